//! Event dispatch: decomposing a `6xx`-class [`Reply`] into per-event
//! callbacks for a typed handler, while also forwarding every event to
//! any number of raw listeners.
//!
//! Dispatch never suspends the reader: listener invocations are
//! synchronous on the reader's execution context, and a panicking
//! listener is caught and logged rather than allowed to unwind into the
//! reader loop (mirroring how `jmux-proxy` isolates its per-channel
//! tasks from each other).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::reply::Reply;

/// Typed callbacks for the event kinds the control protocol defines a
/// recognized payload shape for. All methods have a no-op default so
/// implementors only override what they need.
pub trait EventHandler: Send + Sync {
    /// `CIRC`. `path` is empty when the status is `LAUNCHED` or when
    /// fewer than three tokens were present — this is a deliberately
    /// preserved quirk, not a parsing shortcut (spec.md §9).
    fn circuit_status(&self, status: &str, circ_id: &str, path: &str) {
        let _ = (status, circ_id, path);
    }

    /// `STREAM`.
    fn stream_status(&self, status: &str, stream_id: &str, target: &str) {
        let _ = (status, stream_id, target);
    }

    /// `ORCONN`.
    fn or_conn_status(&self, status: &str, or_name: &str) {
        let _ = (status, or_name);
    }

    /// `BW`: bytes read, bytes written.
    fn bandwidth(&self, bytes_read: u64, bytes_written: u64) {
        let _ = (bytes_read, bytes_written);
    }

    /// `NEWDESC`.
    fn new_descriptors(&self, server_ids: &[String]) {
        let _ = server_ids;
    }

    /// `DEBUG`/`INFO`/`NOTICE`/`WARN`/`ERR`. `severity` is the event name
    /// lower-cased.
    fn log_message(&self, severity: &str, message: &str) {
        let _ = (severity, message);
    }

    /// Any event name not otherwise recognized.
    fn unrecognized(&self, event_name: &str, rest: &str) {
        let _ = (event_name, rest);
    }
}

/// Opaque handle returned by [`Dispatcher::add_raw_listener`], passed
/// back to [`Dispatcher::remove_raw_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type RawListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Dispatcher {
    raw_listeners: RwLock<Vec<(ListenerId, RawListener)>>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_raw_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.raw_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn remove_raw_listener(&self, id: ListenerId) {
        self.raw_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }

    pub(crate) fn set_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    /// Dispatches every line of an event-class reply. Absence of any
    /// registered listener or handler means events are silently
    /// discarded, per spec.md §3.
    pub(crate) fn dispatch(&self, reply: &Reply) {
        for line in reply.lines() {
            let (event_name, rest) = match line.message.split_once(' ') {
                Some((name, rest)) => (name, rest),
                None => (line.message.as_str(), ""),
            };
            let event_name = event_name.to_ascii_uppercase();

            self.call_raw_listeners(&event_name, rest);

            if let Some(handler) = self.handler.read().unwrap_or_else(|e| e.into_inner()).clone() {
                decode_and_dispatch(handler.as_ref(), &event_name, rest);
            }
        }
    }

    fn call_raw_listeners(&self, event_name: &str, rest: &str) {
        let listeners = self.raw_listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for (_, listener) in listeners {
            guard_listener(|| listener(event_name, rest));
        }
    }
}

fn decode_and_dispatch(handler: &dyn EventHandler, event_name: &str, rest: &str) {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let token = |i: usize| tokens.get(i).copied().unwrap_or("");

    guard_listener(|| match event_name {
        "CIRC" => {
            let circ_id = token(0);
            let status = token(1);
            let path = if status == "LAUNCHED" || tokens.len() < 3 { "" } else { token(2) };
            handler.circuit_status(status, circ_id, path);
        }
        "STREAM" => {
            handler.stream_status(token(1), token(0), token(3));
        }
        "ORCONN" => {
            handler.or_conn_status(token(1), token(0));
        }
        "BW" => match (token(0).parse::<u64>(), token(1).parse::<u64>()) {
            (Ok(read), Ok(written)) => handler.bandwidth(read, written),
            _ => handler.unrecognized(event_name, rest),
        },
        "NEWDESC" => {
            let ids = tokens.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
            handler.new_descriptors(&ids);
        }
        "DEBUG" | "INFO" | "NOTICE" | "WARN" | "ERR" => {
            handler.log_message(&event_name.to_ascii_lowercase(), rest);
        }
        _ => handler.unrecognized(event_name, rest),
    });
}

fn guard_listener<F: FnOnce()>(f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        warn!(%message, "event listener panicked; isolated from the reader");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        circuits: Mutex<Vec<(String, String, String)>>,
        streams: Mutex<Vec<(String, String, String)>>,
        or_conns: Mutex<Vec<(String, String)>>,
        bandwidths: Mutex<Vec<(u64, u64)>>,
        new_descs: Mutex<Vec<Vec<String>>>,
        logs: Mutex<Vec<(String, String)>>,
        unrecognized: Mutex<Vec<(String, String)>>,
    }

    impl EventHandler for Recorder {
        fn circuit_status(&self, status: &str, circ_id: &str, path: &str) {
            self.circuits
                .lock()
                .unwrap()
                .push((status.to_owned(), circ_id.to_owned(), path.to_owned()));
        }

        fn stream_status(&self, status: &str, stream_id: &str, target: &str) {
            self.streams
                .lock()
                .unwrap()
                .push((status.to_owned(), stream_id.to_owned(), target.to_owned()));
        }

        fn or_conn_status(&self, status: &str, or_name: &str) {
            self.or_conns.lock().unwrap().push((status.to_owned(), or_name.to_owned()));
        }

        fn bandwidth(&self, bytes_read: u64, bytes_written: u64) {
            self.bandwidths.lock().unwrap().push((bytes_read, bytes_written));
        }

        fn new_descriptors(&self, server_ids: &[String]) {
            self.new_descs.lock().unwrap().push(server_ids.to_vec());
        }

        fn log_message(&self, severity: &str, message: &str) {
            self.logs.lock().unwrap().push((severity.to_owned(), message.to_owned()));
        }

        fn unrecognized(&self, event_name: &str, rest: &str) {
            self.unrecognized
                .lock()
                .unwrap()
                .push((event_name.to_owned(), rest.to_owned()));
        }
    }

    fn single_line_reply(status: &str, message: &str) -> Reply {
        use crate::reply::ReplyLine;
        let mut status_bytes = [0u8; 3];
        status_bytes.copy_from_slice(status.as_bytes());
        Reply::__for_tests(vec![ReplyLine {
            status: status_bytes,
            divider: b' ',
            message: message.to_owned(),
            data: None,
        }])
    }

    #[test]
    fn circ_launched_has_empty_path_even_with_enough_tokens() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.set_handler(Some(recorder.clone() as Arc<dyn EventHandler>));

        dispatcher.dispatch(&single_line_reply("650", "CIRC 10 LAUNCHED BUILD_FLAGS=NEED_CAPACITY"));

        let circuits = recorder.circuits.lock().unwrap();
        assert_eq!(circuits[0], ("LAUNCHED".to_owned(), "10".to_owned(), String::new()));
    }

    #[test]
    fn circ_short_token_list_has_empty_path() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.set_handler(Some(recorder.clone() as Arc<dyn EventHandler>));

        dispatcher.dispatch(&single_line_reply("650", "CIRC 10 BUILT"));

        let circuits = recorder.circuits.lock().unwrap();
        assert_eq!(circuits[0], ("BUILT".to_owned(), "10".to_owned(), String::new()));
    }

    #[test]
    fn circ_built_carries_path() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.set_handler(Some(recorder.clone() as Arc<dyn EventHandler>));

        dispatcher.dispatch(&single_line_reply(
            "650",
            "CIRC 10 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL",
        ));

        let circuits = recorder.circuits.lock().unwrap();
        assert_eq!(circuits[0].0, "BUILT");
        assert_eq!(circuits[0].1, "10");
        assert_eq!(circuits[0].2, "$AAAA~a,$BBBB~b");
    }

    #[test]
    fn bandwidth_decodes_two_integers() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.set_handler(Some(recorder.clone() as Arc<dyn EventHandler>));

        dispatcher.dispatch(&single_line_reply("650", "BW 1024 2048"));

        assert_eq!(recorder.bandwidths.lock().unwrap()[0], (1024, 2048));
    }

    #[test]
    fn unknown_event_forwarded_to_unrecognized_sink() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.set_handler(Some(recorder.clone() as Arc<dyn EventHandler>));

        dispatcher.dispatch(&single_line_reply("650", "SOMETHING_NEW foo bar"));

        let unrecognized = recorder.unrecognized.lock().unwrap();
        assert_eq!(unrecognized[0], ("SOMETHING_NEW".to_owned(), "foo bar".to_owned()));
    }

    #[test]
    fn raw_listener_always_receives_full_rest_regardless_of_typed_decoding() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        dispatcher.add_raw_listener(move |name, rest| {
            seen_clone.lock().unwrap().push((name.to_owned(), rest.to_owned()));
        });

        dispatcher.dispatch(&single_line_reply("650", "CIRC 10 LAUNCHED"));

        assert_eq!(seen.lock().unwrap()[0], ("CIRC".to_owned(), "10 LAUNCHED".to_owned()));
    }

    #[test]
    fn removed_listener_stops_receiving_events() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let id = dispatcher.add_raw_listener(move |_, _| {
            *count_clone.lock().unwrap() += 1;
        });

        dispatcher.dispatch(&single_line_reply("650", "BW 1 2"));
        dispatcher.remove_raw_listener(id);
        dispatcher.dispatch(&single_line_reply("650", "BW 1 2"));

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_other_listeners() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_raw_listener(|_, _| panic!("boom"));

        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        dispatcher.add_raw_listener(move |_, _| {
            *count_clone.lock().unwrap() += 1;
        });

        dispatcher.dispatch(&single_line_reply("650", "BW 1 2"));

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
