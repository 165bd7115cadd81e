//! The request/response multiplexer: a FIFO of pending callers paired
//! with out-of-order-free replies from a single background reader, plus
//! the writer that keeps "order of queued waiters" and "order of command
//! bytes on the wire" identical.
//!
//! The shape follows the scheduler/sender task split in `jmux-proxy`:
//! one task owns the read half exclusively, a mutex-guarded write half is
//! shared with callers, and completion is signaled with a one-shot
//! channel per pending call rather than the "wait on a monitor" idiom
//! the original control-protocol clients use.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::codec;
use crate::dispatcher::{Dispatcher, EventHandler, ListenerId};
use crate::error::Error;
use crate::reply::{self, Reply};
use crate::tap::{DebugTap, TapSink};

type Waiter = oneshot::Sender<Result<Reply, Error>>;

struct WriteState {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    waiters: VecDeque<Waiter>,
}

struct Shared {
    write: AsyncMutex<WriteState>,
    reader: StdMutex<Option<Box<dyn AsyncRead + Unpin + Send>>>,
    reader_started: OnceCell<()>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    reader_failed: RwLock<Option<Error>>,
    dispatcher: Dispatcher,
    tap: TapSink,
    closed: AtomicBool,
}

/// A handle to a running (or not-yet-started) control-protocol engine.
///
/// Cheap to clone: every clone shares the same background reader, write
/// lock, and waiter queue, which is what makes it safe to hand out to
/// multiple concurrent callers (spec.md §5).
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Wraps a duplex byte stream split into independent read and write
    /// halves. The reader is not started until [`Engine::start`] is
    /// called explicitly, or implicitly by the first [`Engine::exec`].
    pub fn new(
        reader: Box<dyn AsyncRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> Self {
        Engine {
            shared: Arc::new(Shared {
                write: AsyncMutex::new(WriteState {
                    writer,
                    waiters: VecDeque::new(),
                }),
                reader: StdMutex::new(Some(reader)),
                reader_started: OnceCell::new(),
                reader_task: StdMutex::new(None),
                reader_failed: RwLock::new(None),
                dispatcher: Dispatcher::new(),
                tap: TapSink::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the background reader task. Idempotent: concurrent callers
    /// race to start it but only one reader task is ever spawned.
    pub async fn start(&self) {
        let shared = self.shared.clone();
        self.shared
            .reader_started
            .get_or_init(|| async move {
                let reader = shared
                    .reader
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .expect("reader half is only taken once, by this initializer");

                let handle = tokio::spawn(run_reader(shared.clone(), reader));
                *shared.reader_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            })
            .await;
    }

    /// Sends `command_line` (already CRLF-terminated) and, optionally, a
    /// data body, then blocks until the matching reply arrives.
    ///
    /// Fails with [`Error::Server`] if the reply's first line status
    /// class is not `2xx`. Never completes on an event reply — those are
    /// routed to the dispatcher instead.
    #[instrument(skip(self, command_line, body), fields(command = %command_line.trim_end()))]
    pub async fn exec(&self, command_line: &str, body: Option<&str>) -> Result<Reply, Error> {
        if let Some(err) = self.latched_error() {
            return Err(err);
        }

        self.start().await;

        if let Some(err) = self.latched_error() {
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.shared.write.lock().await;

            // Re-check under the write lock: `finish` also takes this
            // lock to drain waiters on reader termination, so if it ran
            // between our first check and now, we must not enqueue a
            // waiter that will never be drained.
            if let Some(err) = self.latched_error() {
                return Err(err);
            }

            state.waiters.push_back(tx);
            if let Err(err) = write_command(&mut state.writer, &self.shared.tap, command_line, body).await {
                state.waiters.pop_back();
                return Err(err);
            }
        }

        let reply = rx.await.map_err(|_| Error::Canceled)??;

        if reply.is_success() {
            Ok(reply)
        } else {
            let line = reply.first();
            Err(Error::Server {
                status: line.status,
                message: line.message.clone(),
            })
        }
    }

    /// Writes `command_line` without enqueuing a waiter. Used for
    /// shutdown signals where the daemon may close the connection
    /// before replying — the subsequent EOF must be treated as a clean
    /// close, not an error, which is exactly what skipping the waiter
    /// achieves.
    pub async fn send_fire_and_forget(&self, command_line: &str) -> Result<(), Error> {
        if let Some(err) = self.latched_error() {
            return Err(err);
        }

        self.start().await;

        let mut state = self.shared.write.lock().await;
        codec::write_line(&mut state.writer, command_line.trim_end_matches(['\r', '\n']), &self.shared.tap).await
    }

    pub fn add_raw_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.shared.dispatcher.add_raw_listener(listener)
    }

    pub fn remove_raw_listener(&self, id: ListenerId) {
        self.shared.dispatcher.remove_raw_listener(id);
    }

    pub fn set_typed_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        self.shared.dispatcher.set_handler(handler);
    }

    pub fn set_debug_tap(&self, tap: Option<Arc<dyn DebugTap>>) {
        self.shared.tap.set(tap);
    }

    /// Tears down the engine immediately: aborts the reader task without
    /// attempting a polite `QUIT` first, cancels every pending waiter,
    /// and latches [`Error::TransportClosed`] for future commands.
    ///
    /// Callers that want to say goodbye politely should send `QUIT` via
    /// [`Engine::send_fire_and_forget`] first.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.shared.reader_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        latch_error(&self.shared, Error::TransportClosed { reason: Some("shut down by caller".to_owned()) });

        let mut state = self.shared.write.lock().await;
        drain_waiters(&mut state.waiters, Error::Canceled);
    }

    fn latched_error(&self) -> Option<Error> {
        self.shared.reader_failed.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

async fn write_command(
    writer: &mut (dyn AsyncWrite + Unpin + Send),
    tap: &TapSink,
    command_line: &str,
    body: Option<&str>,
) -> Result<(), Error> {
    codec::write_line(writer, command_line.trim_end_matches(['\r', '\n']), tap).await?;

    if let Some(body) = body {
        use tokio::io::AsyncWriteExt as _;
        let encoded = codec::encode_data_block(body);
        writer.write_all(encoded.as_bytes()).await?;
        // The debug tap sees the data block as individual lines, matching
        // what was actually framed on the wire.
        for line in encoded.split_terminator("\r\n") {
            tap.outgoing(line);
        }
    }

    Ok(())
}

#[instrument(skip_all, name = "reader")]
async fn run_reader(shared: Arc<Shared>, reader: Box<dyn AsyncRead + Unpin + Send>) {
    let mut buffered = BufReader::new(reader);

    loop {
        match reply::read_reply(&mut buffered, &shared.tap).await {
            Ok(None) => {
                debug!("control stream closed cleanly");
                finish(&shared, Error::TransportClosed { reason: None }).await;
                break;
            }
            Ok(Some(reply)) => {
                if reply.is_event() {
                    trace!("dispatching event reply");
                    shared.dispatcher.dispatch(&reply);
                } else {
                    complete_oldest_waiter(&shared, Ok(reply)).await;
                }
            }
            Err(err) => {
                warn!(%err, "reader terminating");
                finish(&shared, err).await;
                break;
            }
        }
    }
}

async fn complete_oldest_waiter(shared: &Arc<Shared>, result: Result<Reply, Error>) {
    let waiter = {
        let mut state = shared.write.lock().await;
        state.waiters.pop_front()
    };

    if let Some(tx) = waiter {
        // A send error means the caller already gave up (timeout,
        // cancellation) — FIFO order was still honored, so there is
        // nothing left to do but drop the reply.
        let _ = tx.send(result);
    } else {
        warn!("received a non-event reply with no pending waiter");
    }
}

async fn finish(shared: &Arc<Shared>, err: Error) {
    latch_error(shared, err.clone());
    let mut state = shared.write.lock().await;
    drain_waiters(&mut state.waiters, err);
}

fn latch_error(shared: &Shared, err: Error) {
    let mut slot = shared.reader_failed.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn drain_waiters(waiters: &mut VecDeque<Waiter>, err: Error) {
    for tx in waiters.drain(..) {
        let _ = tx.send(Err(err.clone()));
    }
}
