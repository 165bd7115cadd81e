//! An optional trace sink for every line crossing the wire.
//!
//! Installation and removal are safe at any time; the tap is purely
//! advisory — a panicking or slow tap must never be allowed to affect the
//! reader or writer, so invocation is wrapped the same way
//! [`crate::dispatcher::Dispatcher`] isolates listener failures.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::warn;

/// A sink that receives every outgoing (`>> `) and incoming (`<< `) line.
pub trait DebugTap: Send + Sync {
    /// Called with the raw text of a line written to the daemon (without
    /// the `>> ` prefix or line terminator).
    fn outgoing(&self, line: &str);

    /// Called with the raw text of a line read from the daemon (without
    /// the `<< ` prefix or line terminator).
    fn incoming(&self, line: &str);
}

impl<F> DebugTap for F
where
    F: Fn(TapDirection, &str) + Send + Sync,
{
    fn outgoing(&self, line: &str) {
        self(TapDirection::Outgoing, line);
    }

    fn incoming(&self, line: &str) {
        self(TapDirection::Incoming, line);
    }
}

/// Direction of a tapped line, passed to tap closures registered via the
/// blanket `Fn(TapDirection, &str)` impl of [`DebugTap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapDirection {
    Outgoing,
    Incoming,
}

/// A shared, swappable slot holding at most one tap.
#[derive(Default, Clone)]
pub(crate) struct TapSink {
    inner: Arc<RwLock<Option<Arc<dyn DebugTap>>>>,
}

impl TapSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, tap: Option<Arc<dyn DebugTap>>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = tap;
    }

    pub(crate) fn outgoing(&self, line: &str) {
        if let Some(tap) = self.inner.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            guard_tap(|| tap.outgoing(line));
        }
    }

    pub(crate) fn incoming(&self, line: &str) {
        if let Some(tap) = self.inner.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            guard_tap(|| tap.incoming(line));
        }
    }
}

/// Isolates a tap invocation from the reader/writer it is observing, the
/// same way [`crate::dispatcher::guard_listener`] isolates event
/// listeners: a panicking tap must not unwind into `codec::read_line` or
/// `mux::run_reader`, which would skip the error-latching those do on
/// their way out.
fn guard_tap<F: FnOnce()>(f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        warn!(%message, "debug tap panicked; isolated from the reader/writer");
    }
}
