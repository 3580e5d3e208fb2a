use std::{
    fmt::Display,
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use sae_core::RunTopology;
use tracing::{warn, Level, Metadata};
use tracing_subscriber::filter::{filter_fn, FilterFn};

/// Number of gated scopes currently open in this process.
static QUIET_SCOPES: AtomicUsize = AtomicUsize::new(0);

/// Per-layer filter that passes only warnings and errors while a gated scope
/// is open, and everything otherwise.
///
/// Installed on every output layer by [`crate::logging`], so gated scopes keep
/// the configured format, filters and log file.
pub fn gate_filter() -> FilterFn<impl Fn(&Metadata<'_>) -> bool + Clone> {
    filter_fn(|meta| QUIET_SCOPES.load(Ordering::Relaxed) == 0 || *meta.level() <= Level::WARN)
}

struct QuietScope;

impl QuietScope {
    fn enter() -> Self {
        QUIET_SCOPES.fetch_add(1, Ordering::Relaxed);
        Self
    }
}

impl Drop for QuietScope {
    fn drop(&mut self) {
        QUIET_SCOPES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Lets console output through on the coordinating rank only.
///
/// Ranks other than 0 write nothing to the sink, and inside [`OutputGate::scope`]
/// their tracing output is cut down to warnings and errors.
pub struct OutputGate {
    topology: RunTopology,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl OutputGate {
    pub fn new(topology: RunTopology, sink: Box<dyn Write + Send>) -> Self {
        Self {
            topology,
            sink: Mutex::new(sink),
        }
    }

    pub fn is_open(&self) -> bool {
        self.topology.is_coordinator()
    }

    /// Writes one line to the console if this rank may speak.
    pub fn report(&self, line: impl Display) {
        if !self.is_open() {
            return;
        }
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(sink, "{line}").and_then(|_| sink.flush()) {
            warn!(%err, "Failed to write to console");
        }
    }

    /// Runs `f` with output gated for this rank. Whatever `f` returns,
    /// including errors, is passed straight back.
    pub fn scope<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        if self.is_open() {
            return f(self);
        }
        let _quiet = QuietScope::enter();
        f(self)
    }
}
