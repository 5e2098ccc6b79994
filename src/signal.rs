use eyre::Result;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// A request to stop, observed while waiting for the operator.
pub trait Terminate {
    /// Resolves with the name of whatever asked the process to stop.
    async fn wait_terminate(&mut self) -> &'static str;
}

/// SIGINT and SIGTERM, observed between interactive operations.
#[derive(Debug)]
pub struct Signals {
    int: Signal,
    term: Signal,
}

impl Signals {
    pub fn new() -> Result<Self> {
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
        })
    }
}

impl Terminate for Signals {
    async fn wait_terminate(&mut self) -> &'static str {
        tokio::select! {
            _ = self.int.recv() => "SIGINT",
            _ = self.term.recv() => "SIGTERM",
        }
    }
}
