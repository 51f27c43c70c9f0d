//! Signal handling for the daemon.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// What the operator asked the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Graceful shutdown (SIGTERM, SIGINT).
    Shutdown,
    /// Reload configuration (SIGHUP).
    Reload,
}

impl std::fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonSignal::Shutdown => write!(f, "SHUTDOWN"),
            DaemonSignal::Reload => write!(f, "RELOAD"),
        }
    }
}

/// OS signal streams, installed once at startup.
pub struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl Signals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal. A closed stream counts as a shutdown request.
    pub async fn recv(&mut self) -> DaemonSignal {
        let received = tokio::select! {
            got = self.terminate.recv() => got.map(|_| ("SIGTERM", DaemonSignal::Shutdown)),
            got = self.interrupt.recv() => got.map(|_| ("SIGINT", DaemonSignal::Shutdown)),
            got = self.hangup.recv() => got.map(|_| ("SIGHUP", DaemonSignal::Reload)),
        };
        match received {
            Some((name, action)) => {
                info!(signal = name, action = %action, "signal received");
                action
            }
            None => DaemonSignal::Shutdown,
        }
    }
}
