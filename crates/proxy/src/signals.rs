//! Termination signal handling.
//!
//! SIGINT and SIGTERM end the process immediately; there is no drain of
//! in-flight connections.

use std::fmt;
use std::io;

use tracing::debug;

/// Signal that requested termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// SIGINT (Ctrl-C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Installed SIGINT/SIGTERM handlers.
#[derive(Debug)]
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Register the handlers. Must be called inside a Tokio runtime.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let interrupt = signal(SignalKind::interrupt())?;
        let terminate = signal(SignalKind::terminate())?;
        debug!("Signal handlers installed");
        Ok(Self {
            interrupt,
            terminate,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the first termination signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> SignalType {
        let received = tokio::select! {
            _ = self.interrupt.recv() => SignalType::Interrupt,
            _ = self.terminate.recv() => SignalType::Terminate,
        };
        debug!(signal = %received, "Received signal");
        received
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> SignalType {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        debug!("Received Ctrl-C");
        SignalType::Interrupt
    }
}
