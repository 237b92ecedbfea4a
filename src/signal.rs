//! Process signals that stop or restart the link.
//!
//! * Ctrl-C (SIGINT) and SIGTERM shut down
//! * SIGHUP restarts the link, which is also the way out of the given-up
//!   state without restarting the process
//!
//! On Windows only Ctrl-C is available.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal as UnixSignal, SignalKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Signal {
    /// Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP
    Restart,
}

impl Signal {
    /// Whether the process should exit on this signal.
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "Ctrl+C"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Restart => write!(f, "SIGHUP"),
        }
    }
}

/// Listens for [`Signal`]s.
pub struct Handler {
    #[cfg(unix)]
    sigterm: UnixSignal,
    #[cfg(unix)]
    sighup: UnixSignal,
}

impl Handler {
    /// Registers the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler can't be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> Signal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Signal::Interrupt,
                _ = self.sigterm.recv() => Signal::Terminate,
                _ = self.sighup.recv() => Signal::Restart,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            Signal::Interrupt
        }
    }
}
