//! Signal handling for graceful shutdown

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

/// Handles shutdown signals (SIGTERM, SIGINT)
pub struct ShutdownSignal {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignal {
    /// Register the signal handlers
    pub fn new() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?,
        })
    }

    /// Wait for a shutdown signal
    pub async fn wait(&mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => {
                debug!("received SIGTERM");
            }
            _ = self.sigint.recv() => {
                debug!("received SIGINT");
            }
        }
    }
}
