//! Graceful Shutdown Handler
//!
//! Stops the trigger consumer and the sweeper, then drains in-flight evaluations
//! within a bounded timeout before connections are closed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, SIGINT
    Graceful,
    /// Skip the drain
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight evaluations (default: 60s)
    pub drain_timeout_secs: u64,
    /// Time to wait for pools and connections to close (default: 10s)
    pub close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 60,
            close_timeout_secs: 10,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// No new deliveries are taken; in-flight evaluations finish
    Draining,
    ClosingConnections,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::Draining => write!(f, "draining"),
            ShutdownPhase::ClosingConnections => write!(f, "closing_connections"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase, _) = watch::channel(ShutdownPhase::Running);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            signal_tx,
            phase,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Token observed by long-running loops. Tokens created after the request
    /// still see it.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    /// Drain in-flight work, then close connections. Both steps are bounded.
    pub async fn execute<D, C>(&self, drain: D, close: C) -> Result<(), ShutdownError>
    where
        D: Future<Output = ()>,
        C: Future<Output = ()>,
    {
        let start = std::time::Instant::now();
        let urgent = *self.signal_tx.borrow() == Some(ShutdownSignal::Urgent);

        self.set_phase(ShutdownPhase::Draining);
        let drained = if urgent {
            warn!("Urgent shutdown, skipping drain");
            false
        } else {
            let drain_timeout = Duration::from_secs(self.config.drain_timeout_secs);
            match tokio::time::timeout(drain_timeout, drain).await {
                Ok(()) => {
                    info!("In-flight evaluations drained");
                    true
                }
                Err(_) => {
                    warn!(
                        "Drain timeout after {}s, unfinished deliveries will be redelivered",
                        self.config.drain_timeout_secs
                    );
                    false
                }
            }
        };

        self.set_phase(ShutdownPhase::ClosingConnections);
        let close_timeout = Duration::from_secs(self.config.close_timeout_secs);
        if tokio::time::timeout(close_timeout, close).await.is_err() {
            error!("Connection close timeout after {}s", self.config.close_timeout_secs);
            self.set_phase(ShutdownPhase::Complete);
            return Err(ShutdownError::Timeout);
        }
        debug!("Connections closed");

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());

        if drained {
            Ok(())
        } else {
            Err(ShutdownError::Interrupted)
        }
    }
}

/// Cloneable view of the shutdown request
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolves once shutdown is requested (immediately if it already was)
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                // Coordinator dropped
                return ShutdownSignal::Urgent;
            }
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown timed out")]
    Timeout,
    #[error("shutdown interrupted before in-flight work drained")]
    Interrupted,
}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, level) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(level);
                    }
                    Err(e) => error!("Failed to install {} handler: {}", name, e),
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::Draining.to_string(), "draining");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let shutdown = GracefulShutdown::with_defaults();
        let token = shutdown.token();

        assert!(!shutdown.is_shutdown_requested());
        assert!(!token.is_shutdown_requested());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());
        assert!(token.is_shutdown_requested());

        // Duplicate request is ignored
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        let mut late = shutdown.token();
        assert_eq!(late.wait_for_shutdown().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_token_wakes_waiter() {
        let shutdown = Arc::new(GracefulShutdown::with_defaults());
        let mut token = shutdown.token();

        let waiter = tokio::spawn(async move { token.wait_for_shutdown().await });
        tokio::task::yield_now().await;
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        assert_eq!(waiter.await.unwrap(), ShutdownSignal::Graceful);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out_slow_drain() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        let result = shutdown
            .execute(tokio::time::sleep(Duration::from_secs(3600)), async {})
            .await;

        assert!(matches!(result, Err(ShutdownError::Interrupted)));
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_execute_completes() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        assert!(shutdown.execute(async {}, async {}).await.is_ok());
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }
}
