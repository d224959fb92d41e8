//! Cooperative shutdown (§5): a broadcast-style signal every background
//! worker (rate-limiter/session/audit sweepers, notification workers, RPC
//! health pinger, analytics health loop) selects against, plus a
//! drain-with-timeout helper for the handful of in-flight tasks that need to
//! finish rather than abort.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Waits for every handle to finish, up to `timeout`; any still running are
/// logged and left to be reaped when the process exits (§5 default 10s).
pub async fn drain(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    let drain_all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(timeout, drain_all).await.is_err() {
        tracing::warn!(timeout_secs = timeout.as_secs(), "shutdown: drain timed out, forcing exit");
    }
}

/// Listens for SIGINT/SIGTERM (Unix) or Ctrl-C and triggers `signal`.
pub async fn listen_for_shutdown(signal: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut sigterm = unix_signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received, draining workers");
    signal.trigger();
}
