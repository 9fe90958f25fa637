//! Cancellation signal shared by every background flow, and the bounded
//! graceful-then-forced shutdown of the HTTPS listener.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::*;

/// How long in-flight requests get to finish once shutdown starts
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Fires the shutdown signal; held by whoever watches process signals
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Cloneable view of the shutdown signal
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // every receiver may already be gone, which is fine
        let _ = self.0.send(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is triggered or the trigger is dropped
    pub async fn recv(mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Trigger shutdown on SIGINT or SIGTERM
pub async fn listen_for_signals(trigger: ShutdownTrigger) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
                }
            }
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                if let Err(err) = ctrl_c.await {
                    error!(error = %err, "could not listen for SIGINT");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(error = %err, "could not listen for SIGINT");
        }
        info!("received SIGINT, starting graceful shutdown");
    }

    trigger.trigger();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The server stopped on its own before any shutdown was requested
    Exited,
    /// The server drained within the grace period
    Graceful,
    /// The grace period elapsed and the server was aborted
    Forced,
}

/// Wait for `server` to finish, bounding its drain time once `signal` fires.
///
/// `server` must itself stop accepting connections when `signal` fires.
pub async fn drain(
    mut server: JoinHandle<()>,
    signal: ShutdownSignal,
    grace: Duration,
) -> ShutdownOutcome {
    tokio::select! {
        res = &mut server => {
            if let Err(err) = res {
                error!(error = %err, "server task failed");
            }
            return ShutdownOutcome::Exited;
        }
        _ = signal.recv() => {}
    }

    info!(grace = ?grace, "shutting down server");
    match tokio::time::timeout(grace, &mut server).await {
        Ok(Ok(())) => ShutdownOutcome::Graceful,
        Ok(Err(err)) => {
            error!(error = %err, "server task failed while draining");
            ShutdownOutcome::Graceful
        }
        Err(_) => {
            error!("error shutting server down, closing remaining connections");
            server.abort();
            ShutdownOutcome::Forced
        }
    }
}

/// Wait up to `grace` for a background task that was already told to stop.
///
/// A task still running afterwards is aborted. Returns whether it finished.
pub async fn settle(name: &str, mut task: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(task = name, error = %err, "background task failed");
            true
        }
        Err(_) => {
            warn!(task = name, grace = ?grace, "background task did not stop in time");
            task.abort();
            false
        }
    }
}
