// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cooperative shutdown driven by control envelopes.
//!
//! The loop state only moves forward:
//! `Running -> ShutdownRequested -> Terminated`. Requesting shutdown flips a
//! local flag and cancels a [`CancellationToken`]; nothing is acknowledged to
//! the sender. The runtime notices on its next iteration boundary (or wakes
//! from its sleep early through the token) and then runs the registered
//! shutdown callbacks exactly once, in registration order.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{Envelope, EnvelopeKind};

/// Where a participant's poll loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ShutdownRequested,
    Terminated,
}

/// Why shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A control or emergency envelope arrived.
    ControlEnvelope {
        envelope_id: String,
        sender_id: String,
        command: Option<String>,
    },
    /// The hosting process asked for it, e.g. after finishing a bounded task.
    Requested,
    /// SIGINT / SIGTERM.
    Signal,
    /// The poll loop itself failed.
    Emergency(String),
}

type ShutdownFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type ShutdownCallback = Box<dyn FnOnce() -> ShutdownFuture + Send>;

/// Shutdown state machine shared between the poll loop and its host.
pub struct ControlPlane {
    token: CancellationToken,
    state: Mutex<LoopState>,
    reason: Mutex<Option<ShutdownReason>>,
    callbacks: Mutex<Vec<(String, ShutdownCallback)>>,
    callbacks_ran: AtomicBool,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("state", &self.state())
            .field("reason", &self.reason())
            .field("callbacks_ran", &self.callbacks_ran.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Mutex::new(LoopState::Running),
            reason: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            callbacks_ran: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Token cancelled when shutdown is requested.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Move from `Running` to `ShutdownRequested`.
    ///
    /// Returns false if shutdown was already under way; the first reason wins.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != LoopState::Running {
                return false;
            }
            *state = LoopState::ShutdownRequested;
        }
        info!(reason = ?reason, "Shutdown requested");
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.token.cancel();
        true
    }

    /// Inspect a freshly received batch. Returns true if it carried a control signal.
    pub fn observe(&self, envelopes: &[Envelope]) -> bool {
        let mut saw_control = false;
        for envelope in envelopes {
            if envelope.is_announcement() {
                info!(
                    from = %envelope.sender_name,
                    sender = %envelope.sender_id,
                    text = envelope.text().unwrap_or_default(),
                    "Announcement received"
                );
            }
            if !envelope.is_control_signal() {
                continue;
            }
            saw_control = true;
            if envelope.kind == EnvelopeKind::Emergency {
                warn!(sender = %envelope.sender_id, "Emergency envelope received");
            }
            self.request_shutdown(ShutdownReason::ControlEnvelope {
                envelope_id: envelope.envelope_id.clone(),
                sender_id: envelope.sender_id.clone(),
                command: envelope.control_command().map(str::to_string),
            });
        }
        saw_control
    }

    /// Register a callback to run at shutdown, after those already registered.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: ShutdownCallback = Box::new(move || Box::pin(callback()));
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), boxed));
    }

    /// Run every registered callback once, in order, awaiting each.
    ///
    /// Failures are logged and do not stop later callbacks. A second call
    /// runs nothing. Returns how many callbacks ran.
    pub async fn run_shutdown_callbacks(&self) -> usize {
        if self.callbacks_ran.swap(true, Ordering::SeqCst) {
            return 0;
        }
        // Covers a host that never requested shutdown explicitly.
        self.request_shutdown(ShutdownReason::Requested);

        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = callbacks.len();

        for (name, callback) in callbacks {
            match callback().await {
                Ok(()) => debug!(callback = %name, "Shutdown callback finished"),
                Err(e) => error!(callback = %name, error = %e, "Shutdown callback failed"),
            }
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = LoopState::Terminated;
        info!(callbacks = count, "Shutdown complete");
        count
    }

    /// Request shutdown on Ctrl-C or SIGTERM.
    ///
    /// The listener exits quietly once shutdown happens for any other reason.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    control.request_shutdown(ShutdownReason::Signal);
                }
                _ = control.cancelled() => {}
            }
        })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::CapabilityCard;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn envelope(body: serde_json::Value, kind: EnvelopeKind) -> Envelope {
        Envelope::new(&CapabilityCard::new("sender"), "me", body, kind)
    }

    #[test]
    fn test_plain_batch_keeps_running() {
        let control = ControlPlane::new();
        let batch = vec![
            envelope(json!({"text": "hello"}), EnvelopeKind::Query),
            envelope(json!({"announcement": true}), EnvelopeKind::Announcement),
        ];
        assert!(!control.observe(&batch));
        assert!(control.is_running());
        assert!(!control.token().is_cancelled());
    }

    #[test]
    fn test_control_envelope_requests_shutdown() {
        let control = ControlPlane::new();
        let exit = envelope(json!({"control_command": "exit_loop"}), EnvelopeKind::Control);
        assert!(control.observe(&[exit.clone()]));
        assert_eq!(control.state(), LoopState::ShutdownRequested);
        assert!(control.token().is_cancelled());
        assert_eq!(
            control.reason(),
            Some(ShutdownReason::ControlEnvelope {
                envelope_id: exit.envelope_id,
                sender_id: exit.sender_id,
                command: Some("exit_loop".to_string()),
            })
        );

        // First reason wins.
        assert!(!control.request_shutdown(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn test_callbacks_run_once_in_order() {
        let control = ControlPlane::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for name in ["first", "failing", "third"] {
            let order = Arc::clone(&order);
            control.on_shutdown(name, move || async move {
                order.lock().unwrap().push(name);
                if name == "failing" {
                    anyhow::bail!("boom");
                }
                Ok(())
            });
        }

        assert_eq!(control.run_shutdown_callbacks().await, 3);
        assert_eq!(control.run_shutdown_callbacks().await, 0);
        assert_eq!(*order.lock().unwrap(), vec!["first", "failing", "third"]);
        assert_eq!(control.state(), LoopState::Terminated);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let control = Arc::new(ControlPlane::new());
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.cancelled().await })
        };
        control.request_shutdown(ShutdownReason::Requested);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_listener_exits_on_shutdown() {
        let control = Arc::new(ControlPlane::new());
        let listener = control.listen_for_signals();
        control.request_shutdown(ShutdownReason::Requested);
        tokio::time::timeout(std::time::Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control.reason(), Some(ShutdownReason::Requested));
    }
}
