// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The participant's poll loop.
//!
//! ```text
//! load card -> publish -> discover (log only)
//!   loop while Running:
//!     check instructions -> receive -> control plane
//!       -> handler per envelope (own task) -> respond if Some
//!     ping -> sleep(poll interval) or wake on shutdown
//! -> shutdown callbacks (deregister first)
//! ```
//!
//! A handler that errors or panics only loses its own envelope. If the
//! pump task itself dies, the emergency path still runs the shutdown
//! callbacks before `run` returns an error.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ResolvedConfig, DEFAULT_POLL_INTERVAL};
use crate::error::BusError;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{BusCounter, GLOBAL_METRICS};

use super::control::{ControlPlane, ShutdownReason};
use super::store::ReceiveOptions;
use super::types::{DiscoveryFilter, Envelope};
use super::AgentBus;

/// Application logic plugged into the runtime.
///
/// Returning `Some(body)` sends `body` back to the envelope's sender as a
/// `response`. Errors are logged and the envelope is still consumed.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Value>>;
}

/// Adapter turning an async closure into an [`EnvelopeHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. It receives its own copy of each envelope.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Value>> {
        (self.0)(envelope.clone()).await
    }
}

/// Errors that end [`AgentRuntime::run`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Card, storage or registration failed before the loop started.
    #[error("Agent setup failed: {0}")]
    Setup(#[from] BusError),

    /// The poll loop died; emergency shutdown callbacks have run.
    #[error("Poll loop aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Sleep between poll cycles.
    pub poll_interval: Duration,
    /// Turn Ctrl-C / SIGTERM into a shutdown request.
    pub handle_signals: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            handle_signals: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_signals(mut self, handle: bool) -> Self {
        self.handle_signals = handle;
        self
    }
}

/// What happened during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub agent_id: String,
    pub cycles: u64,
    pub handled: u64,
    pub handler_failures: u64,
    pub responses: u64,
    pub reason: Option<ShutdownReason>,
    pub callbacks_run: usize,
}

/// Hosts one participant: registration, the poll loop and shutdown.
pub struct AgentRuntime {
    bus: AgentBus,
    handler: Arc<dyn EnvelopeHandler>,
    control: Arc<ControlPlane>,
    config: RuntimeConfig,
    #[cfg(test)]
    fault_after_cycles: Option<u64>,
}

impl AgentRuntime {
    /// Build a runtime. The default "deregister" shutdown callback is
    /// registered here, so it runs before any callback added later.
    pub fn new(bus: AgentBus, handler: impl EnvelopeHandler + 'static, config: RuntimeConfig) -> Self {
        let control = Arc::new(ControlPlane::new());

        let registry = bus.registry().clone();
        control.on_shutdown("deregister", move || async move {
            registry.deregister_self().await?;
            Ok(())
        });

        Self {
            bus,
            handler: Arc::new(handler),
            control,
            config,
            #[cfg(test)]
            fault_after_cycles: None,
        }
    }

    /// Shared control plane, e.g. for a handler that ends a bounded task.
    pub fn control(&self) -> Arc<ControlPlane> {
        Arc::clone(&self.control)
    }

    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.control.on_shutdown(name, callback);
    }

    /// Register, poll until shutdown, then run the shutdown callbacks.
    pub async fn run(self) -> Result<RunSummary, RuntimeError> {
        let card = self.bus.card().load().await?;
        self.bus.init().await?;
        self.bus.registry().publish().await?;

        match self.bus.registry().discover(&DiscoveryFilter::default()).await {
            Ok(peers) => {
                info!(agent = %card.id, peers = peers.len(), "Agent started");
                for peer in peers.iter().filter(|p| p.card.id != card.id) {
                    debug!(peer = %peer.card.id, name = %peer.card.name, status = %peer.status, "Known peer");
                }
            }
            Err(e) => warn!(error = %e, "Initial discovery failed"),
        }

        let signals = self
            .config
            .handle_signals
            .then(|| self.control.listen_for_signals());

        let pump = Pump {
            bus: self.bus.clone(),
            handler: Arc::clone(&self.handler),
            control: Arc::clone(&self.control),
            identity: card.id.clone(),
            poll_interval: self.config.poll_interval,
            #[cfg(test)]
            fault_after_cycles: self.fault_after_cycles,
        };
        let outcome = tokio::spawn(pump.run()).await;

        let result = match outcome {
            Ok(stats) => {
                let callbacks_run = self.control.run_shutdown_callbacks().await;
                Ok(RunSummary {
                    agent_id: card.id,
                    cycles: stats.cycles,
                    handled: stats.handled,
                    handler_failures: stats.handler_failures,
                    responses: stats.responses,
                    reason: self.control.reason(),
                    callbacks_run,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Poll loop aborted, running emergency shutdown");
                self.control
                    .request_shutdown(ShutdownReason::Emergency(message.clone()));
                self.control.run_shutdown_callbacks().await;
                Err(RuntimeError::Aborted(message))
            }
        };

        if let Some(listener) = signals {
            listener.abort();
        }
        result
    }
}

#[derive(Debug, Default)]
struct PumpStats {
    cycles: u64,
    handled: u64,
    handler_failures: u64,
    responses: u64,
}

struct Pump {
    bus: AgentBus,
    handler: Arc<dyn EnvelopeHandler>,
    control: Arc<ControlPlane>,
    identity: String,
    poll_interval: Duration,
    /// Kill the pump task after this many cycles.
    #[cfg(test)]
    fault_after_cycles: Option<u64>,
}

impl Pump {
    async fn run(self) -> PumpStats {
        let mut stats = PumpStats::default();

        while self.control.is_running() {
            self.poll_once(&mut stats).await;
            stats.cycles += 1;

            #[cfg(test)]
            if self.fault_after_cycles == Some(stats.cycles) {
                panic!("pump fault injected after {} cycles", stats.cycles);
            }

            if !self.control.is_running() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.control.cancelled() => {}
            }
        }

        debug!(cycles = stats.cycles, "Poll loop finished");
        stats
    }

    async fn poll_once(&self, stats: &mut PumpStats) {
        self.bus.orchestrator().check_instructions(&self.identity).await;

        // Storage trouble reads as "nothing yet"; the next cycle retries.
        let envelopes = match self.bus.store().receive(ReceiveOptions::default()).await {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "Receive failed");
                Vec::new()
            }
        };

        self.control.observe(&envelopes);
        self.refresh_announcers(&envelopes).await;

        for envelope in envelopes {
            stats.handled += 1;
            match self.dispatch(&envelope).await {
                Ok(Some(body)) => match self.bus.store().respond(&envelope, body).await {
                    Ok(_) => stats.responses += 1,
                    Err(e) => warn!(envelope = %envelope.envelope_id, error = %e, "Response not sent"),
                },
                Ok(None) => {}
                Err(e) => {
                    stats.handler_failures += 1;
                    error!(
                        envelope = %envelope.envelope_id,
                        kind = %envelope.kind,
                        error = %e,
                        "Handler failed"
                    );
                }
            }
        }

        if let Err(e) = self.bus.liveness().ping(&self.identity).await {
            warn!(error = %e, "Liveness ping failed");
        }
    }

    /// Peers announcing themselves are recorded as active with their details.
    async fn refresh_announcers(&self, envelopes: &[Envelope]) {
        for envelope in envelopes {
            if !envelope.is_announcement() || envelope.sender_id == self.identity {
                continue;
            }
            let details = &envelope.body["agent_details"];
            let name = details["name"].as_str().unwrap_or(&envelope.sender_name);
            let capabilities: Vec<String> = details["capabilities"]
                .as_array()
                .map(|tags| {
                    tags.iter()
                        .filter_map(|tag| tag.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            if let Err(e) = self
                .bus
                .liveness()
                .record_announcement(&envelope.sender_id, name, &capabilities)
                .await
            {
                warn!(peer = %envelope.sender_id, error = %e, "Could not record announced peer");
            }
        }
    }

    /// Run the handler for one envelope in its own task so a panic stays contained.
    async fn dispatch(&self, envelope: &Envelope) -> anyhow::Result<Option<Value>> {
        let handler = Arc::clone(&self.handler);
        let owned = envelope.clone();
        let start = Instant::now();

        let result = match tokio::spawn(async move { handler.handle(&owned).await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("handler panicked: {e}")),
        };

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_handler(envelope.kind.as_str(), start.elapsed(), result.is_ok());
            if result.is_err() {
                GLOBAL_METRICS.increment(BusCounter::HandlerFailures);
            }
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::layout::StorageLayout;
    use crate::bus::types::{CapabilityCard, EnvelopeKind, LivenessStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn fast() -> RuntimeConfig {
        RuntimeConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_signals(false)
    }

    #[tokio::test]
    async fn test_setup_failure_without_card() {
        let temp = TempDir::new().unwrap();
        let bus = AgentBus::new(
            StorageLayout::new(temp.path()),
            temp.path().join("missing-card.json"),
        );
        let runtime = AgentRuntime::new(bus, handler_fn(|_| async { Ok(None) }), fast());
        let err = runtime.run().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Setup(BusError::CardUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_are_isolated() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let me = CapabilityCard::new("Worker");
        let peer = AgentBus::new(layout.clone(), CapabilityCard::new("Peer"));
        peer.init().await.unwrap();

        for text in ["panic", "fail", "ok"] {
            peer.send(&me.id, json!({"text": text}), EnvelopeKind::Query).await.unwrap();
        }
        peer.send(&me.id, json!({"control_command": "exit_loop"}), EnvelopeKind::Control)
            .await
            .unwrap();

        let bus = AgentBus::new(layout, me);
        let handler = handler_fn(|env: Envelope| async move {
            match env.text() {
                Some("panic") => panic!("handler blew up"),
                Some("fail") => anyhow::bail!("handler failed"),
                Some("ok") => Ok(Some(json!({"text": "done"}))),
                _ => Ok(None),
            }
        });

        let summary = AgentRuntime::new(bus, handler, fast()).run().await.unwrap();
        assert_eq!(summary.handled, 4);
        assert_eq!(summary.handler_failures, 2);
        assert_eq!(summary.responses, 1);
        assert_eq!(summary.callbacks_run, 1);
        assert!(matches!(summary.reason, Some(ShutdownReason::ControlEnvelope { .. })));
    }

    #[tokio::test]
    async fn test_dead_pump_runs_emergency_shutdown() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let me = CapabilityCard::new("Fragile");
        let bus = AgentBus::new(layout.clone(), me.clone());
        let mut runtime = AgentRuntime::new(bus, handler_fn(|_| async { Ok(None) }), fast());
        runtime.fault_after_cycles = Some(2);

        let flushed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&flushed);
        runtime.on_shutdown("flush", move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let control = runtime.control();

        let err = runtime.run().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Aborted(_)));
        assert!(matches!(control.reason(), Some(ShutdownReason::Emergency(_))));
        assert!(flushed.load(Ordering::SeqCst));
        assert!(!layout.discovery_record(&me.id).exists());
    }

    #[tokio::test]
    async fn test_announcement_marks_peer_active() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let me = CapabilityCard::new("Listener");
        let bus = AgentBus::new(layout.clone(), me.clone());
        let runtime = AgentRuntime::new(bus, handler_fn(|_| async { Ok(None) }), fast());
        let control = runtime.control();
        let run = tokio::spawn(runtime.run());

        let scout = CapabilityCard::new("Scout").with_capability("search");
        let peer = AgentBus::new(layout.clone(), scout.clone());
        peer.init().await.unwrap();
        let body = json!({
            "text": "Agent Scout has joined the system.",
            "announcement": true,
            "agent_details": {"name": "Scout", "id": scout.id, "capabilities": ["search"]},
        });
        peer.send(&me.id, body, EnvelopeKind::Announcement).await.unwrap();

        let mut recorded = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // Only the announcement path stores capabilities.
            if let Some(entry) = peer.liveness().entry(&scout.id).await {
                if entry.extra.contains_key("capabilities") {
                    recorded = Some(entry);
                    break;
                }
            }
        }
        control.request_shutdown(ShutdownReason::Requested);
        run.await.unwrap().unwrap();

        let entry = recorded.expect("announcement was not recorded");
        assert_eq!(entry.status, LivenessStatus::Active);
        assert_eq!(entry.name.as_deref(), Some("Scout"));
        assert_eq!(entry.extra["capabilities"], json!(["search"]));
    }

    #[tokio::test]
    async fn test_host_requested_shutdown() {
        let temp = TempDir::new().unwrap();
        let bus = AgentBus::new(StorageLayout::new(temp.path()), CapabilityCard::new("Solo"));
        let runtime = AgentRuntime::new(bus, handler_fn(|_| async { Ok(None) }), fast());

        let control = runtime.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            control.request_shutdown(ShutdownReason::Requested);
        });

        let summary = runtime.run().await.unwrap();
        assert!(summary.cycles >= 1);
        assert_eq!(summary.reason, Some(ShutdownReason::Requested));
    }
}
