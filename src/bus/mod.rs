// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Broker-less agent-to-agent message bus over a shared directory.
//!
//! Every participant is an independent process. All coordination happens
//! through JSON documents under one base directory:
//!
//! ```text
//! <base>/
//!   discovery/<id>.json           capability cards
//!   messages/<envelope>.json      global copy of every envelope
//!   messages/<recipient>/...      per-recipient copies
//!   messages/read/...             archive of consumed envelopes
//!   status/agents_status.json     shared liveness document
//!   orchestrator/...              coordinator descriptor, status, instructions
//! ```
//!
//! [`AgentBus`] bundles the pieces for one local participant; the
//! [`AgentRuntime`] drives a handler over it until a control envelope or a
//! signal asks it to stop.

pub mod control;
pub mod discovery;
pub mod document;
pub mod layout;
pub mod liveness;
pub mod orchestrator;
pub mod runtime;
pub mod store;
pub mod types;

pub use control::{ControlPlane, LoopState, ShutdownReason};
pub use discovery::Registry;
pub use layout::StorageLayout;
pub use liveness::LivenessTracker;
pub use orchestrator::{InstructionsReport, OrchestratorBridge};
pub use runtime::{
    handler_fn, AgentRuntime, EnvelopeHandler, FnHandler, RunSummary, RuntimeConfig, RuntimeError,
};
pub use store::{MarkOutcome, MessageStore, PurgeReport, ReceiveOptions};
pub use types::{
    CapabilityCard, CardSource, DiscoveredAgent, DiscoveryFilter, Envelope, EnvelopeKind,
    LivenessStatus, OrchestratorDescriptor, OrchestratorStatus, PROTOCOL_VERSION,
};

use serde_json::Value;

use crate::config::ResolvedConfig;
use crate::error::BusResult;

/// One participant's view of the bus.
#[derive(Debug, Clone)]
pub struct AgentBus {
    layout: StorageLayout,
    card: CardSource,
    liveness: LivenessTracker,
    store: MessageStore,
    registry: Registry,
    orchestrator: OrchestratorBridge,
}

impl AgentBus {
    /// Bus rooted at `layout` with default timing.
    pub fn new(layout: StorageLayout, card: impl Into<CardSource>) -> Self {
        let liveness = LivenessTracker::new(layout.clone());
        Self::assemble(layout, card.into(), liveness)
    }

    /// Bus using the resolved base directory and timing settings.
    pub fn from_config(config: &ResolvedConfig, card: impl Into<CardSource>) -> Self {
        let layout = config.layout();
        let liveness = LivenessTracker::new(layout.clone())
            .with_staleness_window(config.staleness_window)
            .with_lock_timeout(config.lock_timeout);
        Self::assemble(layout, card.into(), liveness)
    }

    fn assemble(layout: StorageLayout, card: CardSource, liveness: LivenessTracker) -> Self {
        let store = MessageStore::new(layout.clone(), card.clone(), liveness.clone());
        let orchestrator = OrchestratorBridge::new(layout.clone());
        let registry = Registry::new(
            layout.clone(),
            card.clone(),
            liveness.clone(),
            store.clone(),
            orchestrator.clone(),
        );
        Self {
            layout,
            card,
            liveness,
            store,
            registry,
            orchestrator,
        }
    }

    /// Create the storage areas and an empty liveness document.
    pub async fn init(&self) -> BusResult<()> {
        self.layout.ensure().await
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn card(&self) -> &CardSource {
        &self.card
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &OrchestratorBridge {
        &self.orchestrator
    }

    // ========================================================================
    // Shortcuts
    // ========================================================================

    pub async fn send(&self, recipient_id: &str, body: Value, kind: EnvelopeKind) -> BusResult<Envelope> {
        self.store.send(recipient_id, body, kind).await
    }

    pub async fn receive(&self, options: ReceiveOptions) -> BusResult<Vec<Envelope>> {
        self.store.receive(options).await
    }

    pub async fn respond(&self, original: &Envelope, body: Value) -> BusResult<Envelope> {
        self.store.respond(original, body).await
    }

    pub async fn publish(&self) -> BusResult<usize> {
        self.registry.publish().await
    }

    pub async fn discover(&self, filter: &DiscoveryFilter) -> BusResult<Vec<DiscoveredAgent>> {
        self.registry.discover(filter).await
    }

    pub async fn deregister(&self, identity: &str) -> BusResult<()> {
        self.registry.deregister(identity).await
    }

    /// Refresh the local participant's liveness entry.
    pub async fn ping(&self) -> BusResult<()> {
        let card = self.card.load().await?;
        self.liveness.ping(&card.id).await
    }

    pub async fn is_active(&self, identity: &str) -> bool {
        self.liveness.is_active(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_two_participants_exchange() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let alpha_card = CapabilityCard::new("Alpha");
        let beta_card = CapabilityCard::new("Beta").with_capability("search");

        let alpha = AgentBus::new(layout.clone(), alpha_card.clone());
        let beta = AgentBus::new(layout, beta_card.clone());
        alpha.init().await.unwrap();
        alpha.publish().await.unwrap();
        beta.publish().await.unwrap();

        let searchers = alpha
            .discover(&DiscoveryFilter::active().with_capability("search"))
            .await
            .unwrap();
        assert_eq!(searchers.len(), 1);
        assert_eq!(searchers[0].card.id, beta_card.id);

        alpha
            .send(&beta_card.id, json!({"text": "hi"}), EnvelopeKind::Query)
            .await
            .unwrap();
        let inbox = beta
            .receive(ReceiveOptions::default().with_kind(EnvelopeKind::Query))
            .await
            .unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].text(), Some("hi"));

        beta.respond(&inbox[0], json!({"text": "hello"})).await.unwrap();
        let replies = alpha
            .receive(ReceiveOptions::default().with_kind(EnvelopeKind::Response))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sender_id, beta_card.id);
    }

    #[tokio::test]
    async fn test_from_config_applies_settings() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig {
            base_dir: temp.path().to_path_buf(),
            staleness_window: Duration::from_secs(42),
            ..Default::default()
        };
        let bus = AgentBus::from_config(&config, CapabilityCard::new("Configured"));
        assert_eq!(bus.layout().base(), temp.path());
        assert_eq!(bus.liveness().staleness_window(), Duration::from_secs(42));

        bus.init().await.unwrap();
        bus.ping().await.unwrap();
        let id = bus.card().load().await.unwrap().id;
        assert!(bus.is_active(&id).await);
    }
}
