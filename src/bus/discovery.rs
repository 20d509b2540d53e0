// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Capability registration and peer discovery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use serde_json::json;
use tokio::fs;
#[cfg(feature = "telemetry")]
use tracing::instrument;
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::document::{list_json_files, read_json, write_json_atomic};
use super::layout::{validate_identity, StorageLayout};
use super::liveness::LivenessTracker;
use super::orchestrator::OrchestratorBridge;
use super::store::MessageStore;
use super::types::{
    CapabilityCard, CardSource, DiscoveredAgent, DiscoveryFilter, EnvelopeKind, LivenessStatus,
};

/// Read every capability card in the discovery area.
///
/// Malformed records are skipped. Several records claiming the same
/// identity are logged and collapsed to the first one found.
pub async fn read_cards(layout: &StorageLayout) -> BusResult<Vec<CapabilityCard>> {
    let mut seen = HashSet::new();
    let mut cards = Vec::new();

    for path in list_json_files(&layout.discovery_dir()).await? {
        let card = match read_json::<CapabilityCard>(&path).await {
            Ok(Some(card)) => card,
            Ok(None) => continue,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable discovery record");
                continue;
            }
        };
        if !seen.insert(card.id.clone()) {
            warn!(agent = %card.id, path = %path.display(), "Duplicate discovery record for identity");
            continue;
        }
        cards.push(card);
    }
    Ok(cards)
}

/// Publishes the local card and answers discovery queries.
#[derive(Debug, Clone)]
pub struct Registry {
    layout: StorageLayout,
    card: CardSource,
    liveness: LivenessTracker,
    store: MessageStore,
    orchestrator: OrchestratorBridge,
    /// Last statuses seen by `discover`, refreshed on every call.
    hints: Arc<RwLock<HashMap<String, LivenessStatus>>>,
}

impl Registry {
    pub fn new(
        layout: StorageLayout,
        card: CardSource,
        liveness: LivenessTracker,
        store: MessageStore,
        orchestrator: OrchestratorBridge,
    ) -> Self {
        Self {
            layout,
            card,
            liveness,
            store,
            orchestrator,
            hints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish the local card, mark it active and announce it.
    ///
    /// Announcements go to the orchestrator, if one is discoverable, and to
    /// every other discovered participant. A failed announcement is logged
    /// and does not fail the publish. Returns the number of announcements sent.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn publish(&self) -> BusResult<usize> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let card = self.card.load().await?;

        let dir = self.layout.discovery_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| BusError::io(dir.display(), e))?;
        write_json_atomic(&self.layout.discovery_record(&card.id), &card).await?;

        if let Err(e) = self
            .liveness
            .set_status(&card.id, LivenessStatus::Active, Some(&card.name))
            .await
        {
            warn!(error = %e, "Could not mark agent active after publish");
        }

        let mut recipients: Vec<(String, bool)> = Vec::new();
        if let Some(orchestrator) = self.orchestrator.get_orchestrator().await {
            recipients.push((orchestrator.id, true));
        }
        match read_cards(&self.layout).await {
            Ok(peers) => recipients.extend(peers.into_iter().map(|peer| (peer.id, false))),
            Err(e) => warn!(error = %e, "Could not list peers to announce to"),
        }

        let mut announced = HashSet::new();
        let mut sent = 0;
        for (recipient, is_orchestrator) in recipients {
            if recipient == card.id || !announced.insert(recipient.clone()) {
                continue;
            }
            let body = announcement_body(&card, is_orchestrator);
            match self
                .store
                .post(&card, &recipient, body, EnvelopeKind::Announcement)
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => warn!(recipient = %recipient, error = %e, "Announcement not delivered"),
            }
        }

        info!(agent = %card.id, name = %card.name, announcements = sent, "Capabilities published");

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("bus.publish", start.elapsed());

        Ok(sent)
    }

    /// List published cards joined with their liveness, narrowed by `filter`.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn discover(&self, filter: &DiscoveryFilter) -> BusResult<Vec<DiscoveredAgent>> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let cards = read_cards(&self.layout).await?;
        let liveness = self.liveness.snapshot().await;

        let agents: Vec<DiscoveredAgent> = cards
            .into_iter()
            .map(|card| {
                let entry = liveness.active_agents.get(&card.id);
                let status = entry.map(|e| e.status).unwrap_or_default();
                DiscoveredAgent {
                    status,
                    active: status == LivenessStatus::Active,
                    last_update: entry.and_then(|e| e.last_update),
                    card,
                }
            })
            .collect();

        {
            let mut hints = self.hints.write().unwrap_or_else(PoisonError::into_inner);
            hints.clear();
            hints.extend(agents.iter().map(|a| (a.card.id.clone(), a.status)));
        }

        let matched: Vec<DiscoveredAgent> =
            agents.into_iter().filter(|a| filter.matches(a)).collect();

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("bus.discover", start.elapsed());

        Ok(matched)
    }

    /// Identities the last `discover` call saw as active.
    pub fn known_active(&self) -> Vec<String> {
        let hints = self.hints.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = hints
            .iter()
            .filter(|(_, status)| **status == LivenessStatus::Active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Withdraw `identity`: mark inactive, delete its cards, tell the orchestrator.
    ///
    /// Every discovery record claiming `identity` is removed, whatever its
    /// file name. Deregistering an identity that is already gone succeeds.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn deregister(&self, identity: &str) -> BusResult<()> {
        validate_identity(identity)?;

        if let Err(e) = self
            .liveness
            .set_status(identity, LivenessStatus::Inactive, None)
            .await
        {
            warn!(agent = identity, error = %e, "Could not mark agent inactive");
        }

        let record = self.layout.discovery_record(identity);
        match fs::remove_file(&record).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(agent = identity, "Discovery record already gone");
            }
            Err(e) => return Err(BusError::io(record.display(), e)),
        }
        self.remove_stray_records(identity).await?;

        self.hints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);

        self.notify_orchestrator(identity).await;

        info!(agent = identity, "Agent deregistered");
        Ok(())
    }

    /// Remove records for `identity` stored under any other file name.
    async fn remove_stray_records(&self, identity: &str) -> BusResult<()> {
        for path in list_json_files(&self.layout.discovery_dir()).await? {
            match read_json::<CapabilityCard>(&path).await {
                Ok(Some(card)) if card.id == identity => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable discovery record");
                    continue;
                }
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(agent = identity, path = %path.display(), "Removed duplicate discovery record");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BusError::io(path.display(), e)),
            }
        }
        Ok(())
    }

    /// Deregister the local participant. Returns its identity.
    pub async fn deregister_self(&self) -> BusResult<String> {
        let card = self.card.load().await?;
        self.deregister(&card.id).await?;
        Ok(card.id)
    }

    async fn notify_orchestrator(&self, identity: &str) {
        let Some(orchestrator) = self.orchestrator.get_orchestrator().await else {
            return;
        };
        if orchestrator.id == identity {
            return;
        }
        let sender = match self.card.load().await {
            Ok(card) => card,
            Err(e) => {
                debug!(error = %e, "No local card, orchestrator not notified of deregistration");
                return;
            }
        };

        let body = json!({
            "text": format!("Agent with ID {identity} has been deregistered."),
            "deregistration": true,
            "agent_id": identity,
        });
        if let Err(e) = self
            .store
            .post(&sender, &orchestrator.id, body, EnvelopeKind::Notification)
            .await
        {
            warn!(error = %e, "Deregistration notice not delivered");
        }
    }
}

fn announcement_body(card: &CapabilityCard, to_orchestrator: bool) -> serde_json::Value {
    let text = if to_orchestrator {
        format!("Agent {} ({}) is now active.", card.name, card.id)
    } else {
        format!("Agent {} ({}) has joined the system.", card.name, card.id)
    };
    json!({
        "text": text,
        "announcement": true,
        "agent_details": {
            "name": card.name,
            "id": card.id,
            "description": card.description,
            "capabilities": card.capabilities,
        },
    })
}
