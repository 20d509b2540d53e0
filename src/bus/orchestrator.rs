// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator hand-off conventions.
//!
//! At most one participant coordinates the rest. It either publishes an
//! explicit descriptor or is inferred from the discovery area by name or by
//! the `orchestration` capability. Instructions and project status are
//! plain documents in the orchestrator area; the bus only reads and reports
//! them, acting on instructions is up to each participant's handler.

use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{BusError, BusResult};

use super::discovery::read_cards;
use super::document::{read_json, write_json_atomic};
use super::layout::StorageLayout;
use super::types::{OrchestratorDescriptor, OrchestratorStatus};

/// Instructions found for one participant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionsReport {
    pub global: Option<Value>,
    pub personal: Option<Value>,
}

impl InstructionsReport {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.personal.is_none()
    }
}

/// Read/write access to the orchestrator area.
#[derive(Debug, Clone)]
pub struct OrchestratorBridge {
    layout: StorageLayout,
}

impl OrchestratorBridge {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// The coordinator, from its descriptor or inferred from discovery.
    pub async fn get_orchestrator(&self) -> Option<OrchestratorDescriptor> {
        match read_json::<OrchestratorDescriptor>(&self.layout.orchestrator_descriptor()).await {
            Ok(Some(descriptor)) => return Some(descriptor),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Orchestrator descriptor unreadable, inferring"),
        }

        let cards = match read_cards(&self.layout).await {
            Ok(cards) => cards,
            Err(e) => {
                debug!(error = %e, "Discovery area unreadable");
                return None;
            }
        };
        cards
            .iter()
            .find(|card| card.looks_like_orchestrator())
            .map(OrchestratorDescriptor::from_card)
    }

    /// The coordinator's project status, or the "unknown" placeholder.
    pub async fn get_orchestrator_status(&self) -> OrchestratorStatus {
        match read_json::<OrchestratorStatus>(&self.layout.orchestrator_status()).await {
            Ok(Some(status)) => status,
            Ok(None) => OrchestratorStatus::unknown(),
            Err(e) => {
                debug!(error = %e, "Orchestrator status unreadable");
                OrchestratorStatus::unknown()
            }
        }
    }

    /// Look for global and identity-scoped instructions and log what is there.
    pub async fn check_instructions(&self, identity: &str) -> InstructionsReport {
        let report = InstructionsReport {
            global: self.read_optional(&self.layout.global_instructions()).await,
            personal: self
                .read_optional(&self.layout.instructions_for(identity))
                .await,
        };

        if report.global.is_some() {
            debug!("Global instructions present");
        }
        if report.personal.is_some() {
            info!(agent = identity, "Instructions from orchestrator present");
        }
        report
    }

    async fn read_optional(&self, path: &std::path::Path) -> Option<Value> {
        match read_json::<Value>(path).await {
            Ok(value) => value,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Instructions unreadable");
                None
            }
        }
    }

    /// Announce `descriptor` as the coordinator.
    pub async fn publish_descriptor(&self, descriptor: &OrchestratorDescriptor) -> BusResult<()> {
        self.ensure_dir().await?;
        write_json_atomic(&self.layout.orchestrator_descriptor(), descriptor).await?;
        info!(orchestrator = %descriptor.id, name = %descriptor.name, "Orchestrator descriptor published");
        Ok(())
    }

    pub async fn write_status(&self, status: &OrchestratorStatus) -> BusResult<()> {
        self.ensure_dir().await?;
        write_json_atomic(&self.layout.orchestrator_status(), status).await
    }

    pub async fn write_global_instructions(&self, instructions: &Value) -> BusResult<()> {
        self.ensure_dir().await?;
        write_json_atomic(&self.layout.global_instructions(), instructions).await
    }

    pub async fn write_instructions(&self, identity: &str, instructions: &Value) -> BusResult<()> {
        self.ensure_dir().await?;
        write_json_atomic(&self.layout.instructions_for(identity), instructions).await
    }

    async fn ensure_dir(&self) -> BusResult<()> {
        let dir = self.layout.orchestrator_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| BusError::io(dir.display(), e))
    }
}
