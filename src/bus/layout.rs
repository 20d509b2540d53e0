// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout of the shared bus area.
//!
//! ```text
//! <base>/discovery/<identity>.json
//! <base>/messages/<envelope_id>.json
//! <base>/messages/<recipient_id>/<envelope_id>.json
//! <base>/messages/read/<envelope_id>.json
//! <base>/status/agents_status.json
//! <base>/orchestrator/orchestrator.json
//! <base>/orchestrator/status.json
//! <base>/orchestrator/global_instructions.json
//! <base>/orchestrator/<identity>_instructions.json
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{BusError, BusResult};

use super::document::write_json_atomic;
use super::types::LivenessDocument;

/// Directory holding one capability card per participant.
pub const DISCOVERY_DIR: &str = "discovery";
/// Global inbox directory.
pub const MESSAGES_DIR: &str = "messages";
/// Consumed archive, nested inside the global inbox.
pub const READ_DIR: &str = "read";
/// Directory holding the liveness aggregate.
pub const STATUS_DIR: &str = "status";
/// Orchestrator hand-off area.
pub const ORCHESTRATOR_DIR: &str = "orchestrator";

const LIVENESS_FILE: &str = "agents_status.json";
const ORCHESTRATOR_FILE: &str = "orchestrator.json";
const ORCHESTRATOR_STATUS_FILE: &str = "status.json";
const GLOBAL_INSTRUCTIONS_FILE: &str = "global_instructions.json";

/// Extension of every record on the bus.
pub const RECORD_EXTENSION: &str = "json";
/// Extension of in-flight temporary files; never listed as records.
pub const TEMP_EXTENSION: &str = "tmp";

/// Paths of every shared area, relative to one base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base: PathBuf,
}

impl StorageLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn discovery_dir(&self) -> PathBuf {
        self.base.join(DISCOVERY_DIR)
    }

    pub fn discovery_record(&self, identity: &str) -> PathBuf {
        self.discovery_dir().join(record_name(identity))
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.base.join(MESSAGES_DIR)
    }

    /// Authoritative global copy of an envelope.
    pub fn global_envelope(&self, envelope_id: &str) -> PathBuf {
        self.inbox_dir().join(record_name(envelope_id))
    }

    /// Per-recipient cache directory.
    pub fn recipient_dir(&self, recipient_id: &str) -> PathBuf {
        self.inbox_dir().join(recipient_id)
    }

    pub fn recipient_envelope(&self, recipient_id: &str, envelope_id: &str) -> PathBuf {
        self.recipient_dir(recipient_id).join(record_name(envelope_id))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.inbox_dir().join(READ_DIR)
    }

    pub fn archived_envelope(&self, envelope_id: &str) -> PathBuf {
        self.archive_dir().join(record_name(envelope_id))
    }

    pub fn status_dir(&self) -> PathBuf {
        self.base.join(STATUS_DIR)
    }

    /// The liveness aggregate document.
    pub fn liveness_file(&self) -> PathBuf {
        self.status_dir().join(LIVENESS_FILE)
    }

    pub fn orchestrator_dir(&self) -> PathBuf {
        self.base.join(ORCHESTRATOR_DIR)
    }

    pub fn orchestrator_descriptor(&self) -> PathBuf {
        self.orchestrator_dir().join(ORCHESTRATOR_FILE)
    }

    pub fn orchestrator_status(&self) -> PathBuf {
        self.orchestrator_dir().join(ORCHESTRATOR_STATUS_FILE)
    }

    pub fn global_instructions(&self) -> PathBuf {
        self.orchestrator_dir().join(GLOBAL_INSTRUCTIONS_FILE)
    }

    pub fn instructions_for(&self, identity: &str) -> PathBuf {
        self.orchestrator_dir()
            .join(format!("{identity}_instructions.{RECORD_EXTENSION}"))
    }

    /// Create every shared area and seed an empty liveness aggregate.
    ///
    /// Idempotent; an existing liveness document is left untouched.
    pub async fn ensure(&self) -> BusResult<()> {
        for dir in [
            self.discovery_dir(),
            self.inbox_dir(),
            self.archive_dir(),
            self.status_dir(),
            self.orchestrator_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| BusError::setup(&dir, e))?;
        }

        let liveness = self.liveness_file();
        if !fs::try_exists(&liveness).await.unwrap_or(false) {
            write_json_atomic(&liveness, &LivenessDocument::default())
                .await
                .map_err(|e| BusError::setup(&liveness, e))?;
        }

        Ok(())
    }
}

/// Check that `id` can be used as a single path component of the bus area.
///
/// Rejects empty ids, `.` and `..`, the archive name and anything with a
/// path separator, so per-recipient paths stay under the inbox and never
/// alias the archive.
pub fn validate_identity(id: &str) -> BusResult<()> {
    let invalid = id.trim().is_empty()
        || id == "."
        || id == ".."
        || id == READ_DIR
        || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BusError::InvalidIdentity(id.to_string()));
    }
    Ok(())
}

/// File name for a record keyed by `id`.
pub fn record_name(id: &str) -> String {
    format!("{id}.{RECORD_EXTENSION}")
}

/// Record key for a path, if it names a finished record (not a temp file).
pub fn record_id(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}
