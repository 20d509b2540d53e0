// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! `WorkspaceConfig` is what a config file may contain (every key optional,
//! camelCase on disk, JSON or YAML). `ResolvedConfig` is the merged result
//! with every default filled in.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::document::DEFAULT_LOCK_TIMEOUT;
use crate::bus::layout::StorageLayout;
use crate::bus::liveness::{INACTIVITY_THRESHOLD, STALENESS_WINDOW};
use crate::bus::store::DEFAULT_RETENTION;

/// Directory name appended to the system temp dir for the default bus area.
pub const DEFAULT_BASE_DIR_NAME: &str = "a2a-protocol";

/// Default local card location, relative to the working directory.
pub const DEFAULT_CARD_PATH: &str = "cards/AgentCard.json";

/// Default directory where `create-agent` writes cards.
pub const DEFAULT_CARDS_DIR: &str = "cards";

/// Default delay between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Bus configuration as found in a config file.
/// Can be defined in .a2aconfig, .a2a/config.json or .a2a/config.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Root of the shared bus area
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,

    /// Capability card of the local participant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_path: Option<PathBuf>,

    /// Where `create-agent` writes new cards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cards_dir: Option<PathBuf>,

    /// Delay between runtime poll cycles, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// How long a ping keeps a participant active, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staleness_window_secs: Option<u64>,

    /// Silence after which a sweep marks a participant inactive, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactivity_threshold_secs: Option<u64>,

    /// Age after which envelopes are removed by cleanup, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,

    /// How long to wait for a shared-document lock, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub base_dir: PathBuf,
    pub card_path: PathBuf,
    pub cards_dir: PathBuf,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub staleness_window: Duration,
    #[serde(with = "duration_ms")]
    pub inactivity_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            card_path: PathBuf::from(DEFAULT_CARD_PATH),
            cards_dir: PathBuf::from(DEFAULT_CARDS_DIR),
            poll_interval: DEFAULT_POLL_INTERVAL,
            staleness_window: STALENESS_WINDOW,
            inactivity_threshold: INACTIVITY_THRESHOLD,
            retention: DEFAULT_RETENTION,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl ResolvedConfig {
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.base_dir)
    }
}

/// `<temp>/a2a-protocol`.
pub fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_BASE_DIR_NAME)
}

/// Durations are shown in milliseconds when a resolved config is printed.
mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
