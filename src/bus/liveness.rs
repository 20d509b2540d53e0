// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Liveness aggregate: who is active and when they were last heard from.
//!
//! Every update is a read-merge-write of the single status document. The
//! cycle runs under a [`DocumentLock`] so updates to different identities
//! never clobber each other; if the lock cannot be had in time the update
//! proceeds anyway and the last writer wins.

use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, Utc};
#[cfg(feature = "telemetry")]
use tracing::instrument;
use tracing::{debug, warn};

use crate::error::BusResult;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::document::{read_json, write_json_atomic, DocumentLock, DEFAULT_LOCK_TIMEOUT};
use super::layout::StorageLayout;
use super::types::{LivenessDocument, LivenessEntry, LivenessStatus};

/// Entries older than this are not reported active.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Entries silent longer than this are reclassified inactive by a sweep.
pub const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(15 * 60);

/// Read/write access to the liveness aggregate.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    layout: StorageLayout,
    staleness_window: Duration,
    lock_timeout: Duration,
}

impl LivenessTracker {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            staleness_window: STALENESS_WINDOW,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    /// Mark `identity` active as of now. Other entries are untouched.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn ping(&self, identity: &str) -> BusResult<()> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        self.set_status(identity, LivenessStatus::Active, None).await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("bus.liveness.ping", start.elapsed());

        Ok(())
    }

    /// Set the status (and optionally the display name) of one entry.
    pub async fn set_status(
        &self,
        identity: &str,
        status: LivenessStatus,
        name: Option<&str>,
    ) -> BusResult<()> {
        let now = Utc::now();
        self.update(now, |doc| {
            let entry = doc.active_agents.entry(identity.to_string()).or_default();
            entry.status = status;
            entry.last_update = Some(next_timestamp(entry.last_update, now));
            if let Some(name) = name {
                entry.name = Some(name.to_string());
            }
        })
        .await
    }

    /// Merge a peer's self-announcement: active now, with its name and capabilities.
    pub async fn record_announcement(
        &self,
        identity: &str,
        name: &str,
        capabilities: &[String],
    ) -> BusResult<()> {
        let now = Utc::now();
        self.update(now, |doc| {
            let entry = doc.active_agents.entry(identity.to_string()).or_default();
            entry.status = LivenessStatus::Active;
            entry.last_update = Some(next_timestamp(entry.last_update, now));
            entry.name = Some(name.to_string());
            entry
                .extra
                .insert("capabilities".to_string(), serde_json::json!(capabilities));
        })
        .await
    }

    /// Current aggregate. Unreadable or malformed documents read as empty.
    pub async fn snapshot(&self) -> LivenessDocument {
        match read_json::<LivenessDocument>(&self.layout.liveness_file()).await {
            Ok(doc) => doc.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "Liveness document unreadable, treating as empty");
                LivenessDocument::default()
            }
        }
    }

    pub async fn entry(&self, identity: &str) -> Option<LivenessEntry> {
        self.snapshot().await.active_agents.remove(identity)
    }

    pub async fn is_active(&self, identity: &str) -> bool {
        self.is_active_at(identity, Utc::now()).await
    }

    /// Whether `identity` counts as active at instant `now`.
    pub async fn is_active_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        self.entry(identity)
            .await
            .is_some_and(|entry| is_fresh(&entry, now, self.staleness_window))
    }

    /// Flip active entries silent for longer than `threshold` to inactive.
    ///
    /// Returns the identities that changed. Intended for a coordinator's
    /// periodic sweep; the bus itself never calls this.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn reclassify_stale(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> BusResult<Vec<String>> {
        let mut changed = Vec::new();

        self.update(now, |doc| {
            for (id, entry) in doc.active_agents.iter_mut() {
                if entry.status != LivenessStatus::Active {
                    continue;
                }
                let silent = entry.last_update.map_or(true, |last| {
                    now.signed_duration_since(last)
                        .to_std()
                        .is_ok_and(|age| age > threshold)
                });
                if silent {
                    entry.status = LivenessStatus::Inactive;
                    changed.push(id.clone());
                }
            }
        })
        .await?;

        if !changed.is_empty() {
            warn!(count = changed.len(), agents = ?changed, "Reclassified silent agents as inactive");
        }
        Ok(changed)
    }

    async fn update<F>(&self, now: DateTime<Utc>, apply: F) -> BusResult<()>
    where
        F: FnOnce(&mut LivenessDocument),
    {
        let path = self.layout.liveness_file();
        let _lock = DocumentLock::acquire_or_proceed(&path, self.lock_timeout).await;

        // A malformed document fails the update instead of being overwritten.
        let mut doc = read_json::<LivenessDocument>(&path).await?.unwrap_or_default();
        apply(&mut doc);
        doc.last_update = Some(next_timestamp(doc.last_update, now));

        write_json_atomic(&path, &doc).await
    }
}

/// Whether an entry is active and was updated within `window` of `now`.
pub fn is_fresh(entry: &LivenessEntry, now: DateTime<Utc>, window: Duration) -> bool {
    if entry.status != LivenessStatus::Active {
        return false;
    }
    // A timestamp ahead of `now` (clock skew between hosts) counts as fresh.
    entry.last_update.is_some_and(|last| {
        now.signed_duration_since(last)
            .to_std()
            .map_or(true, |age| age <= window)
    })
}

/// `now`, nudged forward so timestamps never repeat or go backwards.
fn next_timestamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if prev >= now => prev + chrono::Duration::milliseconds(1),
        _ => now,
    }
}
