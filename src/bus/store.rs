// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Envelope delivery.
//!
//! The global inbox is the source of truth. Each send writes the envelope
//! there and then into the recipient's own directory, which is only a cache:
//! every receive scans the global inbox and copies in whatever the cache is
//! missing. Consumption renames the envelope into the shared `read/`
//! archive; a rename is the only arbitration between racing readers, so
//! delivery is at-least-once.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use serde_json::Value;
use tokio::fs;
#[cfg(feature = "telemetry")]
use tracing::instrument;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{BusCounter, GLOBAL_METRICS};

use super::document::{list_dirs, list_json_files, read_json, write_atomic, write_json_atomic};
use super::layout::{validate_identity, StorageLayout, READ_DIR};
use super::liveness::LivenessTracker;
use super::types::{CapabilityCard, CardSource, Envelope, EnvelopeKind};

/// Envelopes older than this are removed by [`MessageStore::purge_expired`].
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Options for [`MessageStore::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Archive the returned envelopes.
    pub mark_as_read: bool,
    /// Only return envelopes of this kind. The rest stay pending.
    pub kind: Option<EnvelopeKind>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            mark_as_read: true,
            kind: None,
        }
    }
}

impl ReceiveOptions {
    /// Look without consuming.
    pub fn peek() -> Self {
        Self {
            mark_as_read: false,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: EnvelopeKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Result of archiving one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Moved into the archive by this call.
    Archived,
    /// Someone (possibly this participant) archived it earlier.
    AlreadyArchived,
    /// Neither a pending copy nor an archived one exists.
    Missing,
    /// The rename failed; the envelope stays pending and is redelivered.
    Failed,
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub envelopes: usize,
    pub directories: usize,
}

/// One participant's handle on the inbox area.
#[derive(Debug, Clone)]
pub struct MessageStore {
    layout: StorageLayout,
    card: CardSource,
    liveness: LivenessTracker,
}

impl MessageStore {
    pub fn new(layout: StorageLayout, card: CardSource, liveness: LivenessTracker) -> Self {
        Self {
            layout,
            card,
            liveness,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Send `body` to `recipient_id` as the local participant.
    ///
    /// Fails without writing anything when the local card cannot be loaded.
    /// The recipient is not validated; an unknown recipient still succeeds.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, body)))]
    pub async fn send(
        &self,
        recipient_id: &str,
        body: Value,
        kind: EnvelopeKind,
    ) -> BusResult<Envelope> {
        let card = self.card.load().await?;
        let envelope = self.post(&card, recipient_id, body, kind).await?;

        if let Err(e) = self.liveness.ping(&card.id).await {
            warn!(error = %e, "Liveness refresh after send failed");
        }
        Ok(envelope)
    }

    /// Reply to `original`'s sender.
    pub async fn respond(&self, original: &Envelope, body: Value) -> BusResult<Envelope> {
        self.send(&original.sender_id, body, EnvelopeKind::Response)
            .await
    }

    /// Write an envelope from an already-resolved `sender` card.
    ///
    /// Does not touch liveness. The global copy must land; the per-recipient
    /// copy is best effort and is rebuilt by the recipient's next receive.
    pub async fn post(
        &self,
        sender: &CapabilityCard,
        recipient_id: &str,
        body: Value,
        kind: EnvelopeKind,
    ) -> BusResult<Envelope> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        validate_identity(recipient_id)?;
        let envelope = Envelope::new(sender, recipient_id, body, kind);

        let inbox = self.layout.inbox_dir();
        fs::create_dir_all(&inbox)
            .await
            .map_err(|e| BusError::io(inbox.display(), e))?;
        write_json_atomic(&self.layout.global_envelope(&envelope.envelope_id), &envelope).await?;

        let recipient_dir = self.layout.recipient_dir(recipient_id);
        let cached = match fs::create_dir_all(&recipient_dir).await {
            Ok(()) => {
                write_json_atomic(
                    &self
                        .layout
                        .recipient_envelope(recipient_id, &envelope.envelope_id),
                    &envelope,
                )
                .await
            }
            Err(e) => Err(BusError::io(recipient_dir.display(), e)),
        };
        if let Err(e) = cached {
            warn!(
                envelope = %envelope.envelope_id,
                recipient = recipient_id,
                error = %e,
                "Per-recipient copy not written, recipient will recover it from the global inbox"
            );
        }

        debug!(
            envelope = %envelope.envelope_id,
            recipient = recipient_id,
            kind = %envelope.kind,
            "Envelope sent"
        );

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.increment(BusCounter::Sent);
            GLOBAL_METRICS.record_operation("bus.send", start.elapsed());
        }

        Ok(envelope)
    }

    /// Collect the local participant's pending envelopes.
    ///
    /// Only a missing local card is an error. Storage failures degrade to
    /// "nothing delivered yet" and the next poll tries again. Returned
    /// envelopes are unique by id and ordered by creation time.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn receive(&self, options: ReceiveOptions) -> BusResult<Vec<Envelope>> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let card = self.card.load().await?;
        let identity = card.id.as_str();

        if let Err(e) = self.liveness.ping(identity).await {
            warn!(error = %e, "Liveness refresh before receive failed");
        }

        let mut pending: BTreeMap<String, Envelope> = BTreeMap::new();

        match list_json_files(&self.layout.recipient_dir(identity)).await {
            Ok(files) => {
                for path in files {
                    if let Some(envelope) = parse_envelope(&path).await {
                        pending.entry(envelope.envelope_id.clone()).or_insert(envelope);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list per-recipient inbox"),
        }

        self.replicate_missing(identity, &mut pending).await;

        let mut envelopes: Vec<Envelope> = pending
            .into_values()
            .filter(|env| options.kind.as_ref().map_or(true, |kind| &env.kind == kind))
            .collect();
        envelopes.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.envelope_id.cmp(&b.envelope_id))
        });

        if options.mark_as_read {
            for envelope in &envelopes {
                self.mark_read(identity, &envelope.envelope_id).await;
            }
        }

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.add(BusCounter::Received, envelopes.len() as u64);
            GLOBAL_METRICS.record_operation("bus.receive", start.elapsed());
        }

        Ok(envelopes)
    }

    /// Copy global envelopes addressed to `identity` into its cache.
    ///
    /// Envelopes found only globally are still returned when the copy fails.
    async fn replicate_missing(&self, identity: &str, pending: &mut BTreeMap<String, Envelope>) {
        let files = match list_json_files(&self.layout.inbox_dir()).await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Could not scan global inbox");
                return;
            }
        };

        for path in files {
            let Some(envelope) = parse_envelope(&path).await else {
                continue;
            };
            if envelope.recipient_id != identity || pending.contains_key(&envelope.envelope_id) {
                continue;
            }

            let archived = self.layout.archived_envelope(&envelope.envelope_id);
            if fs::try_exists(&archived).await.unwrap_or(false) {
                debug!(envelope = %envelope.envelope_id, "Skipping global leftover of archived envelope");
                continue;
            }

            if let Err(e) = self.copy_into_cache(identity, &path, &envelope.envelope_id).await {
                warn!(envelope = %envelope.envelope_id, error = %e, "Replication into per-recipient inbox failed");
            } else {
                debug!(envelope = %envelope.envelope_id, "Replicated envelope from global inbox");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.increment(BusCounter::Replicated);
            }
            pending.insert(envelope.envelope_id.clone(), envelope);
        }
    }

    async fn copy_into_cache(&self, identity: &str, source: &Path, envelope_id: &str) -> BusResult<()> {
        let dir = self.layout.recipient_dir(identity);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| BusError::io(dir.display(), e))?;
        let bytes = fs::read(source)
            .await
            .map_err(|e| BusError::io(source.display(), e))?;
        write_atomic(&self.layout.recipient_envelope(identity, envelope_id), &bytes).await
    }

    /// Archive one envelope of `recipient_id`.
    ///
    /// Prefers the per-recipient copy, falls back to the global one, and
    /// removes any global leftover so replication cannot resurrect it.
    pub async fn mark_read(&self, recipient_id: &str, envelope_id: &str) -> MarkOutcome {
        let archive = self.layout.archived_envelope(envelope_id);
        let local = self.layout.recipient_envelope(recipient_id, envelope_id);
        let global = self.layout.global_envelope(envelope_id);

        if let Err(e) = fs::create_dir_all(self.layout.archive_dir()).await {
            warn!(error = %e, "Archive directory unavailable");
        }

        let outcome = match fs::rename(&local, &archive).await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&global).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(envelope = envelope_id, error = %e, "Global leftover not removed");
                    }
                }
                MarkOutcome::Archived
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match fs::rename(&global, &archive).await {
                    Ok(()) => MarkOutcome::Archived,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        if fs::try_exists(&archive).await.unwrap_or(false) {
                            MarkOutcome::AlreadyArchived
                        } else {
                            MarkOutcome::Missing
                        }
                    }
                    Err(e) => {
                        warn!(envelope = envelope_id, error = %e, "Could not archive envelope");
                        MarkOutcome::Failed
                    }
                }
            }
            Err(e) => {
                warn!(envelope = envelope_id, error = %e, "Could not archive envelope");
                MarkOutcome::Failed
            }
        };

        #[cfg(feature = "telemetry")]
        {
            match outcome {
                MarkOutcome::Archived => GLOBAL_METRICS.increment(BusCounter::Archived),
                MarkOutcome::Failed => GLOBAL_METRICS.increment(BusCounter::ArchiveFailures),
                MarkOutcome::AlreadyArchived | MarkOutcome::Missing => {}
            }
        }

        outcome
    }

    /// Remove envelopes whose files are older than `max_age`.
    ///
    /// Covers the global inbox, every per-recipient cache and the archive,
    /// then removes per-recipient directories left empty.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn purge_expired(&self, max_age: Duration) -> BusResult<PurgeReport> {
        let now = SystemTime::now();
        let inbox = self.layout.inbox_dir();
        let mut report = PurgeReport::default();

        let mut dirs = vec![inbox.clone()];
        dirs.extend(list_dirs(&inbox).await?);

        for dir in &dirs {
            for path in list_json_files(dir).await? {
                if is_older_than(&path, max_age, now).await {
                    match fs::remove_file(&path).await {
                        Ok(()) => report.envelopes += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(path = %path.display(), error = %e, "Expired envelope not removed"),
                    }
                }
            }
        }

        for dir in dirs.iter().skip(1) {
            if dir.file_name().and_then(|n| n.to_str()) == Some(READ_DIR) {
                continue;
            }
            // Only succeeds when empty.
            if fs::remove_dir(dir).await.is_ok() {
                report.directories += 1;
            }
        }

        if report.envelopes > 0 || report.directories > 0 {
            debug!(envelopes = report.envelopes, directories = report.directories, "Retention sweep");
        }
        Ok(report)
    }
}

async fn parse_envelope(path: &Path) -> Option<Envelope> {
    match read_json::<Envelope>(path).await {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping unreadable envelope");
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.increment(BusCounter::Malformed);
            None
        }
    }
}

async fn is_older_than(path: &Path, max_age: Duration, now: SystemTime) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}
