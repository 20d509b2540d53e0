// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON document I/O on the shared area.
//!
//! Writers never leave a half-written record behind: content goes to a
//! uniquely named `.tmp` sibling first and is renamed into place. Shared
//! aggregates are updated under a [`DocumentLock`] so concurrent
//! read-merge-write cycles from different processes serialize.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BusError, BusResult};

use super::layout::{record_id, TEMP_EXTENSION};

/// Locks older than this are assumed abandoned by a crashed writer.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

/// Default time to wait for a lock before proceeding unlocked.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Read and parse a JSON document. A missing file reads as `None`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> BusResult<Option<T>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BusError::io(path.display(), e)),
    };
    let value = serde_json::from_str(&raw)
        .map_err(|e| BusError::Serialization(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Serialize `value` and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> BusResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes()).await
}

/// Atomically replace `path` with `content` via a temp file and rename.
pub async fn write_atomic(path: &Path, content: &[u8]) -> BusResult<()> {
    let tmp = temp_path(path);
    if let Err(e) = fs::write(&tmp, content).await {
        return Err(BusError::io(tmp.display(), e));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(BusError::io(path.display(), e));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{}.{TEMP_EXTENSION}", Uuid::new_v4().simple()))
}

/// List finished JSON records directly inside `dir`, sorted by path.
///
/// A missing directory lists as empty; sub-directories and temp files are skipped.
pub async fn list_json_files(dir: &Path) -> BusResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BusError::io(dir.display(), e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BusError::io(dir.display(), e))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && record_id(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// List sub-directories directly inside `dir`. A missing directory lists as empty.
pub async fn list_dirs(dir: &Path) -> BusResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BusError::io(dir.display(), e)),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BusError::io(dir.display(), e))?
    {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Advisory cross-process lock guarding one shared document.
///
/// Implemented as a `<document>.lock` file created with `create_new`. The
/// file is removed when the guard drops.
#[derive(Debug)]
pub struct DocumentLock {
    path: PathBuf,
}

impl DocumentLock {
    /// Acquire the lock for `document`, waiting up to `timeout`.
    pub async fn acquire(document: &Path, timeout: Duration) -> BusResult<Self> {
        let path = lock_path(document);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        debug!(lock = %path.display(), "Breaking stale document lock");
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                }
                Err(e) => return Err(BusError::io(path.display(), e)),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BusError::LockTimeout(document.display().to_string()));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Acquire the lock, or proceed without it after `timeout`.
    ///
    /// Returning `None` means the caller's update is last-writer-wins.
    pub async fn acquire_or_proceed(document: &Path, timeout: Duration) -> Option<Self> {
        match Self::acquire(document, timeout).await {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!(document = %document.display(), error = %e, "Proceeding without document lock");
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(document: &Path) -> PathBuf {
    let name = document
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    document.with_file_name(format!("{name}.lock"))
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}
