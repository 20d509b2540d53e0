// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the agent bus.
//!
//! This module provides strongly-typed errors for the storage-backed bus,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation
//! at the edges (CLI, envelope handlers, shutdown callbacks).

use std::path::Path;

use thiserror::Error;

/// Errors that can occur while operating on the shared bus storage.
#[derive(Error, Debug)]
pub enum BusError {
    /// The base directory (or one of its areas) cannot be created or read.
    #[error("Storage setup failed: {0}")]
    Setup(String),

    /// The local capability card could not be loaded.
    #[error("Capability card unavailable at {path}: {reason}")]
    CardUnavailable { path: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another process held a document lock for longer than the timeout.
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    /// An identity that cannot name a directory inside the bus area.
    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),
}

impl BusError {
    /// Create a setup error for a path.
    pub fn setup(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Setup(format!("{}: {}", path.display(), err))
    }

    /// Create an IO error with context.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(format!("{context}: {err}")),
            std::io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{context}: {err}"))
            }
            _ => Self::Io(format!("{context}: {err}")),
        }
    }

    /// Check if this error is transient (the next poll cycle may succeed).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::NotFound(_) | Self::LockTimeout(_) | Self::Serialization(_)
        )
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type for bus storage operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
