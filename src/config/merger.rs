// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options (and their environment fallbacks) that override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub base_dir: Option<PathBuf>,
    pub card_path: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options / environment
/// 2. Workspace config (.a2aconfig, .a2a/config.json, .a2a/config.yaml)
/// 3. Global config (~/.a2a/config.json)
/// 4. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let mut result = default_config();

    if let Some(config) = global {
        apply_workspace_config(&mut result, &config)?;
    }

    if let Some(config) = workspace {
        apply_workspace_config(&mut result, &config)?;
    }

    apply_cli_options(&mut result, &cli)?;

    Ok(result)
}

fn apply_workspace_config(
    result: &mut ResolvedConfig,
    config: &WorkspaceConfig,
) -> Result<(), ConfigError> {
    if let Some(ref base_dir) = config.base_dir {
        result.base_dir = base_dir.clone();
    }

    if let Some(ref card_path) = config.card_path {
        result.card_path = card_path.clone();
    }

    if let Some(ref cards_dir) = config.cards_dir {
        result.cards_dir = cards_dir.clone();
    }

    if let Some(ms) = config.poll_interval_ms {
        result.poll_interval = positive_millis("pollIntervalMs", ms)?;
    }

    if let Some(secs) = config.staleness_window_secs {
        result.staleness_window = positive_secs("stalenessWindowSecs", secs)?;
    }

    if let Some(secs) = config.inactivity_threshold_secs {
        result.inactivity_threshold = positive_secs("inactivityThresholdSecs", secs)?;
    }

    if let Some(secs) = config.retention_secs {
        result.retention = positive_secs("retentionSecs", secs)?;
    }

    if let Some(ms) = config.lock_timeout_ms {
        result.lock_timeout = Duration::from_millis(ms);
    }

    Ok(())
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) -> Result<(), ConfigError> {
    if let Some(ref base_dir) = cli.base_dir {
        result.base_dir = base_dir.clone();
    }

    if let Some(ref card_path) = cli.card_path {
        result.card_path = card_path.clone();
    }

    if let Some(ms) = cli.poll_interval_ms {
        result.poll_interval = positive_millis("poll interval", ms)?;
    }

    Ok(())
}

fn positive_millis(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    positive_millis(field, secs.saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_defaults_only() {
        let config = merge_config(None, None, CliOptions::default()).unwrap();
        assert_eq!(config, ResolvedConfig::default());
    }

    #[test]
    fn test_workspace_overrides_global() {
        let global = WorkspaceConfig {
            base_dir: Some(PathBuf::from("/global")),
            retention_secs: Some(60),
            ..Default::default()
        };
        let workspace = WorkspaceConfig {
            base_dir: Some(PathBuf::from("/workspace")),
            ..Default::default()
        };

        let config = merge_config(Some(global), Some(workspace), CliOptions::default()).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/workspace"));
        assert_eq!(config.retention, Duration::from_secs(60));
    }

    #[test]
    fn test_cli_overrides_everything() {
        let workspace = WorkspaceConfig {
            base_dir: Some(PathBuf::from("/workspace")),
            card_path: Some(PathBuf::from("cards/A.json")),
            ..Default::default()
        };
        let cli = CliOptions {
            base_dir: Some(PathBuf::from("/cli")),
            poll_interval_ms: Some(100),
            ..Default::default()
        };

        let config = merge_config(None, Some(workspace), cli).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/cli"));
        assert_eq!(config.card_path, PathBuf::from("cards/A.json"));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let workspace = WorkspaceConfig {
            poll_interval_ms: Some(0),
            ..Default::default()
        };
        let err = merge_config(None, Some(workspace), CliOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "pollIntervalMs"));
    }
}
