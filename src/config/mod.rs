// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the bus.
//!
//! Handles loading and merging of configuration from multiple sources:
//! - Global config: ~/.a2a/config.json
//! - Workspace config: .a2aconfig, .a2a/config.json, or .a2a/config.yaml
//! - CLI options: command-line arguments and `A2A_*` environment variables
//!
//! Configuration is merged with precedence (CLI > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_global_config_dir, get_global_config_path, init_config,
    load_config_file, load_global_config, load_workspace_config, save_workspace_config,
    CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, INIT_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    default_base_dir, ResolvedConfig, WorkspaceConfig, DEFAULT_BASE_DIR_NAME, DEFAULT_CARDS_DIR,
    DEFAULT_CARD_PATH, DEFAULT_POLL_INTERVAL,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// The workspace config is looked up in `workspace_root` and its ancestors.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = match find_workspace_root(workspace_root) {
        Some(root) => load_workspace_config(&root)?,
        None => None,
    };

    merge_config(global, workspace, cli_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_workspace_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".a2aconfig"),
            r#"{"baseDir": "/srv/agents", "retentionSecs": 120}"#,
        )
        .unwrap();
        let nested = temp.path().join("agents").join("scout");
        std::fs::create_dir_all(&nested).unwrap();

        let config = load_config(&nested, CliOptions::default()).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/srv/agents"));
        assert_eq!(config.retention, std::time::Duration::from_secs(120));
    }

    #[test]
    fn test_cli_base_dir_wins() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".a2aconfig"), r#"{"baseDir": "/file"}"#).unwrap();

        let cli = CliOptions {
            base_dir: Some(PathBuf::from("/flag")),
            ..Default::default()
        };
        let config = load_config(temp.path(), cli).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/flag"));
    }
}
