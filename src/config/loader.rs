// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::WorkspaceConfig;

/// Config file names to search for (in order).
///
/// `.a2aconfig` has no extension and is always JSON.
pub const CONFIG_FILES: &[&str] = &[".a2aconfig", ".a2a/config.json", ".a2a/config.yaml"];

/// File written by `init`.
pub const INIT_CONFIG_FILE: &str = ".a2aconfig";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".a2a";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.a2a/config.json.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration from the first config file present in `workspace_root`.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.is_file() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load a configuration file (JSON or YAML, chosen by extension).
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Save workspace configuration to `.a2aconfig` (or `filename`) under `workspace_root`.
pub fn save_workspace_config(
    workspace_root: &Path,
    config: &WorkspaceConfig,
    filename: Option<&str>,
) -> Result<PathBuf, ConfigError> {
    let filename = filename.unwrap_or(INIT_CONFIG_FILE);
    let path = workspace_root.join(filename);

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;

    Ok(path)
}

/// Write a config file pointing the workspace at `base_dir`.
pub fn init_config(workspace_root: &Path, base_dir: &Path) -> Result<PathBuf, ConfigError> {
    let config = WorkspaceConfig {
        base_dir: Some(base_dir.to_path_buf()),
        ..Default::default()
    };
    save_workspace_config(workspace_root, &config, None)
}

/// Find the workspace root by searching for config files.
///
/// Walks up the directory tree from `start` until it finds a directory
/// containing a config file or reaches the filesystem root.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        for filename in CONFIG_FILES {
            if current.join(filename).is_file() {
                return Some(current);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".a2a"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path());
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_load_a2aconfig_is_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".a2aconfig"), r#"{"baseDir": "/srv/bus"}"#).unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.base_dir, Some(PathBuf::from("/srv/bus")));
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".a2a");
        std::fs::create_dir(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.yaml"),
            "baseDir: /var/bus\npollIntervalMs: 250\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.base_dir, Some(PathBuf::from("/var/bus")));
        assert_eq!(config.poll_interval_ms, Some(250));
    }

    #[test]
    fn test_first_config_file_wins() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".a2a")).unwrap();
        std::fs::write(temp.path().join(".a2a/config.json"), r#"{"baseDir": "/second"}"#).unwrap();
        std::fs::write(temp.path().join(".a2aconfig"), r#"{"baseDir": "/first"}"#).unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.base_dir, Some(PathBuf::from("/first")));
    }

    #[test]
    fn test_malformed_config_is_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".a2aconfig"), "baseDir = nope").unwrap();
        let err = load_workspace_config(temp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_init_config() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), Path::new("/tmp/a2a-protocol")).unwrap();
        assert_eq!(path.file_name().unwrap(), ".a2aconfig");

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.base_dir, Some(PathBuf::from("/tmp/a2a-protocol")));
    }

    #[test]
    fn test_find_workspace_root() {
        let temp = TempDir::new().unwrap();
        let subdir = temp.path().join("a").join("b");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(temp.path().join(".a2aconfig"), "{}").unwrap();

        assert_eq!(find_workspace_root(&subdir).unwrap(), temp.path());
    }
}
