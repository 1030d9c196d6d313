//! Configuration management for tollgate.
//!
//! Loads configuration from ${TOLLGATE_HOME}/config.toml with sensible defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Transcript rendering settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Tool displays per scope that stay expanded
    pub recent_tools_expanded: usize,
    /// Tools shown collapsed on arrival
    pub collapse_by_default: Vec<String>,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            recent_tools_expanded: Config::DEFAULT_RECENT_TOOLS_EXPANDED,
            collapse_by_default: ["WebSearch", "WebFetch", "AskUserQuestion"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Which tools open a nested scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub tools: Vec<String>,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            tools: vec!["Task".to_string()],
        }
    }
}

/// Permission groups: group name -> tool names sharing one approval flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub groups: BTreeMap<String, Vec<String>>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            groups: BTreeMap::from([(
                "edits".to_string(),
                vec!["Edit".to_string(), "Write".to_string()],
            )]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Write logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Config::DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transcript: TranscriptConfig,
    pub delegation: DelegationConfig,
    pub permissions: PermissionsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub const DEFAULT_RECENT_TOOLS_EXPANDED: usize = 2;
    pub const DEFAULT_LOG_LEVEL: &'static str = "warn";

    /// Loads configuration from the default path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the default config template to `path`.
    ///
    /// Fails if a file already exists there.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for tollgate configuration.
    //!
    //! TOLLGATE_HOME resolution order:
    //! 1. TOLLGATE_HOME environment variable (if set)
    //! 2. ~/.config/tollgate (default)

    use std::path::PathBuf;

    /// Returns the tollgate home directory.
    pub fn tollgate_home() -> PathBuf {
        if let Ok(home) = std::env::var("TOLLGATE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .unwrap_or_default()
            .join(".config")
            .join("tollgate")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        tollgate_home().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.transcript.recent_tools_expanded, 2);
        assert_eq!(config.delegation.tools, vec!["Task".to_string()]);
        assert_eq!(
            config.permissions.groups.get("edits"),
            Some(&vec!["Edit".to_string(), "Write".to_string()])
        );
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[transcript]\nrecent_tools_expanded = 5\n").unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.transcript.recent_tools_expanded, 5);
        assert_eq!(
            config.transcript.collapse_by_default,
            TranscriptConfig::default().collapse_by_default
        );
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_invalid_config_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "transcript = 3\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_init_creates_config_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subdir").join("config.toml");

        Config::init(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "# mine\n").unwrap();

        assert!(Config::init(&path).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "# mine\n");
    }
}
