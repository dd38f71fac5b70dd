//! Runtime configuration
//!
//! Read from a TOML file, then overridden by `CIPHER_QUESTS_*` environment
//! variables. Every field has a default so a missing file is fine.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

/// Used when neither `--config` nor `CIPHER_QUESTS_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "cipher_quests.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub signs_path: PathBuf,
    pub session_path: PathBuf,
    /// Directive added to the `RUST_LOG` filter
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:cipher_quests.db?mode=rwc".to_string(),
            signs_path: PathBuf::from("data/signs.json"),
            session_path: PathBuf::from("data/session.json"),
            log_filter: "cipher_quests=info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load `path` and apply overrides from the process environment
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse a config file; a missing file gives the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replace fields whose variable `lookup` returns a non-empty value for
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("CIPHER_QUESTS_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(path) = get("CIPHER_QUESTS_SIGNS_PATH") {
            self.signs_path = PathBuf::from(path);
        }
        if let Some(path) = get("CIPHER_QUESTS_SESSION_PATH") {
            self.session_path = PathBuf::from(path);
        }
        if let Some(filter) = get("CIPHER_QUESTS_LOG") {
            self.log_filter = filter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_url = \"sqlite::memory:\"").unwrap();
        writeln!(file, "signs_path = \"/srv/signs.json\"").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.signs_path, PathBuf::from("/srv/signs.json"));
        assert_eq!(config.session_path, PathBuf::from("data/session.json"));
    }

    #[test]
    fn test_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_url = [").unwrap();
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CIPHER_QUESTS_DATABASE_URL", "sqlite:other.db"),
            ("CIPHER_QUESTS_LOG", "cipher_quests=debug"),
            ("CIPHER_QUESTS_SIGNS_PATH", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.database_url, "sqlite:other.db");
        assert_eq!(config.log_filter, "cipher_quests=debug");
        assert_eq!(config.signs_path, PathBuf::from("data/signs.json"));
    }
}
