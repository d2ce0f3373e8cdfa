//! # sandfs-config
//!
//! Configuration management for sandfs.
//!
//! Loads configuration from:
//! 1. `~/.sandfs/config.toml` (global)
//! 2. `.sandfs/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pack: PackConfig,
    pub links: LinksConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pack: PackConfig::default(),
            links: LinksConfig::default(),
        }
    }
}

/// Settings for the packed storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// DEFLATE payloads that are large enough and actually shrink
    pub compression: bool,
    /// Verify the pack blob checksum on load
    pub verify_checksums: bool,
    /// Name of the backing blob holding packed content
    pub blob_name: String,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            compression: true,
            verify_checksums: true,
            blob_name: ".sandfs.pack".to_string(),
        }
    }
}

/// Settings for the symlink emulation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinksConfig {
    /// Name of the backing blob holding the link table
    pub blob_name: String,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            blob_name: ".sandfs.links".to_string(),
        }
    }
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.sandfs/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.sandfs/config.toml) - overrides global
        let project_path = Path::new(".sandfs/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            config = toml::from_str(&contents)?;
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load config from an explicit TOML file, with env overrides applied
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: ~/.sandfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".sandfs/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SANDFS_COMPRESSION") {
            self.pack.compression = parse_bool(&v).unwrap_or(self.pack.compression);
        }
        if let Ok(v) = std::env::var("SANDFS_VERIFY_CHECKSUMS") {
            self.pack.verify_checksums = parse_bool(&v).unwrap_or(self.pack.verify_checksums);
        }
        if let Ok(name) = std::env::var("SANDFS_PACK_BLOB") {
            self.pack.blob_name = name;
        }
        if let Ok(name) = std::env::var("SANDFS_LINKS_BLOB") {
            self.links.blob_name = name;
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.pack.compression);
        assert!(config.pack.verify_checksums);
        assert_eq!(config.pack.blob_name, ".sandfs.pack");
        assert_eq!(config.links.blob_name, ".sandfs.links");
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempdir().unwrap();
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[pack]
compression = false
blob_name = "custom.pack"
"#,
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert!(!config.pack.compression);
        assert_eq!(config.pack.blob_name, "custom.pack");
        // Unspecified sections keep defaults
        assert!(config.pack.verify_checksums);
        assert_eq!(config.links.blob_name, ".sandfs.links");
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
