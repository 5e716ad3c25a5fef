use serde::{Deserialize, Serialize};
use dirs_next::home_dir;
use std::{fs, path::{Path, PathBuf}};
use thiserror::Error;

/// Error type for config loading/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Host runtime configuration. The embedding process may hand in its own
/// instance or load one from YAML; every field has a working default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory scanned for device modules by `load_dir` and resolved
    /// against by the `load_device` scripting binding.
    pub device_dir: PathBuf,
    /// Log level hint for the embedder ("info" | "debug" | ...).
    pub log_level: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { device_dir: PathBuf::from("./devices"), log_level: None }
    }
}

impl HostConfig {
    /// Read a YAML file, layer it over the defaults, validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        merge(&mut cfg, read_yaml(path)?);
        validate(&cfg)?;
        Ok(cfg)
    }

    /// Search conventional locations (first hit wins); defaults when no
    /// file is present.
    pub fn load() -> Result<Self, ConfigError> {
        match find_config_file() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Try common locations in order.
fn find_config_file() -> Option<PathBuf> {
    // XDG-style: ~/.config/vmdev/config.yaml
    if let Some(home) = home_dir() {
        let p = home.join(".config/vmdev/config.yaml");
        if p.exists() { return Some(p) }
        let p = home.join(".config/vmdev.yaml");
        if p.exists() { return Some(p) }
    }
    // project local
    for candidate in &["vmdev.yaml", "config/vmdev.yaml"] {
        let p = PathBuf::from(candidate);
        if p.exists() { return Some(p) }
    }
    None
}

fn read_yaml(path: &Path) -> Result<PartialConfig, ConfigError> {
    let s = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&s)?)
}

/// All fields optional so a file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    device_dir: Option<PathBuf>,
    log_level: Option<String>,
}

fn merge(dst: &mut HostConfig, src: PartialConfig) {
    if let Some(dir) = src.device_dir { dst.device_dir = dir; }
    if src.log_level.is_some()        { dst.log_level = src.log_level; }
}

fn validate(cfg: &HostConfig) -> Result<(), ConfigError> {
    if cfg.device_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation("device_dir must not be empty".into()));
    }
    if let Some(level) = cfg.log_level.as_deref() {
        match level {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "log_level `{other}` is not one of error|warn|info|debug|trace"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_device_dir() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.device_dir, PathBuf::from("./devices"));
        assert!(cfg.log_level.is_none());
    }

    #[test]
    fn merge_overrides_only_present_fields() {
        let mut cfg = HostConfig::default();
        merge(
            &mut cfg,
            PartialConfig { device_dir: Some(PathBuf::from("/opt/vmdev/devices")), log_level: None },
        );
        assert_eq!(cfg.device_dir, PathBuf::from("/opt/vmdev/devices"));
        assert!(cfg.log_level.is_none());
    }

    #[test]
    fn validation_rejects_unknown_log_level() {
        let cfg = HostConfig { device_dir: PathBuf::from("./devices"), log_level: Some("loud".into()) };
        assert!(matches!(validate(&cfg), Err(ConfigError::Validation(_))));

        let cfg = HostConfig { device_dir: PathBuf::from("./devices"), log_level: Some("debug".into()) };
        assert!(validate(&cfg).is_ok());
    }
}
