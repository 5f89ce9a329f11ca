use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "http://192.168.2.1:8888/json";
pub const DEFAULT_REFRESH_SECS: u64 = 60;
pub const DEFAULT_TICK_SECS: u64 = 5 * 60;

const MAX_SERVER_URL_LEN: usize = 2048;
const DATA_DIR_ENV: &str = "NARAGAIDEN_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("please fix the following:\n\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_refresh_secs() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            refresh_secs: DEFAULT_REFRESH_SECS,
            tick_secs: DEFAULT_TICK_SECS,
        }
    }
}

impl ClientConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

/// Values given on the command line; each one wins over the saved config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub refresh_secs: Option<u64>,
    pub tick_secs: Option<u64>,
}

pub fn validate_config(cfg: &ClientConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    let server_url = cfg.server_url.trim();
    if server_url.is_empty() {
        errors.push("Server URL is required.".to_string());
    } else if server_url.len() > MAX_SERVER_URL_LEN {
        errors.push(format!(
            "Server URL is too long ({} > {} chars).",
            server_url.len(),
            MAX_SERVER_URL_LEN
        ));
    } else {
        match Url::parse(server_url) {
            Ok(url) => {
                let scheme = url.scheme();
                if scheme != "http" && scheme != "https" {
                    errors.push("Server URL must start with http:// or https://.".to_string());
                }
            }
            Err(err) => {
                errors.push(format!("Server URL is invalid: {err}"));
            }
        }
    }

    if cfg.refresh_secs == 0 {
        errors.push("Refresh interval must be at least 1 second.".to_string());
    }
    if cfg.tick_secs == 0 {
        errors.push("Tick interval must be at least 1 second.".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

pub fn data_dir(explicit: Option<&Path>) -> PathBuf {
    data_dir_from(explicit, |key| std::env::var_os(key))
}

/// Resolves the data directory from an explicit path or the environment lookup `env`.
pub fn data_dir_from(explicit: Option<&Path>, env: impl Fn(&str) -> Option<OsString>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = env(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(base) = env("LOCALAPPDATA") {
        return PathBuf::from(base).join("NaraGaiden");
    }
    if let Some(base) = env("XDG_DATA_HOME") {
        return PathBuf::from(base).join("nara-gaiden");
    }
    if let Some(home) = env("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("nara-gaiden");
    }
    PathBuf::from(".nara-gaiden")
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("state.json")
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join("logs").join("nara-gaiden.log")
}

pub fn load_config(path: &Path) -> Result<Option<ClientConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: ClientConfig = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate_config(&cfg)?;
    Ok(Some(cfg))
}

pub fn save_config(path: &Path, cfg: &ClientConfig) -> Result<(), ConfigError> {
    validate_config(cfg)?;

    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(cfg).map_err(ConfigError::Serialize)?;

    let mut attempt = 1;
    loop {
        let result = std::fs::write(&tmp_path, payload.as_bytes())
            .and_then(|()| std::fs::rename(&tmp_path, path));
        match result {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= MAX_ATTEMPTS => {
                return Err(ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                });
            }
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

/// Saved config (or defaults when missing or invalid) with `overrides` applied, validated.
pub fn resolve_config(
    path: &Path,
    overrides: &ConfigOverrides,
) -> Result<ClientConfig, ConfigError> {
    let mut cfg = match load_config(path) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => ClientConfig::default(),
        Err(err) => {
            warn!("saved config invalid, using defaults: {}", err);
            ClientConfig::default()
        }
    };

    if let Some(server_url) = overrides.server_url.as_deref() {
        cfg.server_url = server_url.trim().to_owned();
    }
    if let Some(refresh_secs) = overrides.refresh_secs {
        cfg.refresh_secs = refresh_secs;
    }
    if let Some(tick_secs) = overrides.tick_secs {
        cfg.tick_secs = tick_secs;
    }

    validate_config(&cfg)?;
    Ok(cfg)
}
