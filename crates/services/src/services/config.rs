//! Engine configuration.
//!
//! One JSON file under the asset directory. Loading never fails: a missing
//! or unreadable file falls back to defaults and the defaults are written
//! back so the operator has something to edit.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use utils::assets::asset_dir;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConductorConfig {
    /// Retry ceiling for autonomous step failures.
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: i64,
    /// Wave concurrency cap applied to workflows that do not set their own.
    #[serde(default = "default_max_parallel")]
    pub default_max_parallel: i64,
    #[serde(default = "default_workers_path")]
    pub workers_path: PathBuf,
    #[serde(default = "default_guardians_dir")]
    pub guardians_dir: PathBuf,
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    #[serde(default = "default_guardian_poll_interval_secs")]
    pub guardian_poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub guardian_enabled: bool,
}

fn default_max_step_attempts() -> i64 {
    3
}

fn default_max_parallel() -> i64 {
    4
}

fn default_workers_path() -> PathBuf {
    asset_dir().join("workers.json")
}

fn default_guardians_dir() -> PathBuf {
    asset_dir().join("guardians")
}

fn default_sandbox_root() -> PathBuf {
    asset_dir().join("sandboxes")
}

fn default_guardian_poll_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            default_max_parallel: default_max_parallel(),
            workers_path: default_workers_path(),
            guardians_dir: default_guardians_dir(),
            sandbox_root: default_sandbox_root(),
            guardian_poll_interval_secs: default_guardian_poll_interval_secs(),
            guardian_enabled: default_true(),
        }
    }
}

impl ConductorConfig {
    /// Load from `path`, falling back to defaults. A missing or corrupt file
    /// gets the defaults written back; a filesystem error leaves the file
    /// alone and just uses defaults for this run.
    pub fn load(path: &Path) -> Self {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<ConductorConfig>(&raw) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(
                        "Config at {} is unreadable ({}), rewriting defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!("Could not read config at {}: {}", path.display(), e);
                return Self::default();
            }
        };

        if let Err(e) = config.save(path) {
            tracing::warn!("Could not write config to {}: {}", path.display(), e);
        }
        config
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, raw)
    }
}
