//! CLI configuration file
//!
//! JSON, every field optional. A missing file means defaults.

use anyhow::{bail, Context};
use directories::ProjectDirs;
use ledgerkey_core::ChainConfig;
use ledgerkey_signer::{RedirectConfig, RelayConfig, TrackerConfig};
use ledgerkey_storage::{EnvelopeParams, MAX_ITERATIONS, MIN_ITERATIONS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "ledgerkey.db";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "Ledgerkey", "ledgerkey")
}

/// Default config location for this platform
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// SQLite file; defaults to the platform data directory
    pub database_path: Option<PathBuf>,
    /// RPC node and key prefix
    pub chain: ChainConfig,
    /// Transaction status endpoint; tracker polling is off without it
    pub status_url: Option<String>,
    pub relay: RelayConfig,
    pub redirect: RedirectConfig,
    pub tracker: TrackerConfig,
    /// KDF cost for newly sealed vaults
    pub envelope: EnvelopeParams,
}

impl CliConfig {
    /// Load from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let iterations = self.envelope.iterations;
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
            bail!(
                "envelope.iterations must be between {} and {}, got {}",
                MIN_ITERATIONS,
                MAX_ITERATIONS,
                iterations
            );
        }
        if self.tracker.max_attempts == 0 {
            bail!("tracker.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Database file, creating its parent directory
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        let path = match &self.database_path {
            Some(path) => path.clone(),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
                .context("no home directory; set database_path in the config")?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        Ok(path)
    }
}
