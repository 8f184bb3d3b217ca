use crate::mock::{MockEndpoints, StaticGithubData};
use crate::patch::{DEFAULT_QUARANTINED_SCRIPTS, PatchOptions};
use crate::reconcile::DEFAULT_HYDRATION_SETTLE;
use crate::worker::WorkerConfig;
use relink_core::{RuleSettings, RuleTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "relink.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {} as relink config: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelinkConfig {
    #[serde(default)]
    pub rules: RuleSettings,
    #[serde(default = "default_quarantined_scripts")]
    pub quarantined_scripts: Vec<String>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default = "default_worker_script")]
    pub worker_script: String,
    #[serde(default = "default_hydration_settle_ms")]
    pub hydration_settle_ms: u64,
    #[serde(default)]
    pub github_login: Option<String>,
    /// Where the preview server keeps worker registrations. Relative paths
    /// resolve against the config file's directory.
    #[serde(default)]
    pub registrations_path: Option<PathBuf>,
}

fn default_quarantined_scripts() -> Vec<String> {
    DEFAULT_QUARANTINED_SCRIPTS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_worker_script() -> String {
    "relink-sw.js".to_string()
}

fn default_hydration_settle_ms() -> u64 {
    DEFAULT_HYDRATION_SETTLE.as_millis() as u64
}

impl RelinkConfig {
    pub fn minimal() -> Self {
        Self {
            rules: RuleSettings::default(),
            quarantined_scripts: default_quarantined_scripts(),
            worker: WorkerConfig::default(),
            worker_script: default_worker_script(),
            hydration_settle_ms: default_hydration_settle_ms(),
            github_login: None,
            registrations_path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = serde_json::from_str::<Self>(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if cfg.worker.max_fallback_attempts == 0 {
            cfg.worker.max_fallback_attempts = WorkerConfig::default().max_fallback_attempts;
        }
        if let Some(rel) = cfg.registrations_path.take() {
            cfg.registrations_path = Some(match path.parent() {
                Some(base) if rel.is_relative() => base.join(rel),
                _ => rel,
            });
        }
        Ok(cfg)
    }

    /// `dir/relink.json` when present, otherwise [`RelinkConfig::minimal`].
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(Self::minimal());
        }
        Self::load(&path)
    }

    pub fn rule_table(&self) -> RuleTable {
        RuleTable::from_settings(&self.rules)
    }

    pub fn hydration_settle(&self) -> Duration {
        Duration::from_millis(self.hydration_settle_ms)
    }

    pub fn mocks(&self) -> MockEndpoints {
        let data = match &self.github_login {
            Some(login) => StaticGithubData::new(login.as_str()),
            None => StaticGithubData::default(),
        };
        MockEndpoints::new(Arc::new(data))
    }

    pub fn patch_options(&self) -> PatchOptions {
        PatchOptions::new(Arc::new(self.rule_table()))
            .with_mocks(self.mocks())
            .with_quarantine(self.quarantined_scripts.iter().cloned())
    }
}

impl Default for RelinkConfig {
    fn default() -> Self {
        Self::minimal()
    }
}
