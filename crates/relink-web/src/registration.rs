//! Worker registrations, persisted across page loads.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub script_url: String,
    pub scope: String,
    pub rules_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Installed,
    Unchanged,
    Updated { from: u32 },
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("scope '{0}' must be an absolute URL")]
    InvalidScope(String),

    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub trait RegistrationStore {
    fn load(&self) -> Result<Vec<Registration>, RegistrationError>;
    fn save(&mut self, registrations: &[Registration]) -> Result<(), RegistrationError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRegistrations {
    entries: Vec<Registration>,
}

impl RegistrationStore for MemoryRegistrations {
    fn load(&self) -> Result<Vec<Registration>, RegistrationError> {
        Ok(self.entries.clone())
    }

    fn save(&mut self, registrations: &[Registration]) -> Result<(), RegistrationError> {
        self.entries = registrations.to_vec();
        Ok(())
    }
}

/// JSON array on disk. A missing file is an empty store.
#[derive(Debug, Clone)]
pub struct FileRegistrations {
    path: PathBuf,
}

impl FileRegistrations {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistrationStore for FileRegistrations {
    fn load(&self) -> Result<Vec<Registration>, RegistrationError> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|source| RegistrationError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| RegistrationError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&mut self, registrations: &[Registration]) -> Result<(), RegistrationError> {
        let write_err = |source| RegistrationError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let body = serde_json::to_string_pretty(registrations).map_err(|source| {
            RegistrationError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, body).map_err(write_err)
    }
}

/// Registers `script_url` for `scope` at `rules_version`.
///
/// Same scope and version is a no-op; an older version is updated in place.
pub fn register(
    store: &mut dyn RegistrationStore,
    script_url: &str,
    scope: &str,
    rules_version: u32,
) -> Result<RegistrationOutcome, RegistrationError> {
    let scope = normalize_scope(scope)?;
    let mut entries = store.load()?;

    let outcome = match entries.iter_mut().find(|r| r.scope == scope) {
        Some(existing)
            if existing.rules_version == rules_version && existing.script_url == script_url =>
        {
            return Ok(RegistrationOutcome::Unchanged);
        }
        Some(existing) => {
            let from = existing.rules_version;
            existing.rules_version = rules_version;
            existing.script_url = script_url.to_string();
            RegistrationOutcome::Updated { from }
        }
        None => {
            entries.push(Registration {
                script_url: script_url.to_string(),
                scope: scope.clone(),
                rules_version,
            });
            RegistrationOutcome::Installed
        }
    };

    store.save(&entries)?;
    info!(scope = %scope, script_url, rules_version, ?outcome, "worker registration");
    Ok(outcome)
}

/// The registration whose scope is the longest prefix of `url`.
pub fn lookup(
    store: &dyn RegistrationStore,
    url: &str,
) -> Result<Option<Registration>, RegistrationError> {
    Ok(store
        .load()?
        .into_iter()
        .filter(|r| url.starts_with(&r.scope))
        .max_by_key(|r| r.scope.len()))
}

fn normalize_scope(scope: &str) -> Result<String, RegistrationError> {
    let mut url = Url::parse(scope).map_err(|_| RegistrationError::InvalidScope(scope.to_string()))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.into())
}
