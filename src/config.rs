use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::Sha256Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::syncer::SyncOptions;

/// default location of the global config
pub const GLOBAL_CONFIG_PATH: &str = "/etc/tarsync/config.toml";

/// sync configuration stored in config.toml
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// settings applied to every sync
    #[serde(default)]
    pub sync: SyncOptions,
    /// configured repositories
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoConfig>,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// load global defaults, then apply local overrides
    ///
    /// either file may be missing. local `[sync]` keys win over global ones
    /// key by key; a local repo replaces the global repo of the same name.
    pub fn load_layered(global: &Path, local: Option<&Path>) -> Result<Self> {
        let mut table = read_table(global)?.unwrap_or_default();

        if let Some(local) = local {
            if let Some(overrides) = read_table(local)? {
                merge_sync_table(&mut table, &overrides);
                let mut merged: Config = toml::Value::Table(table).try_into()?;
                let local_repos: Config = toml::Value::Table(overrides).try_into()?;
                for repo in local_repos.repos {
                    merged.upsert_repo(repo);
                }
                return Ok(merged);
            }
        }

        Ok(toml::Value::Table(table).try_into()?)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// add a repo
    pub fn add_repo(&mut self, repo: RepoConfig) -> Result<()> {
        if self.get_repo(&repo.name).is_some() {
            return Err(Error::RepoExists(repo.name));
        }
        self.repos.push(repo);
        Ok(())
    }

    /// remove a repo
    pub fn remove_repo(&mut self, name: &str) -> Result<RepoConfig> {
        let pos = self
            .repos
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::RepoNotFound(name.to_string()))?;
        Ok(self.repos.remove(pos))
    }

    /// get repo by name
    pub fn get_repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.name == name)
    }

    fn upsert_repo(&mut self, repo: RepoConfig) {
        match self.repos.iter_mut().find(|r| r.name == repo.name) {
            Some(existing) => *existing = repo,
            None => self.repos.push(repo),
        }
    }
}

/// a repository kept in sync from a tarball
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    /// live repository directory
    pub location: PathBuf,
    pub sync_uri: String,
    /// expected digest of the downloaded archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<Sha256Digest>,
}

impl RepoConfig {
    pub fn new(
        name: impl Into<String>,
        location: impl Into<PathBuf>,
        sync_uri: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            sync_uri: sync_uri.into(),
            sha256: None,
        }
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        debug!("no config at {}", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).with_path(path)?;
    Ok(Some(content.parse::<toml::Table>()?))
}

fn merge_sync_table(base: &mut toml::Table, overrides: &toml::Table) {
    let Some(toml::Value::Table(local_sync)) = overrides.get("sync") else {
        return;
    };

    match base.get_mut("sync") {
        Some(toml::Value::Table(global_sync)) => {
            for (key, value) in local_sync {
                global_sync.insert(key.clone(), value.clone());
            }
        }
        _ => {
            base.insert("sync".to_string(), toml::Value::Table(local_sync.clone()));
        }
    }
}
