//! Persistence contract for server configuration and instance state.
//!
//! The supervisor only talks to the [`ConfigStore`] trait. Two
//! implementations ship with the crate: [`FileConfigStore`], which keeps the
//! configuration document on disk (JSON or YAML) with instance state in a
//! JSON side file, and [`MemoryConfigStore`] for embedding and tests.

use crate::config::{Config, ServerConfig, is_yaml_path, validate_server_config};
use crate::error::{Error, Result};
use crate::server::InstanceState;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Load/save contract for configuration and last-known instance state
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All configured servers
    async fn load_servers(&self) -> Result<Vec<ServerConfig>>;

    /// One server's configuration, if present
    async fn load_server(&self, id: &str) -> Result<Option<ServerConfig>>;

    /// Insert or replace a server configuration
    async fn save_server(&self, config: &ServerConfig) -> Result<()>;

    /// All persisted instance states
    async fn load_instances(&self) -> Result<Vec<InstanceState>>;

    /// Insert or replace one instance state
    async fn save_instance(&self, state: &InstanceState) -> Result<()>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryConfigStore {
    servers: Mutex<BTreeMap<String, ServerConfig>>,
    instances: Mutex<BTreeMap<String, InstanceState>>,
}

impl MemoryConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the servers of a configuration
    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        if let Ok(mut servers) = store.servers.lock() {
            servers.extend(config.mcp_servers.clone());
        }
        store
    }
}

fn poisoned() -> Error {
    Error::Storage("Store lock poisoned".to_string())
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_servers(&self) -> Result<Vec<ServerConfig>> {
        let servers = self.servers.lock().map_err(|_| poisoned())?;
        Ok(servers.values().cloned().collect())
    }

    async fn load_server(&self, id: &str) -> Result<Option<ServerConfig>> {
        let servers = self.servers.lock().map_err(|_| poisoned())?;
        Ok(servers.get(id).cloned())
    }

    async fn save_server(&self, config: &ServerConfig) -> Result<()> {
        validate_server_config(config)?;
        let mut servers = self.servers.lock().map_err(|_| poisoned())?;
        servers.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn load_instances(&self) -> Result<Vec<InstanceState>> {
        let instances = self.instances.lock().map_err(|_| poisoned())?;
        Ok(instances.values().cloned().collect())
    }

    async fn save_instance(&self, state: &InstanceState) -> Result<()> {
        let mut instances = self.instances.lock().map_err(|_| poisoned())?;
        instances.insert(state.server_id.clone(), state.clone());
        Ok(())
    }
}

/// File-backed store.
///
/// Writes are serialized through an async mutex so concurrent saves from
/// different servers cannot interleave their read-modify-write cycles.
pub struct FileConfigStore {
    config_path: PathBuf,
    state_path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileConfigStore {
    /// Create a store for `config_path`. Instance state goes to `state_path`,
    /// or to `<config_path>.state.json` when not given.
    pub fn new(config_path: impl Into<PathBuf>, state_path: Option<PathBuf>) -> Self {
        let config_path = config_path.into();
        let state_path = state_path.unwrap_or_else(|| {
            let mut name = config_path.as_os_str().to_owned();
            name.push(".state.json");
            PathBuf::from(name)
        });
        Self {
            config_path,
            state_path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the configuration document
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Path of the instance state file
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn read_config(&self) -> Result<Config> {
        match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) if is_yaml_path(&self.config_path) => Config::parse_yaml_str(&content),
            Ok(content) => Config::parse_from_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to read {}: {}",
                self.config_path.display(),
                e
            ))),
        }
    }

    async fn read_instances(&self) -> Result<BTreeMap<String, InstanceState>> {
        match tokio::fs::read_to_string(&self.state_path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to read {}: {}",
                self.state_path.display(),
                e
            ))),
        }
    }

    async fn write_file(path: &Path, content: String) -> Result<()> {
        // Write to a sibling file first so a crash never leaves half a document
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to replace {}: {}", path.display(), e)))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self.read_config().await?.servers())
    }

    async fn load_server(&self, id: &str) -> Result<Option<ServerConfig>> {
        Ok(self.read_config().await?.mcp_servers.remove(id))
    }

    #[tracing::instrument(skip(self, config), fields(server_id = %config.id))]
    async fn save_server(&self, config: &ServerConfig) -> Result<()> {
        validate_server_config(config)?;
        let _guard = self.write_lock.lock().await;

        let mut document = self.read_config().await?;
        document
            .mcp_servers
            .insert(config.id.clone(), config.clone());

        let content = document.to_string_for(&self.config_path)?;
        Self::write_file(&self.config_path, content).await?;
        tracing::debug!(path = %self.config_path.display(), "Saved server configuration");
        Ok(())
    }

    async fn load_instances(&self) -> Result<Vec<InstanceState>> {
        Ok(self.read_instances().await?.into_values().collect())
    }

    async fn save_instance(&self, state: &InstanceState) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut instances = self.read_instances().await?;
        instances.insert(state.server_id.clone(), state.clone());

        let content = serde_json::to_string_pretty(&instances)?;
        Self::write_file(&self.state_path, content).await
    }
}
