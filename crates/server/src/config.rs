use anyhow::{Context, Result};
use fleetlink_core::{
    LinkConfig, LinkServer, Manager, PairingService, RedbSlaveStore, Registry, RegistryConfig,
};
use fleetlink_mcp::tools::{fleet_server, FLEET_SERVER};
use fleetlink_mcp::McpProxy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub link: LinkSection,

    #[serde(default)]
    pub credentials: CredentialsSection,

    /// Context name -> servers visible under it
    #[serde(default)]
    pub contexts: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

fn default_db_file() -> String {
    "fleet.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    120
}

fn default_notification_capacity() -> usize {
    10
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    10
}

fn default_send_queue() -> usize {
    64
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            write_timeout_secs: default_write_timeout(),
            send_queue: default_send_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsSection {
    #[serde(default = "default_validity_days")]
    pub validity_days: i64,
}

fn default_validity_days() -> i64 {
    fleetlink_core::pairing::DEFAULT_VALIDITY_DAYS
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            validity_days: default_validity_days(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the slave roster database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.db_file)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.registry.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.registry.heartbeat_timeout_secs),
            notification_capacity: self.registry.notification_capacity,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            request_timeout: Duration::from_secs(self.link.request_timeout_secs),
            write_timeout: Duration::from_secs(self.link.write_timeout_secs),
            send_queue: self.link.send_queue,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub registry: Arc<Registry>,
    pub proxy: Arc<McpProxy>,
    pub link: Arc<LinkServer>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbSlaveStore::new(config.db_path()).context("Failed to open slave store")?,
        );
        Self::with_store(config, store)
    }

    /// Wire the fleet over an already opened store.
    pub fn with_store(
        config: &ServerConfig,
        store: Arc<dyn fleetlink_core::SlaveStore>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new(store.clone(), config.registry_config()));

        let proxy = Arc::new(McpProxy::new());
        proxy
            .add_local_server(FLEET_SERVER, fleet_server(registry.clone()))
            .context("Failed to add fleet tool server")?;
        for (context, servers) in &config.contexts {
            proxy.set_context(context, servers.clone());
        }

        let pairing = Arc::new(PairingService::with_validity(
            store.clone(),
            chrono::Duration::days(config.credentials.validity_days),
        ));

        let manager = Arc::new(Manager::new(
            registry.clone(),
            proxy.clone(),
            store,
            pairing,
        ));
        let link = manager.create_server(config.link_config());

        Ok(Self {
            manager,
            registry,
            proxy,
            link,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml"), dir.path().join("data")).unwrap();

        assert!(dir.path().join("data").exists());
        assert_eq!(config.registry.heartbeat_interval_secs, 30);
        assert_eq!(config.registry.heartbeat_timeout_secs, 120);
        assert_eq!(config.registry.notification_capacity, 10);
        assert_eq!(config.link.request_timeout_secs, 30);
        assert_eq!(config.credentials.validity_days, 365);
        assert!(config.db_path().ends_with("fleet.redb"));
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetlink.toml");
        std::fs::write(
            &path,
            r#"
[registry]
heartbeat_timeout_secs = 45

[contexts]
ops = ["fleet", "jobs"]
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path, dir.path().to_path_buf()).unwrap();

        assert_eq!(config.registry.heartbeat_interval_secs, 30);
        assert_eq!(config.registry_config().heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(config.contexts["ops"], vec!["fleet", "jobs"]);
    }

    #[test]
    fn test_app_state_wires_fleet_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml"), dir.path().to_path_buf()).unwrap();

        let state = AppState::new(&config).unwrap();

        assert_eq!(state.proxy.local_server_names(), vec![FLEET_SERVER.to_string()]);
        assert!(state.manager.server().is_some());
    }
}
