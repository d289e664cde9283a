//! Configuration for the meshnode tool.
//!
//! A single TOML file with `node`, `storage` and `logging` sections. On first
//! run a default file is written and the data directory is created.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the platform-specific data directory for meshnode
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\meshnode
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshnode")
    } else {
        // Linux/Mac: ~/.meshnode
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshnode")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Mesh network UUID new nodes are provisioned into; generated when empty
    #[serde(default)]
    pub network_id: String,
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
}

fn default_ttl() -> u8 {
    crate::constants::node::DEFAULT_TTL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sled" or "memory". `memory` is for library use and tests; the
    /// binary refuses it because nothing would survive the process.
    pub backend: String,
    pub data_dir: String,
}

impl StorageConfig {
    pub fn nodes_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("nodes")
    }

    /// Whether records outlive the process.
    pub fn is_persistent(&self) -> bool {
        self.backend == "sled"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "Mesh Provisioner".to_string(),
                network_id: String::new(),
                default_ttl: default_ttl(),
            },
            storage: StorageConfig {
                backend: "sled".to_string(),
                data_dir: String::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                output: "stdout".to_string(),
                file_path: "./logs/meshnode.log".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Loads `path`, or writes a default config there if it does not exist.
    pub fn load_or_create(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let data_dir = get_data_dir();

        let mut config = if fs::metadata(path).is_ok() {
            Self::load_from_file(path)?
        } else {
            let mut config = Config::default();
            config.node.network_id = uuid::Uuid::new_v4().to_string();
            config.storage.data_dir = data_dir.to_string_lossy().to_string();
            config.save_to_file(path)?;
            tracing::info!("📝 Created default config at {}", path);
            config
        };

        if config.storage.data_dir.is_empty() {
            config.storage.data_dir = data_dir.to_string_lossy().to_string();
        }
        fs::create_dir_all(&config.storage.data_dir)?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.storage.backend.as_str() {
            "sled" | "memory" => {}
            other => return Err(format!("unknown storage backend '{}'", other)),
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => return Err(format!("unknown log format '{}'", other)),
        }
        if !self.node.network_id.is_empty() {
            uuid::Uuid::parse_str(&self.node.network_id)
                .map_err(|e| format!("invalid node.network_id: {}", e))?;
        }
        if self.node.default_ttl > crate::constants::node::MAX_TTL {
            return Err(format!("node.default_ttl {} is too large", self.node.default_ttl));
        }
        Ok(())
    }

    /// Network UUID from the config, or the nil UUID when none is set.
    pub fn network_id(&self) -> uuid::Uuid {
        uuid::Uuid::parse_str(&self.node.network_id).unwrap_or_default()
    }
}
