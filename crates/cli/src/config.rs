use std::path::{Path, PathBuf};

use orchestrator::{NodeCommands, OrchestratorConfig};
use sandbox_core::{Version, DEFAULT_NODE_COUNT};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

pub const CONFIG_DIR: &str = ".dbsandbox";
pub const CONFIG_FILE: &str = "config.toml";

/// Settings read from `~/.dbsandbox/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub paths: PathsConfig,
    pub ports: PortsConfig,
    pub nodes: NodesConfig,
    pub commands: NodeCommands,
    pub auxiliary: AuxiliaryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent directory of every deployed sandbox.
    pub sandbox_home: PathBuf,
    /// Holds one directory of server binaries per version (`8.0.11/`).
    pub sandbox_binary: PathBuf,
    pub catalog: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sandbox_home: PathBuf::from("~/sandboxes"),
            sandbox_binary: PathBuf::from("~/opt/mysql"),
            catalog: PathBuf::from("~/.dbsandbox/sandboxes.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub multiple_base_port: u32,
    pub auxiliary_delta: u16,
    pub max_port: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            multiple_base_port: defaults.multiple_base_port,
            auxiliary_delta: defaults.auxiliary_delta,
            max_port: defaults.max_port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    pub count: u32,
    pub prefix: String,
    pub multiple_prefix: String,
    pub base_server_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            count: DEFAULT_NODE_COUNT,
            prefix: defaults.node_prefix,
            multiple_prefix: defaults.multiple_prefix,
            base_server_id: defaults.base_server_id,
            max_parallelism: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryConfig {
    /// First version whose nodes serve an auxiliary port.
    pub min_version: Version,
    /// Deploy without auxiliary ports when no block is free.
    pub optional: bool,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            min_version: Version::new(8, 0, 11),
            optional: false,
        }
    }
}

impl CliConfig {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    /// Read the config file, falling back to defaults when it is missing or
    /// unusable.
    pub async fn read(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(path).await {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    debug!(path = %path.display(), "Config loaded successfully");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(path, toml::to_string_pretty(self)?).await?;
        debug!(path = %path.display(), "Config saved successfully");
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_multiple_base_port(self.ports.multiple_base_port)
            .with_auxiliary_delta(self.ports.auxiliary_delta)
            .with_max_port(self.ports.max_port)
            .with_node_prefix(&self.nodes.prefix)
            .with_multiple_prefix(&self.nodes.multiple_prefix)
            .with_base_server_id(self.nodes.base_server_id)
            .with_max_parallelism(self.nodes.max_parallelism)
    }

    pub fn sandbox_home(&self) -> PathBuf {
        expand_home(&self.paths.sandbox_home)
    }

    pub fn sandbox_binary(&self) -> PathBuf {
        expand_home(&self.paths.sandbox_binary)
    }

    pub fn catalog(&self) -> PathBuf {
        expand_home(&self.paths.catalog)
    }
}

/// Replace a leading `~` with the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
