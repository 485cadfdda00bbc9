use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::version::Version;
use crate::error::{CoreError, Result};

/// Fewest nodes a batch may hold. One node is a single sandbox, not a batch.
pub const MIN_NODE_COUNT: u32 = 2;

pub const DEFAULT_NODE_COUNT: u32 = 3;

/// How the installation steps of a batch are executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// One step at a time, tier order then node order.
    #[default]
    Sequential,
    /// Every step of a tier runs in parallel; tiers are barriers.
    Concurrent,
}

impl ConcurrencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(Self::Sequential),
            "concurrent" => Some(Self::Concurrent),
            _ => None,
        }
    }
}

/// Policy for the auxiliary (extended protocol) port family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuxiliaryPorts {
    /// Nodes of this batch are capable of serving an auxiliary port.
    pub enabled: bool,
    /// When no auxiliary block can be found, disable the feature on every
    /// node instead of failing the batch.
    pub optional: bool,
}

impl AuxiliaryPorts {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn required() -> Self {
        Self {
            enabled: true,
            optional: false,
        }
    }

    pub fn optional() -> Self {
        Self {
            enabled: true,
            optional: true,
        }
    }
}

/// Immutable description of one multi-node provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxBatchRequest {
    pub version: Version,
    pub nodes: u32,
    /// Directory holding the server binaries for `version`.
    pub basedir: PathBuf,
    /// Parent directory of every sandbox.
    pub sandbox_home: PathBuf,
    /// Overrides the derived sandbox directory name.
    pub dir_name: Option<String>,
    /// Overrides the port derived from the version.
    pub base_port: Option<u16>,
    pub mode: ConcurrencyMode,
    /// Ports held by earlier deployments at the time the request was built.
    pub installed_ports: BTreeSet<u16>,
    pub auxiliary: AuxiliaryPorts,
    /// Replace an existing, unlocked sandbox at the target directory.
    pub force: bool,
    pub log_file: Option<PathBuf>,
}

impl SandboxBatchRequest {
    pub fn new(version: Version, basedir: impl Into<PathBuf>, sandbox_home: impl Into<PathBuf>) -> Self {
        Self {
            version,
            nodes: DEFAULT_NODE_COUNT,
            basedir: basedir.into(),
            sandbox_home: sandbox_home.into(),
            dir_name: None,
            base_port: None,
            mode: ConcurrencyMode::default(),
            installed_ports: BTreeSet::new(),
            auxiliary: AuxiliaryPorts::default(),
            force: false,
            log_file: None,
        }
    }

    pub fn with_nodes(mut self, nodes: u32) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_dir_name(mut self, dir_name: impl Into<String>) -> Self {
        self.dir_name = Some(dir_name.into());
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = Some(port);
        self
    }

    pub fn with_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_installed_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.installed_ports = ports.into_iter().collect();
        self
    }

    pub fn with_auxiliary(mut self, auxiliary: AuxiliaryPorts) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Checks the parts of the request that need no filesystem access.
    pub fn validate(&self) -> Result<()> {
        if self.nodes < MIN_NODE_COUNT {
            return Err(CoreError::InvalidNodeCount {
                count: self.nodes,
                min: MIN_NODE_COUNT,
            });
        }
        if let Some(name) = &self.dir_name {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(CoreError::Validation(format!(
                    "invalid sandbox directory name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SandboxBatchRequest {
        SandboxBatchRequest::new(Version::new(8, 0, 11), "/opt/mysql/8.0.11", "/tmp/sandboxes")
    }

    #[test]
    fn test_request_defaults() {
        let req = request();
        assert_eq!(req.nodes, DEFAULT_NODE_COUNT);
        assert_eq!(req.mode, ConcurrencyMode::Sequential);
        assert!(req.installed_ports.is_empty());
        assert!(!req.auxiliary.enabled);
        assert!(!req.force);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_single_node_rejected() {
        let err = request().with_nodes(1).validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidNodeCount { count: 1, min: 2 }));
    }

    #[test]
    fn test_invalid_dir_name_rejected() {
        assert!(request().with_dir_name("a/b").validate().is_err());
        assert!(request().with_dir_name("..").validate().is_err());
        assert!(request().with_dir_name("my_cluster").validate().is_ok());
    }

    #[test]
    fn test_concurrency_mode_parsing() {
        assert_eq!(ConcurrencyMode::parse("concurrent"), Some(ConcurrencyMode::Concurrent));
        assert_eq!(ConcurrencyMode::Sequential.as_str(), "sequential");
        assert_eq!(ConcurrencyMode::parse("parallel"), None);
    }
}
