use sandbox_core::Version;

use crate::error::{OrchestratorError, Result};
use crate::ports::MAX_PORT;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Added to the version port to derive the default base port.
    pub multiple_base_port: u32,
    /// Distance between the primary and the auxiliary port families.
    pub auxiliary_delta: u16,
    /// Highest port the allocator may hand out.
    pub max_port: u16,
    pub multiple_prefix: String,
    pub node_prefix: String,
    pub base_server_id: u32,
    /// Steps running at once within a tier. `None` means the whole tier.
    pub max_parallelism: Option<usize>,
    pub sandbox_type: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            multiple_base_port: 16000,
            auxiliary_delta: 10000,
            max_port: MAX_PORT,
            multiple_prefix: "multi_msb_".to_string(),
            node_prefix: "node".to_string(),
            base_server_id: 0,
            max_parallelism: None,
            sandbox_type: "multiple".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_multiple_base_port(mut self, port: u32) -> Self {
        self.multiple_base_port = port;
        self
    }

    pub fn with_auxiliary_delta(mut self, delta: u16) -> Self {
        self.auxiliary_delta = delta;
        self
    }

    pub fn with_max_port(mut self, port: u16) -> Self {
        self.max_port = port;
        self
    }

    pub fn with_multiple_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.multiple_prefix = prefix.into();
        self
    }

    pub fn with_node_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.node_prefix = prefix.into();
        self
    }

    pub fn with_base_server_id(mut self, id: u32) -> Self {
        self.base_server_id = id;
        self
    }

    pub fn with_max_parallelism(mut self, max: Option<usize>) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_sandbox_type(mut self, sandbox_type: impl Into<String>) -> Self {
        self.sandbox_type = sandbox_type.into();
        self
    }

    /// Base port used when a request does not override it:
    /// `version port + multiple_base_port + rev * 100`.
    pub fn default_base_port(&self, version: &Version) -> Result<u16> {
        let port = version.to_port() + self.multiple_base_port + version.rev * 100;
        u16::try_from(port)
            .ok()
            .filter(|p| *p <= self.max_port)
            .ok_or_else(|| {
                OrchestratorError::InvalidRequest(format!(
                    "derived base port {} for version {} is above the port limit {}",
                    port, version, self.max_port
                ))
            })
    }

    /// Directory name of a sandbox holding `version` when none is given.
    pub fn default_dir_name(&self, version: &Version) -> String {
        format!("{}{}", self.multiple_prefix, version.to_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_port() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.default_base_port(&Version::new(8, 0, 11)).unwrap(),
            8011 + 16000 + 1100
        );
        assert_eq!(
            config.default_base_port(&Version::new(5, 7, 21)).unwrap(),
            5721 + 16000 + 2100
        );
    }

    #[test]
    fn test_default_base_port_above_limit() {
        let config = OrchestratorConfig::default().with_max_port(20000);
        let err = config.default_base_port(&Version::new(8, 0, 11)).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[test]
    fn test_default_dir_name() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.default_dir_name(&Version::new(8, 0, 11)),
            "multi_msb_8_0_11"
        );
        let config = config.with_multiple_prefix("cluster_");
        assert_eq!(config.default_dir_name(&Version::new(5, 7, 21)), "cluster_5_7_21");
    }
}
