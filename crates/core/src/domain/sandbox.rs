use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::NodeDescriptor;
use super::version::Version;

/// Description stored inside a sandbox directory (`sbdescription.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxDescription {
    pub basedir: PathBuf,
    #[serde(rename = "type")]
    pub sandbox_type: String,
    pub version: Version,
    pub port: Vec<u16>,
    pub nodes: u32,
    pub node_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Entry describing one deployment in the sandbox catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub origin: PathBuf,
    #[serde(rename = "type")]
    pub sandbox_type: String,
    pub version: Version,
    pub port: Vec<u16>,
    pub nodes: Vec<String>,
    pub destination: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_directory: Option<PathBuf>,
}

/// Outcome of a successful provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxBatchResult {
    pub sandbox_dir: PathBuf,
    pub sandbox_type: String,
    pub version: Version,
    pub nodes: Vec<NodeDescriptor>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub description: SandboxDescription,
    pub catalog_item: CatalogItem,
}

impl SandboxBatchResult {
    /// All ports claimed by the batch, node by node.
    pub fn ports(&self) -> Vec<u16> {
        self.nodes.iter().flat_map(NodeDescriptor::ports).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_item_json_shape() {
        let item = CatalogItem {
            origin: PathBuf::from("/opt/mysql/8.0.11"),
            sandbox_type: "multiple".to_string(),
            version: Version::new(8, 0, 11),
            port: vec![24912, 24913],
            nodes: vec!["node1".to_string(), "node2".to_string()],
            destination: PathBuf::from("/sandboxes/multi_msb_8_0_11"),
            log_directory: None,
        };

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "multiple");
        assert_eq!(json["version"], "8.0.11");
        assert!(json.get("log_directory").is_none());

        let back: CatalogItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
