use serde::{Deserialize, Serialize};

/// Server id of the node at `ordinal`. Pure so identities are reproducible.
pub fn server_id_for(base_server_id: u32, ordinal: u32) -> u32 {
    (base_server_id + ordinal) * 100
}

/// Directory name of the node at `ordinal` (`node1`, `node2`, ...).
pub fn dir_name_for(prefix: &str, ordinal: u32) -> String {
    format!("{}{}", prefix, ordinal)
}

/// Derived, immutable state of one node in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// 1-based position in the batch.
    pub ordinal: u32,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary_port: Option<u16>,
    /// Whether this node serves its auxiliary port.
    pub auxiliary_enabled: bool,
    pub server_id: u32,
    pub dir_name: String,
    pub label: String,
}

impl NodeDescriptor {
    /// Every port this node listens on.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.port];
        if self.auxiliary_enabled {
            ports.extend(self.auxiliary_port);
        }
        ports
    }
}
