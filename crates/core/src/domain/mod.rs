mod node;
mod request;
mod sandbox;
mod version;

pub use node::{dir_name_for, server_id_for, NodeDescriptor};
pub use request::{
    AuxiliaryPorts, ConcurrencyMode, SandboxBatchRequest, DEFAULT_NODE_COUNT, MIN_NODE_COUNT,
};
pub use sandbox::{CatalogItem, SandboxBatchResult, SandboxDescription};
pub use version::Version;
