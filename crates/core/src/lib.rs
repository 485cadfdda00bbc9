//! Data model shared by the sandbox provisioner crates.

pub mod domain;
pub mod error;

pub use domain::{
    dir_name_for, server_id_for, AuxiliaryPorts, CatalogItem, ConcurrencyMode, NodeDescriptor,
    SandboxBatchRequest, SandboxBatchResult, SandboxDescription, Version, DEFAULT_NODE_COUNT,
    MIN_NODE_COUNT,
};
pub use error::{CoreError, Result};
