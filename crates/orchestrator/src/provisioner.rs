//! Per-node setup: identity derivation, node directories and the hand-off
//! to the installer that produces the node's execution steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sandbox_core::{dir_name_for, server_id_for, NodeDescriptor, Version};
use tracing::{debug, info};

use crate::cleanup::{CleanupAction, CleanupStack};
use crate::error::{OrchestratorError, Result};
use crate::ports::PortAllocation;
use crate::scheduler::{ExecutionBatch, ExecutionStep};

/// Everything an installer needs to know about the node it sets up.
#[derive(Debug, Clone)]
pub struct NodeSetup {
    pub node: Arc<NodeDescriptor>,
    pub version: Version,
    /// Directory holding the server binaries.
    pub basedir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub node_dir: PathBuf,
    pub sandbox_type: String,
}

/// Produces the installation steps of one node.
///
/// Implementations may write configuration files into `setup.node_dir`
/// and must register an undo action for every other resource they create.
/// They must not run any installation work; that is what the returned
/// steps are for.
#[async_trait]
pub trait NodeInstaller: Send + Sync {
    async fn install(&self, setup: &NodeSetup, cleanup: &CleanupStack) -> Result<Vec<ExecutionStep>>;
}

#[derive(Debug, Clone)]
pub struct NodeProvisioner {
    node_prefix: String,
    base_server_id: u32,
}

impl NodeProvisioner {
    pub fn new(node_prefix: impl Into<String>, base_server_id: u32) -> Self {
        Self {
            node_prefix: node_prefix.into(),
            base_server_id,
        }
    }

    /// Derive the descriptor of the node at `ordinal` from the allocation.
    pub fn describe(&self, ordinal: u32, allocation: &PortAllocation) -> Result<NodeDescriptor> {
        let (port, auxiliary_port) = allocation.for_node(ordinal).ok_or_else(|| {
            OrchestratorError::provisioning(ordinal, "no port allocated for this node")
        })?;
        let dir_name = dir_name_for(&self.node_prefix, ordinal);

        Ok(NodeDescriptor {
            ordinal,
            port,
            auxiliary_port,
            auxiliary_enabled: auxiliary_port.is_some(),
            server_id: server_id_for(self.base_server_id, ordinal),
            label: dir_name.clone(),
            dir_name,
        })
    }

    /// Create the node directory and collect the node's steps into `batch`.
    ///
    /// The directory's removal is registered before the installer runs, so
    /// a failing installer leaves nothing behind after an unwind.
    pub async fn provision(
        &self,
        node: NodeDescriptor,
        context: &ProvisionContext<'_>,
        cleanup: &CleanupStack,
        batch: &mut ExecutionBatch,
    ) -> Result<usize> {
        let ordinal = node.ordinal;
        let node_dir = context.sandbox_dir.join(&node.dir_name);

        tokio::fs::create_dir_all(&node_dir).await.map_err(|e| {
            OrchestratorError::provisioning(
                ordinal,
                format!("creating {}: {}", node_dir.display(), e),
            )
        })?;
        cleanup.register(CleanupAction::remove_dir(&node_dir));
        debug!(node = ordinal, dir = %node_dir.display(), "Node directory created");

        let setup = NodeSetup {
            node: Arc::new(node),
            version: context.version,
            basedir: context.basedir.to_path_buf(),
            sandbox_dir: context.sandbox_dir.to_path_buf(),
            node_dir,
            sandbox_type: context.sandbox_type.to_string(),
        };

        let steps = context
            .installer
            .install(&setup, cleanup)
            .await
            .map_err(|e| match e {
                OrchestratorError::ProvisioningFailure { .. } => e,
                other => OrchestratorError::provisioning(ordinal, other.to_string()),
            })?;

        if let Some(foreign) = steps.iter().find(|s| s.node().ordinal != ordinal) {
            return Err(OrchestratorError::provisioning(
                ordinal,
                format!(
                    "installer returned step '{}' owned by node {}",
                    foreign.label(),
                    foreign.node().ordinal
                ),
            ));
        }

        let count = steps.len();
        batch.extend(steps);
        info!(node = ordinal, port = setup.node.port, steps = count, "Node provisioned");
        Ok(count)
    }
}

/// Batch-wide inputs shared by every node of a run.
pub struct ProvisionContext<'a> {
    pub version: Version,
    pub basedir: &'a Path,
    pub sandbox_dir: &'a Path,
    pub sandbox_type: &'a str,
    pub installer: &'a dyn NodeInstaller,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TwoTierInstaller;

    #[async_trait]
    impl NodeInstaller for TwoTierInstaller {
        async fn install(&self, setup: &NodeSetup, _cleanup: &CleanupStack) -> Result<Vec<ExecutionStep>> {
            Ok(vec![
                ExecutionStep::new(Arc::clone(&setup.node), 0, "init", || async { Ok(()) }),
                ExecutionStep::new(Arc::clone(&setup.node), 1, "start", || async { Ok(()) }),
            ])
        }
    }

    struct FailingInstaller;

    #[async_trait]
    impl NodeInstaller for FailingInstaller {
        async fn install(&self, _setup: &NodeSetup, _cleanup: &CleanupStack) -> Result<Vec<ExecutionStep>> {
            Err(OrchestratorError::command_failed("write config", "disk full"))
        }
    }

    struct ForeignStepInstaller;

    #[async_trait]
    impl NodeInstaller for ForeignStepInstaller {
        async fn install(&self, setup: &NodeSetup, _cleanup: &CleanupStack) -> Result<Vec<ExecutionStep>> {
            let mut other = (*setup.node).clone();
            other.ordinal += 1;
            Ok(vec![ExecutionStep::new(Arc::new(other), 0, "init", || async { Ok(()) })])
        }
    }

    fn allocation() -> PortAllocation {
        PortAllocation {
            primary: vec![20001, 20002, 20003],
            auxiliary: Some(vec![30001, 30002, 30003]),
        }
    }

    fn context<'a>(sandbox_dir: &'a Path, installer: &'a dyn NodeInstaller) -> ProvisionContext<'a> {
        ProvisionContext {
            version: Version::new(8, 0, 11),
            basedir: Path::new("/opt/mysql/8.0.11"),
            sandbox_dir,
            sandbox_type: "multiple",
            installer,
        }
    }

    #[test]
    fn test_describe_derives_identity() {
        let provisioner = NodeProvisioner::new("node", 0);
        let node = provisioner.describe(2, &allocation()).unwrap();

        assert_eq!(node.port, 20002);
        assert_eq!(node.auxiliary_port, Some(30002));
        assert!(node.auxiliary_enabled);
        assert_eq!(node.server_id, 200);
        assert_eq!(node.dir_name, "node2");
        assert_eq!(node.label, "node2");
    }

    #[test]
    fn test_describe_without_auxiliary() {
        let provisioner = NodeProvisioner::new("node", 0);
        let allocation = PortAllocation {
            primary: vec![20001, 20002],
            auxiliary: None,
        };
        let node = provisioner.describe(1, &allocation).unwrap();
        assert!(!node.auxiliary_enabled);
        assert_eq!(node.ports(), vec![20001]);

        assert!(provisioner.describe(3, &allocation).is_err());
    }

    #[tokio::test]
    async fn test_provision_collects_steps() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NodeProvisioner::new("node", 0);
        let cleanup = CleanupStack::new();
        let mut batch = ExecutionBatch::new();
        let installer = TwoTierInstaller;

        for ordinal in 1..=3 {
            let node = provisioner.describe(ordinal, &allocation()).unwrap();
            provisioner
                .provision(node, &context(temp_dir.path(), &installer), &cleanup, &mut batch)
                .await
                .unwrap();
        }

        assert_eq!(batch.len(), 6);
        assert_eq!(batch.tiers(), vec![0, 1]);
        assert!(temp_dir.path().join("node3").is_dir());
        assert_eq!(cleanup.names(), vec!["rmdir", "rmdir", "rmdir"]);
    }

    #[tokio::test]
    async fn test_installer_failure_keeps_directory_registered() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NodeProvisioner::new("node", 0);
        let cleanup = CleanupStack::new();
        let mut batch = ExecutionBatch::new();
        let installer = FailingInstaller;

        let node = provisioner.describe(1, &allocation()).unwrap();
        let err = provisioner
            .provision(node, &context(temp_dir.path(), &installer), &cleanup, &mut batch)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::ProvisioningFailure { node: 1, .. }));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(cleanup.len(), 1);

        cleanup.unwind().await;
        assert!(!temp_dir.path().join("node1").exists());
    }

    #[tokio::test]
    async fn test_foreign_steps_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NodeProvisioner::new("node", 0);
        let cleanup = CleanupStack::new();
        let mut batch = ExecutionBatch::new();
        let installer = ForeignStepInstaller;

        let node = provisioner.describe(1, &allocation()).unwrap();
        let err = provisioner
            .provision(node, &context(temp_dir.path(), &installer), &cleanup, &mut batch)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("owned by node 2"));
        assert!(batch.is_empty());
    }
}
