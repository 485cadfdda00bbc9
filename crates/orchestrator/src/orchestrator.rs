use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use events::{Event, EventBus, EventEnvelope};
use sandbox_core::{
    CatalogItem, NodeDescriptor, SandboxBatchRequest, SandboxBatchResult, SandboxDescription,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::cleanup::{CleanupAction, CleanupStack};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::installer::run_script;
use crate::ports::{PortAllocation, PortAllocator, PortRequest, LOCK_MARKER};
use crate::provisioner::{NodeInstaller, NodeProvisioner, ProvisionContext};
use crate::scheduler::{ExecutionBatch, ExecutionScheduler};
use crate::scripts::{ScriptWriter, AGGREGATE_SCRIPTS, NODE_SHORTCUT_TEMPLATE};
use crate::state_machine::{ProvisionState, ProvisionStateMachine};

pub const DESCRIPTION_FILE: &str = "sbdescription.json";

/// What Validating and AllocatingPorts settled on.
#[derive(Debug)]
struct Plan {
    sandbox_dir: PathBuf,
    allocation: PortAllocation,
}

/// An existing sandbox that is about to be replaced.
#[derive(Debug)]
struct Replacement {
    released: BTreeSet<u16>,
}

/// Drives one multi-node provisioning run through its states.
///
/// Every resource created after validation is registered on the cleanup
/// stack, so a failure in any later state rolls the host back to how it was
/// before the run.
pub struct SandboxOrchestrator {
    config: OrchestratorConfig,
    installer: Arc<dyn NodeInstaller>,
    catalog: Arc<dyn Catalog>,
    scripts: Arc<dyn ScriptWriter>,
    event_bus: Option<EventBus>,
    cleanup: CleanupStack,
    cancel: CancellationToken,
    state: ProvisionState,
    transitions: Vec<(ProvisionState, ProvisionState)>,
    batch_id: Uuid,
}

impl SandboxOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        installer: Arc<dyn NodeInstaller>,
        catalog: Arc<dyn Catalog>,
        scripts: Arc<dyn ScriptWriter>,
    ) -> Self {
        Self {
            config,
            installer,
            catalog,
            scripts,
            event_bus: None,
            cleanup: CleanupStack::new(),
            cancel: CancellationToken::new(),
            state: ProvisionState::Validating,
            transitions: Vec::new(),
            batch_id: Uuid::nil(),
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Abort runs once `cancel` fires.
    ///
    /// The run stops at the next safe point (between nodes, or before the
    /// next tier once scheduling has started), rolls back everything it
    /// created and fails with [`OrchestratorError::Cancelled`]. Steps that
    /// are already running are awaited first.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// Every transition of the last run, in order.
    pub fn transitions(&self) -> &[(ProvisionState, ProvisionState)] {
        &self.transitions
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Handle to the cleanup stack of the current run.
    pub fn cleanup_stack(&self) -> CleanupStack {
        self.cleanup.clone()
    }

    /// Provision every node of `request`.
    ///
    /// Either all nodes are installed and recorded, or the run is rolled
    /// back and the error describes both the cause and any cleanup action
    /// that could not be completed.
    pub async fn provision(&mut self, request: &SandboxBatchRequest) -> Result<SandboxBatchResult> {
        self.state = ProvisionState::Validating;
        self.transitions.clear();
        self.batch_id = Uuid::new_v4();
        let started_at = Utc::now();

        info!(
            batch_id = %self.batch_id,
            version = %request.version,
            nodes = request.nodes,
            mode = request.mode.as_str(),
            "Provisioning sandbox batch"
        );

        let plan = match self.prepare(request).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(batch_id = %self.batch_id, error = %e, "Batch rejected");
                self.transition(ProvisionState::Failed)?;
                self.emit_event(Event::BatchFinished {
                    batch_id: self.batch_id,
                    success: false,
                });
                return Err(e);
            }
        };

        match self.build(request, &plan, started_at).await {
            Ok(result) => {
                self.transition(ProvisionState::Done)?;
                self.emit_event(Event::BatchFinished {
                    batch_id: self.batch_id,
                    success: true,
                });
                info!(
                    batch_id = %self.batch_id,
                    sandbox_dir = %result.sandbox_dir.display(),
                    ports = ?result.ports(),
                    "Sandbox batch installed"
                );
                Ok(result)
            }
            Err(cause) => Err(self.roll_back(cause).await),
        }
    }

    /// Validating and AllocatingPorts. Nothing here is undone on failure.
    async fn prepare(&mut self, request: &SandboxBatchRequest) -> Result<Plan> {
        request.validate()?;
        if !request.basedir.is_dir() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "base directory {} does not exist",
                request.basedir.display()
            )));
        }
        if !request.sandbox_home.is_dir() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "sandbox home {} does not exist",
                request.sandbox_home.display()
            )));
        }

        let dir_name = request
            .dir_name
            .clone()
            .unwrap_or_else(|| self.config.default_dir_name(&request.version));
        let sandbox_dir = request.sandbox_home.join(dir_name);
        let base_port = match request.base_port {
            Some(port) => port,
            None => self.config.default_base_port(&request.version)?,
        };

        let replacement = self.check_existing(request, &sandbox_dir).await?;
        let released = replacement
            .as_ref()
            .map(|r| r.released.clone())
            .unwrap_or_default();

        self.emit_event(Event::BatchStarted {
            batch_id: self.batch_id,
            sandbox_dir: sandbox_dir.display().to_string(),
            nodes: request.nodes,
        });

        self.transition(ProvisionState::AllocatingPorts)?;

        let allocator = PortAllocator::with_horizon(self.config.max_port);
        let snapshot: BTreeSet<u16> = request.installed_ports.difference(&released).copied().collect();
        let allocation = allocator.allocate(
            &PortRequest {
                base: base_port,
                count: request.nodes,
                auxiliary: request.auxiliary,
                auxiliary_delta: self.config.auxiliary_delta,
            },
            &snapshot,
        )?;

        let mut live: BTreeSet<u16> = self
            .catalog
            .installed_ports()
            .await?
            .difference(&released)
            .copied()
            .collect();
        live.extend(snapshot.iter().copied());
        allocator.revalidate(&allocation, &live)?;

        self.check_cancelled("replacing the existing sandbox")?;
        if replacement.is_some() {
            self.replace_existing(&sandbox_dir).await?;
        }
        PortAllocator::check_target(&sandbox_dir)?;

        self.emit_event(Event::PortsAllocated {
            batch_id: self.batch_id,
            ports: allocation.primary.clone(),
            auxiliary_ports: allocation.auxiliary.clone().unwrap_or_default(),
        });

        Ok(Plan {
            sandbox_dir,
            allocation,
        })
    }

    /// Apply the merge policy to an existing target directory.
    async fn check_existing(
        &self,
        request: &SandboxBatchRequest,
        sandbox_dir: &Path,
    ) -> Result<Option<Replacement>> {
        if !sandbox_dir.exists() {
            return Ok(None);
        }
        if sandbox_dir.join(LOCK_MARKER).exists() {
            return Err(OrchestratorError::DirectoryConflict {
                path: sandbox_dir.to_path_buf(),
                reason: format!("the sandbox is locked (remove '{}' to unlock)", LOCK_MARKER),
            });
        }
        if !request.force {
            return Err(OrchestratorError::InvalidRequest(format!(
                "directory {} already exists; use force to replace it",
                sandbox_dir.display()
            )));
        }

        let released = self
            .catalog
            .find(sandbox_dir)
            .await?
            .map(|item| item.port.into_iter().collect())
            .unwrap_or_default();
        Ok(Some(Replacement { released }))
    }

    /// Stop and remove the sandbox at `sandbox_dir` and forget it.
    async fn replace_existing(&self, sandbox_dir: &Path) -> Result<()> {
        warn!(sandbox_dir = %sandbox_dir.display(), "Replacing existing sandbox");

        let stop_all = sandbox_dir.join("stop_all");
        if stop_all.is_file() {
            if let Err(e) = run_script(&stop_all).await {
                warn!(error = %e, "Stopping the existing sandbox failed, removing it anyway");
            }
        }

        tokio::fs::remove_dir_all(sandbox_dir).await?;
        if self.catalog.remove(sandbox_dir).await?.is_some() {
            debug!(sandbox_dir = %sandbox_dir.display(), "Catalog entry removed");
        }
        Ok(())
    }

    /// ProvisioningNodes, Scheduling and Finalizing.
    async fn build(
        &mut self,
        request: &SandboxBatchRequest,
        plan: &Plan,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<SandboxBatchResult> {
        self.transition(ProvisionState::ProvisioningNodes)?;

        tokio::fs::create_dir_all(&plan.sandbox_dir).await?;
        self.cleanup
            .register(CleanupAction::remove_dir(&plan.sandbox_dir));

        let provisioner = NodeProvisioner::new(&self.config.node_prefix, self.config.base_server_id);
        let context = ProvisionContext {
            version: request.version,
            basedir: &request.basedir,
            sandbox_dir: &plan.sandbox_dir,
            sandbox_type: &self.config.sandbox_type,
            installer: self.installer.as_ref(),
        };

        let mut batch = ExecutionBatch::new();
        let mut nodes = Vec::with_capacity(request.nodes as usize);
        for ordinal in 1..=request.nodes {
            self.check_cancelled(&format!("node {}", ordinal))?;
            let node = provisioner.describe(ordinal, &plan.allocation)?;
            let steps = provisioner
                .provision(node.clone(), &context, &self.cleanup, &mut batch)
                .await?;
            self.emit_event(Event::NodeProvisioned {
                batch_id: self.batch_id,
                node: ordinal,
                port: node.port,
                steps,
            });
            nodes.push(node);
        }

        self.transition(ProvisionState::Scheduling)?;

        let mut scheduler = ExecutionScheduler::new(request.mode)
            .with_max_parallelism(self.config.max_parallelism)
            .with_batch_id(self.batch_id)
            .with_cancellation(self.cancel.clone());
        if let Some(bus) = &self.event_bus {
            scheduler = scheduler.with_event_bus(bus.clone());
        }
        let report = scheduler.run(batch).await?;
        debug!(steps = report.total_steps(), tiers = report.tiers.len(), "Schedule completed");

        self.check_cancelled("finalizing")?;
        self.transition(ProvisionState::Finalizing)?;

        self.write_scripts(&plan.sandbox_dir, &nodes).await?;

        let ports: Vec<u16> = nodes.iter().flat_map(NodeDescriptor::ports).collect();
        let description = SandboxDescription {
            basedir: request.basedir.clone(),
            sandbox_type: self.config.sandbox_type.clone(),
            version: request.version,
            port: ports.clone(),
            nodes: request.nodes,
            node_num: 0,
            log_file: request.log_file.clone(),
        };
        let content = serde_json::to_string_pretty(&description)?;
        tokio::fs::write(plan.sandbox_dir.join(DESCRIPTION_FILE), content).await?;

        let catalog_item = CatalogItem {
            origin: request.basedir.clone(),
            sandbox_type: self.config.sandbox_type.clone(),
            version: request.version,
            port: ports,
            nodes: nodes.iter().map(|n| n.dir_name.clone()).collect(),
            destination: plan.sandbox_dir.clone(),
            log_directory: request
                .log_file
                .as_ref()
                .and_then(|f| f.parent())
                .map(Path::to_path_buf),
        };
        self.catalog.register(catalog_item.clone()).await?;
        let catalog = Arc::clone(&self.catalog);
        let destination = plan.sandbox_dir.clone();
        self.cleanup.register(CleanupAction::new(
            "uncatalog",
            destination.display().to_string(),
            move || async move { catalog.remove(&destination).await.map(|_| ()) },
        ));

        let committed = self.cleanup.commit();
        debug!(committed, "Cleanup actions committed");

        Ok(SandboxBatchResult {
            sandbox_dir: plan.sandbox_dir.clone(),
            sandbox_type: self.config.sandbox_type.clone(),
            version: request.version,
            nodes,
            started_at,
            finished_at: Utc::now(),
            description,
            catalog_item,
        })
    }

    async fn write_scripts(&self, sandbox_dir: &Path, nodes: &[NodeDescriptor]) -> Result<()> {
        let app_version = concat!("dbsandbox ", env!("CARGO_PKG_VERSION"));
        let date_time = Utc::now().to_rfc2822();
        let sandbox = sandbox_dir.display().to_string();

        let node_data: Vec<serde_json::Value> = nodes
            .iter()
            .map(|node| {
                json!({
                    "Node": node.ordinal,
                    "NodePort": node.port,
                    "NodeLabel": node.label,
                    "NodeDir": node.dir_name,
                    "SandboxDir": sandbox,
                })
            })
            .collect();

        for (node, data) in nodes.iter().zip(&node_data) {
            let mut data = data.clone();
            data["AppVersion"] = json!(app_version);
            data["DateTime"] = json!(date_time);
            self.scripts
                .write_script(
                    sandbox_dir,
                    &format!("n{}", node.ordinal),
                    NODE_SHORTCUT_TEMPLATE,
                    &data,
                )
                .await?;
        }

        let data = json!({
            "AppVersion": app_version,
            "DateTime": date_time,
            "SandboxDir": sandbox,
            "Nodes": node_data,
        });
        for (name, template) in AGGREGATE_SCRIPTS {
            self.scripts
                .write_script(sandbox_dir, name, template, &data)
                .await?;
        }
        Ok(())
    }

    /// Undo everything registered so far and end in `Failed`.
    async fn roll_back(&mut self, cause: OrchestratorError) -> OrchestratorError {
        warn!(batch_id = %self.batch_id, error = %cause, "Batch failed, rolling back");
        if let Err(e) = self.transition(ProvisionState::RollingBack) {
            warn!(error = %e, "Unexpected state while rolling back");
        }

        let report = self.cleanup.unwind().await;
        for record in &report.invoked {
            self.emit_event(Event::CleanupInvoked {
                batch_id: self.batch_id,
                action: record.action.clone(),
                target: record.target.clone(),
                success: record.success,
            });
        }
        if !report.is_clean() {
            warn!(
                failed = report.failures.len(),
                "Some cleanup actions failed, manual cleanup needed"
            );
        }

        if let Err(e) = self.transition(ProvisionState::Failed) {
            warn!(error = %e, "Unexpected state after rollback");
        }
        self.emit_event(Event::BatchFinished {
            batch_id: self.batch_id,
            success: false,
        });

        OrchestratorError::RolledBack {
            cause: Box::new(cause),
            cleanup_failures: report.failures,
        }
    }

    fn check_cancelled(&self, next: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(batch_id = %self.batch_id, next, "Batch cancelled");
            return Err(OrchestratorError::Cancelled(next.to_string()));
        }
        Ok(())
    }

    fn transition(&mut self, to: ProvisionState) -> Result<()> {
        let from = self.state;
        info!(from = %from.as_str(), to = %to.as_str(), "Batch state transition");

        ProvisionStateMachine::validate_transition(&from, &to)?;
        self.state = to;
        self.transitions.push((from, to));

        self.emit_event(Event::StateChanged {
            batch_id: self.batch_id,
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
        });
        Ok(())
    }

    fn emit_event(&self, event: Event) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(EventEnvelope::new(event));
        }
    }
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("batch_id", &self.batch_id)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}
