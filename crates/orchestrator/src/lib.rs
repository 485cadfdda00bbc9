//! Multi-node sandbox provisioning.
//!
//! [`SandboxOrchestrator`] takes a [`sandbox_core::SandboxBatchRequest`],
//! reserves ports with the [`PortAllocator`], lets the [`NodeProvisioner`]
//! collect installation steps and runs them through the tiered
//! [`ExecutionScheduler`]. Everything created on the way is recorded on a
//! [`CleanupStack`] and undone if the run fails.

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod installer;
pub mod orchestrator;
pub mod ports;
pub mod provisioner;
pub mod scheduler;
pub mod scripts;
pub mod state_machine;

pub use catalog::{Catalog, JsonCatalog, MemoryCatalog, CATALOG_FILE};
pub use cleanup::{CleanupAction, CleanupFailure, CleanupRecord, CleanupReport, CleanupStack};
pub use config::OrchestratorConfig;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use installer::{CommandNodeInstaller, NodeCommands};
pub use orchestrator::{SandboxOrchestrator, DESCRIPTION_FILE};
pub use ports::{PortAllocation, PortAllocator, PortRequest, LOCK_MARKER};
pub use provisioner::{NodeInstaller, NodeProvisioner, NodeSetup, ProvisionContext};
pub use scheduler::{
    ExecutionBatch, ExecutionScheduler, ExecutionStep, ScheduleReport, StepFailure, TierReport,
};
pub use scripts::{ScriptWriter, TemplateScriptWriter};
pub use state_machine::{ProvisionState, ProvisionStateMachine};
