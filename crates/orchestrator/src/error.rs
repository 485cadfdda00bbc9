use std::path::PathBuf;

use thiserror::Error;

use crate::cleanup::CleanupFailure;
use crate::scheduler::StepFailure;

/// Coarse classification of a failed run, used to decide what the
/// operator has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is unusable. Nothing was touched.
    InvalidRequest,
    /// No usable port block. Nothing was touched.
    ResourceExhausted,
    /// Setting up a node failed before scheduling.
    ProvisioningFailure,
    /// One or more steps failed within a tier.
    ExecutionFailure,
    /// A reversal action failed during rollback.
    CleanupFailure,
    /// The caller cancelled the run.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No block of {count} free ports after port {base} (search limit {horizon})")]
    ResourceExhausted { base: u32, count: u32, horizon: u16 },

    #[error("Port {port} is not available: {reason}")]
    PortConflict { port: u16, reason: String },

    #[error("Directory {} cannot be used: {reason}", .path.display())]
    DirectoryConflict { path: PathBuf, reason: String },

    #[error("Provisioning of node {node} failed: {reason}")]
    ProvisioningFailure { node: u32, reason: String },

    #[error("{} step(s) failed in tier {tier}: {}", .failures.len(), describe_steps(.failures))]
    ExecutionFailure { tier: u32, failures: Vec<StepFailure> },

    #[error("Command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("{0} panicked")]
    Panicked(String),

    #[error("Cancelled before {0}")]
    Cancelled(String),

    #[error("{} cleanup action(s) failed: {}", .0.len(), describe_cleanup(.0))]
    CleanupFailure(Vec<CleanupFailure>),

    #[error("{cause}; rolled back{}", describe_rollback(.cleanup_failures))]
    RolledBack {
        cause: Box<OrchestratorError>,
        cleanup_failures: Vec<CleanupFailure>,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] sandbox_core::CoreError),
}

impl OrchestratorError {
    /// Create a provisioning failure for the node at `node`.
    pub fn provisioning(node: u32, reason: impl Into<String>) -> Self {
        Self::ProvisioningFailure {
            node,
            reason: reason.into(),
        }
    }

    /// Create a command failure.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::DirectoryConflict { .. } | Self::Core(_) => {
                ErrorKind::InvalidRequest
            }
            Self::ResourceExhausted { .. } | Self::PortConflict { .. } => {
                ErrorKind::ResourceExhausted
            }
            Self::ExecutionFailure { .. } | Self::CommandFailed { .. } | Self::Panicked(_) => {
                ErrorKind::ExecutionFailure
            }
            Self::CleanupFailure(_) => ErrorKind::CleanupFailure,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::RolledBack { cause, .. } => cause.kind(),
            Self::ProvisioningFailure { .. }
            | Self::InvalidTransition { .. }
            | Self::Catalog(_)
            | Self::Script(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorKind::ProvisioningFailure,
        }
    }

    /// Cleanup actions that could not be completed, for manual follow-up.
    pub fn cleanup_failures(&self) -> &[CleanupFailure] {
        match self {
            Self::RolledBack {
                cleanup_failures, ..
            } => cleanup_failures,
            Self::CleanupFailure(failures) => failures,
            _ => &[],
        }
    }

    /// The error that started the failure, looking through a rollback.
    pub fn root_cause(&self) -> &OrchestratorError {
        match self {
            Self::RolledBack { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn was_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

fn describe_steps(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("node {} '{}': {}", f.node, f.step, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_cleanup(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} {}: {}", f.action, f.target, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_rollback(failures: &[CleanupFailure]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(
            " with {} failed cleanup action(s), finish manually: {}",
            failures.len(),
            describe_cleanup(failures)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
