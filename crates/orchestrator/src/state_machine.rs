use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Where a provisioning run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Validating,
    AllocatingPorts,
    ProvisioningNodes,
    Scheduling,
    Finalizing,
    Done,
    RollingBack,
    Failed,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Validating => "validating",
            ProvisionState::AllocatingPorts => "allocating_ports",
            ProvisionState::ProvisioningNodes => "provisioning_nodes",
            ProvisionState::Scheduling => "scheduling",
            ProvisionState::Finalizing => "finalizing",
            ProvisionState::Done => "done",
            ProvisionState::RollingBack => "rolling_back",
            ProvisionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Done | ProvisionState::Failed)
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ProvisionStateMachine;

impl ProvisionStateMachine {
    pub fn validate_transition(from: &ProvisionState, to: &ProvisionState) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    /// Nothing has been created before `ProvisioningNodes`, so the early
    /// states fail directly. Later states must roll back first.
    fn allowed_transitions(from: &ProvisionState) -> Vec<ProvisionState> {
        match from {
            ProvisionState::Validating => {
                vec![ProvisionState::AllocatingPorts, ProvisionState::Failed]
            }
            ProvisionState::AllocatingPorts => {
                vec![ProvisionState::ProvisioningNodes, ProvisionState::Failed]
            }
            ProvisionState::ProvisioningNodes => {
                vec![ProvisionState::Scheduling, ProvisionState::RollingBack]
            }
            ProvisionState::Scheduling => {
                vec![ProvisionState::Finalizing, ProvisionState::RollingBack]
            }
            ProvisionState::Finalizing => {
                vec![ProvisionState::Done, ProvisionState::RollingBack]
            }
            ProvisionState::RollingBack => vec![ProvisionState::Failed],
            ProvisionState::Done | ProvisionState::Failed => vec![],
        }
    }

    pub fn can_transition(from: &ProvisionState, to: &ProvisionState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// The next state on the success path.
    pub fn next_state(current: &ProvisionState) -> Option<ProvisionState> {
        match current {
            ProvisionState::Validating => Some(ProvisionState::AllocatingPorts),
            ProvisionState::AllocatingPorts => Some(ProvisionState::ProvisioningNodes),
            ProvisionState::ProvisioningNodes => Some(ProvisionState::Scheduling),
            ProvisionState::Scheduling => Some(ProvisionState::Finalizing),
            ProvisionState::Finalizing => Some(ProvisionState::Done),
            ProvisionState::RollingBack => Some(ProvisionState::Failed),
            ProvisionState::Done | ProvisionState::Failed => None,
        }
    }

    /// The state a failure in `current` leads to.
    pub fn failure_state(current: &ProvisionState) -> Option<ProvisionState> {
        match current {
            ProvisionState::Validating | ProvisionState::AllocatingPorts => {
                Some(ProvisionState::Failed)
            }
            ProvisionState::ProvisioningNodes
            | ProvisionState::Scheduling
            | ProvisionState::Finalizing => Some(ProvisionState::RollingBack),
            ProvisionState::RollingBack => Some(ProvisionState::Failed),
            ProvisionState::Done | ProvisionState::Failed => None,
        }
    }
}
