//! Event types for provisioning runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events of a provisioning run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Batch lifecycle
    /// A provisioning run was accepted
    #[serde(rename = "batch.started")]
    BatchStarted {
        batch_id: Uuid,
        sandbox_dir: String,
        nodes: u32,
    },

    /// The orchestrator moved to another state
    #[serde(rename = "batch.state_changed")]
    StateChanged {
        batch_id: Uuid,
        from_state: String,
        to_state: String,
    },

    /// Port blocks were reserved for the batch
    #[serde(rename = "batch.ports_allocated")]
    PortsAllocated {
        batch_id: Uuid,
        ports: Vec<u16>,
        auxiliary_ports: Vec<u16>,
    },

    /// A node's configuration and steps were produced
    #[serde(rename = "node.provisioned")]
    NodeProvisioned {
        batch_id: Uuid,
        node: u32,
        port: u16,
        steps: usize,
    },

    /// The run ended
    #[serde(rename = "batch.finished")]
    BatchFinished { batch_id: Uuid, success: bool },

    // Scheduling
    /// Every step of a tier is about to be dispatched
    #[serde(rename = "tier.started")]
    TierStarted {
        batch_id: Uuid,
        tier: u32,
        steps: usize,
    },

    /// Every step of a tier has finished
    #[serde(rename = "tier.finished")]
    TierFinished {
        batch_id: Uuid,
        tier: u32,
        failures: usize,
    },

    /// A step began executing
    #[serde(rename = "step.started")]
    StepStarted {
        batch_id: Uuid,
        tier: u32,
        node: u32,
        step: String,
    },

    /// A step ran to completion
    #[serde(rename = "step.finished")]
    StepFinished {
        batch_id: Uuid,
        tier: u32,
        node: u32,
        step: String,
        success: bool,
        error: Option<String>,
    },

    // Rollback
    /// A cleanup action was invoked during rollback
    #[serde(rename = "cleanup.invoked")]
    CleanupInvoked {
        batch_id: Uuid,
        action: String,
        target: String,
        success: bool,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the batch ID associated with this event, if any
    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            Event::BatchStarted { batch_id, .. }
            | Event::StateChanged { batch_id, .. }
            | Event::PortsAllocated { batch_id, .. }
            | Event::NodeProvisioned { batch_id, .. }
            | Event::BatchFinished { batch_id, .. }
            | Event::TierStarted { batch_id, .. }
            | Event::TierFinished { batch_id, .. }
            | Event::StepStarted { batch_id, .. }
            | Event::StepFinished { batch_id, .. }
            | Event::CleanupInvoked { batch_id, .. } => Some(*batch_id),
            Event::Error { .. } => None,
        }
    }

    /// Whether the event reports a step or action that went wrong
    pub fn is_failure(&self) -> bool {
        match self {
            Event::BatchFinished { success, .. }
            | Event::StepFinished { success, .. }
            | Event::CleanupInvoked { success, .. } => !success,
            Event::TierFinished { failures, .. } => *failures > 0,
            Event::Error { .. } => true,
            _ => false,
        }
    }
}
