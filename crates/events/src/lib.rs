//! Event system for the sandbox provisioner
//!
//! This crate provides the event bus and event types used to observe
//! provisioning runs: state changes, tier and step progress, rollback.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
