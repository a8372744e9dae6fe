//! Infrastructure and application layer: case stores, transition
//! orchestration, appointment booking, the notification pipeline,
//! configuration and the service assembly built from it.

pub mod booking;
pub mod case_store;
pub mod config;
pub mod contract;
pub mod event_bus;
pub mod external;
pub mod notifications;
pub mod orchestrator;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use booking::AppointmentBooking;
pub use config::{ConfigError, ConsularConfig};
pub use orchestrator::{
    CertificateIssuer, OrchestratorError, SYSTEM_CANCELLED, TransitionOrchestrator, TransitionOutcome,
};
pub use service::{Collaborators, ConsularServices, ServiceBus, ServiceBusError};
