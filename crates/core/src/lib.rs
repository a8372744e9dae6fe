//! `consular-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, the generic transition engine and the
//! case abstraction every workflow type implements.

pub mod case;
pub mod error;
pub mod id;
pub mod workflow;

pub use case::{
    BookingKey, Case, CaseHeader, CaseNumber, CertificateRef, ExpectedVersion, Fee,
    TransitionContext, TransitionHistoryRecord,
};
pub use error::{DomainError, DomainResult};
pub use id::{CaseId, CitizenId, DocumentId, HistoryId, NotificationId, UserId};
pub use workflow::{TransitionEngine, TransitionEngineBuilder, WorkflowState};
