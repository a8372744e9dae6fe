//! Transition orchestration (application-level).
//!
//! One [`TransitionOrchestrator`] drives the cases of one workflow type. Every
//! state change follows the same pipeline:
//!
//! ```text
//! request (case id, target state, actor, comment)
//!   ↓
//! 1. Load the case
//!   ↓
//! 2. Validate the edge against the workflow graph (InvalidTransition)
//!   ↓
//! 3. Mutate a copy: state, type-specific effects, certificate if required
//!   ↓
//! 4. Prepend the history record
//!   ↓
//! 5. Commit case + history atomically (optimistic on the loaded version)
//!   ↓
//! 6. Publish the TransitionEvent (after commit)
//! ```
//!
//! Any failure in steps 1-5 leaves the stored case untouched: no partial
//! state, no history record. A certificate stored in step 3 is discarded
//! again when the commit fails. A failed publish is logged and does not undo
//! the committed transition; consumers treat delivery as at-least-once.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use consular_core::{
    Case, CaseId, CertificateRef, DocumentId, DomainError, ExpectedVersion, TransitionContext,
    TransitionHistoryRecord, UserId, WorkflowState,
};
use consular_events::{Event, EventBus, TransitionEvent};

use crate::case_store::{CaseNumberSequence, CaseStore, CaseStoreError};
use crate::external::{CertificateRenderer, ExternalError, ObjectStore};

/// Comment recorded on forced cancellations (case deletion).
pub const SYSTEM_CANCELLED: &str = "system-cancelled";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid {workflow} transition: {from} -> {to}")]
    InvalidTransition {
        workflow: String,
        from: String,
        to: String,
    },

    #[error("conflicting appointment: {0}")]
    ConflictingAppointment(String),

    /// Stale version: the case changed since it was loaded.
    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Certificate rendering or storage failed; the transition was aborted.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] ExternalError),

    #[error(transparent)]
    Store(CaseStoreError),
}

impl From<DomainError> for OrchestratorError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                OrchestratorError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => OrchestratorError::Invariant(msg),
            DomainError::NotFound => OrchestratorError::NotFound("entity not found".to_string()),
            DomainError::InvalidTransition { workflow, from, to } => {
                OrchestratorError::InvalidTransition { workflow, from, to }
            }
            DomainError::ConflictingAppointment(msg) => {
                OrchestratorError::ConflictingAppointment(msg)
            }
            DomainError::Conflict(msg) => OrchestratorError::Conflict(msg),
        }
    }
}

impl From<CaseStoreError> for OrchestratorError {
    fn from(value: CaseStoreError) -> Self {
        match value {
            CaseStoreError::NotFound(id) => OrchestratorError::NotFound(format!("case {id}")),
            CaseStoreError::Concurrency(msg) => OrchestratorError::Concurrency(msg),
            CaseStoreError::BookingConflict(msg) => OrchestratorError::ConflictingAppointment(msg),
            CaseStoreError::DuplicateCaseNumber(msg) => OrchestratorError::Conflict(msg),
            CaseStoreError::InvalidHistory(msg) => OrchestratorError::Invariant(msg),
            other => OrchestratorError::Store(other),
        }
    }
}

/// Result of a committed transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome<C> {
    /// The case as committed (new state, new version).
    pub case: C,
    /// The history record written for this transition.
    pub entry: TransitionHistoryRecord,
}

/// Certificate collaborators used on transitions that require an artifact.
#[derive(Clone)]
pub struct CertificateIssuer {
    renderer: Arc<dyn CertificateRenderer>,
    objects: Arc<dyn ObjectStore>,
}

impl CertificateIssuer {
    pub fn new(renderer: Arc<dyn CertificateRenderer>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { renderer, objects }
    }

    fn issue<C: Case>(&self, case: &C) -> Result<CertificateRef, OrchestratorError> {
        let data = serde_json::to_value(case)
            .map_err(|e| ExternalError::Render(format!("case serialization failed: {e}")))?;
        let bytes = self.renderer.render(&data)?;
        Ok(self.objects.store(bytes)?)
    }

    fn discard(&self, reference: &CertificateRef) -> Result<(), ExternalError> {
        self.objects.discard(reference)
    }
}

/// A mutated, not yet committed case change.
struct Mutation {
    entry: TransitionHistoryRecord,
    /// Certificate stored while mutating; orphaned if the commit fails.
    certificate: Option<CertificateRef>,
}

impl core::fmt::Debug for CertificateIssuer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CertificateIssuer").finish_non_exhaustive()
    }
}

/// Drives state changes of one workflow type.
///
/// Generic over the case type `C`, its store `S` and the event bus `B`, so
/// tests run against in-memory implementations and production swaps in the
/// Postgres store without touching this code.
pub struct TransitionOrchestrator<C, S, B> {
    store: S,
    bus: B,
    sequence: Arc<dyn CaseNumberSequence>,
    certificates: Option<CertificateIssuer>,
    _case: PhantomData<fn() -> C>,
}

impl<C, S, B> core::fmt::Debug for TransitionOrchestrator<C, S, B>
where
    C: Case,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransitionOrchestrator")
            .field("workflow", &C::WORKFLOW)
            .field("certificates", &self.certificates.is_some())
            .finish_non_exhaustive()
    }
}

impl<C, S, B> TransitionOrchestrator<C, S, B>
where
    C: Case,
    S: CaseStore<C>,
    B: EventBus<TransitionEvent>,
{
    pub fn new(store: S, bus: B, sequence: Arc<dyn CaseNumberSequence>) -> Self {
        Self {
            store,
            bus,
            sequence,
            certificates: None,
            _case: PhantomData,
        }
    }

    pub fn with_certificates(mut self, issuer: CertificateIssuer) -> Self {
        self.certificates = Some(issuer);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a new case: assign its number, record the creation entry,
    /// persist it and announce it.
    pub fn create(&self, mut case: C, actor: UserId) -> Result<C, OrchestratorError> {
        let graph = C::graph();
        if case.state() != graph.initial() {
            return Err(OrchestratorError::Invariant(format!(
                "new {} case must start in {}, not {}",
                C::WORKFLOW,
                graph.initial(),
                case.state()
            )));
        }
        if !case.header().history().is_empty() || case.header().case_number().is_some() {
            return Err(OrchestratorError::Invariant(format!(
                "case {} was already registered",
                case.id()
            )));
        }

        let year = case.header().created_at().year();
        let sequence = self.sequence.next_value(C::NUMBER_PREFIX, year)?;
        let number = case.format_number(sequence);
        case.header_mut().assign_number(number)?;

        let record = TransitionHistoryRecord::new(
            case.id(),
            None,
            case.state().as_str(),
            None,
            actor,
            Utc::now(),
        );
        let entry = case.header_mut().record(record)?;

        let stored = self.store.insert(&case)?;
        info!(
            workflow = C::WORKFLOW,
            case_id = %stored.id(),
            case_number = %sequence_label(&stored),
            actor = %actor,
            "case created"
        );
        self.publish(&stored, &entry);
        Ok(stored)
    }

    pub fn get(&self, id: CaseId) -> Result<C, OrchestratorError> {
        Ok(self.store.load(id)?)
    }

    /// History of a live case, newest first.
    pub fn history(&self, id: CaseId) -> Result<Vec<TransitionHistoryRecord>, OrchestratorError> {
        Ok(self.store.load(id)?.header().history().to_vec())
    }

    /// History of a deleted case, newest first.
    pub fn archived_history(
        &self,
        id: CaseId,
    ) -> Result<Vec<TransitionHistoryRecord>, OrchestratorError> {
        Ok(self.store.archived_history(id)?)
    }

    /// Move a case to `target`.
    pub fn apply_transition(
        &self,
        id: CaseId,
        target: C::State,
        actor: UserId,
        comment: Option<String>,
    ) -> Result<TransitionOutcome<C>, OrchestratorError> {
        self.apply_transition_with(id, target, actor, comment, |_| Ok(()))
    }

    /// Like [`apply_transition`](Self::apply_transition), with the target
    /// given by its wire name (e.g. `"UNDER_REVIEW"`).
    pub fn apply_transition_str(
        &self,
        id: CaseId,
        target: &str,
        actor: UserId,
        comment: Option<String>,
    ) -> Result<TransitionOutcome<C>, OrchestratorError> {
        let target: C::State = target.parse()?;
        self.apply_transition(id, target, actor, comment)
    }

    /// Move a case to `target`, letting `prepare` adjust the case first
    /// (e.g. the new time of a rescheduled appointment).
    ///
    /// `prepare` runs only after the edge was validated and its changes are
    /// committed together with the transition.
    pub fn apply_transition_with(
        &self,
        id: CaseId,
        target: C::State,
        actor: UserId,
        comment: Option<String>,
        prepare: impl FnOnce(&mut C) -> Result<(), DomainError>,
    ) -> Result<TransitionOutcome<C>, OrchestratorError> {
        let loaded = self.store.load(id)?;
        let from = loaded.state();

        if let Err(err) = C::graph().validate(from, target) {
            warn!(
                workflow = C::WORKFLOW,
                case_id = %id,
                from = from.as_str(),
                to = target.as_str(),
                "rejected transition"
            );
            return Err(err.into());
        }

        let mut case = loaded.clone();
        prepare(&mut case)?;
        let mutation = self.mutate(&mut case, from, target, actor, comment)?;
        let committed = self.commit_mutation(&case, loaded.header().version(), &mutation)?;
        let entry = mutation.entry;

        info!(
            workflow = C::WORKFLOW,
            case_id = %id,
            from = from.as_str(),
            to = target.as_str(),
            actor = %actor,
            version = committed.header().version(),
            "transition committed"
        );
        self.publish(&committed, &entry);

        Ok(TransitionOutcome {
            case: committed,
            entry,
        })
    }

    /// Delete a case. A case that has not reached a terminal state is first
    /// force-cancelled by the system (bypassing the graph) so its history
    /// ends with the cancellation.
    pub fn delete(&self, id: CaseId) -> Result<(), OrchestratorError> {
        let loaded = self.store.load(id)?;
        let from = loaded.state();

        if !loaded.is_terminal() {
            let target = C::cancellation_state();
            let mut case = loaded.clone();
            let mutation = self.mutate(
                &mut case,
                from,
                target,
                UserId::system(),
                Some(SYSTEM_CANCELLED.to_string()),
            )?;
            let committed = self.commit_mutation(&case, loaded.header().version(), &mutation)?;
            warn!(
                workflow = C::WORKFLOW,
                case_id = %id,
                from = from.as_str(),
                to = target.as_str(),
                "case force-cancelled before deletion"
            );
            self.publish(&committed, &mutation.entry);
        }

        self.store.remove(id)?;
        info!(workflow = C::WORKFLOW, case_id = %id, "case deleted");
        Ok(())
    }

    /// Record payment of the case fee.
    pub fn record_payment(&self, id: CaseId) -> Result<C, OrchestratorError> {
        let loaded = self.store.load(id)?;
        if loaded.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "case {id} is closed ({})",
                loaded.state()
            )));
        }
        let mut case = loaded.clone();
        case.header_mut().mark_paid(Utc::now())?;
        let committed = self
            .store
            .commit(&case, ExpectedVersion::Exact(loaded.header().version()))?;
        info!(workflow = C::WORKFLOW, case_id = %id, "fee paid");
        Ok(committed)
    }

    /// Link a document to an open case. Linking twice is a no-op.
    pub fn attach_document(&self, id: CaseId, document: DocumentId) -> Result<C, OrchestratorError> {
        self.update_documents(id, |case| {
            case.header_mut().attach_document(document, Utc::now());
            Ok(())
        })
    }

    /// Unlink a document from an open case.
    pub fn detach_document(&self, id: CaseId, document: DocumentId) -> Result<C, OrchestratorError> {
        self.update_documents(id, |case| {
            if case.header_mut().detach_document(document, Utc::now()) {
                Ok(())
            } else {
                Err(OrchestratorError::NotFound(format!(
                    "document {document} on case {id}"
                )))
            }
        })
    }

    fn update_documents(
        &self,
        id: CaseId,
        change: impl FnOnce(&mut C) -> Result<(), OrchestratorError>,
    ) -> Result<C, OrchestratorError> {
        let loaded = self.store.load(id)?;
        if loaded.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "documents of closed case {id} cannot change"
            )));
        }
        let mut case = loaded.clone();
        change(&mut case)?;
        if case.header().documents() == loaded.header().documents() {
            return Ok(loaded);
        }
        Ok(self
            .store
            .commit(&case, ExpectedVersion::Exact(loaded.header().version()))?)
    }

    /// Steps 3-4: state, effects, certificate, history. No IO besides the
    /// certificate collaborators.
    fn mutate(
        &self,
        case: &mut C,
        from: C::State,
        target: C::State,
        actor: UserId,
        comment: Option<String>,
    ) -> Result<Mutation, OrchestratorError> {
        let ctx = TransitionContext {
            at: Utc::now(),
            actor,
            comment,
        };
        case.set_state(target);
        case.apply_effects(target, &ctx);

        let mut certificate = None;
        if case.requires_certificate(target) {
            let issuer = self.certificates.as_ref().ok_or_else(|| {
                OrchestratorError::Certificate(ExternalError::Storage(
                    "no certificate issuer configured".to_string(),
                ))
            })?;
            let reference = issuer.issue(case).inspect_err(|err| {
                error!(
                    workflow = C::WORKFLOW,
                    case_id = %case.id(),
                    to = target.as_str(),
                    error = %err,
                    "certificate generation failed, transition aborted"
                );
            })?;
            case.attach_certificate(reference.clone());
            certificate = Some(reference);
        }

        let record = TransitionHistoryRecord::new(
            case.id(),
            Some(from.as_str().to_string()),
            target.as_str(),
            ctx.comment,
            actor,
            ctx.at,
        );
        let entry = case.header_mut().record(record)?;
        Ok(Mutation { entry, certificate })
    }

    /// Step 5. On failure, a certificate issued for this change is discarded.
    fn commit_mutation(
        &self,
        case: &C,
        loaded_version: u64,
        mutation: &Mutation,
    ) -> Result<C, OrchestratorError> {
        match self.store.commit(case, ExpectedVersion::Exact(loaded_version)) {
            Ok(committed) => Ok(committed),
            Err(err) => {
                if let (Some(reference), Some(issuer)) =
                    (&mutation.certificate, self.certificates.as_ref())
                {
                    if let Err(discard_err) = issuer.discard(reference) {
                        warn!(
                            workflow = C::WORKFLOW,
                            case_id = %case.id(),
                            certificate = %reference.0,
                            error = %discard_err,
                            "orphaned certificate left in object store"
                        );
                    }
                }
                Err(err.into())
            }
        }
    }

    fn publish(&self, case: &C, entry: &TransitionHistoryRecord) {
        let event = TransitionEvent::for_case(case, entry);
        let event_type = event.event_type();
        if let Err(err) = self.bus.publish(event) {
            error!(
                workflow = C::WORKFLOW,
                case_id = %entry.case_id,
                state = %entry.new_state,
                event_type,
                error = ?err,
                "failed to publish transition event"
            );
        }
    }
}

fn sequence_label<C: Case>(case: &C) -> String {
    case.header()
        .case_number()
        .map(ToString::to_string)
        .unwrap_or_default()
}
