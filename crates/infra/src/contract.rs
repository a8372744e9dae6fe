//! Request/response shapes for the thin HTTP layer, and the mapping from
//! orchestrator errors to status codes.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use consular_appointments::{Appointment, AppointmentType, Slot};
use consular_core::{Case, CaseId, TransitionHistoryRecord, UserId};
use consular_events::{EventBus, TransitionEvent};

use crate::booking::AppointmentBooking;
use crate::case_store::CaseStore;
use crate::orchestrator::{OrchestratorError, TransitionOrchestrator, TransitionOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub target_state: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Updated case snapshot plus the history entry just written.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionResponse<C> {
    pub case: C,
    pub entry: TransitionHistoryRecord,
}

impl<C> From<TransitionOutcome<C>> for TransitionResponse<C> {
    fn from(outcome: TransitionOutcome<C>) -> Self {
        Self {
            case: outcome.case,
            entry: outcome.entry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotQuery {
    pub date: NaiveDate,
    pub appointment_type: AppointmentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotView {
    pub date_time: NaiveDateTime,
    pub duration_minutes: u32,
    pub appointment_type: AppointmentType,
}

impl From<Slot> for SlotView {
    fn from(slot: Slot) -> Self {
        Self {
            date_time: slot.date_time,
            duration_minutes: slot.duration_minutes,
            appointment_type: slot.appointment_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl OrchestratorError {
    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::NotFound(_) => 404,
            OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::ConflictingAppointment(_)
            | OrchestratorError::Concurrency(_)
            | OrchestratorError::Conflict(_) => 409,
            OrchestratorError::Validation(_) => 400,
            OrchestratorError::Invariant(_)
            | OrchestratorError::Certificate(_)
            | OrchestratorError::Store(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::ConflictingAppointment(_) => "conflicting_appointment",
            OrchestratorError::Concurrency(_) => "concurrent_modification",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::Validation(_) => "validation_failed",
            OrchestratorError::Invariant(_) => "invariant_violated",
            OrchestratorError::Certificate(_) => "certificate_failed",
            OrchestratorError::Store(_) => "storage_error",
        }
    }
}

impl From<&OrchestratorError> for ErrorBody {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            status: err.http_status(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// `POST /{workflow}/{id}/transitions`
pub fn handle_transition<C, S, B>(
    orchestrator: &TransitionOrchestrator<C, S, B>,
    id: CaseId,
    request: TransitionRequest,
    actor: UserId,
) -> Result<TransitionResponse<C>, ErrorBody>
where
    C: Case,
    S: CaseStore<C>,
    B: EventBus<TransitionEvent>,
{
    orchestrator
        .apply_transition_str(id, &request.target_state, actor, request.comment)
        .map(TransitionResponse::from)
        .map_err(|e| ErrorBody::from(&e))
}

/// `GET /appointments/slots?date=..&appointmentType=..`
pub fn handle_slot_query<S, B>(
    booking: &AppointmentBooking<S, B>,
    query: SlotQuery,
) -> Result<Vec<SlotView>, ErrorBody>
where
    S: CaseStore<Appointment>,
    B: EventBus<TransitionEvent>,
{
    booking
        .available_slots(query.date, query.appointment_type)
        .map(|slots| slots.into_iter().map(SlotView::from).collect())
        .map_err(|e| ErrorBody::from(&e))
}
