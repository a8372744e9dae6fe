use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consular_core::{Case, CaseId, CitizenId, TransitionHistoryRecord, UserId};

/// A domain-agnostic event. Events are immutable facts.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "case.transitioned").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Published after a case state change (or creation) has been committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub event_id: Uuid,
    pub case_id: CaseId,
    pub workflow: String,
    /// Absent when the case was just created.
    pub previous_state: Option<String>,
    pub new_state: String,
    pub comment: Option<String>,
    pub actor: UserId,
    pub timestamp: DateTime<Utc>,
    /// Owner of the case as committed. Lets consumers act on the event even
    /// after the case itself was deleted.
    #[serde(default)]
    pub citizen_id: Option<CitizenId>,
    /// Template variables of the case as committed.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl TransitionEvent {
    /// Build the event mirroring a committed history record.
    pub fn from_record(workflow: impl Into<String>, record: &TransitionHistoryRecord) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            case_id: record.case_id,
            workflow: workflow.into(),
            previous_state: record.previous_state.clone(),
            new_state: record.new_state.clone(),
            comment: record.comment.clone(),
            actor: record.actor,
            timestamp: record.timestamp,
            citizen_id: None,
            variables: BTreeMap::new(),
        }
    }

    /// Build the event for `record` just committed on `case`, carrying the
    /// case owner and its notification variables.
    pub fn for_case<C: Case>(case: &C, record: &TransitionHistoryRecord) -> Self {
        Self {
            citizen_id: Some(case.header().citizen_id()),
            variables: case.notification_variables(),
            ..Self::from_record(C::WORKFLOW, record)
        }
    }

    pub fn is_creation(&self) -> bool {
        self.previous_state.is_none()
    }
}

impl Event for TransitionEvent {
    fn event_type(&self) -> &'static str {
        if self.is_creation() {
            "case.created"
        } else {
            "case.transitioned"
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mirrors_history_record() {
        let case_id = CaseId::new();
        let actor = UserId::new();
        let record = TransitionHistoryRecord::new(
            case_id,
            Some("DRAFT".to_string()),
            "SUBMITTED",
            Some("all documents attached".to_string()),
            actor,
            Utc::now(),
        );

        let event = TransitionEvent::from_record("visa", &record);

        assert_eq!(event.case_id, case_id);
        assert_eq!(event.workflow, "visa");
        assert_eq!(event.previous_state.as_deref(), Some("DRAFT"));
        assert_eq!(event.new_state, "SUBMITTED");
        assert_eq!(event.actor, actor);
        assert_eq!(event.occurred_at(), record.timestamp);
        assert_eq!(event.event_type(), "case.transitioned");
    }

    #[test]
    fn creation_events_have_no_previous_state() {
        let record =
            TransitionHistoryRecord::new(CaseId::new(), None, "DRAFT", None, UserId::new(), Utc::now());
        let event = TransitionEvent::from_record("visa", &record);
        assert!(event.is_creation());
        assert_eq!(event.event_type(), "case.created");

        let json = serde_json::to_value(&event).unwrap();
        assert!(json["previous_state"].is_null());
    }

    #[test]
    fn payload_without_case_context_still_decodes() {
        let json = serde_json::json!({
            "event_id": Uuid::now_v7(),
            "case_id": CaseId::new(),
            "workflow": "visa",
            "previous_state": "APPROVED",
            "new_state": "ISSUED",
            "comment": null,
            "actor": UserId::new(),
            "timestamp": Utc::now(),
        });
        let event: TransitionEvent = serde_json::from_value(json).unwrap();
        assert!(event.citizen_id.is_none());
        assert!(event.variables.is_empty());
    }
}
