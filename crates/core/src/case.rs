//! Case records: the common header every workflow type carries, the
//! append-only transition history, and the `Case` trait the orchestrator
//! drives.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CaseId, CitizenId, DocumentId, HistoryId, UserId};
use crate::workflow::{TransitionEngine, WorkflowState};

/// Optimistic concurrency expectation for a case.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (imports, migrations).
    Any,
    /// Require the case to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

/// Human-readable sequential case number (`VIS-2026-000042`).
///
/// Assigned once at creation and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseNumber(String);

impl CaseNumber {
    pub fn format(prefix: &str, year: i32, sequence: u64) -> Self {
        Self(format!("{prefix}-{year}-{sequence:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CaseNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Consular fee attached to fee-bearing case types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    /// Amount in the smallest currency unit (e.g. cents).
    pub amount_minor: u64,
    pub currency: String,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Fee {
    pub fn unpaid(amount_minor: u64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
            paid: false,
            paid_at: None,
        }
    }
}

/// Reference to a stored certificate artifact (returned by the object store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateRef(pub String);

/// The (service, wall-clock time) pair an active appointment occupies.
///
/// At most one active case may hold a given key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingKey {
    pub service: String,
    pub slot: NaiveDateTime,
}

/// One immutable entry of a case's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionHistoryRecord {
    pub id: HistoryId,
    pub case_id: CaseId,
    /// Absent for the creation record.
    pub previous_state: Option<String>,
    pub new_state: String,
    pub comment: Option<String>,
    pub actor: UserId,
    pub timestamp: DateTime<Utc>,
}

impl TransitionHistoryRecord {
    pub fn new(
        case_id: CaseId,
        previous_state: Option<String>,
        new_state: impl Into<String>,
        comment: Option<String>,
        actor: UserId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HistoryId::new(),
            case_id,
            previous_state,
            new_state: new_state.into(),
            comment,
            actor,
            timestamp,
        }
    }
}

/// Inputs available to type-specific effects while a transition is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    pub at: DateTime<Utc>,
    pub actor: UserId,
    pub comment: Option<String>,
}

/// Fields shared by every case type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseHeader {
    id: CaseId,
    citizen_id: CitizenId,
    case_number: Option<CaseNumber>,
    fee: Option<Fee>,
    documents: BTreeSet<DocumentId>,
    /// Newest first.
    history: Vec<TransitionHistoryRecord>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CaseHeader {
    pub fn new(id: CaseId, citizen_id: CitizenId, fee: Option<Fee>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            citizen_id,
            case_number: None,
            fee,
            documents: BTreeSet::new(),
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> CaseId {
        self.id
    }

    pub fn citizen_id(&self) -> CitizenId {
        self.citizen_id
    }

    pub fn case_number(&self) -> Option<&CaseNumber> {
        self.case_number.as_ref()
    }

    pub fn fee(&self) -> Option<&Fee> {
        self.fee.as_ref()
    }

    pub fn documents(&self) -> &BTreeSet<DocumentId> {
        &self.documents
    }

    /// Transition history, newest first.
    pub fn history(&self) -> &[TransitionHistoryRecord] {
        &self.history
    }

    pub fn latest_record(&self) -> Option<&TransitionHistoryRecord> {
        self.history.first()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Assign the case number. Numbers are permanent.
    pub fn assign_number(&mut self, number: CaseNumber) -> DomainResult<()> {
        if let Some(existing) = &self.case_number {
            return Err(DomainError::invariant(format!(
                "case {} already numbered {existing}",
                self.id
            )));
        }
        self.case_number = Some(number);
        Ok(())
    }

    /// Prepend a history record and return the stored copy.
    ///
    /// Timestamps are kept strictly increasing: a record stamped at or before
    /// the current newest record is moved 1µs past it.
    pub fn record(&mut self, mut record: TransitionHistoryRecord) -> DomainResult<TransitionHistoryRecord> {
        if record.case_id != self.id {
            return Err(DomainError::invariant("history record belongs to another case"));
        }
        if let Some(newest) = self.history.first() {
            if record.timestamp <= newest.timestamp {
                record.timestamp = newest.timestamp + Duration::microseconds(1);
            }
        }
        self.updated_at = record.timestamp;
        self.history.insert(0, record.clone());
        Ok(record)
    }

    pub fn mark_paid(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        let fee = self
            .fee
            .as_mut()
            .ok_or_else(|| DomainError::validation("case type carries no fee"))?;
        if fee.paid {
            return Err(DomainError::conflict("fee already paid"));
        }
        fee.paid = true;
        fee.paid_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    /// Returns false if the document was already linked.
    pub fn attach_document(&mut self, document: DocumentId, at: DateTime<Utc>) -> bool {
        let inserted = self.documents.insert(document);
        if inserted {
            self.updated_at = at;
        }
        inserted
    }

    /// Returns false if the document was not linked.
    pub fn detach_document(&mut self, document: DocumentId, at: DateTime<Utc>) -> bool {
        let removed = self.documents.remove(&document);
        if removed {
            self.updated_at = at;
        }
        removed
    }

    /// Stamp the committed version. Stores call this; nothing else should.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// A case record of one workflow type.
///
/// Implementations are pure: state effects must not perform IO. Certificate
/// generation is requested through [`Case::requires_certificate`] and the
/// orchestrator attaches the resulting reference.
pub trait Case: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type State: WorkflowState;

    /// Stable workflow name (e.g. `"visa"`).
    const WORKFLOW: &'static str;

    /// Case-number prefix (e.g. `"VIS"`).
    const NUMBER_PREFIX: &'static str;

    fn graph() -> &'static TransitionEngine<Self::State>;

    /// State reached when a case is cancelled (including forced cancellation).
    fn cancellation_state() -> Self::State;

    fn header(&self) -> &CaseHeader;

    fn header_mut(&mut self) -> &mut CaseHeader;

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);

    /// Type-specific derived effects on entering `target` (timestamps, reasons).
    fn apply_effects(&mut self, target: Self::State, ctx: &TransitionContext);

    /// Whether entering `target` must produce a certificate artifact.
    fn requires_certificate(&self, _target: Self::State) -> bool {
        false
    }

    fn attach_certificate(&mut self, _reference: CertificateRef) {}

    /// Slot held by this case while it is in an active booking state.
    fn booking_key(&self) -> Option<BookingKey> {
        None
    }

    /// Human-readable case type used in notifications.
    fn display_type(&self) -> String {
        Self::WORKFLOW.to_string()
    }

    /// Extra template substitution variables.
    fn extra_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn id(&self) -> CaseId {
        self.header().id()
    }

    fn is_terminal(&self) -> bool {
        Self::graph().is_terminal(self.state())
    }

    /// Template substitution variables (case number, type, plus extras).
    fn notification_variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.extra_variables();
        if let Some(number) = self.header().case_number() {
            vars.insert("case_number".to_string(), number.to_string());
        }
        vars.insert("case_type".to_string(), self.display_type());
        vars.insert("state".to_string(), self.state().as_str().to_string());
        vars
    }

    /// Case number for a sequence value, stamped with the creation year.
    fn format_number(&self, sequence: u64) -> CaseNumber {
        CaseNumber::format(Self::NUMBER_PREFIX, self.header().created_at().year(), sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CaseHeader {
        CaseHeader::new(CaseId::new(), CitizenId::new(), Some(Fee::unpaid(6000, "EUR")), Utc::now())
    }

    #[test]
    fn case_number_format_is_zero_padded() {
        assert_eq!(CaseNumber::format("VIS", 2026, 42).as_str(), "VIS-2026-000042");
    }

    #[test]
    fn case_number_is_assigned_once() {
        let mut h = header();
        h.assign_number(CaseNumber::format("VIS", 2026, 1)).unwrap();
        let err = h.assign_number(CaseNumber::format("VIS", 2026, 2)).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(h.case_number().unwrap().as_str(), "VIS-2026-000001");
    }

    #[test]
    fn history_is_newest_first_with_increasing_timestamps() {
        let mut h = header();
        let at = Utc::now();
        let first = TransitionHistoryRecord::new(h.id(), None, "DRAFT", None, UserId::new(), at);
        let second = TransitionHistoryRecord::new(
            h.id(),
            Some("DRAFT".into()),
            "SUBMITTED",
            None,
            UserId::new(),
            at,
        );
        h.record(first).unwrap();
        let stored = h.record(second).unwrap();

        assert_eq!(h.history().len(), 2);
        assert_eq!(h.latest_record().unwrap().new_state, "SUBMITTED");
        assert!(stored.timestamp > h.history()[1].timestamp);
    }

    #[test]
    fn record_rejects_foreign_case() {
        let mut h = header();
        let rec = TransitionHistoryRecord::new(CaseId::new(), None, "DRAFT", None, UserId::new(), Utc::now());
        assert!(h.record(rec).is_err());
        assert!(h.history().is_empty());
    }

    #[test]
    fn fee_can_be_paid_once() {
        let mut h = header();
        h.mark_paid(Utc::now()).unwrap();
        assert!(h.fee().unwrap().paid);
        assert!(matches!(h.mark_paid(Utc::now()), Err(DomainError::Conflict(_))));

        let mut free = CaseHeader::new(CaseId::new(), CitizenId::new(), None, Utc::now());
        assert!(matches!(free.mark_paid(Utc::now()), Err(DomainError::Validation(_))));
    }

    #[test]
    fn documents_attach_and_detach() {
        let mut h = header();
        let doc = DocumentId::new();
        assert!(h.attach_document(doc, Utc::now()));
        assert!(!h.attach_document(doc, Utc::now()));
        assert!(h.detach_document(doc, Utc::now()));
        assert!(!h.detach_document(doc, Utc::now()));
    }
}
