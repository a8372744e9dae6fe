use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use consular_core::{
    Case, CaseHeader, CaseId, CertificateRef, CitizenId, DomainError, DomainResult, Fee,
    TransitionContext, TransitionEngine,
};

consular_core::workflow_state! {
    /// Civil-registry registration lifecycle.
    pub enum RegistrationState {
        Draft => "DRAFT",
        Submitted => "SUBMITTED",
        Verifying => "VERIFYING",
        Verified => "VERIFIED",
        CertificateIssued => "CERTIFICATE_ISSUED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
    }
}

pub fn registration_graph() -> &'static TransitionEngine<RegistrationState> {
    static GRAPH: OnceLock<TransitionEngine<RegistrationState>> = OnceLock::new();
    GRAPH.get_or_init(|| {
        use RegistrationState::*;
        TransitionEngine::builder(CivilRegistration::WORKFLOW, Draft)
            .edges(Draft, [Submitted, Cancelled])
            .edges(Submitted, [Verifying, Cancelled])
            .edges(Verifying, [Verified, Rejected])
            .edges(Verified, [CertificateIssued, Cancelled])
            .terminal([CertificateIssued, Rejected, Cancelled])
            .build()
    })
}

/// Vital event being registered with the consulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationKind {
    Birth,
    Marriage,
    Death,
}

impl RegistrationKind {
    pub fn fee_minor(self) -> u64 {
        match self {
            RegistrationKind::Birth | RegistrationKind::Death => 1_500,
            RegistrationKind::Marriage => 4_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationKind::Birth => "birth",
            RegistrationKind::Marriage => "marriage",
            RegistrationKind::Death => "death",
        }
    }
}

/// Case: civil-registry registration (birth, marriage, death abroad).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CivilRegistration {
    header: CaseHeader,
    state: RegistrationState,
    kind: RegistrationKind,
    subject_name: String,
    event_date: NaiveDate,
    event_place: String,
    submitted_at: Option<DateTime<Utc>>,
    verified_at: Option<DateTime<Utc>>,
    certificate_issued_at: Option<DateTime<Utc>>,
    certificate: Option<CertificateRef>,
    rejection_reason: Option<String>,
    cancellation_reason: Option<String>,
}

impl CivilRegistration {
    pub fn new(
        id: CaseId,
        citizen_id: CitizenId,
        kind: RegistrationKind,
        subject_name: impl Into<String>,
        event_date: NaiveDate,
        event_place: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let subject_name = subject_name.into();
        if subject_name.trim().is_empty() {
            return Err(DomainError::validation("subject_name cannot be empty"));
        }
        if event_date > now.date_naive() {
            return Err(DomainError::validation("event_date cannot be in the future"));
        }

        Ok(Self {
            header: CaseHeader::new(id, citizen_id, Some(Fee::unpaid(kind.fee_minor(), "EUR")), now),
            state: registration_graph().initial(),
            kind,
            subject_name,
            event_date,
            event_place: event_place.into(),
            submitted_at: None,
            verified_at: None,
            certificate_issued_at: None,
            certificate: None,
            rejection_reason: None,
            cancellation_reason: None,
        })
    }

    pub fn kind(&self) -> RegistrationKind {
        self.kind
    }

    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    pub fn event_date(&self) -> NaiveDate {
        self.event_date
    }

    pub fn event_place(&self) -> &str {
        &self.event_place
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn certificate_issued_at(&self) -> Option<DateTime<Utc>> {
        self.certificate_issued_at
    }

    pub fn certificate(&self) -> Option<&CertificateRef> {
        self.certificate.as_ref()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }
}

impl Case for CivilRegistration {
    type State = RegistrationState;

    const WORKFLOW: &'static str = "civil_registration";
    const NUMBER_PREFIX: &'static str = "REG";

    fn graph() -> &'static TransitionEngine<RegistrationState> {
        registration_graph()
    }

    fn cancellation_state() -> RegistrationState {
        RegistrationState::Cancelled
    }

    fn header(&self) -> &CaseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut CaseHeader {
        &mut self.header
    }

    fn state(&self) -> RegistrationState {
        self.state
    }

    fn set_state(&mut self, state: RegistrationState) {
        self.state = state;
    }

    fn apply_effects(&mut self, target: RegistrationState, ctx: &TransitionContext) {
        match target {
            RegistrationState::Submitted => self.submitted_at = Some(ctx.at),
            RegistrationState::Verified => self.verified_at = Some(ctx.at),
            RegistrationState::CertificateIssued => self.certificate_issued_at = Some(ctx.at),
            RegistrationState::Rejected => self.rejection_reason = ctx.comment.clone(),
            RegistrationState::Cancelled => self.cancellation_reason = ctx.comment.clone(),
            RegistrationState::Draft | RegistrationState::Verifying => {}
        }
    }

    fn requires_certificate(&self, target: RegistrationState) -> bool {
        target == RegistrationState::CertificateIssued
    }

    fn attach_certificate(&mut self, reference: CertificateRef) {
        self.certificate = Some(reference);
    }

    fn display_type(&self) -> String {
        format!("{} registration", self.kind.as_str())
    }

    fn extra_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("subject_name".to_string(), self.subject_name.clone())])
    }
}
