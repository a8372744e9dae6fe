use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use consular_core::{
    Case, CaseHeader, CaseId, CitizenId, DomainError, DomainResult, Fee, TransitionContext,
    TransitionEngine,
};

consular_core::workflow_state! {
    /// Visa application lifecycle.
    pub enum VisaState {
        Draft => "DRAFT",
        Submitted => "SUBMITTED",
        UnderReview => "UNDER_REVIEW",
        DocsPending => "DOCS_PENDING",
        Approved => "APPROVED",
        Issued => "ISSUED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
    }
}

/// Transition graph shared by every visa application.
pub fn visa_graph() -> &'static TransitionEngine<VisaState> {
    static GRAPH: OnceLock<TransitionEngine<VisaState>> = OnceLock::new();
    GRAPH.get_or_init(|| {
        use VisaState::*;
        TransitionEngine::builder(VisaApplication::WORKFLOW, Draft)
            .edges(Draft, [Submitted, Cancelled])
            .edges(Submitted, [UnderReview, Cancelled])
            .edges(UnderReview, [DocsPending, Approved, Rejected])
            .edges(DocsPending, [UnderReview, Cancelled])
            .edges(Approved, [Issued, Cancelled])
            .terminal([Issued, Rejected, Cancelled])
            .build()
    })
}

/// Visa category; determines the consular fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisaCategory {
    Tourist,
    Business,
    Student,
    Work,
    Transit,
}

impl VisaCategory {
    /// Fee in euro cents.
    pub fn fee_minor(self) -> u64 {
        match self {
            VisaCategory::Tourist | VisaCategory::Business => 9_000,
            VisaCategory::Student => 6_000,
            VisaCategory::Work => 12_000,
            VisaCategory::Transit => 3_500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VisaCategory::Tourist => "tourist",
            VisaCategory::Business => "business",
            VisaCategory::Student => "student",
            VisaCategory::Work => "work",
            VisaCategory::Transit => "transit",
        }
    }
}

/// Case: visa application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisaApplication {
    header: CaseHeader,
    state: VisaState,
    category: VisaCategory,
    passport_number: String,
    intended_entry: NaiveDate,
    stay_days: u32,
    submitted_at: Option<DateTime<Utc>>,
    documents_requested_at: Option<DateTime<Utc>>,
    decided_at: Option<DateTime<Utc>>,
    issued_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    cancellation_reason: Option<String>,
}

impl VisaApplication {
    pub fn new(
        id: CaseId,
        citizen_id: CitizenId,
        category: VisaCategory,
        passport_number: impl Into<String>,
        intended_entry: NaiveDate,
        stay_days: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let passport_number = passport_number.into();
        if passport_number.trim().is_empty() {
            return Err(DomainError::validation("passport_number cannot be empty"));
        }
        if stay_days == 0 {
            return Err(DomainError::validation("stay_days must be positive"));
        }

        Ok(Self {
            header: CaseHeader::new(
                id,
                citizen_id,
                Some(Fee::unpaid(category.fee_minor(), "EUR")),
                now,
            ),
            state: visa_graph().initial(),
            category,
            passport_number,
            intended_entry,
            stay_days,
            submitted_at: None,
            documents_requested_at: None,
            decided_at: None,
            issued_at: None,
            rejection_reason: None,
            cancellation_reason: None,
        })
    }

    pub fn category(&self) -> VisaCategory {
        self.category
    }

    pub fn passport_number(&self) -> &str {
        &self.passport_number
    }

    pub fn intended_entry(&self) -> NaiveDate {
        self.intended_entry
    }

    pub fn stay_days(&self) -> u32 {
        self.stay_days
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn documents_requested_at(&self) -> Option<DateTime<Utc>> {
        self.documents_requested_at
    }

    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decided_at
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }
}

impl Case for VisaApplication {
    type State = VisaState;

    const WORKFLOW: &'static str = "visa";
    const NUMBER_PREFIX: &'static str = "VIS";

    fn graph() -> &'static TransitionEngine<VisaState> {
        visa_graph()
    }

    fn cancellation_state() -> VisaState {
        VisaState::Cancelled
    }

    fn header(&self) -> &CaseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut CaseHeader {
        &mut self.header
    }

    fn state(&self) -> VisaState {
        self.state
    }

    fn set_state(&mut self, state: VisaState) {
        self.state = state;
    }

    fn apply_effects(&mut self, target: VisaState, ctx: &TransitionContext) {
        match target {
            VisaState::Submitted => self.submitted_at = Some(ctx.at),
            VisaState::DocsPending => self.documents_requested_at = Some(ctx.at),
            VisaState::Approved => self.decided_at = Some(ctx.at),
            VisaState::Rejected => {
                self.decided_at = Some(ctx.at);
                self.rejection_reason = ctx.comment.clone();
            }
            VisaState::Issued => self.issued_at = Some(ctx.at),
            VisaState::Cancelled => self.cancellation_reason = ctx.comment.clone(),
            VisaState::Draft | VisaState::UnderReview => {}
        }
    }

    fn display_type(&self) -> String {
        format!("{} visa", self.category.as_str())
    }

    fn extra_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "intended_entry".to_string(),
            self.intended_entry.format("%Y-%m-%d").to_string(),
        )])
    }
}
