use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use consular_core::{
    Case, CaseHeader, CaseId, CertificateRef, CitizenId, DomainError, DomainResult, Fee,
    TransitionContext, TransitionEngine,
};

consular_core::workflow_state! {
    /// Notarial service lifecycle.
    pub enum NotarialState {
        Draft => "DRAFT",
        Submitted => "SUBMITTED",
        Processing => "PROCESSING",
        Concluded => "CONCLUDED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
    }
}

pub fn notarial_graph() -> &'static TransitionEngine<NotarialState> {
    static GRAPH: OnceLock<TransitionEngine<NotarialState>> = OnceLock::new();
    GRAPH.get_or_init(|| {
        use NotarialState::*;
        TransitionEngine::builder(NotarialService::WORKFLOW, Draft)
            .edges(Draft, [Submitted, Cancelled])
            .edges(Submitted, [Processing, Cancelled])
            .edges(Processing, [Concluded, Rejected])
            .terminal([Concluded, Rejected, Cancelled])
            .build()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotarialKind {
    PowerOfAttorney,
    SignatureRecognition,
    CertifiedCopy,
    Apostille,
}

impl NotarialKind {
    pub fn fee_minor(self) -> u64 {
        match self {
            NotarialKind::PowerOfAttorney => 5_000,
            NotarialKind::SignatureRecognition => 1_200,
            NotarialKind::CertifiedCopy => 800,
            NotarialKind::Apostille => 2_500,
        }
    }

    /// Whether concluding the act yields a certificate artifact.
    pub fn produces_certificate(self) -> bool {
        matches!(self, NotarialKind::PowerOfAttorney | NotarialKind::Apostille)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotarialKind::PowerOfAttorney => "power of attorney",
            NotarialKind::SignatureRecognition => "signature recognition",
            NotarialKind::CertifiedCopy => "certified copy",
            NotarialKind::Apostille => "apostille",
        }
    }
}

/// Case: notarial act requested at the consulate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarialService {
    header: CaseHeader,
    state: NotarialState,
    kind: NotarialKind,
    description: String,
    submitted_at: Option<DateTime<Utc>>,
    processing_started_at: Option<DateTime<Utc>>,
    concluded_at: Option<DateTime<Utc>>,
    certificate: Option<CertificateRef>,
    rejection_reason: Option<String>,
    cancellation_reason: Option<String>,
}

impl NotarialService {
    pub fn new(
        id: CaseId,
        citizen_id: CitizenId,
        kind: NotarialKind,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(DomainError::validation("description cannot be empty"));
        }

        Ok(Self {
            header: CaseHeader::new(id, citizen_id, Some(Fee::unpaid(kind.fee_minor(), "EUR")), now),
            state: notarial_graph().initial(),
            kind,
            description,
            submitted_at: None,
            processing_started_at: None,
            concluded_at: None,
            certificate: None,
            rejection_reason: None,
            cancellation_reason: None,
        })
    }

    pub fn kind(&self) -> NotarialKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn processing_started_at(&self) -> Option<DateTime<Utc>> {
        self.processing_started_at
    }

    pub fn concluded_at(&self) -> Option<DateTime<Utc>> {
        self.concluded_at
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

impl Case for NotarialService {
    type State = NotarialState;

    const WORKFLOW: &'static str = "notarial";
    const NUMBER_PREFIX: &'static str = "NOT";

    fn graph() -> &'static TransitionEngine<NotarialState> {
        notarial_graph()
    }

    fn cancellation_state() -> NotarialState {
        NotarialState::Cancelled
    }

    fn header(&self) -> &CaseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut CaseHeader {
        &mut self.header
    }

    fn state(&self) -> NotarialState {
        self.state
    }

    fn set_state(&mut self, state: NotarialState) {
        self.state = state;
    }

    fn apply_effects(&mut self, target: NotarialState, ctx: &TransitionContext) {
        match target {
            NotarialState::Submitted => self.submitted_at = Some(ctx.at),
            NotarialState::Processing => self.processing_started_at = Some(ctx.at),
            NotarialState::Concluded => self.concluded_at = Some(ctx.at),
            NotarialState::Rejected => self.rejection_reason = ctx.comment.clone(),
            NotarialState::Cancelled => self.cancellation_reason = ctx.comment.clone(),
            NotarialState::Draft => {}
        }
    }

    fn requires_certificate(&self, target: NotarialState) -> bool {
        target == NotarialState::Concluded && self.kind.produces_certificate()
    }

    fn attach_certificate(&mut self, reference: CertificateRef) {
        self.certificate = Some(reference);
    }

    fn display_type(&self) -> String {
        self.kind.as_str().to_string()
    }

    fn extra_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("description".to_string(), self.description.clone())])
    }
}

#[cfg(test)]
mod tests {
    use super::NotarialState::*;
    use super::*;
    use consular_core::{UserId, WorkflowState};
    use std::collections::BTreeSet;

    fn service(kind: NotarialKind) -> NotarialService {
        NotarialService::new(CaseId::new(), CitizenId::new(), kind, "sale of apartment", Utc::now())
            .unwrap()
    }

    #[test]
    fn edges_match_the_notarial_table() {
        let g = notarial_graph();
        assert_eq!(g.allowed_targets(Draft), BTreeSet::from([Submitted, Cancelled]));
        assert_eq!(g.allowed_targets(Submitted), BTreeSet::from([Processing, Cancelled]));
        assert_eq!(g.allowed_targets(Processing), BTreeSet::from([Concluded, Rejected]));
        assert_eq!(g.terminal_states(), BTreeSet::from([Concluded, Rejected, Cancelled]));
        assert_eq!(g.reachable_states().len(), NotarialState::ALL.len());
    }

    #[test]
    fn processing_cannot_be_cancelled() {
        let err = notarial_graph().validate(Processing, Cancelled).unwrap_err();
        assert_eq!(
            err,
            DomainError::invalid_transition("notarial", "PROCESSING", "CANCELLED")
        );
    }

    #[test]
    fn certificate_depends_on_kind() {
        assert!(service(NotarialKind::PowerOfAttorney).requires_certificate(Concluded));
        assert!(!service(NotarialKind::CertifiedCopy).requires_certificate(Concluded));
        assert!(!service(NotarialKind::Apostille).requires_certificate(Processing));
    }

    #[test]
    fn empty_description_is_rejected() {
        let err = NotarialService::new(
            CaseId::new(),
            CitizenId::new(),
            NotarialKind::Apostille,
            "",
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejection_records_reason() {
        let mut s = service(NotarialKind::SignatureRecognition);
        s.apply_effects(
            Rejected,
            &TransitionContext {
                at: Utc::now(),
                actor: UserId::new(),
                comment: Some("signature mismatch".to_string()),
            },
        );
        assert_eq!(s.rejection_reason(), Some("signature mismatch"));
        assert_eq!(s.header().fee().unwrap().amount_minor, 1_200);
        assert_eq!(s.notification_variables()["case_type"], "signature recognition");
    }
}
