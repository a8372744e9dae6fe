use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use consular_core::{
    Case, CaseHeader, CaseId, CitizenId, DomainError, DomainResult, TransitionContext,
    TransitionEngine,
};

consular_core::workflow_state! {
    /// Generic administrative process lifecycle.
    ///
    /// `REJECTED` is not terminal here: a rejected process may be reworked
    /// from `DRAFT`.
    pub enum ProcessState {
        Draft => "DRAFT",
        Submitted => "SUBMITTED",
        UnderReview => "UNDER_REVIEW",
        Approved => "APPROVED",
        Rejected => "REJECTED",
        Concluded => "CONCLUDED",
        Cancelled => "CANCELLED",
    }
}

pub fn process_graph() -> &'static TransitionEngine<ProcessState> {
    static GRAPH: OnceLock<TransitionEngine<ProcessState>> = OnceLock::new();
    GRAPH.get_or_init(|| {
        use ProcessState::*;
        TransitionEngine::builder(GenericProcess::WORKFLOW, Draft)
            .edges(Draft, [Submitted, Cancelled])
            .edges(Submitted, [UnderReview, Cancelled])
            .edges(UnderReview, [Approved, Rejected, Cancelled])
            .edges(Approved, [Concluded, Cancelled])
            .edges(Rejected, [Draft, Cancelled])
            .terminal([Concluded, Cancelled])
            .build()
    })
}

/// Case: any administrative process without a dedicated workflow
/// (nationality attestations, military service certificates, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericProcess {
    header: CaseHeader,
    state: ProcessState,
    title: String,
    category: String,
    submitted_at: Option<DateTime<Utc>>,
    decided_at: Option<DateTime<Utc>>,
    concluded_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    cancellation_reason: Option<String>,
    /// Times the process went back to draft after a rejection.
    rework_count: u32,
}

impl GenericProcess {
    pub fn new(
        id: CaseId,
        citizen_id: CitizenId,
        title: impl Into<String>,
        category: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }

        Ok(Self {
            header: CaseHeader::new(id, citizen_id, None, now),
            state: process_graph().initial(),
            title,
            category: category.into(),
            submitted_at: None,
            decided_at: None,
            concluded_at: None,
            rejection_reason: None,
            cancellation_reason: None,
            rework_count: 0,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decided_at
    }

    pub fn concluded_at(&self) -> Option<DateTime<Utc>> {
        self.concluded_at
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn rework_count(&self) -> u32 {
        self.rework_count
    }
}

impl Case for GenericProcess {
    type State = ProcessState;

    const WORKFLOW: &'static str = "process";
    const NUMBER_PREFIX: &'static str = "PRC";

    fn graph() -> &'static TransitionEngine<ProcessState> {
        process_graph()
    }

    fn cancellation_state() -> ProcessState {
        ProcessState::Cancelled
    }

    fn header(&self) -> &CaseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut CaseHeader {
        &mut self.header
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    fn apply_effects(&mut self, target: ProcessState, ctx: &TransitionContext) {
        match target {
            ProcessState::Draft => {
                // Back from REJECTED: the previous decision no longer applies.
                self.decided_at = None;
                self.rejection_reason = None;
                self.rework_count += 1;
            }
            ProcessState::Submitted => self.submitted_at = Some(ctx.at),
            ProcessState::Approved => self.decided_at = Some(ctx.at),
            ProcessState::Rejected => {
                self.decided_at = Some(ctx.at);
                self.rejection_reason = ctx.comment.clone();
            }
            ProcessState::Concluded => self.concluded_at = Some(ctx.at),
            ProcessState::Cancelled => self.cancellation_reason = ctx.comment.clone(),
            ProcessState::UnderReview => {}
        }
    }

    fn display_type(&self) -> String {
        self.title.clone()
    }

    fn extra_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("category".to_string(), self.category.clone())])
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessState::*;
    use super::*;
    use consular_core::{UserId, WorkflowState};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn ctx(comment: Option<&str>) -> TransitionContext {
        TransitionContext {
            at: Utc::now(),
            actor: UserId::new(),
            comment: comment.map(str::to_string),
        }
    }

    fn process() -> GenericProcess {
        GenericProcess::new(
            CaseId::new(),
            CitizenId::new(),
            "Nationality attestation",
            "nationality",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn edges_match_the_process_table() {
        let g = process_graph();
        assert_eq!(g.allowed_targets(Draft), BTreeSet::from([Submitted, Cancelled]));
        assert_eq!(g.allowed_targets(Submitted), BTreeSet::from([UnderReview, Cancelled]));
        assert_eq!(
            g.allowed_targets(UnderReview),
            BTreeSet::from([Approved, Rejected, Cancelled])
        );
        assert_eq!(g.allowed_targets(Approved), BTreeSet::from([Concluded, Cancelled]));
        assert_eq!(g.allowed_targets(Rejected), BTreeSet::from([Draft, Cancelled]));
    }

    #[test]
    fn rejected_is_not_terminal() {
        let g = process_graph();
        assert!(!g.is_terminal(Rejected));
        assert_eq!(g.terminal_states(), BTreeSet::from([Concluded, Cancelled]));
    }

    #[test]
    fn carries_no_fee() {
        assert!(process().header().fee().is_none());
    }

    #[test]
    fn rework_after_rejection_clears_decision() {
        let mut p = process();
        p.apply_effects(Rejected, &ctx(Some("missing birth certificate")));
        assert!(p.decided_at().is_some());
        assert_eq!(p.rejection_reason(), Some("missing birth certificate"));

        p.apply_effects(Draft, &ctx(None));
        assert!(p.decided_at().is_none());
        assert!(p.rejection_reason().is_none());
        assert_eq!(p.rework_count(), 1);
    }

    #[test]
    fn reject_and_resubmit_path_is_legal() {
        let g = process_graph();
        let path = [UnderReview, Rejected, Draft, Submitted];
        for pair in path.windows(2) {
            assert!(g.validate(pair[0], pair[1]).is_ok(), "{} -> {}", pair[0], pair[1]);
        }
    }

    proptest! {
        #[test]
        fn reachable_from_every_non_terminal_state_includes_a_terminal(idx in 0usize..7) {
            let g = process_graph();
            let start = ProcessState::ALL[idx];
            prop_assume!(!g.is_terminal(start));
            // Cancellation is one hop away from every non-terminal state.
            prop_assert!(g.is_allowed(start, Cancelled));
        }
    }
}
