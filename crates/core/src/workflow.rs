//! Generic finite-state transition engine.
//!
//! One `TransitionEngine<S>` holds the static transition graph of a single case
//! type: the legal `from -> {to}` edges and the states marked terminal. It is a
//! pure function of that configuration; no IO, no clocks.
//!
//! Concrete workflows declare their state enum with [`workflow_state!`] and
//! build their graph once (typically behind a `OnceLock`):
//!
//! ```ignore
//! TransitionEngine::builder("visa", VisaState::Draft)
//!     .edges(VisaState::Draft, [VisaState::Submitted, VisaState::Cancelled])
//!     .terminal([VisaState::Cancelled])
//!     .build()
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};

/// A workflow state value.
///
/// States are closed enums with a stable SCREAMING_SNAKE wire name; the name is
/// what gets persisted and published.
pub trait WorkflowState:
    Copy + Eq + Ord + Hash + Debug + Display + FromStr<Err = DomainError> + Send + Sync + 'static
{
    /// Every state of the workflow, in declaration order.
    const ALL: &'static [Self];

    /// Stable wire name (e.g. `"UNDER_REVIEW"`).
    fn as_str(&self) -> &'static str;
}

/// Declare a workflow state enum with its wire names.
///
/// Generates the enum (with serde renames), `WorkflowState`, `Display` and
/// `FromStr`. Calling crates must depend on `serde`.
#[macro_export]
macro_rules! workflow_state {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label)] $variant ),+
        }

        impl $crate::workflow::WorkflowState for $name {
            const ALL: &'static [Self] = &[$( Self::$variant ),+];

            fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str($crate::workflow::WorkflowState::as_str(self))
            }
        }

        impl core::str::FromStr for $name {
            type Err = $crate::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok(Self::$variant), )+
                    other => Err($crate::DomainError::validation(format!(
                        "unknown {} state: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// Static transition graph for one workflow.
#[derive(Debug, Clone)]
pub struct TransitionEngine<S> {
    workflow: &'static str,
    initial: S,
    edges: BTreeMap<S, BTreeSet<S>>,
    terminal: BTreeSet<S>,
}

impl<S: WorkflowState> TransitionEngine<S> {
    pub fn builder(workflow: &'static str, initial: S) -> TransitionEngineBuilder<S> {
        TransitionEngineBuilder {
            engine: TransitionEngine {
                workflow,
                initial,
                edges: BTreeMap::new(),
                terminal: BTreeSet::new(),
            },
        }
    }

    /// Workflow name used in errors and events (e.g. `"visa"`).
    pub fn workflow(&self) -> &'static str {
        self.workflow
    }

    /// State every new case of this workflow starts in.
    pub fn initial(&self) -> S {
        self.initial
    }

    /// True iff `to` is in the configured successor set of `from`.
    pub fn is_allowed(&self, from: S, to: S) -> bool {
        self.edges
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// Succeeds silently for a legal edge, otherwise `InvalidTransition`.
    pub fn validate(&self, from: S, to: S) -> DomainResult<()> {
        if self.is_allowed(from, to) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(
                self.workflow,
                from.as_str(),
                to.as_str(),
            ))
        }
    }

    /// Terminal if explicitly marked, or implicitly (no outgoing edges).
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
            || self.edges.get(&state).is_none_or(|targets| targets.is_empty())
    }

    pub fn allowed_targets(&self, from: S) -> BTreeSet<S> {
        self.edges.get(&from).cloned().unwrap_or_default()
    }

    /// All terminal states of the workflow.
    pub fn terminal_states(&self) -> BTreeSet<S> {
        S::ALL
            .iter()
            .copied()
            .filter(|s| self.is_terminal(*s))
            .collect()
    }

    /// States reachable from the initial state through legal edges (initial included).
    pub fn reachable_states(&self) -> BTreeSet<S> {
        let mut seen = BTreeSet::from([self.initial]);
        let mut queue = VecDeque::from([self.initial]);
        while let Some(state) = queue.pop_front() {
            for next in self.allowed_targets(state) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

/// Builder for a [`TransitionEngine`].
#[derive(Debug)]
pub struct TransitionEngineBuilder<S> {
    engine: TransitionEngine<S>,
}

impl<S: WorkflowState> TransitionEngineBuilder<S> {
    /// Add `from -> to` for every target.
    pub fn edges(mut self, from: S, targets: impl IntoIterator<Item = S>) -> Self {
        self.engine.edges.entry(from).or_default().extend(targets);
        self
    }

    /// Explicitly mark states as terminal.
    pub fn terminal(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.engine.terminal.extend(states);
        self
    }

    /// Finish the graph.
    ///
    /// Panics if a state marked terminal has outgoing edges: graphs are static
    /// configuration, so this is a programming error.
    pub fn build(self) -> TransitionEngine<S> {
        for state in &self.engine.terminal {
            assert!(
                self.engine.allowed_targets(*state).is_empty(),
                "{} state {} is marked terminal but has outgoing edges",
                self.engine.workflow,
                state
            );
        }
        self.engine
    }
}
