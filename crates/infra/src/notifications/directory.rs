//! Lookups the dispatcher needs beyond the event itself: who owns a case, how
//! to reach them, and what to substitute into the template.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use consular_core::{Case, CaseId, CitizenId};

use crate::case_store::{CaseStore, CaseStoreError};

/// Contact addresses of citizens.
pub trait CitizenDirectory: Send + Sync {
    fn contact_address(&self, citizen_id: CitizenId) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct InMemoryCitizenDirectory {
    addresses: RwLock<HashMap<CitizenId, String>>,
}

impl InMemoryCitizenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, citizen_id: CitizenId, address: impl Into<String>) {
        if let Ok(mut addresses) = self.addresses.write() {
            addresses.insert(citizen_id, address.into());
        }
    }
}

impl CitizenDirectory for InMemoryCitizenDirectory {
    fn contact_address(&self, citizen_id: CitizenId) -> Option<String> {
        self.addresses.read().ok()?.get(&citizen_id).cloned()
    }
}

/// What a notification needs to know about a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseSummary {
    pub citizen_id: CitizenId,
    pub variables: BTreeMap<String, String>,
}

pub trait CaseSummarySource: Send + Sync {
    fn summary(&self, id: CaseId) -> Result<CaseSummary, CaseStoreError>;
}

/// Reads summaries straight from a case store.
pub struct StoreSummaries<C, S> {
    store: S,
    _case: PhantomData<fn() -> C>,
}

impl<C, S> StoreSummaries<C, S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            _case: PhantomData,
        }
    }
}

impl<C, S> CaseSummarySource for StoreSummaries<C, S>
where
    C: Case,
    S: CaseStore<C>,
{
    fn summary(&self, id: CaseId) -> Result<CaseSummary, CaseStoreError> {
        let case = self.store.load(id)?;
        Ok(CaseSummary {
            citizen_id: case.header().citizen_id(),
            variables: case.notification_variables(),
        })
    }
}

/// Summary sources keyed by workflow name.
#[derive(Clone, Default)]
pub struct CaseLookup {
    sources: HashMap<&'static str, Arc<dyn CaseSummarySource>>,
}

impl CaseLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the store holding cases of type `C`.
    pub fn with_store<C, S>(mut self, store: S) -> Self
    where
        C: Case,
        S: CaseStore<C> + 'static,
    {
        self.sources
            .insert(C::WORKFLOW, Arc::new(StoreSummaries::<C, S>::new(store)));
        self
    }

    /// `None` when no store is registered for `workflow`.
    pub fn summary(&self, workflow: &str, id: CaseId) -> Option<Result<CaseSummary, CaseStoreError>> {
        self.sources.get(workflow).map(|source| source.summary(id))
    }

    pub fn workflows(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sources.keys().copied()
    }
}

impl core::fmt::Debug for CaseLookup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CaseLookup")
            .field("workflows", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}
