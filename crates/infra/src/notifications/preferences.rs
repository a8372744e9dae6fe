use std::collections::HashMap;
use std::sync::RwLock;

use consular_core::CitizenId;

/// Per-citizen, per-workflow email preference.
///
/// Opt-out model: a citizen with no stored preference is notified.
pub trait PreferenceStore: Send + Sync {
    fn is_enabled(&self, citizen_id: CitizenId, workflow: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    prefs: RwLock<HashMap<(CitizenId, String), bool>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, citizen_id: CitizenId, workflow: &str, enabled: bool) {
        if let Ok(mut prefs) = self.prefs.write() {
            prefs.insert((citizen_id, workflow.to_string()), enabled);
        }
    }

    /// Forget a stored preference (back to the default).
    pub fn clear(&self, citizen_id: CitizenId, workflow: &str) {
        if let Ok(mut prefs) = self.prefs.write() {
            prefs.remove(&(citizen_id, workflow.to_string()));
        }
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn is_enabled(&self, citizen_id: CitizenId, workflow: &str) -> bool {
        self.prefs
            .read()
            .ok()
            .and_then(|prefs| prefs.get(&(citizen_id, workflow.to_string())).copied())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_preference_means_enabled() {
        let prefs = InMemoryPreferenceStore::new();
        assert!(prefs.is_enabled(CitizenId::new(), "visa"));
    }

    #[test]
    fn opt_out_is_scoped_to_one_workflow() {
        let prefs = InMemoryPreferenceStore::new();
        let citizen = CitizenId::new();
        prefs.set(citizen, "visa", false);

        assert!(!prefs.is_enabled(citizen, "visa"));
        assert!(prefs.is_enabled(citizen, "appointment"));
        assert!(prefs.is_enabled(CitizenId::new(), "visa"));

        prefs.clear(citizen, "visa");
        assert!(prefs.is_enabled(citizen, "visa"));
    }
}
