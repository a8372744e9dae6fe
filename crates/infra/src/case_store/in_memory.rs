use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use chrono::{NaiveDate, NaiveDateTime};

use consular_core::{BookingKey, Case, CaseId, CaseNumber, ExpectedVersion, TransitionHistoryRecord};

use super::r#trait::{
    CaseNumberSequence, CaseStore, CaseStoreError, required_number, validate_history_extension,
};

#[derive(Debug)]
struct Inner<C> {
    cases: HashMap<CaseId, C>,
    bookings: HashMap<BookingKey, CaseId>,
    numbers: HashMap<CaseNumber, CaseId>,
    archived: HashMap<CaseId, Vec<TransitionHistoryRecord>>,
}

impl<C> Default for Inner<C> {
    fn default() -> Self {
        Self {
            cases: HashMap::new(),
            bookings: HashMap::new(),
            numbers: HashMap::new(),
            archived: HashMap::new(),
        }
    }
}

impl<C: Case> Inner<C> {
    fn check_booking(&self, case: &C) -> Result<Option<BookingKey>, CaseStoreError> {
        let Some(key) = case.booking_key() else {
            return Ok(None);
        };
        match self.bookings.get(&key) {
            Some(holder) if *holder != case.id() => Err(CaseStoreError::BookingConflict(format!(
                "{} at {} is held by case {holder}",
                key.service, key.slot
            ))),
            _ => Ok(Some(key)),
        }
    }

    fn release_booking(&mut self, id: CaseId) {
        self.bookings.retain(|_, holder| *holder != id);
    }
}

/// In-memory case store.
///
/// Intended for tests/dev. One lock guards cases, bookings and numbers so
/// every write is atomic.
#[derive(Debug)]
pub struct InMemoryCaseStore<C> {
    inner: RwLock<Inner<C>>,
}

impl<C> InMemoryCaseStore<C> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> Default for InMemoryCaseStore<C> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

fn poisoned() -> CaseStoreError {
    CaseStoreError::Storage("lock poisoned".to_string())
}

impl<C: Case> CaseStore<C> for InMemoryCaseStore<C> {
    fn insert(&self, case: &C) -> Result<C, CaseStoreError> {
        let number = required_number(case)?.clone();
        let mut inner = self.inner.write().map_err(|_| poisoned())?;

        if inner.cases.contains_key(&case.id()) || inner.archived.contains_key(&case.id()) {
            return Err(CaseStoreError::Concurrency(format!("case {} already exists", case.id())));
        }
        if inner.numbers.contains_key(&number) {
            return Err(CaseStoreError::DuplicateCaseNumber(number.to_string()));
        }
        validate_history_extension(case.id(), &[], case.header().history())?;
        let booking = inner.check_booking(case)?;

        let mut stored = case.clone();
        stored.header_mut().set_version(1);

        if let Some(key) = booking {
            inner.bookings.insert(key, case.id());
        }
        inner.numbers.insert(number, case.id());
        inner.cases.insert(case.id(), stored.clone());
        Ok(stored)
    }

    fn load(&self, id: CaseId) -> Result<C, CaseStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner.cases.get(&id).cloned().ok_or(CaseStoreError::NotFound(id))
    }

    fn commit(&self, case: &C, expected: ExpectedVersion) -> Result<C, CaseStoreError> {
        let id = case.id();
        let mut inner = self.inner.write().map_err(|_| poisoned())?;

        let current = inner.cases.get(&id).ok_or(CaseStoreError::NotFound(id))?;
        let current_version = current.header().version();
        if !expected.matches(current_version) {
            return Err(CaseStoreError::Concurrency(format!(
                "expected {expected:?}, found {current_version}"
            )));
        }
        if current.header().case_number() != case.header().case_number() {
            return Err(CaseStoreError::Storage("case numbers are permanent".to_string()));
        }
        validate_history_extension(id, current.header().history(), case.header().history())?;
        let booking = inner.check_booking(case)?;

        let mut stored = case.clone();
        stored.header_mut().set_version(current_version + 1);

        inner.release_booking(id);
        if let Some(key) = booking {
            inner.bookings.insert(key, id);
        }
        inner.cases.insert(id, stored.clone());
        Ok(stored)
    }

    fn remove(&self, id: CaseId) -> Result<(), CaseStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let case = inner.cases.remove(&id).ok_or(CaseStoreError::NotFound(id))?;
        inner.release_booking(id);
        inner.archived.insert(id, case.header().history().to_vec());
        Ok(())
    }

    fn archived_history(&self, id: CaseId) -> Result<Vec<TransitionHistoryRecord>, CaseStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner.archived.get(&id).cloned().ok_or(CaseStoreError::NotFound(id))
    }

    fn occupied(&self, service: &str, date: NaiveDate) -> Result<BTreeSet<NaiveDateTime>, CaseStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .bookings
            .keys()
            .filter(|k| k.service == service && k.slot.date() == date)
            .map(|k| k.slot)
            .collect())
    }
}

/// Process-local case number sequence.
#[derive(Debug, Default)]
pub struct InMemoryCaseSequence {
    counters: Mutex<HashMap<(String, i32), u64>>,
}

impl InMemoryCaseSequence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaseNumberSequence for InMemoryCaseSequence {
    fn next_value(&self, prefix: &str, year: i32) -> Result<u64, CaseStoreError> {
        let mut counters = self.counters.lock().map_err(|_| poisoned())?;
        let counter = counters.entry((prefix.to_string(), year)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use consular_appointments::{Appointment, AppointmentState, AppointmentType};
    use consular_core::{CaseHeader, CitizenId, UserId};
    use consular_processes::GenericProcess;

    fn numbered<C: Case>(mut case: C, seq: u64) -> C {
        let number = case.format_number(seq);
        case.header_mut().assign_number(number).unwrap();
        let record = TransitionHistoryRecord::new(
            case.id(),
            None,
            case.state().to_string(),
            None,
            UserId::new(),
            Utc::now(),
        );
        case.header_mut().record(record).unwrap();
        case
    }

    fn process(seq: u64) -> GenericProcess {
        numbered(
            GenericProcess::new(CaseId::new(), CitizenId::new(), "Attestation", "misc", Utc::now())
                .unwrap(),
            seq,
        )
    }

    fn appointment(seq: u64, at: NaiveDateTime) -> Appointment {
        numbered(
            Appointment::new(
                CaseId::new(),
                CitizenId::new(),
                AppointmentType::VisaInterview,
                at,
                30,
                "Window 1",
                Utc::now(),
            )
            .unwrap(),
            seq,
        )
    }

    fn slot() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 11, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn insert_assigns_version_and_load_returns_copy() {
        let store = InMemoryCaseStore::new();
        let case = process(1);
        let stored = store.insert(&case).unwrap();
        assert_eq!(stored.header().version(), 1);
        assert_eq!(store.load(case.id()).unwrap(), stored);
    }

    #[test]
    fn stale_commit_is_rejected() {
        let store = InMemoryCaseStore::new();
        let stored = store.insert(&process(1)).unwrap();

        store.commit(&stored, ExpectedVersion::Exact(1)).unwrap();
        let err = store.commit(&stored, ExpectedVersion::Exact(1)).unwrap_err();
        assert!(matches!(err, CaseStoreError::Concurrency(_)));
    }

    #[test]
    fn duplicate_numbers_are_rejected() {
        let store = InMemoryCaseStore::new();
        store.insert(&process(7)).unwrap();
        let err = store.insert(&process(7)).unwrap_err();
        assert!(matches!(err, CaseStoreError::DuplicateCaseNumber(_)));
    }

    #[test]
    fn commit_rejects_history_rewrite() {
        let store = InMemoryCaseStore::new();
        let stored = store.insert(&process(1)).unwrap();

        let mut rewritten = stored.clone();
        let original = stored.header();
        let mut blank =
            CaseHeader::new(original.id(), original.citizen_id(), None, original.created_at());
        blank
            .assign_number(original.case_number().unwrap().clone())
            .unwrap();
        *rewritten.header_mut() = blank;

        let err = store.commit(&rewritten, ExpectedVersion::Exact(1)).unwrap_err();
        assert!(matches!(err, CaseStoreError::InvalidHistory(_)));
    }

    #[test]
    fn active_bookings_are_unique_until_released() {
        let store = InMemoryCaseStore::new();
        let first = store.insert(&appointment(1, slot())).unwrap();

        let err = store.insert(&appointment(2, slot())).unwrap_err();
        assert!(matches!(err, CaseStoreError::BookingConflict(_)));
        assert_eq!(
            store.occupied("visa_interview", slot().date()).unwrap(),
            BTreeSet::from([slot()])
        );

        let mut cancelled = first.clone();
        cancelled.set_state(AppointmentState::Cancelled);
        store.commit(&cancelled, ExpectedVersion::Exact(1)).unwrap();

        assert!(store.occupied("visa_interview", slot().date()).unwrap().is_empty());
        store.insert(&appointment(2, slot())).unwrap();
    }

    #[test]
    fn remove_archives_history() {
        let store = InMemoryCaseStore::new();
        let stored = store.insert(&appointment(1, slot())).unwrap();
        store.remove(stored.id()).unwrap();

        assert!(matches!(store.load(stored.id()), Err(CaseStoreError::NotFound(_))));
        assert_eq!(store.archived_history(stored.id()).unwrap().len(), 1);
        assert!(store.occupied("visa_interview", slot().date()).unwrap().is_empty());
    }

    #[test]
    fn sequence_is_scoped_per_prefix_and_year() {
        let seq = InMemoryCaseSequence::new();
        assert_eq!(seq.next_value("VIS", 2026).unwrap(), 1);
        assert_eq!(seq.next_value("VIS", 2026).unwrap(), 2);
        assert_eq!(seq.next_value("REG", 2026).unwrap(), 1);
        assert_eq!(seq.next_value("VIS", 2027).unwrap(), 1);
    }
}
