use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

use consular_core::{Case, CaseId, CaseNumber, ExpectedVersion, TransitionHistoryRecord};

/// Case store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, uniqueness) as
/// opposed to domain errors (illegal transitions, validation).
#[derive(Debug, Error)]
pub enum CaseStoreError {
    #[error("case not found: {0}")]
    NotFound(CaseId),

    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Another active appointment holds the same (service, slot) pair.
    #[error("booking conflict: {0}")]
    BookingConflict(String),

    #[error("duplicate case number: {0}")]
    DuplicateCaseNumber(String),

    /// The new history does not extend the stored one (rewrite, reorder, or
    /// non-increasing timestamps).
    #[error("invalid history: {0}")]
    InvalidHistory(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistent store for cases of one workflow type.
///
/// ## Write semantics
///
/// `insert()` and `commit()` are atomic: the case row, its new history
/// records, and its booking (if any) are written together or not at all.
/// Implementations must:
/// - assign versions (`1` on insert, `stored + 1` on commit)
/// - reject a commit whose expected version does not match (`Concurrency`)
/// - accept history only as a prepend-only extension with strictly
///   increasing timestamps (`InvalidHistory`)
/// - keep at most one active case per [`BookingKey`](consular_core::BookingKey)
///   (`BookingConflict`); this is the backstop behind the allocator's
///   check-then-act conflict check
/// - keep case numbers unique (`DuplicateCaseNumber`)
///
/// ## Deletion
///
/// `remove()` is a soft delete: the case disappears from `load()` and from
/// booking queries, while its history stays readable via `archived_history()`.
pub trait CaseStore<C: Case>: Send + Sync {
    /// Persist a new case. Returns the stored copy (version 1).
    fn insert(&self, case: &C) -> Result<C, CaseStoreError>;

    fn load(&self, id: CaseId) -> Result<C, CaseStoreError>;

    /// Replace a case if its stored version matches `expected`.
    fn commit(&self, case: &C, expected: ExpectedVersion) -> Result<C, CaseStoreError>;

    fn remove(&self, id: CaseId) -> Result<(), CaseStoreError>;

    /// History of a removed case, newest first.
    fn archived_history(&self, id: CaseId) -> Result<Vec<TransitionHistoryRecord>, CaseStoreError>;

    /// Start times on `date` held by active bookings of `service`.
    fn occupied(&self, service: &str, date: NaiveDate) -> Result<BTreeSet<NaiveDateTime>, CaseStoreError>;
}

impl<C, S> CaseStore<C> for Arc<S>
where
    C: Case,
    S: CaseStore<C> + ?Sized,
{
    fn insert(&self, case: &C) -> Result<C, CaseStoreError> {
        (**self).insert(case)
    }

    fn load(&self, id: CaseId) -> Result<C, CaseStoreError> {
        (**self).load(id)
    }

    fn commit(&self, case: &C, expected: ExpectedVersion) -> Result<C, CaseStoreError> {
        (**self).commit(case, expected)
    }

    fn remove(&self, id: CaseId) -> Result<(), CaseStoreError> {
        (**self).remove(id)
    }

    fn archived_history(&self, id: CaseId) -> Result<Vec<TransitionHistoryRecord>, CaseStoreError> {
        (**self).archived_history(id)
    }

    fn occupied(&self, service: &str, date: NaiveDate) -> Result<BTreeSet<NaiveDateTime>, CaseStoreError> {
        (**self).occupied(service, date)
    }
}

/// Allocates per-(prefix, year) case number sequence values.
pub trait CaseNumberSequence: Send + Sync {
    /// Next value, starting at 1 for every new (prefix, year).
    fn next_value(&self, prefix: &str, year: i32) -> Result<u64, CaseStoreError>;
}

impl<Q> CaseNumberSequence for Arc<Q>
where
    Q: CaseNumberSequence + ?Sized,
{
    fn next_value(&self, prefix: &str, year: i32) -> Result<u64, CaseStoreError> {
        (**self).next_value(prefix, year)
    }
}

/// Check that `new` is `old` with zero or more records prepended, all
/// belonging to `case_id`, with strictly increasing timestamps.
pub(crate) fn validate_history_extension(
    case_id: CaseId,
    old: &[TransitionHistoryRecord],
    new: &[TransitionHistoryRecord],
) -> Result<(), CaseStoreError> {
    if new.len() < old.len() {
        return Err(CaseStoreError::InvalidHistory(format!(
            "history shrank from {} to {} records",
            old.len(),
            new.len()
        )));
    }
    let added = new.len() - old.len();
    if new[added..] != *old {
        return Err(CaseStoreError::InvalidHistory(
            "existing history records were modified".to_string(),
        ));
    }
    if let Some(foreign) = new[..added].iter().find(|r| r.case_id != case_id) {
        return Err(CaseStoreError::InvalidHistory(format!(
            "record {} belongs to case {}",
            foreign.id, foreign.case_id
        )));
    }
    // Newest first: timestamps must strictly decrease along the slice.
    if new.windows(2).any(|w| w[0].timestamp <= w[1].timestamp) {
        return Err(CaseStoreError::InvalidHistory(
            "history timestamps are not strictly increasing".to_string(),
        ));
    }
    Ok(())
}

/// Case number of a case that must have one before it is stored.
pub(crate) fn required_number<C: Case>(case: &C) -> Result<&CaseNumber, CaseStoreError> {
    case.header().case_number().ok_or_else(|| {
        CaseStoreError::Storage(format!("case {} has no case number", case.id()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use consular_core::UserId;

    fn rec(case_id: CaseId, state: &str, offset_ms: i64) -> TransitionHistoryRecord {
        TransitionHistoryRecord::new(
            case_id,
            None,
            state,
            None,
            UserId::new(),
            Utc::now() + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn prepending_is_accepted() {
        let id = CaseId::new();
        let base = rec(id, "DRAFT", 0);
        let old = vec![base.clone()];
        let new = vec![rec(id, "SUBMITTED", 10), base];
        assert!(validate_history_extension(id, &old, &new).is_ok());
        assert!(validate_history_extension(id, &old, &old).is_ok());
    }

    #[test]
    fn rewriting_or_truncating_is_rejected() {
        let id = CaseId::new();
        let a = rec(id, "DRAFT", 0);
        let b = rec(id, "SUBMITTED", 10);
        let old = vec![b.clone(), a.clone()];

        assert!(validate_history_extension(id, &old, &[b.clone()]).is_err());

        let mut edited = b.clone();
        edited.comment = Some("edited".to_string());
        assert!(validate_history_extension(id, &old, &[edited, a.clone()]).is_err());

        // Appending at the tail instead of prepending.
        let older = rec(id, "DRAFT", -10);
        assert!(validate_history_extension(id, &old, &[b, a, older]).is_err());
    }

    #[test]
    fn non_increasing_timestamps_are_rejected() {
        let id = CaseId::new();
        let a = rec(id, "DRAFT", 0);
        let mut same_time = rec(id, "SUBMITTED", 0);
        same_time.timestamp = a.timestamp;
        let err = validate_history_extension(id, &[a.clone()], &[same_time, a]).unwrap_err();
        assert!(matches!(err, CaseStoreError::InvalidHistory(_)));
    }

    #[test]
    fn foreign_records_are_rejected() {
        let id = CaseId::new();
        let a = rec(id, "DRAFT", 0);
        let foreign = rec(CaseId::new(), "SUBMITTED", 10);
        assert!(validate_history_extension(id, &[a.clone()], &[foreign, a]).is_err());
    }
}
