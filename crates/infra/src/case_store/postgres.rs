//! Postgres-backed case store.
//!
//! All workflow types share one `cases` table with a `workflow` discriminator;
//! the case itself is stored as a JSONB payload next to the columns the store
//! needs to enforce its guarantees (state, version, case number, booking).
//! History records are mirrored into `case_history` so they survive soft
//! deletion.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL code / constraint | CaseStoreError |
//! |------------|------------------------------|----------------|
//! | unique violation | `23505` on `cases_active_booking_uq` | `BookingConflict` |
//! | unique violation | `23505` on `cases_case_number_key` | `DuplicateCaseNumber` |
//! | unique violation | `23505` (other) | `Concurrency` |
//! | other database / pool / io | any | `Storage` |
//!
//! ## Sync bridge
//!
//! [`CaseStore`] is synchronous. Calls are bridged onto the ambient tokio
//! runtime with `block_in_place`, so they must come from a multi-thread
//! runtime (or a plain thread that entered one).

use std::collections::BTreeSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, instrument};
use uuid::Uuid;

use consular_core::{Case, CaseId, ExpectedVersion, HistoryId, TransitionHistoryRecord, UserId};

use super::r#trait::{
    CaseNumberSequence, CaseStore, CaseStoreError, required_number, validate_history_extension,
};

const BOOKING_CONSTRAINT: &str = "cases_active_booking_uq";
const CASE_NUMBER_CONSTRAINT: &str = "cases_case_number_key";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cases (
        id              UUID PRIMARY KEY,
        workflow        TEXT NOT NULL,
        case_number     TEXT NOT NULL,
        citizen_id      UUID NOT NULL,
        state           TEXT NOT NULL,
        version         BIGINT NOT NULL CHECK (version > 0),
        payload         JSONB NOT NULL,
        booking_service TEXT,
        booking_slot    TIMESTAMP,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        deleted_at      TIMESTAMPTZ,
        CONSTRAINT cases_case_number_key UNIQUE (case_number)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS cases_active_booking_uq
        ON cases (booking_service, booking_slot)
        WHERE booking_service IS NOT NULL AND deleted_at IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS cases_workflow_state_idx ON cases (workflow, state)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_history (
        id             UUID PRIMARY KEY,
        case_id        UUID NOT NULL REFERENCES cases (id),
        previous_state TEXT,
        new_state      TEXT NOT NULL,
        comment        TEXT,
        actor          UUID NOT NULL,
        recorded_at    TIMESTAMPTZ NOT NULL,
        CONSTRAINT case_history_case_ts_key UNIQUE (case_id, recorded_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_number_sequences (
        prefix     TEXT NOT NULL,
        year       INT NOT NULL,
        last_value BIGINT NOT NULL,
        PRIMARY KEY (prefix, year)
    )
    "#,
];

/// Create the tables and indexes the Postgres store relies on (idempotent).
pub async fn ensure_schema(pool: &PgPool) -> Result<(), CaseStoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    Ok(())
}

/// Postgres-backed store for cases of one workflow type.
#[derive(Debug)]
pub struct PostgresCaseStore<C> {
    pool: Arc<PgPool>,
    _case: PhantomData<fn() -> C>,
}

impl<C> Clone for PostgresCaseStore<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _case: PhantomData,
        }
    }
}

impl<C: Case> PostgresCaseStore<C> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            _case: PhantomData,
        }
    }

    #[instrument(skip(self, case), fields(workflow = C::WORKFLOW, case_id = %case.id()), err)]
    pub async fn insert_case(&self, case: &C) -> Result<C, CaseStoreError> {
        let number = required_number(case)?.as_str().to_string();
        validate_history_extension(case.id(), &[], case.header().history())?;

        let mut stored = case.clone();
        stored.header_mut().set_version(1);
        let payload = to_payload(&stored)?;
        let booking = stored.booking_key();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO cases (
                id, workflow, case_number, citizen_id, state, version, payload,
                booking_service, booking_slot, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(stored.id().as_uuid())
        .bind(C::WORKFLOW)
        .bind(&number)
        .bind(stored.header().citizen_id().as_uuid())
        .bind(stored.state().to_string())
        .bind(&payload)
        .bind(booking.as_ref().map(|k| k.service.clone()))
        .bind(booking.as_ref().map(|k| k.slot))
        .bind(stored.header().created_at())
        .bind(stored.header().updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_case", e))?;

        insert_history(&mut tx, stored.header().history()).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(workflow = C::WORKFLOW), err)]
    pub async fn load_case(&self, id: CaseId) -> Result<C, CaseStoreError> {
        let row = sqlx::query(
            "SELECT payload FROM cases WHERE id = $1 AND workflow = $2 AND deleted_at IS NULL",
        )
        .bind(id.as_uuid())
        .bind(C::WORKFLOW)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_case", e))?
        .ok_or(CaseStoreError::NotFound(id))?;

        let payload: serde_json::Value = row
            .try_get("payload")
            .map_err(|e| map_sqlx_error("load_case", e))?;
        from_payload(payload)
    }

    #[instrument(
        skip(self, case),
        fields(workflow = C::WORKFLOW, case_id = %case.id(), expected = ?expected),
        err
    )]
    pub async fn commit_case(&self, case: &C, expected: ExpectedVersion) -> Result<C, CaseStoreError> {
        let id = case.id();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Row lock: concurrent commits on the same case serialize here.
        let row = sqlx::query(
            r#"
            SELECT version, payload FROM cases
            WHERE id = $1 AND workflow = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .bind(C::WORKFLOW)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_case", e))?
        .ok_or(CaseStoreError::NotFound(id))?;

        let current_version: i64 = row
            .try_get("version")
            .map_err(|e| map_sqlx_error("lock_case", e))?;
        let current_version = current_version as u64;
        if !expected.matches(current_version) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(CaseStoreError::Concurrency(format!(
                "expected {expected:?}, found {current_version}"
            )));
        }

        let current: C = from_payload(
            row.try_get("payload")
                .map_err(|e| map_sqlx_error("lock_case", e))?,
        )?;
        if current.header().case_number() != case.header().case_number() {
            return Err(CaseStoreError::Storage("case numbers are permanent".to_string()));
        }
        let old_history = current.header().history();
        let new_history = case.header().history();
        validate_history_extension(id, old_history, new_history)?;

        let mut stored = case.clone();
        stored.header_mut().set_version(current_version + 1);
        let payload = to_payload(&stored)?;
        let booking = stored.booking_key();

        sqlx::query(
            r#"
            UPDATE cases
            SET state = $2, version = $3, payload = $4,
                booking_service = $5, booking_slot = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(stored.state().to_string())
        .bind((current_version + 1) as i64)
        .bind(&payload)
        .bind(booking.as_ref().map(|k| k.service.clone()))
        .bind(booking.as_ref().map(|k| k.slot))
        .bind(stored.header().updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_case", e))?;

        let added = new_history.len() - old_history.len();
        insert_history(&mut tx, &new_history[..added]).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(version = current_version + 1, new_records = added, "case committed");
        Ok(stored)
    }

    pub async fn remove_case(&self, id: CaseId) -> Result<(), CaseStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET deleted_at = now(), booking_service = NULL, booking_slot = NULL
            WHERE id = $1 AND workflow = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(C::WORKFLOW)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_case", e))?;

        if result.rows_affected() == 0 {
            return Err(CaseStoreError::NotFound(id));
        }
        Ok(())
    }

    pub async fn load_archived_history(
        &self,
        id: CaseId,
    ) -> Result<Vec<TransitionHistoryRecord>, CaseStoreError> {
        let deleted = sqlx::query(
            "SELECT 1 FROM cases WHERE id = $1 AND workflow = $2 AND deleted_at IS NOT NULL",
        )
        .bind(id.as_uuid())
        .bind(C::WORKFLOW)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("archived_history", e))?;
        if deleted.is_none() {
            return Err(CaseStoreError::NotFound(id));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, case_id, previous_state, new_state, comment, actor, recorded_at
            FROM case_history
            WHERE case_id = $1
            ORDER BY recorded_at DESC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("archived_history", e))?;

        rows.iter()
            .map(history_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("archived_history", e))
    }

    pub async fn load_occupied(
        &self,
        service: &str,
        date: NaiveDate,
    ) -> Result<BTreeSet<NaiveDateTime>, CaseStoreError> {
        let day_start = date.and_time(chrono::NaiveTime::MIN);
        let day_end = day_start + chrono::Duration::days(1);

        let rows = sqlx::query(
            r#"
            SELECT booking_slot FROM cases
            WHERE booking_service = $1
              AND booking_slot >= $2 AND booking_slot < $3
              AND deleted_at IS NULL
            "#,
        )
        .bind(service)
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("occupied", e))?;

        rows.iter()
            .map(|r| r.try_get::<NaiveDateTime, _>("booking_slot"))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| map_sqlx_error("occupied", e))
    }
}

impl<C: Case> CaseStore<C> for PostgresCaseStore<C> {
    fn insert(&self, case: &C) -> Result<C, CaseStoreError> {
        block_on(self.insert_case(case))?
    }

    fn load(&self, id: CaseId) -> Result<C, CaseStoreError> {
        block_on(self.load_case(id))?
    }

    fn commit(&self, case: &C, expected: ExpectedVersion) -> Result<C, CaseStoreError> {
        block_on(self.commit_case(case, expected))?
    }

    fn remove(&self, id: CaseId) -> Result<(), CaseStoreError> {
        block_on(self.remove_case(id))?
    }

    fn archived_history(&self, id: CaseId) -> Result<Vec<TransitionHistoryRecord>, CaseStoreError> {
        block_on(self.load_archived_history(id))?
    }

    fn occupied(&self, service: &str, date: NaiveDate) -> Result<BTreeSet<NaiveDateTime>, CaseStoreError> {
        block_on(self.load_occupied(service, date))?
    }
}

/// Case number sequence backed by the `case_number_sequences` table.
///
/// Survives restarts and is shared by every instance pointing at the same
/// database.
#[derive(Debug, Clone)]
pub struct PostgresCaseSequence {
    pool: Arc<PgPool>,
}

impl PostgresCaseSequence {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn next(&self, prefix: &str, year: i32) -> Result<u64, CaseStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO case_number_sequences (prefix, year, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (prefix, year)
            DO UPDATE SET last_value = case_number_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(prefix)
        .bind(year)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("next_sequence", e))?;

        let value: i64 = row
            .try_get("last_value")
            .map_err(|e| map_sqlx_error("next_sequence", e))?;
        Ok(value as u64)
    }
}

impl CaseNumberSequence for PostgresCaseSequence {
    fn next_value(&self, prefix: &str, year: i32) -> Result<u64, CaseStoreError> {
        block_on(self.next(prefix, year))?
    }
}

/// Run a store future to completion from synchronous code.
fn block_on<F: Future>(future: F) -> Result<F::Output, CaseStoreError> {
    let handle = Handle::try_current().map_err(|_| {
        CaseStoreError::Storage(
            "Postgres store requires a tokio runtime; call it from within one".to_string(),
        )
    })?;
    match handle.runtime_flavor() {
        RuntimeFlavor::CurrentThread => Err(CaseStoreError::Storage(
            "Postgres store requires a multi-thread tokio runtime".to_string(),
        )),
        _ => Ok(tokio::task::block_in_place(|| handle.block_on(future))),
    }
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    records: &[TransitionHistoryRecord],
) -> Result<(), CaseStoreError> {
    // Oldest first so `recorded_at` grows with insertion order.
    for record in records.iter().rev() {
        sqlx::query(
            r#"
            INSERT INTO case_history (
                id, case_id, previous_state, new_state, comment, actor, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.case_id.as_uuid())
        .bind(record.previous_state.as_deref())
        .bind(&record.new_state)
        .bind(record.comment.as_deref())
        .bind(record.actor.as_uuid())
        .bind(record.timestamp)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_history", e))?;
    }
    Ok(())
}

fn history_from_row(row: &sqlx::postgres::PgRow) -> Result<TransitionHistoryRecord, sqlx::Error> {
    Ok(TransitionHistoryRecord {
        id: HistoryId::from_uuid(row.try_get::<Uuid, _>("id")?),
        case_id: CaseId::from_uuid(row.try_get::<Uuid, _>("case_id")?),
        previous_state: row.try_get("previous_state")?,
        new_state: row.try_get("new_state")?,
        comment: row.try_get("comment")?,
        actor: UserId::from_uuid(row.try_get::<Uuid, _>("actor")?),
        timestamp: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
    })
}

fn to_payload<C: Case>(case: &C) -> Result<serde_json::Value, CaseStoreError> {
    serde_json::to_value(case).map_err(|e| CaseStoreError::Serialization(e.to_string()))
}

fn from_payload<C: Case>(payload: serde_json::Value) -> Result<C, CaseStoreError> {
    serde_json::from_value(payload).map_err(|e| CaseStoreError::Serialization(e.to_string()))
}

/// Map SQLx errors to `CaseStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CaseStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match (db_err.code().as_deref(), db_err.constraint()) {
                (Some("23505"), Some(BOOKING_CONSTRAINT)) => CaseStoreError::BookingConflict(msg),
                (Some("23505"), Some(CASE_NUMBER_CONSTRAINT)) => {
                    CaseStoreError::DuplicateCaseNumber(msg)
                }
                (Some("23505"), _) => CaseStoreError::Concurrency(msg),
                _ => CaseStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            CaseStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => CaseStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
