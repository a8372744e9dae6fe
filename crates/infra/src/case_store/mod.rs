//! Case persistence boundary.
//!
//! A [`CaseStore`] persists the cases of one workflow type together with
//! their history and bookings. The in-memory store backs tests and local
//! runs; the Postgres store is the durable backend.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryCaseSequence, InMemoryCaseStore};
pub use postgres::{PostgresCaseSequence, PostgresCaseStore, ensure_schema};
pub use r#trait::{CaseNumberSequence, CaseStore, CaseStoreError};
