//! Notarial acts: powers of attorney, signature recognition, certified copies.

pub mod service;

pub use service::{NotarialKind, NotarialService, NotarialState, notarial_graph};
