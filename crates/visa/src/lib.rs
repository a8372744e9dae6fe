//! Visa applications (pure domain: state graph, case record, derived effects).

pub mod application;

pub use application::{VisaApplication, VisaCategory, VisaState, visa_graph};
