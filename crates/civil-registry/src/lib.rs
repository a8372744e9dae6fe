//! Civil-registry registrations: births, marriages and deaths recorded abroad.

pub mod registration;

pub use registration::{
    CivilRegistration, RegistrationKind, RegistrationState, registration_graph,
};
