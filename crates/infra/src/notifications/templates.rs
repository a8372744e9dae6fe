//! Which transitions are notification-worthy, and with which template.

use std::collections::HashMap;

use consular_appointments::{Appointment, AppointmentState};
use consular_civil_registry::{CivilRegistration, RegistrationState};
use consular_core::{Case, WorkflowState};
use consular_notarial::{NotarialService, NotarialState};
use consular_processes::{GenericProcess, ProcessState};
use consular_visa::{VisaApplication, VisaState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTemplate {
    pub template_id: String,
    pub subject: String,
}

/// Static `(workflow, state) -> template` mapping.
///
/// States without an entry produce no notification.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    entries: HashMap<String, HashMap<String, NotificationTemplate>>,
}

impl TemplateCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog covering every case type.
    pub fn standard() -> Self {
        Self::empty()
            .with_template::<VisaApplication>(VisaState::Submitted, "visa.submitted", "Visa application received")
            .with_template::<VisaApplication>(VisaState::DocsPending, "visa.docs_pending", "Additional documents required")
            .with_template::<VisaApplication>(VisaState::Approved, "visa.approved", "Visa application approved")
            .with_template::<VisaApplication>(VisaState::Rejected, "visa.rejected", "Visa application rejected")
            .with_template::<VisaApplication>(VisaState::Issued, "visa.issued", "Your visa has been issued")
            .with_template::<CivilRegistration>(RegistrationState::Submitted, "civil.submitted", "Registration request received")
            .with_template::<CivilRegistration>(RegistrationState::Rejected, "civil.rejected", "Registration request rejected")
            .with_template::<CivilRegistration>(RegistrationState::CertificateIssued, "civil.certificate_issued", "Your certificate is ready")
            .with_template::<NotarialService>(NotarialState::Concluded, "notarial.concluded", "Notarial act concluded")
            .with_template::<NotarialService>(NotarialState::Rejected, "notarial.rejected", "Notarial request rejected")
            .with_template::<GenericProcess>(ProcessState::Approved, "process.approved", "Request approved")
            .with_template::<GenericProcess>(ProcessState::Rejected, "process.rejected", "Request returned for changes")
            .with_template::<GenericProcess>(ProcessState::Concluded, "process.concluded", "Request concluded")
            .with_template::<Appointment>(AppointmentState::Pending, "appointment.booked", "Appointment booked")
            .with_template::<Appointment>(AppointmentState::Confirmed, "appointment.confirmed", "Appointment confirmed")
            .with_template::<Appointment>(AppointmentState::Rescheduled, "appointment.rescheduled", "Appointment rescheduled")
            .with_template::<Appointment>(AppointmentState::Cancelled, "appointment.cancelled", "Appointment cancelled")
    }

    pub fn with_template<C: Case>(
        mut self,
        state: C::State,
        template_id: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        self.entries
            .entry(C::WORKFLOW.to_string())
            .or_default()
            .insert(
                state.as_str().to_string(),
                NotificationTemplate {
                    template_id: template_id.into(),
                    subject: subject.into(),
                },
            );
        self
    }

    pub fn resolve(&self, workflow: &str, state: &str) -> Option<&NotificationTemplate> {
        self.entries.get(workflow)?.get(state)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_resolves_by_wire_names() {
        let catalog = TemplateCatalog::standard();
        let t = catalog.resolve("visa", "ISSUED").unwrap();
        assert_eq!(t.template_id, "visa.issued");
        assert_eq!(
            catalog.resolve("appointment", "PENDING").unwrap().template_id,
            "appointment.booked"
        );
    }

    #[test]
    fn unmapped_states_resolve_to_nothing() {
        let catalog = TemplateCatalog::standard();
        assert!(catalog.resolve("visa", "UNDER_REVIEW").is_none());
        assert!(catalog.resolve("visa", "DRAFT").is_none());
        assert!(catalog.resolve("passport", "ISSUED").is_none());
    }

    #[test]
    fn later_entries_replace_earlier_ones() {
        let catalog = TemplateCatalog::empty()
            .with_template::<GenericProcess>(ProcessState::Approved, "a", "first")
            .with_template::<GenericProcess>(ProcessState::Approved, "b", "second");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.resolve("process", "APPROVED").unwrap().template_id, "b");
    }
}
