//! Turns one transition event into (at most) one outbound message.
//!
//! Nothing here can fail the transition that produced the event: every
//! problem ends up as a [`DispatchOutcome`], a log entry and a tracing record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use consular_core::NotificationId;
use consular_events::{Event, TransitionEvent};

use crate::external::{OutboundChannel, OutboundMessage};

use super::directory::{CaseLookup, CaseSummary, CitizenDirectory};
use super::log::{NotificationLog, NotificationLogEntry};
use super::preferences::PreferenceStore;
use super::templates::TemplateCatalog;

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The new state is not notification-worthy.
    NoTemplate,
    /// The event carries no case context and the case could not be read
    /// (deleted, or no store registered).
    CaseUnavailable,
    NoContactAddress,
    OptedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Sent(NotificationId),
    /// `id` is absent when not even the pending log entry could be written.
    Failed {
        id: Option<NotificationId>,
        error: String,
    },
}

pub struct NotificationDispatcher {
    templates: TemplateCatalog,
    cases: CaseLookup,
    citizens: Arc<dyn CitizenDirectory>,
    preferences: Arc<dyn PreferenceStore>,
    log: Arc<dyn NotificationLog>,
    channel: Arc<dyn OutboundChannel>,
    delivery_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        templates: TemplateCatalog,
        cases: CaseLookup,
        citizens: Arc<dyn CitizenDirectory>,
        preferences: Arc<dyn PreferenceStore>,
        log: Arc<dyn NotificationLog>,
        channel: Arc<dyn OutboundChannel>,
    ) -> Self {
        Self {
            templates,
            cases,
            citizens,
            preferences,
            log,
            channel,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    pub fn log(&self) -> &Arc<dyn NotificationLog> {
        &self.log
    }

    pub fn handle(&self, event: &TransitionEvent) -> DispatchOutcome {
        let Some(template) = self.templates.resolve(&event.workflow, &event.new_state) else {
            return DispatchOutcome::Skipped(SkipReason::NoTemplate);
        };

        let summary = match self.summary(event) {
            Ok(summary) => summary,
            Err(skip) => return DispatchOutcome::Skipped(skip),
        };

        let Some(address) = self.citizens.contact_address(summary.citizen_id) else {
            warn!(
                case_id = %event.case_id,
                citizen_id = %summary.citizen_id,
                "citizen has no contact address"
            );
            return DispatchOutcome::Skipped(SkipReason::NoContactAddress);
        };

        if !self.preferences.is_enabled(summary.citizen_id, &event.workflow) {
            debug!(
                workflow = %event.workflow,
                case_id = %event.case_id,
                template = %template.template_id,
                "citizen opted out"
            );
            return DispatchOutcome::Skipped(SkipReason::OptedOut);
        }

        let mut entry = NotificationLogEntry::pending(
            address.clone(),
            template.template_id.clone(),
            event.workflow.clone(),
            event.case_id,
            Utc::now(),
        );
        if let Err(err) = self.log.append(&entry) {
            warn!(case_id = %event.case_id, error = %err, "failed to write notification log");
            return DispatchOutcome::Failed {
                id: None,
                error: err.to_string(),
            };
        }

        let message = OutboundMessage {
            address,
            subject: template.subject.clone(),
            template_id: template.template_id.clone(),
            variables: summary.variables,
        };

        let outcome = match self.channel.send(&message, self.delivery_timeout) {
            Ok(()) => {
                entry.mark_sent(Utc::now());
                info!(
                    workflow = %event.workflow,
                    case_id = %event.case_id,
                    event_type = event.event_type(),
                    template = %template.template_id,
                    lag_ms = (Utc::now() - event.occurred_at()).num_milliseconds(),
                    "notification sent"
                );
                DispatchOutcome::Sent(entry.id)
            }
            Err(err) => {
                entry.mark_failed(err.to_string());
                warn!(
                    workflow = %event.workflow,
                    case_id = %event.case_id,
                    event_type = event.event_type(),
                    template = %template.template_id,
                    error = %err,
                    "notification delivery failed"
                );
                DispatchOutcome::Failed {
                    id: Some(entry.id),
                    error: err.to_string(),
                }
            }
        };

        if let Err(err) = self.log.update(&entry) {
            warn!(notification_id = %entry.id, error = %err, "failed to record delivery outcome");
        }
        outcome
    }

    /// Case owner and template variables: taken from the event when it
    /// carries them (so deleted cases are still notified), read from the
    /// case store otherwise.
    fn summary(&self, event: &TransitionEvent) -> Result<CaseSummary, SkipReason> {
        if let Some(citizen_id) = event.citizen_id {
            return Ok(CaseSummary {
                citizen_id,
                variables: event.variables.clone(),
            });
        }
        match self.cases.summary(&event.workflow, event.case_id) {
            Some(Ok(summary)) => Ok(summary),
            Some(Err(err)) => {
                warn!(
                    workflow = %event.workflow,
                    case_id = %event.case_id,
                    error = %err,
                    "case unavailable, notification skipped"
                );
                Err(SkipReason::CaseUnavailable)
            }
            None => {
                warn!(workflow = %event.workflow, "no case store registered for workflow");
                Err(SkipReason::CaseUnavailable)
            }
        }
    }
}

impl core::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("templates", &self.templates.len())
            .field("cases", &self.cases)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish_non_exhaustive()
    }
}
