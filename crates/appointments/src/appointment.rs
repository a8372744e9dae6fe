use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use consular_core::{
    BookingKey, Case, CaseHeader, CaseId, CitizenId, DomainError, DomainResult,
    TransitionContext, TransitionEngine,
};

consular_core::workflow_state! {
    /// Appointment lifecycle.
    pub enum AppointmentState {
        Pending => "PENDING",
        Confirmed => "CONFIRMED",
        Rescheduled => "RESCHEDULED",
        Cancelled => "CANCELLED",
        Completed => "COMPLETED",
        NoShow => "NO_SHOW",
    }
}

impl AppointmentState {
    /// Active appointments occupy their slot and block re-booking.
    pub fn is_active(self) -> bool {
        matches!(self, AppointmentState::Pending | AppointmentState::Confirmed)
    }
}

pub fn appointment_graph() -> &'static TransitionEngine<AppointmentState> {
    static GRAPH: OnceLock<TransitionEngine<AppointmentState>> = OnceLock::new();
    GRAPH.get_or_init(|| {
        use AppointmentState::*;
        TransitionEngine::builder(Appointment::WORKFLOW, Pending)
            .edges(Pending, [Confirmed, Cancelled])
            .edges(Confirmed, [Rescheduled, Cancelled, Completed, NoShow])
            .edges(Rescheduled, [Confirmed, Cancelled])
            .terminal([Cancelled, Completed, NoShow])
            .build()
    })
}

/// Consular service an appointment is booked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    VisaInterview,
    PassportService,
    CivilRegistry,
    NotarialAct,
    Consultation,
}

impl AppointmentType {
    pub const ALL: [AppointmentType; 5] = [
        AppointmentType::VisaInterview,
        AppointmentType::PassportService,
        AppointmentType::CivilRegistry,
        AppointmentType::NotarialAct,
        AppointmentType::Consultation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentType::VisaInterview => "visa_interview",
            AppointmentType::PassportService => "passport_service",
            AppointmentType::CivilRegistry => "civil_registry",
            AppointmentType::NotarialAct => "notarial_act",
            AppointmentType::Consultation => "consultation",
        }
    }
}

impl core::fmt::Display for AppointmentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppointmentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown appointment type: {s}")))
    }
}

/// Case: appointment at the consulate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    header: CaseHeader,
    state: AppointmentState,
    appointment_type: AppointmentType,
    scheduled_at: NaiveDateTime,
    duration_minutes: u32,
    location: String,
    confirmed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    /// Slot held before the latest reschedule.
    previous_slot: Option<NaiveDateTime>,
    cancellation_reason: Option<String>,
}

impl Appointment {
    pub fn new(
        id: CaseId,
        citizen_id: CitizenId,
        appointment_type: AppointmentType,
        scheduled_at: NaiveDateTime,
        duration_minutes: u32,
        location: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if duration_minutes == 0 {
            return Err(DomainError::validation("duration_minutes must be positive"));
        }
        let location = location.into();
        if location.trim().is_empty() {
            return Err(DomainError::validation("location cannot be empty"));
        }

        Ok(Self {
            header: CaseHeader::new(id, citizen_id, None, now),
            state: appointment_graph().initial(),
            appointment_type,
            scheduled_at,
            duration_minutes,
            location,
            confirmed_at: None,
            completed_at: None,
            previous_slot: None,
            cancellation_reason: None,
        })
    }

    pub fn appointment_type(&self) -> AppointmentType {
        self.appointment_type
    }

    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.scheduled_at
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.confirmed_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn previous_slot(&self) -> Option<NaiveDateTime> {
        self.previous_slot
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    /// Move the appointment to a new time. Only meaningful while entering
    /// `RESCHEDULED`; callers validate the slot first.
    pub fn move_to(&mut self, scheduled_at: NaiveDateTime) {
        self.previous_slot = Some(self.scheduled_at);
        self.scheduled_at = scheduled_at;
    }
}

impl Case for Appointment {
    type State = AppointmentState;

    const WORKFLOW: &'static str = "appointment";
    const NUMBER_PREFIX: &'static str = "APT";

    fn graph() -> &'static TransitionEngine<AppointmentState> {
        appointment_graph()
    }

    fn cancellation_state() -> AppointmentState {
        AppointmentState::Cancelled
    }

    fn header(&self) -> &CaseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut CaseHeader {
        &mut self.header
    }

    fn state(&self) -> AppointmentState {
        self.state
    }

    fn set_state(&mut self, state: AppointmentState) {
        self.state = state;
    }

    fn apply_effects(&mut self, target: AppointmentState, ctx: &TransitionContext) {
        match target {
            AppointmentState::Confirmed => self.confirmed_at = Some(ctx.at),
            AppointmentState::Completed => self.completed_at = Some(ctx.at),
            AppointmentState::Cancelled => self.cancellation_reason = ctx.comment.clone(),
            AppointmentState::Pending | AppointmentState::Rescheduled | AppointmentState::NoShow => {}
        }
    }

    fn booking_key(&self) -> Option<BookingKey> {
        self.state.is_active().then(|| BookingKey {
            service: self.appointment_type.as_str().to_string(),
            slot: self.scheduled_at,
        })
    }

    fn display_type(&self) -> String {
        self.appointment_type.as_str().replace('_', " ")
    }

    fn extra_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "date_time".to_string(),
                self.scheduled_at.format("%Y-%m-%d %H:%M").to_string(),
            ),
            ("location".to_string(), self.location.clone()),
        ])
    }
}
