//! Appointment booking: slot allocation in front of the appointment
//! orchestrator.
//!
//! The allocator check here is check-then-act. The store's unique active
//! booking constraint is what finally decides a race between two bookings of
//! the same slot; the loser gets `ConflictingAppointment` either way.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use tracing::info;

use consular_appointments::{Appointment, AppointmentState, AppointmentType, Slot, SlotAllocator};
use consular_core::{Case, CaseId, CitizenId, UserId};
use consular_events::{EventBus, TransitionEvent};

use crate::case_store::CaseStore;
use crate::orchestrator::{OrchestratorError, TransitionOrchestrator, TransitionOutcome};

pub struct AppointmentBooking<S, B> {
    orchestrator: TransitionOrchestrator<Appointment, S, B>,
    allocator: SlotAllocator,
}

impl<S, B> AppointmentBooking<S, B>
where
    S: CaseStore<Appointment>,
    B: EventBus<TransitionEvent>,
{
    pub fn new(orchestrator: TransitionOrchestrator<Appointment, S, B>, allocator: SlotAllocator) -> Self {
        Self {
            orchestrator,
            allocator,
        }
    }

    pub fn orchestrator(&self) -> &TransitionOrchestrator<Appointment, S, B> {
        &self.orchestrator
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    /// Free slots of `appointment_type` on `date`.
    pub fn available_slots(
        &self,
        date: NaiveDate,
        appointment_type: AppointmentType,
    ) -> Result<Vec<Slot>, OrchestratorError> {
        let occupied = self.occupied(appointment_type, date)?;
        Ok(self.allocator.available_slots(date, appointment_type, &occupied))
    }

    /// Book a new appointment in `PENDING`.
    pub fn book(
        &self,
        citizen_id: CitizenId,
        appointment_type: AppointmentType,
        date_time: NaiveDateTime,
        location: &str,
        actor: UserId,
    ) -> Result<Appointment, OrchestratorError> {
        let occupied = self.occupied(appointment_type, date_time.date())?;
        self.allocator
            .validate_booking(date_time, appointment_type, &occupied)?;
        let duration = self.allocator.duration(appointment_type)?;

        let appointment = Appointment::new(
            CaseId::new(),
            citizen_id,
            appointment_type,
            date_time,
            duration,
            location,
            Utc::now(),
        )?;
        let booked = self.orchestrator.create(appointment, actor)?;
        info!(
            case_id = %booked.id(),
            service = appointment_type.as_str(),
            slot = %date_time,
            "appointment booked"
        );
        Ok(booked)
    }

    /// Move a confirmed appointment to a new slot (`RESCHEDULED`). The new
    /// slot must differ from the current one.
    ///
    /// The new slot is validated now and checked again on confirmation,
    /// since a rescheduled appointment does not hold a slot until then.
    pub fn reschedule(
        &self,
        id: CaseId,
        new_time: NaiveDateTime,
        actor: UserId,
        comment: Option<String>,
    ) -> Result<TransitionOutcome<Appointment>, OrchestratorError> {
        let current = self.orchestrator.get(id)?;
        if new_time == current.scheduled_at() {
            return Err(OrchestratorError::Validation(format!(
                "appointment {id} is already scheduled at {}",
                new_time.format("%Y-%m-%d %H:%M")
            )));
        }
        let appointment_type = current.appointment_type();
        let occupied = self.occupied(appointment_type, new_time.date())?;
        self.allocator
            .validate_booking(new_time, appointment_type, &occupied)?;

        self.orchestrator.apply_transition_with(
            id,
            AppointmentState::Rescheduled,
            actor,
            comment,
            |appointment| {
                appointment.move_to(new_time);
                Ok(())
            },
        )
    }

    /// Confirm a pending or rescheduled appointment.
    pub fn confirm(&self, id: CaseId, actor: UserId) -> Result<TransitionOutcome<Appointment>, OrchestratorError> {
        let current = self.orchestrator.get(id)?;
        if current.state() == AppointmentState::Rescheduled {
            let occupied = self.occupied(current.appointment_type(), current.scheduled_at().date())?;
            self.allocator.check_conflict(
                current.scheduled_at(),
                current.appointment_type(),
                &occupied,
            )?;
        }
        self.orchestrator
            .apply_transition(id, AppointmentState::Confirmed, actor, None)
    }

    pub fn cancel(
        &self,
        id: CaseId,
        actor: UserId,
        reason: Option<String>,
    ) -> Result<TransitionOutcome<Appointment>, OrchestratorError> {
        self.orchestrator
            .apply_transition(id, AppointmentState::Cancelled, actor, reason)
    }

    fn occupied(
        &self,
        appointment_type: AppointmentType,
        date: NaiveDate,
    ) -> Result<std::collections::BTreeSet<NaiveDateTime>, OrchestratorError> {
        Ok(self
            .orchestrator
            .store()
            .occupied(appointment_type.as_str(), date)?)
    }
}
