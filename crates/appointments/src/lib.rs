//! Consular appointments: the booking workflow and the slot allocator.

pub mod appointment;
pub mod slots;

pub use appointment::{Appointment, AppointmentState, AppointmentType, appointment_graph};
pub use slots::{
    SchedulingRule, SchedulingRuleSpec, Slot, SlotAllocator, TimeBlock, TimeBlockSpec,
};
