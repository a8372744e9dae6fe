//! Slot allocation and conflict detection.
//!
//! Bookable slots are derived from a per-service [`SchedulingRule`]: permitted
//! weekdays, non-overlapping time blocks and a fixed slot length. The
//! allocator is pure; callers pass in the start times already held by active
//! appointments of the same service on the requested date.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use consular_core::{DomainError, DomainResult};

use crate::appointment::AppointmentType;

/// `[start, end)` window inside a working day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBlock {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeBlock {
    pub fn new(start: NaiveTime, end: NaiveTime) -> DomainResult<Self> {
        if start >= end {
            return Err(DomainError::validation(format!(
                "time block start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    fn overlaps(&self, other: &TimeBlock) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn contains(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start <= start && end <= self.end
    }
}

/// When a service can be booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingRule {
    weekdays: HashSet<Weekday>,
    blocks: Vec<TimeBlock>,
    slot_minutes: u32,
}

impl SchedulingRule {
    pub fn new(
        weekdays: impl IntoIterator<Item = Weekday>,
        blocks: Vec<TimeBlock>,
        slot_minutes: u32,
    ) -> DomainResult<Self> {
        if slot_minutes == 0 {
            return Err(DomainError::validation("slot_minutes must be positive"));
        }
        for (i, a) in blocks.iter().enumerate() {
            if blocks[i + 1..].iter().any(|b| a.overlaps(b)) {
                return Err(DomainError::validation(format!(
                    "time block {}-{} overlaps another block",
                    a.start, a.end
                )));
            }
        }
        Ok(Self {
            weekdays: weekdays.into_iter().collect(),
            blocks,
            slot_minutes,
        })
    }

    pub fn slot_minutes(&self) -> u32 {
        self.slot_minutes
    }

    pub fn blocks(&self) -> &[TimeBlock] {
        &self.blocks
    }

    pub fn permits(&self, weekday: Weekday) -> bool {
        self.weekdays.contains(&weekday)
    }
}

/// Serialized form of a [`SchedulingRule`] (`"mon"`, `"09:00"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingRuleSpec {
    pub weekdays: Vec<String>,
    pub blocks: Vec<TimeBlockSpec>,
    pub slot_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBlockSpec {
    pub start: String,
    pub end: String,
}

impl TryFrom<SchedulingRuleSpec> for SchedulingRule {
    type Error = DomainError;

    fn try_from(spec: SchedulingRuleSpec) -> Result<Self, Self::Error> {
        let weekdays = spec
            .weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| DomainError::validation(format!("unknown weekday: {d}")))
            })
            .collect::<DomainResult<Vec<_>>>()?;
        let blocks = spec
            .blocks
            .iter()
            .map(|b| TimeBlock::new(parse_time(&b.start)?, parse_time(&b.end)?))
            .collect::<DomainResult<Vec<_>>>()?;
        SchedulingRule::new(weekdays, blocks, spec.slot_minutes)
    }
}

fn parse_time(s: &str) -> DomainResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| DomainError::validation(format!("invalid time of day: {s} (expected HH:MM)")))
}

/// One bookable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub date_time: NaiveDateTime,
    pub duration_minutes: u32,
    pub appointment_type: AppointmentType,
}

/// Computes and validates appointment slots from scheduling rules.
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    rules: HashMap<AppointmentType, SchedulingRule>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, appointment_type: AppointmentType, rule: SchedulingRule) -> Self {
        self.rules.insert(appointment_type, rule);
        self
    }

    pub fn rule(&self, appointment_type: AppointmentType) -> Option<&SchedulingRule> {
        self.rules.get(&appointment_type)
    }

    /// Slot length for a service.
    pub fn duration(&self, appointment_type: AppointmentType) -> DomainResult<u32> {
        self.rule(appointment_type)
            .map(SchedulingRule::slot_minutes)
            .ok_or_else(|| {
                DomainError::validation(format!("no scheduling rule for {appointment_type}"))
            })
    }

    /// Bookable slots on `date`, in block order then time order.
    ///
    /// `occupied` holds the start times of active appointments of this type;
    /// those candidates are left out. A candidate is offered only if it ends
    /// at or before its block's end.
    pub fn available_slots(
        &self,
        date: NaiveDate,
        appointment_type: AppointmentType,
        occupied: &BTreeSet<NaiveDateTime>,
    ) -> Vec<Slot> {
        let Some(rule) = self.rule(appointment_type) else {
            return Vec::new();
        };
        if !rule.permits(date.weekday()) {
            return Vec::new();
        }

        let step = Duration::minutes(i64::from(rule.slot_minutes));
        let mut slots = Vec::new();
        for block in &rule.blocks {
            let block_end = date.and_time(block.end);
            let mut candidate = date.and_time(block.start);
            while candidate + step <= block_end {
                if !occupied.contains(&candidate) {
                    slots.push(Slot {
                        date_time: candidate,
                        duration_minutes: rule.slot_minutes,
                        appointment_type,
                    });
                }
                candidate += step;
            }
        }
        slots
    }

    /// The weekday is permitted and one block fully contains the slot.
    pub fn is_valid_slot(&self, date_time: NaiveDateTime, appointment_type: AppointmentType) -> bool {
        let Some(rule) = self.rule(appointment_type) else {
            return false;
        };
        if !rule.permits(date_time.weekday()) {
            return false;
        }
        let end = date_time + Duration::minutes(i64::from(rule.slot_minutes));
        if end.date() != date_time.date() {
            return false;
        }
        rule.blocks
            .iter()
            .any(|b| b.contains(date_time.time(), end.time()))
    }

    /// Fails with `ConflictingAppointment` if the exact start time is taken.
    pub fn check_conflict(
        &self,
        date_time: NaiveDateTime,
        appointment_type: AppointmentType,
        occupied: &BTreeSet<NaiveDateTime>,
    ) -> DomainResult<()> {
        if occupied.contains(&date_time) {
            return Err(DomainError::conflicting_appointment(format!(
                "{appointment_type} already booked at {}",
                date_time.format("%Y-%m-%d %H:%M")
            )));
        }
        Ok(())
    }

    /// Slot validity followed by the conflict check.
    pub fn validate_booking(
        &self,
        date_time: NaiveDateTime,
        appointment_type: AppointmentType,
        occupied: &BTreeSet<NaiveDateTime>,
    ) -> DomainResult<()> {
        if !self.is_valid_slot(date_time, appointment_type) {
            return Err(DomainError::validation(format!(
                "{} is not a bookable {appointment_type} slot",
                date_time.format("%Y-%m-%d %H:%M")
            )));
        }
        self.check_conflict(date_time, appointment_type, occupied)
    }

    /// Rules used when no rules file is configured.
    pub fn with_default_rules() -> Self {
        use Weekday::*;

        let hm = |h: u32, m: u32| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        let block = |s: NaiveTime, e: NaiveTime| TimeBlock { start: s, end: e };
        let weekdays = [Mon, Tue, Wed, Thu, Fri];

        let rule = |days: &[Weekday], blocks: Vec<TimeBlock>, minutes: u32| SchedulingRule {
            weekdays: days.iter().copied().collect(),
            blocks,
            slot_minutes: minutes,
        };

        Self::new()
            .with_rule(
                AppointmentType::VisaInterview,
                rule(
                    &weekdays,
                    vec![block(hm(9, 0), hm(12, 0)), block(hm(14, 0), hm(16, 0))],
                    30,
                ),
            )
            .with_rule(
                AppointmentType::PassportService,
                rule(&weekdays, vec![block(hm(9, 0), hm(13, 0))], 20),
            )
            .with_rule(
                AppointmentType::CivilRegistry,
                rule(&[Mon, Tue, Wed, Thu], vec![block(hm(10, 0), hm(12, 0))], 30),
            )
            .with_rule(
                AppointmentType::NotarialAct,
                rule(&[Tue, Thu], vec![block(hm(9, 0), hm(12, 0))], 45),
            )
            .with_rule(
                AppointmentType::Consultation,
                rule(&weekdays, vec![block(hm(14, 0), hm(17, 0))], 15),
            )
    }
}
