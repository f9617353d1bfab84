use serde::{Deserialize, Serialize};

use crate::model::{AppointmentKind, MINUTES_PER_DAY, Minute, Role, fmt_minute};

/// Inclusive duration bounds in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBounds {
    pub min: i64,
    pub max: i64,
}

impl DurationBounds {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, minutes: i64) -> bool {
        self.min <= minutes && minutes <= self.max
    }
}

/// Which mutation a candidate slot is being checked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOperation {
    Create,
    Reschedule,
}

impl SlotOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotOperation::Create => "create",
            SlotOperation::Reschedule => "reschedule",
        }
    }
}

/// Gap and window rules every visit must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPolicy {
    /// Bounds for advisory and audit visits.
    pub visit_duration: DurationBounds,
    /// Bounds for follow-ups, trainings and administrative reschedules.
    pub extended_duration: DurationBounds,
    /// Gap owed between two visits of the same engineer on the same day.
    pub transport_buffer: Minute,
    pub earliest_start: Minute,
    pub latest_start: Minute,
    /// Minimum minutes between now and the start of a visit a non-administrator creates or moves.
    pub min_lead_time: i64,
    /// Minimum minutes between now and the start of a visit a non-administrator cancels.
    pub cancellation_notice: i64,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            visit_duration: DurationBounds::new(120, 180),
            extended_duration: DurationBounds::new(15, 360),
            transport_buffer: 15,
            earliest_start: 300,
            latest_start: 1140,
            min_lead_time: 60,
            cancellation_notice: 120,
        }
    }
}

impl BufferPolicy {
    pub fn duration_bounds(&self, operation: SlotOperation, kind: AppointmentKind, role: Role) -> DurationBounds {
        if operation == SlotOperation::Reschedule && role == Role::Admin {
            return self.extended_duration;
        }
        match kind {
            AppointmentKind::Advisory | AppointmentKind::Audit => self.visit_duration,
            AppointmentKind::Followup | AppointmentKind::Training => self.extended_duration,
        }
    }

    /// Administrative reschedules may place a visit outside the daily window.
    pub fn enforces_start_window(&self, operation: SlotOperation, role: Role) -> bool {
        !(operation == SlotOperation::Reschedule && role == Role::Admin)
    }

    pub fn requires_lead_time(&self, role: Role) -> bool {
        role != Role::Admin
    }

    /// Reject settings no day could satisfy.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.earliest_start > self.latest_start || self.latest_start >= MINUTES_PER_DAY {
            return Err("start window must satisfy earliest <= latest < 24:00");
        }
        for bounds in [self.visit_duration, self.extended_duration] {
            if bounds.min <= 0 || bounds.min > bounds.max {
                return Err("duration bounds must satisfy 0 < min <= max");
            }
        }
        if self.transport_buffer >= MINUTES_PER_DAY {
            return Err("transport buffer must be shorter than a day");
        }
        if self.min_lead_time < 0 || self.cancellation_notice < 0 {
            return Err("notice periods cannot be negative");
        }
        Ok(())
    }

    pub fn start_window_label(&self) -> String {
        format!(
            "{}-{}",
            fmt_minute(self.earliest_start),
            fmt_minute(self.latest_start)
        )
    }
}
