use chrono::{NaiveDateTime, TimeDelta};

use crate::model::*;
use crate::policy::{BufferPolicy, SlotOperation};

use super::{EngineError, SlotRejection};

/// Everything about the request that changes which rules apply.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext {
    pub operation: SlotOperation,
    pub kind: AppointmentKind,
    pub role: Role,
    pub now: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResult {
    Accepted,
    Rejected(SlotRejection),
}

impl ConflictResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConflictResult::Accepted)
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            ConflictResult::Accepted => Ok(()),
            ConflictResult::Rejected(r) => Err(EngineError::Slot(r)),
        }
    }
}

/// Decide whether `candidate` may be booked next to `existing`, the
/// non-cancelled visits of the same engineer. Entries on other days are ignored.
///
/// Rules run in a fixed order and the first failure wins: duration bounds,
/// daily start window, hard overlap, transport buffer, lead time.
pub fn check(
    policy: &BufferPolicy,
    candidate: &TimeRange,
    existing: &[BookedSlot],
    ctx: &CheckContext,
) -> ConflictResult {
    let bounds = policy.duration_bounds(ctx.operation, ctx.kind, ctx.role);
    let minutes = candidate.duration_minutes();
    if !bounds.contains(minutes) {
        return ConflictResult::Rejected(SlotRejection::invalid_duration(minutes, Some(bounds)));
    }

    let start = candidate.start_minute();
    if policy.enforces_start_window(ctx.operation, ctx.role)
        && (start < policy.earliest_start || start > policy.latest_start)
    {
        return ConflictResult::Rejected(SlotRejection::invalid_start_window(start, policy));
    }

    let same_day = || existing.iter().filter(|e| e.range.date() == candidate.date());

    if let Some(e) = same_day().find(|e| candidate.overlaps(&e.range)) {
        return ConflictResult::Rejected(SlotRejection::overlap(e));
    }

    let buffer = u32::from(policy.transport_buffer);
    let (c_start, c_end) = (u32::from(start), u32::from(candidate.end_minute()));
    for e in same_day() {
        let (e_start, e_end) = (u32::from(e.range.start_minute()), u32::from(e.range.end_minute()));
        // candidate begins inside the travel gap after `e`
        if c_start >= e_end && c_start < e_end + buffer {
            let earliest = e_end + buffer;
            let suggested = (earliest < u32::from(MINUTES_PER_DAY)).then_some(earliest as Minute);
            return ConflictResult::Rejected(SlotRejection::buffer_after(e, suggested));
        }
        // candidate ends inside the travel gap before `e`
        if c_end <= e_start && c_end + buffer > e_start {
            return ConflictResult::Rejected(SlotRejection::buffer_before(
                e,
                e_start.saturating_sub(buffer) as Minute,
            ));
        }
    }

    if policy.requires_lead_time(ctx.role)
        && let Err(r) = require_notice(candidate, ctx.now, policy.min_lead_time)
    {
        return ConflictResult::Rejected(r);
    }

    ConflictResult::Accepted
}

/// At least `minutes` must remain before `range` starts.
pub(crate) fn require_notice(range: &TimeRange, now: NaiveDateTime, minutes: i64) -> Result<(), SlotRejection> {
    let lead = range.lead_time(now);
    if lead < TimeDelta::minutes(minutes) {
        return Err(SlotRejection::lead_time(lead.num_minutes(), minutes));
    }
    Ok(())
}
