use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::policy::BufferPolicy;

/// Half-open minute window `[start, end)` within one day. Unlike
/// [`TimeRange`], `end` may be 1440 (midnight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Minute,
    pub end: Minute,
}

impl Window {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }
}

/// Free stretches of an engineer's day: the permitted day window minus every
/// booked visit widened by the transport buffer on both sides.
///
/// A visit placed entirely inside a returned window clears both the overlap
/// and the buffer rules against `existing`.
pub fn free_windows(policy: &BufferPolicy, date: NaiveDate, existing: &[BookedSlot]) -> Vec<Window> {
    let buffer = policy.transport_buffer;
    let mut blocked: Vec<Window> = existing
        .iter()
        .filter(|e| e.range.date() == date)
        .map(|e| {
            Window::new(
                e.range.start_minute().saturating_sub(buffer),
                e.range.end_minute().saturating_add(buffer).min(MINUTES_PER_DAY),
            )
        })
        .collect();
    blocked.sort_by_key(|w| w.start);
    let blocked = merge_overlapping(&blocked);

    if policy.earliest_start >= MINUTES_PER_DAY {
        return Vec::new();
    }

    let base = [Window::new(policy.earliest_start, MINUTES_PER_DAY)];
    subtract_windows(&base, &blocked)
}

/// Narrow free windows to those that can host a visit of `duration` minutes
/// starting no later than the latest permitted start.
pub fn fitting_windows(policy: &BufferPolicy, free: &[Window], duration: Minute) -> Vec<Window> {
    let last_end = policy.latest_start.saturating_add(duration).min(MINUTES_PER_DAY);
    free.iter()
        .filter_map(|w| {
            let end = w.end.min(last_end);
            (end > w.start && end - w.start >= duration).then(|| Window::new(w.start, end))
        })
        .collect()
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[Window]) -> Vec<Window> {
    let mut merged: Vec<Window> = Vec::with_capacity(sorted.len());
    for w in sorted {
        match merged.last_mut() {
            Some(last) if w.start <= last.end => last.end = last.end.max(w.end),
            _ => merged.push(*w),
        }
    }
    merged
}

/// Subtract sorted, disjoint `to_remove` windows from sorted `base` windows.
pub fn subtract_windows(base: &[Window], to_remove: &[Window]) -> Vec<Window> {
    let mut result = Vec::new();
    let mut ri = 0;

    for b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Window::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Window::new(current_start, current_end));
        }
    }

    result
}
