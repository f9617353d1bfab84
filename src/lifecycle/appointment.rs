//! Appointment status state machine.
//!
//! ```text
//! PROGRAMADA ──▶ CONFIRMADA ──▶ EN_PROGRESO ──▶ EN_REVISION ──▶ COMPLETADA
//!     │  ▲ ⟲         │ ⟲
//!     │  └─reschedule┘
//!     ▼              ▼
//!          CANCELADA
//! ```
//!
//! Every edge is listed in one table keyed by `(from, to)`; the table also
//! names which parties may take the edge and which time guard applies.
//! Rescheduling is the only self-loop and goes through [`plan_reschedule`].

use chrono::NaiveDateTime;

use crate::engine::conflict::{CheckContext, check, require_notice};
use crate::engine::EngineError;
use crate::model::*;
use crate::policy::{BufferPolicy, SlotOperation};

const AGGREGATE: &str = "appointment";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    None,
    /// Non-administrators must act before the cancellation notice runs out.
    CancellationNotice,
}

#[derive(Debug)]
struct Edge {
    from: AppointmentStatus,
    to: AppointmentStatus,
    parties: &'static [Party],
    guard: Guard,
}

const ENGINEER: &[Party] = &[Party::AssignedEngineer];
const ANY_PARTY: &[Party] = &[Party::AssignedEngineer, Party::OwningCompany, Party::Administrator];

const EDGES: &[Edge] = &[
    Edge {
        from: AppointmentStatus::Programada,
        to: AppointmentStatus::Confirmada,
        parties: ENGINEER,
        guard: Guard::None,
    },
    Edge {
        from: AppointmentStatus::Confirmada,
        to: AppointmentStatus::EnProgreso,
        parties: ENGINEER,
        guard: Guard::None,
    },
    Edge {
        from: AppointmentStatus::EnProgreso,
        to: AppointmentStatus::EnRevision,
        parties: ENGINEER,
        guard: Guard::None,
    },
    Edge {
        from: AppointmentStatus::EnRevision,
        to: AppointmentStatus::Completada,
        parties: ENGINEER,
        guard: Guard::None,
    },
    Edge {
        from: AppointmentStatus::Programada,
        to: AppointmentStatus::Cancelada,
        parties: ANY_PARTY,
        guard: Guard::CancellationNotice,
    },
    Edge {
        from: AppointmentStatus::Confirmada,
        to: AppointmentStatus::Cancelada,
        parties: ANY_PARTY,
        guard: Guard::CancellationNotice,
    },
];

fn edge(from: AppointmentStatus, to: AppointmentStatus) -> Option<&'static Edge> {
    EDGES.iter().find(|e| e.from == from && e.to == to)
}

fn invalid(from: AppointmentStatus, to: AppointmentStatus) -> EngineError {
    EngineError::InvalidStateTransition {
        aggregate: AGGREGATE,
        from: from.as_str(),
        to: to.as_str(),
    }
}

/// What an accepted status change does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentTransition {
    Status(AppointmentStatus),
    /// Reaching COMPLETADA also opens the validation record.
    Complete,
}

/// Validate a status change requested through the status endpoint.
///
/// Edge validity is checked before the actor, so a refused actor learns
/// nothing about which roles could have taken the edge.
pub fn plan_transition(
    appointment: &Appointment,
    to: AppointmentStatus,
    actor: &Actor,
    policy: &BufferPolicy,
    now: NaiveDateTime,
) -> Result<AppointmentTransition, EngineError> {
    let edge = edge(appointment.status, to).ok_or_else(|| invalid(appointment.status, to))?;
    let party = appointment
        .party_of(actor)
        .filter(|p| edge.parties.contains(p))
        .ok_or(EngineError::UnauthorizedActor)?;

    if edge.guard == Guard::CancellationNotice && party != Party::Administrator {
        require_notice(&appointment.range, now, policy.cancellation_notice)?;
    }

    Ok(if to == AppointmentStatus::Completada {
        AppointmentTransition::Complete
    } else {
        AppointmentTransition::Status(to)
    })
}

/// Targets `actor` may request from the current status, ignoring time guards.
/// Meant for presentation-layer hints only.
pub fn available_targets(appointment: &Appointment, actor: &Actor) -> Vec<AppointmentStatus> {
    let Some(party) = appointment.party_of(actor) else {
        return Vec::new();
    };
    EDGES
        .iter()
        .filter(|e| e.from == appointment.status && e.parties.contains(&party))
        .map(|e| e.to)
        .collect()
}

/// Validate a brand-new appointment (status PROGRAMADA) against the
/// engineer's other visits that day.
pub fn plan_creation(
    appointment: Appointment,
    actor: &Actor,
    policy: &BufferPolicy,
    existing: &[BookedSlot],
    now: NaiveDateTime,
) -> Result<Event, EngineError> {
    appointment.party_of(actor).ok_or(EngineError::UnauthorizedActor)?;
    let ctx = CheckContext {
        operation: SlotOperation::Create,
        kind: appointment.kind,
        role: actor.role,
        now,
    };
    check(policy, &appointment.range, existing, &ctx).into_result()?;
    Ok(Event::AppointmentScheduled { appointment })
}

/// Validate moving a PROGRAMADA/CONFIRMADA visit to `range`. `existing` holds
/// the engineer's other visits on the target day, the visit itself excluded.
///
/// A company moving a confirmed visit sends it back to PROGRAMADA so the
/// engineer confirms the new slot.
pub fn plan_reschedule(
    appointment: &Appointment,
    range: TimeRange,
    actor: &Actor,
    policy: &BufferPolicy,
    existing: &[BookedSlot],
    now: NaiveDateTime,
) -> Result<Event, EngineError> {
    if !appointment.status.is_reschedulable() {
        return Err(invalid(appointment.status, appointment.status));
    }
    let party = appointment
        .party_of(actor)
        .ok_or(EngineError::UnauthorizedActor)?;

    if party != Party::Administrator {
        require_notice(&appointment.range, now, policy.min_lead_time)?;
    }

    let ctx = CheckContext {
        operation: SlotOperation::Reschedule,
        kind: appointment.kind,
        role: actor.role,
        now,
    };
    check(policy, &range, existing, &ctx).into_result()?;

    let status = match (party, appointment.status) {
        (Party::OwningCompany, AppointmentStatus::Confirmada) => AppointmentStatus::Programada,
        (_, status) => status,
    };
    Ok(Event::AppointmentRescheduled {
        id: appointment.id,
        range,
        status,
    })
}
