use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookedSlot, Minute, fmt_minute};
use crate::policy::{BufferPolicy, DurationBounds};

/// Stable machine-readable codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    InvalidDuration,
    InvalidStartWindow,
    SlotOverlap,
    InsufficientTransportBuffer,
    InsufficientLeadTime,
    InvalidStateTransition,
    DocumentsPendingReview,
    ActNotAccepted,
    UnauthorizedActor,
    InvalidInput,
    NotFound,
    AlreadyExists,
    LimitExceeded,
    StorageFailure,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidDuration => "INVALID_DURATION",
            Self::InvalidStartWindow => "INVALID_START_WINDOW",
            Self::SlotOverlap => "SLOT_OVERLAP",
            Self::InsufficientTransportBuffer => "INSUFFICIENT_TRANSPORT_BUFFER",
            Self::InsufficientLeadTime => "INSUFFICIENT_LEAD_TIME",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::DocumentsPendingReview => "DOCUMENTS_PENDING_REVIEW",
            Self::ActNotAccepted => "ACT_NOT_ACCEPTED",
            Self::UnauthorizedActor => "UNAUTHORIZED_ACTOR",
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::StorageFailure => "STORAGE_FAILURE",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closest legal edge the caller can move a rejected slot to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Boundary {
    EarliestStart(Minute),
    LatestStart(Minute),
    LatestEnd(Minute),
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::EarliestStart(m) => write!(f, "start at or after {}", fmt_minute(*m)),
            Boundary::LatestStart(m) => write!(f, "start at or before {}", fmt_minute(*m)),
            Boundary::LatestEnd(m) => write!(f, "end at or before {}", fmt_minute(*m)),
        }
    }
}

/// Why a candidate slot was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRejection {
    pub code: RejectionCode,
    pub suggested_boundary: Option<Boundary>,
    pub conflicting: Option<Ulid>,
    pub detail: String,
}

impl SlotRejection {
    pub fn invalid_duration(minutes: i64, bounds: Option<DurationBounds>) -> Self {
        let detail = match bounds {
            Some(b) => format!("duration {minutes} min outside [{}, {}] min", b.min, b.max),
            None => format!("duration {minutes} min: end must be after start"),
        };
        Self {
            code: RejectionCode::InvalidDuration,
            suggested_boundary: None,
            conflicting: None,
            detail,
        }
    }

    pub fn invalid_start_window(start: Minute, policy: &BufferPolicy) -> Self {
        let boundary = if start < policy.earliest_start {
            Boundary::EarliestStart(policy.earliest_start)
        } else {
            Boundary::LatestStart(policy.latest_start)
        };
        Self {
            code: RejectionCode::InvalidStartWindow,
            suggested_boundary: Some(boundary),
            conflicting: None,
            detail: format!(
                "start {} outside permitted window {}",
                fmt_minute(start),
                policy.start_window_label()
            ),
        }
    }

    pub fn overlap(existing: &BookedSlot) -> Self {
        Self {
            code: RejectionCode::SlotOverlap,
            suggested_boundary: None,
            conflicting: Some(existing.id),
            detail: format!("overlaps appointment {} ({})", existing.id, existing.range),
        }
    }

    /// `earliest_start` is `None` when the gap runs past midnight.
    pub fn buffer_after(existing: &BookedSlot, earliest_start: Option<Minute>) -> Self {
        let detail = match earliest_start {
            Some(m) => format!(
                "needs transport time after appointment {}; earliest start {}",
                existing.id,
                fmt_minute(m)
            ),
            None => format!(
                "needs transport time after appointment {}; no later start fits the day",
                existing.id
            ),
        };
        Self {
            code: RejectionCode::InsufficientTransportBuffer,
            suggested_boundary: earliest_start.map(Boundary::EarliestStart),
            conflicting: Some(existing.id),
            detail,
        }
    }

    pub fn buffer_before(existing: &BookedSlot, latest_end: Minute) -> Self {
        Self {
            code: RejectionCode::InsufficientTransportBuffer,
            suggested_boundary: Some(Boundary::LatestEnd(latest_end)),
            conflicting: Some(existing.id),
            detail: format!(
                "needs transport time before appointment {}; latest end {}",
                existing.id,
                fmt_minute(latest_end)
            ),
        }
    }

    pub fn lead_time(actual_minutes: i64, required_minutes: i64) -> Self {
        Self {
            code: RejectionCode::InsufficientLeadTime,
            suggested_boundary: None,
            conflicting: None,
            detail: format!("starts in {actual_minutes} min; at least {required_minutes} min notice required"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{}: {}", .0.code, .0.detail)]
    Slot(SlotRejection),
    #[error("invalid state transition for {aggregate}: {from} -> {to}")]
    InvalidStateTransition {
        aggregate: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("{pending} document(s) still pending review")]
    DocumentsPendingReview { pending: usize },
    #[error("visit act has not been accepted")]
    ActNotAccepted,
    #[error("actor is not permitted to perform this operation")]
    UnauthorizedActor,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// What the presentation layer receives for a refused operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub code: RejectionCode,
    pub detail: String,
    pub context: serde_json::Value,
}

impl EngineError {
    pub fn code(&self) -> RejectionCode {
        match self {
            EngineError::Slot(r) => r.code,
            EngineError::InvalidStateTransition { .. } => RejectionCode::InvalidStateTransition,
            EngineError::DocumentsPendingReview { .. } => RejectionCode::DocumentsPendingReview,
            EngineError::ActNotAccepted => RejectionCode::ActNotAccepted,
            EngineError::UnauthorizedActor => RejectionCode::UnauthorizedActor,
            EngineError::InvalidInput(_) => RejectionCode::InvalidInput,
            EngineError::NotFound(_) => RejectionCode::NotFound,
            EngineError::AlreadyExists(_) => RejectionCode::AlreadyExists,
            EngineError::LimitExceeded(_) => RejectionCode::LimitExceeded,
            EngineError::WalError(_) => RejectionCode::StorageFailure,
        }
    }

    pub fn rejection(&self) -> Rejection {
        let context = match self {
            EngineError::Slot(r) => json!({
                "suggestedBoundary": r.suggested_boundary,
                "conflictingAppointment": r.conflicting.map(|id| id.to_string()),
            }),
            EngineError::InvalidStateTransition { aggregate, from, to } => {
                json!({ "aggregate": aggregate, "from": from, "to": to })
            }
            EngineError::DocumentsPendingReview { pending } => json!({ "pending": pending }),
            EngineError::NotFound(id) | EngineError::AlreadyExists(id) => {
                json!({ "id": id.to_string() })
            }
            _ => serde_json::Value::Null,
        };
        // storage details stay in the logs
        let detail = match self {
            EngineError::Slot(r) => r.detail.clone(),
            EngineError::WalError(_) => "storage failure".to_string(),
            other => other.to_string(),
        };
        Rejection {
            code: self.code(),
            detail,
            context,
        }
    }
}

impl From<SlotRejection> for EngineError {
    fn from(r: SlotRejection) -> Self {
        EngineError::Slot(r)
    }
}
