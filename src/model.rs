use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, SlotRejection};

/// Minute of the day, `0..1440`.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 1440;

/// Render a minute of the day as `HH:MM`.
pub fn fmt_minute(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Day-local half-open interval `[start, end)` in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    date: NaiveDate,
    start_minute: Minute,
    end_minute: Minute,
}

impl TimeRange {
    pub fn new(date: NaiveDate, start_minute: Minute, end_minute: Minute) -> Result<Self, EngineError> {
        if start_minute >= MINUTES_PER_DAY || end_minute >= MINUTES_PER_DAY {
            return Err(EngineError::InvalidInput("minute outside the day"));
        }
        if end_minute <= start_minute {
            return Err(EngineError::Slot(SlotRejection::invalid_duration(
                i64::from(end_minute) - i64::from(start_minute),
                None,
            )));
        }
        Ok(Self {
            date,
            start_minute,
            end_minute,
        })
    }

    /// Build from wall-clock times; seconds are ignored.
    pub fn from_times(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Result<Self, EngineError> {
        let to_minute = |t: NaiveTime| (t.hour() * 60 + t.minute()) as Minute;
        Self::new(date, to_minute(start), to_minute(end))
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn start_minute(&self) -> Minute {
        self.start_minute
    }

    pub fn end_minute(&self) -> Minute {
        self.end_minute
    }

    pub fn duration_minutes(&self) -> i64 {
        i64::from(self.end_minute) - i64::from(self.start_minute)
    }

    /// Same day and `self.start < other.end && other.start < self.end`.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.date == other.date
            && self.start_minute < other.end_minute
            && other.start_minute < self.end_minute
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN) + TimeDelta::minutes(i64::from(self.start_minute))
    }

    /// Time left between `now` and the start of the range. Negative once started.
    pub fn lead_time(&self, now: NaiveDateTime) -> TimeDelta {
        self.starts_at() - now
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.date,
            fmt_minute(self.start_minute),
            fmt_minute(self.end_minute)
        )
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Engineer,
    Company,
}

/// Who is performing an operation. Supplied by the caller on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role: Role,
    pub id: Ulid,
}

impl Actor {
    pub fn admin(id: Ulid) -> Self {
        Self { role: Role::Admin, id }
    }

    pub fn engineer(id: Ulid) -> Self {
        Self { role: Role::Engineer, id }
    }

    pub fn company(id: Ulid) -> Self {
        Self { role: Role::Company, id }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// How an actor relates to a given visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    AssignedEngineer,
    OwningCompany,
    Administrator,
}

impl Party {
    pub fn resolve(actor: &Actor, engineer_id: Ulid, company_id: Ulid) -> Option<Party> {
        match actor.role {
            Role::Admin => Some(Party::Administrator),
            Role::Engineer if actor.id == engineer_id => Some(Party::AssignedEngineer),
            Role::Company if actor.id == company_id => Some(Party::OwningCompany),
            _ => None,
        }
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentKind {
    Advisory,
    Audit,
    Followup,
    Training,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Programada,
    Confirmada,
    EnProgreso,
    EnRevision,
    Completada,
    Cancelada,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 6] = [
        Self::Programada,
        Self::Confirmada,
        Self::EnProgreso,
        Self::EnRevision,
        Self::Completada,
        Self::Cancelada,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Programada => "PROGRAMADA",
            Self::Confirmada => "CONFIRMADA",
            Self::EnProgreso => "EN_PROGRESO",
            Self::EnRevision => "EN_REVISION",
            Self::Completada => "COMPLETADA",
            Self::Cancelada => "CANCELADA",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completada | Self::Cancelada)
    }

    /// Still movable: the reschedule self-loop applies.
    pub fn is_reschedulable(&self) -> bool {
        matches!(self, Self::Programada | Self::Confirmada)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub engineer_id: Ulid,
    pub company_id: Ulid,
    pub range: TimeRange,
    #[serde(rename = "type")]
    pub kind: AppointmentKind,
    pub status: AppointmentStatus,
    pub location: String,
    pub description: String,
}

impl Appointment {
    pub fn day_key(&self) -> DayKey {
        DayKey::new(self.engineer_id, self.range.date())
    }

    /// Cancelled visits never block a slot.
    pub fn blocks_slot(&self) -> bool {
        self.status != AppointmentStatus::Cancelada
    }

    pub fn party_of(&self, actor: &Actor) -> Option<Party> {
        Party::resolve(actor, self.engineer_id, self.company_id)
    }
}

/// An occupied slot as seen by the conflict checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedSlot {
    pub id: Ulid,
    pub range: TimeRange,
}

/// Serialization unit: one engineer on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub engineer_id: Ulid,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(engineer_id: Ulid, date: NaiveDate) -> Self {
        Self { engineer_id, date }
    }
}

#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub key: DayKey,
    /// Every appointment of the day, cancelled ones included, sorted by start.
    pub appointments: Vec<Appointment>,
}

impl DaySchedule {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            appointments: Vec::new(),
        }
    }

    /// Insert keeping sort order by start minute.
    pub fn insert(&mut self, appointment: Appointment) {
        let start = appointment.range.start_minute();
        let pos = self
            .appointments
            .partition_point(|a| a.range.start_minute() <= start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.get(id).is_some()
    }

    /// Slots that block the day, optionally ignoring one appointment (the one
    /// being rescheduled).
    pub fn booked_slots(&self, exclude: Option<Ulid>) -> Vec<BookedSlot> {
        self.appointments
            .iter()
            .filter(|a| a.blocks_slot() && Some(a.id) != exclude)
            .map(|a| BookedSlot {
                id: a.id,
                range: a.range,
            })
            .collect()
    }
}

// ── Validation ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    PendienteDocumentacion,
    EnRevision,
    Aprobado,
    RequiereCorrecciones,
    Completado,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendienteDocumentacion => "PENDIENTE_DOCUMENTACION",
            Self::EnRevision => "EN_REVISION",
            Self::Aprobado => "APROBADO",
            Self::RequiereCorrecciones => "REQUIERE_CORRECCIONES",
            Self::Completado => "COMPLETADO",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Approved,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Supporting evidence uploaded by the company, or the visit act ("Acta")
/// produced by the engineer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    Support,
    Act,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Ulid,
    pub validation_record_id: Ulid,
    pub kind: DocumentKind,
    pub name: String,
    pub status: DocumentStatus,
    pub rejection_reason: Option<String>,
    /// Starts at 1, bumped on every replacement upload.
    pub version: u32,
}

impl Document {
    pub fn new(id: Ulid, validation_record_id: Ulid, kind: DocumentKind, name: String) -> Self {
        Self {
            id,
            validation_record_id,
            kind,
            name,
            status: DocumentStatus::Pending,
            rejection_reason: None,
            version: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub engineer_id: Ulid,
    pub company_id: Ulid,
    pub status: ValidationStatus,
    pub documents: Vec<Document>,
}

impl ValidationRecord {
    /// The record an appointment gets the moment it is completed.
    pub fn opened_for(id: Ulid, appointment: &Appointment) -> Self {
        Self {
            id,
            appointment_id: appointment.id,
            engineer_id: appointment.engineer_id,
            company_id: appointment.company_id,
            status: ValidationStatus::PendienteDocumentacion,
            documents: Vec::new(),
        }
    }

    pub fn document(&self, id: &Ulid) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == *id)
    }

    pub fn document_mut(&mut self, id: &Ulid) -> Option<&mut Document> {
        self.documents.iter_mut().find(|d| d.id == *id)
    }

    pub fn act(&self) -> Option<&Document> {
        self.documents.iter().find(|d| d.kind == DocumentKind::Act)
    }

    pub fn support_documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter().filter(|d| d.kind == DocumentKind::Support)
    }

    pub fn count_support(&self, status: DocumentStatus) -> usize {
        self.support_documents().filter(|d| d.status == status).count()
    }

    pub fn party_of(&self, actor: &Actor) -> Option<Party> {
        Party::resolve(actor, self.engineer_id, self.company_id)
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Committed state changes. This is the WAL record format
/// and the payload broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentScheduled {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        range: TimeRange,
        status: AppointmentStatus,
    },
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
    },
    /// Moves the visit to COMPLETADA and opens its validation record.
    AppointmentCompleted {
        id: Ulid,
        validation_id: Ulid,
    },
    DocumentUploaded {
        validation_id: Ulid,
        document: Document,
    },
    DocumentsSubmitted {
        validation_id: Ulid,
        declared_empty: bool,
    },
    DocumentReviewed {
        validation_id: Ulid,
        document_id: Ulid,
        status: DocumentStatus,
        reason: Option<String>,
    },
    DocumentReplaced {
        validation_id: Ulid,
        document_id: Ulid,
        reopens_review: bool,
    },
    ReviewFinalized {
        validation_id: Ulid,
        outcome: ValidationStatus,
    },
    ValidationCompleted {
        validation_id: Ulid,
    },
    /// Compaction snapshot of a whole record.
    ValidationRestored {
        record: ValidationRecord,
    },
}

impl Event {
    /// The validation record this event applies to, if any.
    pub fn validation_id(&self) -> Option<Ulid> {
        match self {
            Event::DocumentUploaded { validation_id, .. }
            | Event::DocumentsSubmitted { validation_id, .. }
            | Event::DocumentReviewed { validation_id, .. }
            | Event::DocumentReplaced { validation_id, .. }
            | Event::ReviewFinalized { validation_id, .. }
            | Event::ValidationCompleted { validation_id } => Some(*validation_id),
            Event::ValidationRestored { record } => Some(record.id),
            Event::AppointmentScheduled { .. }
            | Event::AppointmentRescheduled { .. }
            | Event::AppointmentStatusChanged { .. }
            | Event::AppointmentCompleted { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Event::AppointmentScheduled { .. } => "appointment_scheduled",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::AppointmentCompleted { .. } => "appointment_completed",
            Event::DocumentUploaded { .. } => "document_uploaded",
            Event::DocumentsSubmitted { .. } => "documents_submitted",
            Event::DocumentReviewed { .. } => "document_reviewed",
            Event::DocumentReplaced { .. } => "document_replaced",
            Event::ReviewFinalized { .. } => "review_finalized",
            Event::ValidationCompleted { .. } => "validation_completed",
            Event::ValidationRestored { .. } => "validation_restored",
        }
    }
}
