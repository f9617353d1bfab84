//! Post-visit document validation.
//!
//! ```text
//! PENDIENTE_DOCUMENTACION ──▶ EN_REVISION ──▶ APROBADO ──▶ COMPLETADO
//!                                 │  ▲
//!                                 ▼  │
//!                         REQUIERE_CORRECCIONES
//! ```
//!
//! The review outcome is computed from the documents, never picked by the
//! reviewer. Each document runs its own small machine:
//! `PENDING → APPROVED | REJECTED`, `REJECTED → PENDING` on replacement.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;

const AGGREGATE: &str = "validation";
const DOCUMENT: &str = "document";

fn invalid(from: ValidationStatus, to: ValidationStatus) -> EngineError {
    EngineError::InvalidStateTransition {
        aggregate: AGGREGATE,
        from: from.as_str(),
        to: to.as_str(),
    }
}

fn invalid_document(from: DocumentStatus, to: DocumentStatus) -> EngineError {
    EngineError::InvalidStateTransition {
        aggregate: DOCUMENT,
        from: from.as_str(),
        to: to.as_str(),
    }
}

fn require_party(record: &ValidationRecord, actor: &Actor, party: Party) -> Result<(), EngineError> {
    if record.party_of(actor) == Some(party) {
        Ok(())
    } else {
        Err(EngineError::UnauthorizedActor)
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("document name is empty"));
    }
    if name.len() > MAX_DOCUMENT_NAME_LEN {
        return Err(EngineError::LimitExceeded("document name too long"));
    }
    Ok(())
}

/// How the company closes the upload phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Everything the company intends to provide is uploaded.
    Uploaded,
    /// The company declares there is nothing to upload.
    NoDocuments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject { reason: String },
}

/// Company upload of a supporting document while the upload phase is open.
pub fn plan_upload(
    record: &ValidationRecord,
    actor: &Actor,
    document_id: Ulid,
    name: String,
) -> Result<Event, EngineError> {
    if record.status != ValidationStatus::PendienteDocumentacion {
        return Err(invalid(record.status, record.status));
    }
    require_party(record, actor, Party::OwningCompany)?;
    validate_name(&name)?;
    if record.documents.len() >= MAX_DOCUMENTS_PER_RECORD {
        return Err(EngineError::LimitExceeded("too many documents on record"));
    }
    if record.document(&document_id).is_some() {
        return Err(EngineError::AlreadyExists(document_id));
    }
    Ok(Event::DocumentUploaded {
        validation_id: record.id,
        document: Document::new(document_id, record.id, DocumentKind::Support, name),
    })
}

/// `PENDIENTE_DOCUMENTACION → EN_REVISION`, by the owning company.
pub fn plan_submission(
    record: &ValidationRecord,
    actor: &Actor,
    submission: Submission,
) -> Result<Event, EngineError> {
    if record.status != ValidationStatus::PendienteDocumentacion {
        return Err(invalid(record.status, ValidationStatus::EnRevision));
    }
    require_party(record, actor, Party::OwningCompany)?;
    let uploaded = record.support_documents().count();
    match submission {
        Submission::Uploaded if uploaded == 0 => {
            return Err(EngineError::InvalidInput("no documents uploaded"));
        }
        Submission::NoDocuments if uploaded > 0 => {
            return Err(EngineError::InvalidInput("documents already uploaded"));
        }
        _ => {}
    }
    Ok(Event::DocumentsSubmitted {
        validation_id: record.id,
        declared_empty: submission == Submission::NoDocuments,
    })
}

/// The assigned engineer attaches the visit act. One per record.
pub fn plan_act_attachment(
    record: &ValidationRecord,
    actor: &Actor,
    document_id: Ulid,
    name: String,
) -> Result<Event, EngineError> {
    if record.status == ValidationStatus::Completado {
        return Err(invalid(record.status, record.status));
    }
    require_party(record, actor, Party::AssignedEngineer)?;
    validate_name(&name)?;
    if let Some(act) = record.act() {
        return Err(EngineError::AlreadyExists(act.id));
    }
    if record.documents.len() >= MAX_DOCUMENTS_PER_RECORD {
        return Err(EngineError::LimitExceeded("too many documents on record"));
    }
    Ok(Event::DocumentUploaded {
        validation_id: record.id,
        document: Document::new(document_id, record.id, DocumentKind::Act, name),
    })
}

/// Administrator decision on a single PENDING document.
pub fn plan_review(
    record: &ValidationRecord,
    actor: &Actor,
    document_id: Ulid,
    decision: ReviewDecision,
) -> Result<Event, EngineError> {
    let doc = record
        .document(&document_id)
        .ok_or(EngineError::NotFound(document_id))?;
    let reviewable = match doc.kind {
        DocumentKind::Support => record.status == ValidationStatus::EnRevision,
        DocumentKind::Act => matches!(
            record.status,
            ValidationStatus::EnRevision | ValidationStatus::Aprobado
        ),
    };
    if !reviewable {
        return Err(invalid(record.status, record.status));
    }
    require_party(record, actor, Party::Administrator)?;

    let (status, reason) = match decision {
        ReviewDecision::Approve => (DocumentStatus::Approved, None),
        ReviewDecision::Reject { reason } => {
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(EngineError::InvalidInput("rejection reason is required"));
            }
            if reason.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("rejection reason too long"));
            }
            (DocumentStatus::Rejected, Some(reason.to_string()))
        }
    };
    if doc.status != DocumentStatus::Pending {
        return Err(invalid_document(doc.status, status));
    }

    Ok(Event::DocumentReviewed {
        validation_id: record.id,
        document_id,
        status,
        reason,
    })
}

/// Upload a new version of a REJECTED document.
///
/// Supporting documents are replaced by the company while corrections are
/// requested; replacing the last rejected one sends the record back to review.
/// The act is replaced by the assigned engineer at any point before completion.
pub fn plan_replacement(
    record: &ValidationRecord,
    actor: &Actor,
    document_id: Ulid,
) -> Result<Event, EngineError> {
    let doc = record
        .document(&document_id)
        .ok_or(EngineError::NotFound(document_id))?;
    let (permitted, party) = match doc.kind {
        DocumentKind::Support => (
            record.status == ValidationStatus::RequiereCorrecciones,
            Party::OwningCompany,
        ),
        DocumentKind::Act => (record.status != ValidationStatus::Completado, Party::AssignedEngineer),
    };
    if !permitted {
        return Err(invalid(record.status, record.status));
    }
    require_party(record, actor, party)?;
    if doc.status != DocumentStatus::Rejected {
        return Err(invalid_document(doc.status, DocumentStatus::Pending));
    }

    let reopens_review =
        doc.kind == DocumentKind::Support && record.count_support(DocumentStatus::Rejected) == 1;
    Ok(Event::DocumentReplaced {
        validation_id: record.id,
        document_id,
        reopens_review,
    })
}

/// Close the review round: APROBADO or REQUIERE_CORRECCIONES, computed.
pub fn plan_finalization(record: &ValidationRecord, actor: &Actor) -> Result<Event, EngineError> {
    if record.status != ValidationStatus::EnRevision {
        return Err(invalid(record.status, ValidationStatus::Aprobado));
    }
    require_party(record, actor, Party::Administrator)?;

    let pending = record.count_support(DocumentStatus::Pending);
    if pending > 0 {
        return Err(EngineError::DocumentsPendingReview { pending });
    }
    let outcome = if record.count_support(DocumentStatus::Rejected) > 0 {
        ValidationStatus::RequiereCorrecciones
    } else {
        ValidationStatus::Aprobado
    };
    Ok(Event::ReviewFinalized {
        validation_id: record.id,
        outcome,
    })
}

/// `APROBADO → COMPLETADO` once the visit act is accepted.
pub fn plan_completion(record: &ValidationRecord, actor: &Actor) -> Result<Event, EngineError> {
    if record.status != ValidationStatus::Aprobado {
        return Err(invalid(record.status, ValidationStatus::Completado));
    }
    require_party(record, actor, Party::Administrator)?;
    let accepted = record
        .act()
        .is_some_and(|act| act.status == DocumentStatus::Approved);
    if !accepted {
        return Err(EngineError::ActNotAccepted);
    }
    Ok(Event::ValidationCompleted {
        validation_id: record.id,
    })
}

/// Apply a committed event to a record (caller holds the lock).
pub fn apply(record: &mut ValidationRecord, event: &Event) {
    match event {
        Event::DocumentUploaded { document, .. } => {
            record.documents.push(document.clone());
        }
        Event::DocumentsSubmitted { .. } => {
            record.status = ValidationStatus::EnRevision;
        }
        Event::DocumentReviewed {
            document_id,
            status,
            reason,
            ..
        } => {
            if let Some(doc) = record.document_mut(document_id) {
                doc.status = *status;
                doc.rejection_reason = reason.clone();
            }
        }
        Event::DocumentReplaced {
            document_id,
            reopens_review,
            ..
        } => {
            if let Some(doc) = record.document_mut(document_id) {
                doc.status = DocumentStatus::Pending;
                doc.rejection_reason = None;
                doc.version += 1;
            }
            if *reopens_review {
                record.status = ValidationStatus::EnRevision;
            }
        }
        Event::ReviewFinalized { outcome, .. } => {
            record.status = *outcome;
        }
        Event::ValidationCompleted { .. } => {
            record.status = ValidationStatus::Completado;
        }
        Event::ValidationRestored { record: snapshot } => {
            *record = snapshot.clone();
        }
        // appointment events never reach a record
        Event::AppointmentScheduled { .. }
        | Event::AppointmentRescheduled { .. }
        | Event::AppointmentStatusChanged { .. }
        | Event::AppointmentCompleted { .. } => {}
    }
}
