use tracing::info;
use ulid::Ulid;

use crate::lifecycle::validation::{
    ReviewDecision, Submission, plan_act_attachment, plan_completion, plan_finalization, plan_replacement,
    plan_review, plan_submission, plan_upload,
};
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

impl Engine {
    /// Plan and commit one event against a validation record under its lock.
    async fn commit_on_record<F>(
        &self,
        validation_id: Ulid,
        op: &'static str,
        plan: F,
    ) -> Result<ValidationRecord, EngineError>
    where
        F: FnOnce(&ValidationRecord) -> Result<Event, EngineError>,
    {
        let _gate = self.commit_gate.read().await;
        let record = self
            .get_validation(&validation_id)
            .ok_or(EngineError::NotFound(validation_id))?;
        let mut guard = record.write().await;
        let event = plan(&*guard).inspect_err(|e| observability::rejected(op, e))?;
        self.persist_and_apply_record(&mut guard, &event).await?;
        info!(validation = %validation_id, event = event.label(), status = guard.status.as_str(), "validation updated");
        Ok(guard.clone())
    }

    /// Company upload of a supporting document; returns the stored document.
    pub async fn upload_document(
        &self,
        validation_id: Ulid,
        name: String,
        actor: &Actor,
    ) -> Result<Document, EngineError> {
        let document_id = Ulid::new();
        let record = self
            .commit_on_record(validation_id, "upload_document", |r| {
                plan_upload(r, actor, document_id, name)
            })
            .await?;
        record
            .document(&document_id)
            .cloned()
            .ok_or(EngineError::NotFound(document_id))
    }

    pub async fn submit_documents(
        &self,
        validation_id: Ulid,
        submission: Submission,
        actor: &Actor,
    ) -> Result<ValidationRecord, EngineError> {
        self.commit_on_record(validation_id, "submit_documents", |r| {
            plan_submission(r, actor, submission)
        })
        .await
    }

    /// The engineer's visit act; reviewed like any document but it alone
    /// gates completion.
    pub async fn attach_act(
        &self,
        validation_id: Ulid,
        name: String,
        actor: &Actor,
    ) -> Result<Document, EngineError> {
        let document_id = Ulid::new();
        let record = self
            .commit_on_record(validation_id, "attach_act", |r| {
                plan_act_attachment(r, actor, document_id, name)
            })
            .await?;
        record
            .document(&document_id)
            .cloned()
            .ok_or(EngineError::NotFound(document_id))
    }

    pub async fn review_document(
        &self,
        validation_id: Ulid,
        document_id: Ulid,
        decision: ReviewDecision,
        actor: &Actor,
    ) -> Result<ValidationRecord, EngineError> {
        self.commit_on_record(validation_id, "review_document", |r| {
            plan_review(r, actor, document_id, decision)
        })
        .await
    }

    pub async fn replace_document(
        &self,
        validation_id: Ulid,
        document_id: Ulid,
        actor: &Actor,
    ) -> Result<ValidationRecord, EngineError> {
        self.commit_on_record(validation_id, "replace_document", |r| {
            plan_replacement(r, actor, document_id)
        })
        .await
    }

    /// Close a review round. The outcome comes from the documents.
    pub async fn finalize_review(
        &self,
        validation_id: Ulid,
        actor: &Actor,
    ) -> Result<ValidationRecord, EngineError> {
        self.commit_on_record(validation_id, "finalize_review", |r| plan_finalization(r, actor))
            .await
    }

    pub async fn complete_validation(
        &self,
        validation_id: Ulid,
        actor: &Actor,
    ) -> Result<ValidationRecord, EngineError> {
        self.commit_on_record(validation_id, "complete_validation", |r| plan_completion(r, actor))
            .await
    }
}
