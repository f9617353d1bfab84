use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::lifecycle::{ReviewDecision, Submission};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::BufferPolicy;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("visitcore_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn visit_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// 07:00 the day before the visit day.
fn day_before() -> NaiveDateTime {
    visit_day().pred_opt().unwrap().and_time(hm(7, 0))
}

struct Fixture {
    engine: Engine,
    clock: Arc<ManualClock>,
    engineer: Ulid,
    company: Ulid,
}

impl Fixture {
    fn open(path: PathBuf) -> Self {
        Self::reopen(path, Ulid::new(), Ulid::new())
    }

    fn reopen(path: PathBuf, engineer: Ulid, company: Ulid) -> Self {
        let clock = Arc::new(ManualClock::new(day_before()));
        let engine = Engine::new(
            path,
            BufferPolicy::default(),
            clock.clone(),
            Arc::new(NotifyHub::new()),
        )
        .unwrap();
        Self {
            engine,
            clock,
            engineer,
            company,
        }
    }

    fn engineer_actor(&self) -> Actor {
        Actor::engineer(self.engineer)
    }

    fn company_actor(&self) -> Actor {
        Actor::company(self.company)
    }

    fn request(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> SlotRequest {
        SlotRequest {
            engineer_id: self.engineer,
            company_id: self.company,
            date,
            start_time: start,
            end_time: end,
            kind: AppointmentKind::Advisory,
            location: "Nave 3, Polígono Sur".into(),
            description: "Asesoría en seguridad alimentaria".into(),
        }
    }

    async fn book(&self, start: NaiveTime, end: NaiveTime) -> Result<Appointment, EngineError> {
        self.engine
            .schedule_appointment(self.request(visit_day(), start, end), &self.company_actor())
            .await
    }

    /// Drive a fresh visit to COMPLETADA and return its validation record.
    async fn completed_visit(&self) -> (Appointment, ValidationRecord) {
        let a = self.book(hm(9, 0), hm(11, 0)).await.unwrap();
        for to in [
            AppointmentStatus::Confirmada,
            AppointmentStatus::EnProgreso,
            AppointmentStatus::EnRevision,
            AppointmentStatus::Completada,
        ] {
            self.engine
                .transition_appointment(a.id, to, &self.engineer_actor())
                .await
                .unwrap();
        }
        let record = self.engine.validation_for_appointment(&a.id).await.unwrap();
        (a, record)
    }
}

fn code(err: EngineError) -> RejectionCode {
    err.code()
}

// ── Scheduling ───────────────────────────────────────────

#[tokio::test]
async fn schedule_and_query() {
    let f = Fixture::open(test_wal_path("schedule_query.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    assert_eq!(a.status, AppointmentStatus::Programada);

    assert_eq!(f.engine.get_appointment(&a.id).await.unwrap(), a);
    assert_eq!(f.engine.engineer_day(f.engineer, visit_day()).await, vec![a.clone()]);
    assert_eq!(f.engine.company_appointments(f.company).await, vec![a]);
    assert!(f.engine.company_appointments(Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn touching_visit_needs_transport_buffer() {
    let f = Fixture::open(test_wal_path("buffer.wal"));
    f.book(hm(9, 0), hm(11, 0)).await.unwrap();

    let err = f.book(hm(11, 0), hm(13, 0)).await.unwrap_err();
    let EngineError::Slot(rejection) = err else {
        panic!("expected slot rejection");
    };
    assert_eq!(rejection.code, RejectionCode::InsufficientTransportBuffer);
    assert_eq!(rejection.suggested_boundary, Some(Boundary::EarliestStart(675)));
    assert_eq!(f.engine.engineer_day(f.engineer, visit_day()).await.len(), 1);

    f.book(hm(11, 15), hm(13, 15)).await.unwrap();
    assert_eq!(f.engine.engineer_day(f.engineer, visit_day()).await.len(), 2);
}

#[tokio::test]
async fn overlap_rejected_and_cancellation_frees_slot() {
    let f = Fixture::open(test_wal_path("overlap_cancel.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    assert_eq!(
        code(f.book(hm(10, 0), hm(12, 0)).await.unwrap_err()),
        RejectionCode::SlotOverlap
    );

    f.engine.cancel_appointment(a.id, &f.company_actor()).await.unwrap();
    f.book(hm(10, 0), hm(12, 0)).await.unwrap();
}

#[tokio::test]
async fn other_engineers_do_not_conflict() {
    let f = Fixture::open(test_wal_path("other_engineer.wal"));
    f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    let mut request = f.request(visit_day(), hm(9, 0), hm(11, 0));
    request.engineer_id = Ulid::new();
    f.engine
        .schedule_appointment(request, &f.company_actor())
        .await
        .unwrap();
}

#[tokio::test]
async fn foreign_company_cannot_book() {
    let f = Fixture::open(test_wal_path("foreign_company.wal"));
    let err = f
        .engine
        .schedule_appointment(
            f.request(visit_day(), hm(9, 0), hm(11, 0)),
            &Actor::company(Ulid::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::UnauthorizedActor);
}

#[tokio::test]
async fn blank_location_is_invalid_input() {
    let f = Fixture::open(test_wal_path("blank_location.wal"));
    let mut request = f.request(visit_day(), hm(9, 0), hm(11, 0));
    request.location = "   ".into();
    let err = f
        .engine
        .schedule_appointment(request, &f.company_actor())
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::InvalidInput);
}

#[tokio::test]
async fn lead_time_applies_to_companies_not_admins() {
    let f = Fixture::open(test_wal_path("lead_time.wal"));
    f.clock.set(visit_day().and_time(hm(8, 30)));

    let err = f.book(hm(9, 0), hm(11, 0)).await.unwrap_err();
    assert_eq!(code(err), RejectionCode::InsufficientLeadTime);

    f.engine
        .schedule_appointment(
            f.request(visit_day(), hm(9, 0), hm(11, 0)),
            &Actor::admin(Ulid::new()),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn dry_run_commits_nothing() {
    let f = Fixture::open(test_wal_path("dry_run.wal"));
    let request = f.request(visit_day(), hm(9, 0), hm(11, 0));
    let result = f.engine.check_slot(&request, &f.company_actor()).await.unwrap();
    assert!(result.is_accepted());
    assert!(f.engine.engineer_day(f.engineer, visit_day()).await.is_empty());
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn available_windows_skip_booked_and_buffer() {
    let f = Fixture::open(test_wal_path("windows.wal"));
    f.book(hm(9, 0), hm(11, 0)).await.unwrap();

    let windows = f.engine.available_windows(f.engineer, visit_day(), 120).await;
    assert_eq!(windows, vec![Window::new(300, 525), Window::new(675, 1260)]);
}

#[tokio::test]
async fn available_windows_for_overlong_duration_is_empty() {
    let f = Fixture::open(test_wal_path("windows_overlong.wal"));
    f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    assert!(f.engine.available_windows(f.engineer, visit_day(), 65000).await.is_empty());
}

// ── Rescheduling ─────────────────────────────────────────

#[tokio::test]
async fn reschedule_ignores_own_slot() {
    let f = Fixture::open(test_wal_path("reschedule_self.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    let moved = f
        .engine
        .reschedule_appointment(a.id, visit_day(), hm(9, 30), hm(11, 30), &f.company_actor())
        .await
        .unwrap();
    assert_eq!(moved.range.start_minute(), 570);
    assert_eq!(f.engine.engineer_day(f.engineer, visit_day()).await, vec![moved]);
}

#[tokio::test]
async fn reschedule_to_another_day_moves_the_visit() {
    let f = Fixture::open(test_wal_path("reschedule_day.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    let next = visit_day().succ_opt().unwrap();

    let moved = f
        .engine
        .reschedule_appointment(a.id, next, hm(15, 0), hm(17, 0), &f.engineer_actor())
        .await
        .unwrap();
    assert_eq!(moved.range.date(), next);
    assert!(f.engine.engineer_day(f.engineer, visit_day()).await.is_empty());
    assert_eq!(f.engine.engineer_day(f.engineer, next).await, vec![moved.clone()]);
    assert_eq!(f.engine.get_appointment(&a.id).await.unwrap(), moved);

    // the old day is free again
    f.book(hm(9, 0), hm(11, 0)).await.unwrap();
}

#[tokio::test]
async fn company_reschedule_unconfirms() {
    let f = Fixture::open(test_wal_path("reschedule_unconfirm.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    f.engine
        .transition_appointment(a.id, AppointmentStatus::Confirmada, &f.engineer_actor())
        .await
        .unwrap();

    let moved = f
        .engine
        .reschedule_appointment(a.id, visit_day(), hm(12, 0), hm(14, 0), &f.company_actor())
        .await
        .unwrap();
    assert_eq!(moved.status, AppointmentStatus::Programada);
}

#[tokio::test]
async fn reschedule_into_conflict_leaves_visit_untouched() {
    let f = Fixture::open(test_wal_path("reschedule_conflict.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    f.book(hm(14, 0), hm(16, 0)).await.unwrap();

    let err = f
        .engine
        .reschedule_appointment(a.id, visit_day(), hm(12, 0), hm(14, 0), &f.company_actor())
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::InsufficientTransportBuffer);
    assert_eq!(f.engine.get_appointment(&a.id).await.unwrap(), a);
}

#[tokio::test]
async fn unknown_appointment_is_not_found() {
    let f = Fixture::open(test_wal_path("unknown.wal"));
    let id = Ulid::new();
    let err = f
        .engine
        .transition_appointment(id, AppointmentStatus::Confirmada, &f.engineer_actor())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(got) if got == id));
}

// ── Status lifecycle ─────────────────────────────────────

#[tokio::test]
async fn late_cancellation_needs_admin() {
    let f = Fixture::open(test_wal_path("late_cancel.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    f.clock.set(visit_day().and_time(hm(8, 0)));

    let err = f
        .engine
        .cancel_appointment(a.id, &f.company_actor())
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::InsufficientLeadTime);

    let cancelled = f
        .engine
        .cancel_appointment(a.id, &Actor::admin(Ulid::new()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelada);
}

#[tokio::test]
async fn skipping_a_status_is_rejected() {
    let f = Fixture::open(test_wal_path("skip_status.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    let err = f
        .engine
        .transition_appointment(a.id, AppointmentStatus::Completada, &f.engineer_actor())
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::InvalidStateTransition);
    assert!(f.engine.validation_for_appointment(&a.id).await.is_none());
}

#[tokio::test]
async fn completion_opens_validation_record() {
    let f = Fixture::open(test_wal_path("completion.wal"));
    let (a, record) = f.completed_visit().await;

    assert_eq!(
        f.engine.get_appointment(&a.id).await.unwrap().status,
        AppointmentStatus::Completada
    );
    assert_eq!(record.appointment_id, a.id);
    assert_eq!(record.status, ValidationStatus::PendienteDocumentacion);
    assert!(record.documents.is_empty());
    assert_eq!(
        f.engine.get_validation_record(&record.id).await.unwrap(),
        record
    );
    assert!(
        f.engine
            .appointment_targets(&a.id, &f.engineer_actor())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn subscribers_see_commits() {
    let f = Fixture::open(test_wal_path("notify.wal"));
    let mut rx = f.engine.notify.subscribe(f.company);
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    let event = rx.recv().await.unwrap();
    assert_eq!(event, Event::AppointmentScheduled { appointment: a });
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn correction_loop_then_completion() {
    let f = Fixture::open(test_wal_path("validation_flow.wal"));
    let (_, record) = f.completed_visit().await;
    let admin = Actor::admin(Ulid::new());
    let vid = record.id;

    let invoice = f
        .engine
        .upload_document(vid, "factura.pdf".into(), &f.company_actor())
        .await
        .unwrap();
    let plan = f
        .engine
        .upload_document(vid, "plan_appcc.pdf".into(), &f.company_actor())
        .await
        .unwrap();
    let act = f
        .engine
        .attach_act(vid, "acta_visita.pdf".into(), &f.engineer_actor())
        .await
        .unwrap();
    f.engine
        .submit_documents(vid, Submission::Uploaded, &f.company_actor())
        .await
        .unwrap();

    f.engine
        .review_document(vid, invoice.id, ReviewDecision::Approve, &admin)
        .await
        .unwrap();
    let err = f.engine.finalize_review(vid, &admin).await.unwrap_err();
    assert!(matches!(err, EngineError::DocumentsPendingReview { pending: 1 }));

    f.engine
        .review_document(
            vid,
            plan.id,
            ReviewDecision::Reject {
                reason: "Falta la firma".into(),
            },
            &admin,
        )
        .await
        .unwrap();
    let r = f.engine.finalize_review(vid, &admin).await.unwrap();
    assert_eq!(r.status, ValidationStatus::RequiereCorrecciones);

    let r = f
        .engine
        .replace_document(vid, plan.id, &f.company_actor())
        .await
        .unwrap();
    assert_eq!(r.status, ValidationStatus::EnRevision);
    let replaced = r.document(&plan.id).unwrap();
    assert_eq!(replaced.version, 2);
    assert_eq!(replaced.status, DocumentStatus::Pending);

    f.engine
        .review_document(vid, plan.id, ReviewDecision::Approve, &admin)
        .await
        .unwrap();
    let r = f.engine.finalize_review(vid, &admin).await.unwrap();
    assert_eq!(r.status, ValidationStatus::Aprobado);

    let err = f.engine.complete_validation(vid, &admin).await.unwrap_err();
    assert_eq!(code(err), RejectionCode::ActNotAccepted);

    f.engine
        .review_document(vid, act.id, ReviewDecision::Approve, &admin)
        .await
        .unwrap();
    let r = f.engine.complete_validation(vid, &admin).await.unwrap();
    assert_eq!(r.status, ValidationStatus::Completado);
}

#[tokio::test]
async fn rejected_validation_op_changes_nothing() {
    let f = Fixture::open(test_wal_path("validation_noop.wal"));
    let (_, record) = f.completed_visit().await;
    let before = f.engine.wal_appends_since_compact().await;

    let err = f
        .engine
        .upload_document(record.id, "x.pdf".into(), &f.engineer_actor())
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::UnauthorizedActor);
    assert_eq!(
        f.engine.get_validation_record(&record.id).await.unwrap(),
        record
    );
    assert_eq!(f.engine.wal_appends_since_compact().await, before);
}

// ── Persistence ──────────────────────────────────────────

async fn build_history(f: &Fixture) -> (Appointment, Appointment, ValidationRecord) {
    let (done, record) = f.completed_visit().await;
    let doc = f
        .engine
        .upload_document(record.id, "registro.pdf".into(), &f.company_actor())
        .await
        .unwrap();
    f.engine
        .submit_documents(record.id, Submission::Uploaded, &f.company_actor())
        .await
        .unwrap();
    f.engine
        .review_document(record.id, doc.id, ReviewDecision::Approve, &Actor::admin(Ulid::new()))
        .await
        .unwrap();

    let other = f.book(hm(14, 0), hm(16, 0)).await.unwrap();
    let moved = f
        .engine
        .reschedule_appointment(
            other.id,
            visit_day().succ_opt().unwrap(),
            hm(10, 0),
            hm(12, 0),
            &f.company_actor(),
        )
        .await
        .unwrap();
    let record = f.engine.get_validation_record(&record.id).await.unwrap();
    let done = f.engine.get_appointment(&done.id).await.unwrap();
    (done, moved, record)
}

async fn assert_restored(f: &Fixture, done: &Appointment, moved: &Appointment, record: &ValidationRecord) {
    assert_eq!(f.engine.get_appointment(&done.id).await.as_ref(), Some(done));
    assert_eq!(f.engine.get_appointment(&moved.id).await.as_ref(), Some(moved));
    assert_eq!(
        f.engine.engineer_day(f.engineer, moved.range.date()).await,
        vec![moved.clone()]
    );
    assert_eq!(
        f.engine.validation_for_appointment(&done.id).await.as_ref(),
        Some(record)
    );
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let f = Fixture::open(path.clone());
    let (engineer, company) = (f.engineer, f.company);
    let (done, moved, record) = build_history(&f).await;
    drop(f);

    let f = Fixture::reopen(path, engineer, company);
    assert_restored(&f, &done, &moved, &record).await;
}

#[tokio::test]
async fn commits_after_a_torn_tail_survive_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail_restart.wal");
    let f = Fixture::open(path.clone());
    let (engineer, company) = (f.engineer, f.company);
    let first = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    drop(f);

    // crash mid-append
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(&[7, 0, 0])
        .unwrap();

    let f = Fixture::reopen(path.clone(), engineer, company);
    let second = f.book(hm(13, 0), hm(15, 0)).await.unwrap();
    drop(f);

    let f = Fixture::reopen(path, engineer, company);
    assert_eq!(f.engine.get_appointment(&first.id).await, Some(first));
    assert_eq!(f.engine.get_appointment(&second.id).await, Some(second));
    assert_eq!(
        code(f.book(hm(13, 0), hm(15, 0)).await.unwrap_err()),
        RejectionCode::SlotOverlap
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let f = Fixture::open(path.clone());
    let (engineer, company) = (f.engineer, f.company);
    let (done, moved, record) = build_history(&f).await;
    let size_before = std::fs::metadata(&path).unwrap().len();

    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < size_before);
    assert_restored(&f, &done, &moved, &record).await;
    drop(f);

    let f = Fixture::reopen(path, engineer, company);
    assert_restored(&f, &done, &moved, &record).await;
}

#[tokio::test]
async fn clock_advance_expires_reschedule_window() {
    let f = Fixture::open(test_wal_path("reschedule_lead.wal"));
    let a = f.book(hm(9, 0), hm(11, 0)).await.unwrap();
    f.clock.advance(TimeDelta::hours(25) + TimeDelta::minutes(30));

    let err = f
        .engine
        .reschedule_appointment(a.id, visit_day(), hm(12, 0), hm(14, 0), &f.company_actor())
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectionCode::InsufficientLeadTime);
}
