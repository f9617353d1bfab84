mod availability;
pub mod conflict;
mod error;
mod mutations;
mod queries;
mod validation;
#[cfg(test)]
mod tests;

pub use availability::{Window, fitting_windows, free_windows, merge_overlapping, subtract_windows};
pub use conflict::{CheckContext, ConflictResult, check};
pub use error::{Boundary, EngineError, Rejection, RejectionCode, SlotRejection};
pub use mutations::SlotRequest;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::compactor::run_compactor;
use crate::config::EngineConfig;
use crate::lifecycle::validation as validation_lifecycle;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::policy::BufferPolicy;
use crate::wal::Wal;

pub type SharedDaySchedule = Arc<RwLock<DaySchedule>>;
pub type SharedValidationRecord = Arc<RwLock<ValidationRecord>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is running are written
/// and fsynced together, then every sender gets the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All or nothing: a batch whose encoding or write fails leaves no record
/// behind for replay, matching the error every sender receives.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    if let Err(e) = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
    {
        wal.discard_pending();
        return Err(e);
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Event application ────────────────────────────────────

/// Apply an appointment event that stays within one day (caller holds the lock).
fn apply_to_day(day: &mut DaySchedule, event: &Event) {
    match event {
        Event::AppointmentScheduled { appointment } => day.insert(appointment.clone()),
        Event::AppointmentStatusChanged { id, status } => {
            if let Some(a) = day.get_mut(id) {
                a.status = *status;
            }
        }
        Event::AppointmentCompleted { id, .. } => {
            if let Some(a) = day.get_mut(id) {
                a.status = AppointmentStatus::Completada;
            }
        }
        Event::AppointmentRescheduled { id, range, status } => {
            if let Some(mut a) = day.remove(*id) {
                a.range = *range;
                a.status = *status;
                day.insert(a);
            }
        }
        _ => {}
    }
}

/// Apply a reschedule that changes the date (caller holds both locks).
fn move_between_days(from: &mut DaySchedule, to: &mut DaySchedule, event: &Event) {
    if let Event::AppointmentRescheduled { id, range, status } = event
        && let Some(mut a) = from.remove(*id)
    {
        a.range = *range;
        a.status = *status;
        to.insert(a);
    }
}

/// Plain-map state rebuilt from the WAL before anything is shared.
#[derive(Default)]
struct Replay {
    days: HashMap<DayKey, DaySchedule>,
    index: HashMap<Ulid, DayKey>,
    records: HashMap<Ulid, ValidationRecord>,
}

impl Replay {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::AppointmentScheduled { appointment } => {
                let key = appointment.day_key();
                self.index.insert(appointment.id, key);
                self.days
                    .entry(key)
                    .or_insert_with(|| DaySchedule::new(key))
                    .insert(appointment.clone());
            }
            Event::AppointmentRescheduled { id, range, .. } => {
                let Some(old) = self.index.get(id).copied() else { return };
                let new = DayKey::new(old.engineer_id, range.date());
                if old == new {
                    if let Some(day) = self.days.get_mut(&old) {
                        apply_to_day(day, event);
                    }
                    return;
                }
                let mut to = self.days.remove(&new).unwrap_or_else(|| DaySchedule::new(new));
                if let Some(from) = self.days.get_mut(&old) {
                    move_between_days(from, &mut to, event);
                }
                self.days.insert(new, to);
                self.index.insert(*id, new);
            }
            Event::AppointmentStatusChanged { id, .. } => {
                if let Some(day) = self.index.get(id).and_then(|k| self.days.get_mut(k)) {
                    apply_to_day(day, event);
                }
            }
            Event::AppointmentCompleted { id, validation_id } => {
                let Some(day) = self.index.get(id).and_then(|k| self.days.get_mut(k)) else {
                    return;
                };
                apply_to_day(day, event);
                if let Some(a) = day.get(id) {
                    self.records
                        .insert(*validation_id, ValidationRecord::opened_for(*validation_id, a));
                }
            }
            Event::ValidationRestored { record } => {
                self.records.insert(record.id, record.clone());
            }
            other => {
                if let Some(record) = other.validation_id().and_then(|id| self.records.get_mut(&id)) {
                    validation_lifecycle::apply(record, other);
                }
            }
        }
    }
}

/// Write guards for the day(s) a reschedule touches.
pub(super) enum DayGuards {
    Same(OwnedRwLockWriteGuard<DaySchedule>),
    Moved {
        from: OwnedRwLockWriteGuard<DaySchedule>,
        to: OwnedRwLockWriteGuard<DaySchedule>,
    },
}

impl DayGuards {
    pub(super) fn source(&self) -> &DaySchedule {
        match self {
            DayGuards::Same(g) => g,
            DayGuards::Moved { from, .. } => from,
        }
    }

    pub(super) fn target(&self) -> &DaySchedule {
        match self {
            DayGuards::Same(g) => g,
            DayGuards::Moved { to, .. } => to,
        }
    }
}

pub struct Engine {
    pub(super) days: DashMap<DayKey, SharedDaySchedule>,
    /// Reverse lookup: appointment id → the day holding it.
    pub(super) appointment_index: DashMap<Ulid, DayKey>,
    pub(super) validations: DashMap<Ulid, SharedValidationRecord>,
    pub(super) validation_by_appointment: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: BufferPolicy,
    pub(super) clock: Arc<dyn Clock>,
    /// Held shared by every commit and exclusively by compaction, so no event
    /// lands between the snapshot and the file swap.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        policy: BufferPolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replay = Replay::default();
        for event in &events {
            replay.apply(event);
        }

        let engine = Self {
            days: DashMap::new(),
            appointment_index: DashMap::new(),
            validations: DashMap::new(),
            validation_by_appointment: DashMap::new(),
            wal_tx,
            notify,
            policy,
            clock,
            commit_gate: RwLock::new(()),
        };
        for (key, day) in replay.days {
            engine.days.insert(key, Arc::new(RwLock::new(day)));
        }
        for (id, key) in replay.index {
            engine.appointment_index.insert(id, key);
        }
        for (id, record) in replay.records {
            engine.validation_by_appointment.insert(record.appointment_id, id);
            engine.validations.insert(id, Arc::new(RwLock::new(record)));
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            appointments = engine.appointment_index.len(),
            validations = engine.validations.len(),
            "engine state restored"
        );
        Ok(engine)
    }

    /// Open the engine described by `config` under the system clock and
    /// start the background compactor when a threshold is set.
    pub fn open(config: &EngineConfig) -> io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Arc::new(Self::new(
            config.wal_path(),
            config.policy,
            Arc::new(SystemClock),
            Arc::new(NotifyHub::new()),
        )?);
        if config.compact_threshold > 0 {
            tokio::spawn(run_compactor(
                engine.clone(),
                config.compact_threshold,
                config.compact_interval,
            ));
        }
        Ok(engine)
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn day_entry(&self, key: DayKey) -> SharedDaySchedule {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key))))
            .value()
            .clone()
    }

    pub(super) fn get_day(&self, key: &DayKey) -> Option<SharedDaySchedule> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub(super) fn get_validation(&self, id: &Ulid) -> Option<SharedValidationRecord> {
        self.validations.get(id).map(|e| e.value().clone())
    }

    /// Lock the day holding `id`. Re-checks after locking because a
    /// concurrent reschedule may have moved the visit to another day.
    pub(super) async fn lock_appointment_day(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DaySchedule>, EngineError> {
        loop {
            let key = self
                .appointment_index
                .get(id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(*id))?;
            let day = self.get_day(&key).ok_or(EngineError::NotFound(*id))?;
            let guard = day.write_owned().await;
            if guard.contains(id) {
                return Ok(guard);
            }
            debug!(%id, "appointment moved while locking; retrying");
        }
    }

    /// Lock the current day of `id` and the day `date`, in key order.
    pub(super) async fn lock_reschedule_days(
        &self,
        id: &Ulid,
        date: chrono::NaiveDate,
    ) -> Result<DayGuards, EngineError> {
        loop {
            let old = self
                .appointment_index
                .get(id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(*id))?;
            let new = DayKey::new(old.engineer_id, date);
            if old == new {
                let guard = self.lock_appointment_day(id).await?;
                if guard.key == new {
                    return Ok(DayGuards::Same(guard));
                }
                continue;
            }

            let old_day = self.get_day(&old).ok_or(EngineError::NotFound(*id))?;
            let new_day = self.day_entry(new);
            let (from, to) = if old < new {
                let from = old_day.write_owned().await;
                (from, new_day.write_owned().await)
            } else {
                let to = new_day.write_owned().await;
                (old_day.write_owned().await, to)
            };
            if from.contains(id) {
                return Ok(DayGuards::Moved { from, to });
            }
            debug!(%id, "appointment moved while locking; retrying");
        }
    }

    /// WAL-append, apply and publish an event confined to one day.
    pub(super) async fn persist_and_apply_day(
        &self,
        day: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event);
        match event {
            Event::AppointmentScheduled { appointment } => {
                self.appointment_index.insert(appointment.id, day.key);
            }
            Event::AppointmentCompleted { id, validation_id } => {
                if let Some(a) = day.get(id) {
                    let record = ValidationRecord::opened_for(*validation_id, a);
                    self.validation_by_appointment.insert(*id, *validation_id);
                    self.validations
                        .insert(*validation_id, Arc::new(RwLock::new(record)));
                    info!(appointment = %id, validation = %validation_id, "validation record opened");
                }
            }
            _ => {}
        }
        self.published(day.key.engineer_id, event_company(day, event), event);
        Ok(())
    }

    /// WAL-append, apply and publish a reschedule across two days.
    pub(super) async fn persist_and_move(
        &self,
        from: &mut DaySchedule,
        to: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        move_between_days(from, to, event);
        if let Event::AppointmentRescheduled { id, .. } = event {
            self.appointment_index.insert(*id, to.key);
        }
        self.published(to.key.engineer_id, event_company(to, event), event);
        Ok(())
    }

    /// WAL-append, apply and publish an event on one validation record.
    pub(super) async fn persist_and_apply_record(
        &self,
        record: &mut ValidationRecord,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        validation_lifecycle::apply(record, event);
        self.published(record.engineer_id, Some(record.company_id), event);
        Ok(())
    }

    fn published(&self, engineer_id: Ulid, company_id: Option<Ulid>, event: &Event) {
        metrics::counter!(observability::EVENTS_COMMITTED_TOTAL, "event" => event.label()).increment(1);
        debug!(event = event.label(), "committed");
        self.notify
            .publish(engineer_id, company_id.unwrap_or(engineer_id), event);
    }
}

/// Company of the appointment an applied day event refers to.
fn event_company(day: &DaySchedule, event: &Event) -> Option<Ulid> {
    let id = match event {
        Event::AppointmentScheduled { appointment } => return Some(appointment.company_id),
        Event::AppointmentRescheduled { id, .. }
        | Event::AppointmentStatusChanged { id, .. }
        | Event::AppointmentCompleted { id, .. } => id,
        _ => return None,
    };
    day.get(id).map(|a| a.company_id)
}
