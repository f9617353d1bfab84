use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::lifecycle::appointment::{AppointmentTransition, plan_creation, plan_reschedule, plan_transition};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{DayGuards, Engine, EngineError, WalCommand};

/// A proposed visit, as submitted by a company or an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequest {
    pub engineer_id: Ulid,
    pub company_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(rename = "type")]
    pub kind: AppointmentKind,
    pub location: String,
    #[serde(default)]
    pub description: String,
}

impl SlotRequest {
    fn validate_text(&self) -> Result<(), EngineError> {
        if self.location.trim().is_empty() {
            return Err(EngineError::InvalidInput("location is required"));
        }
        if self.location.len() > MAX_LOCATION_LEN {
            return Err(EngineError::LimitExceeded("location too long"));
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        Ok(())
    }
}

impl Engine {
    /// Book a new PROGRAMADA visit if it clears every slot rule against the
    /// engineer's day. Check and commit happen under the same day lock.
    pub async fn schedule_appointment(
        &self,
        request: SlotRequest,
        actor: &Actor,
    ) -> Result<Appointment, EngineError> {
        request.validate_text()?;
        let range = TimeRange::from_times(request.date, request.start_time, request.end_time)
            .inspect_err(|e| observability::rejected("schedule", e))?;
        let appointment = Appointment {
            id: Ulid::new(),
            engineer_id: request.engineer_id,
            company_id: request.company_id,
            range,
            kind: request.kind,
            status: AppointmentStatus::Programada,
            location: request.location,
            description: request.description,
        };

        let _gate = self.commit_gate.read().await;
        let day = self.day_entry(appointment.day_key());
        let mut guard = day.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on day"));
        }
        let existing = guard.booked_slots(None);
        let event = plan_creation(appointment.clone(), actor, &self.policy, &existing, self.clock.now())
            .inspect_err(|e| observability::rejected("schedule", e))?;
        self.persist_and_apply_day(&mut guard, &event).await?;
        info!(
            id = %appointment.id,
            engineer = %appointment.engineer_id,
            slot = %appointment.range,
            "appointment scheduled"
        );
        Ok(appointment)
    }

    /// Move a PROGRAMADA or CONFIRMADA visit to a new slot, possibly on
    /// another day. The visit's own current slot never conflicts with itself.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        actor: &Actor,
    ) -> Result<Appointment, EngineError> {
        let range = TimeRange::from_times(date, start_time, end_time)
            .inspect_err(|e| observability::rejected("reschedule", e))?;

        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_reschedule_days(&id, date).await?;
        let appointment = guards
            .source()
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let target = guards.target();
        if matches!(guards, DayGuards::Moved { .. })
            && target.appointments.len() >= MAX_APPOINTMENTS_PER_DAY
        {
            return Err(EngineError::LimitExceeded("too many appointments on day"));
        }
        let existing = target.booked_slots(Some(id));
        let event = plan_reschedule(&appointment, range, actor, &self.policy, &existing, self.clock.now())
            .inspect_err(|e| observability::rejected("reschedule", e))?;

        let updated = match &mut guards {
            DayGuards::Same(day) => {
                self.persist_and_apply_day(day, &event).await?;
                day.get(&id).cloned()
            }
            DayGuards::Moved { from, to } => {
                self.persist_and_move(from, to, &event).await?;
                to.get(&id).cloned()
            }
        };
        let updated = updated.ok_or(EngineError::NotFound(id))?;
        info!(%id, from = %appointment.range, to = %updated.range, status = %updated.status, "appointment rescheduled");
        Ok(updated)
    }

    /// Request a status change. Reaching COMPLETADA opens the visit's
    /// validation record in the same commit.
    pub async fn transition_appointment(
        &self,
        id: Ulid,
        to: AppointmentStatus,
        actor: &Actor,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_appointment_day(&id).await?;
        let appointment = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let transition = plan_transition(&appointment, to, actor, &self.policy, self.clock.now())
            .inspect_err(|e| observability::rejected("transition", e))?;

        let event = match transition {
            AppointmentTransition::Status(status) => Event::AppointmentStatusChanged { id, status },
            AppointmentTransition::Complete => {
                if let Some(existing) = self.validation_by_appointment.get(&id) {
                    return Err(EngineError::AlreadyExists(*existing.value()));
                }
                Event::AppointmentCompleted {
                    id,
                    validation_id: Ulid::new(),
                }
            }
        };
        self.persist_and_apply_day(&mut guard, &event).await?;
        info!(%id, from = %appointment.status, %to, "appointment status changed");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_appointment(&self, id: Ulid, actor: &Actor) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentStatus::Cancelada, actor)
            .await
    }

    /// Rewrite the WAL with only the events needed to rebuild current state:
    /// one `AppointmentScheduled` per visit, one snapshot per validation record.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(key, _)| *key);
        for (_, day) in days {
            let guard = day.read().await;
            events.extend(guard.appointments.iter().map(|a| Event::AppointmentScheduled {
                appointment: a.clone(),
            }));
        }

        let records: Vec<_> = self.validations.iter().map(|e| e.value().clone()).collect();
        for record in records {
            let guard = record.read().await;
            events.push(Event::ValidationRestored { record: guard.clone() });
        }

        let snapshot_len = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = snapshot_len, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
