use chrono::NaiveDate;
use ulid::Ulid;

use crate::lifecycle::appointment::available_targets;
use crate::model::*;
use crate::policy::SlotOperation;

use super::availability::{fitting_windows, free_windows};
use super::conflict::{CheckContext, ConflictResult, check};
use super::{Engine, EngineError, SlotRequest, Window};

impl Engine {
    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        loop {
            let key = self.appointment_index.get(id).map(|e| *e.value())?;
            let day = self.get_day(&key)?;
            let guard = day.read().await;
            if let Some(a) = guard.get(id) {
                return Some(a.clone());
            }
            // moved by a concurrent reschedule
        }
    }

    /// The engineer's visits on `date`, cancelled ones included, by start.
    pub async fn engineer_day(&self, engineer_id: Ulid, date: NaiveDate) -> Vec<Appointment> {
        match self.get_day(&DayKey::new(engineer_id, date)) {
            Some(day) => day.read().await.appointments.clone(),
            None => Vec::new(),
        }
    }

    /// Every visit owned by `company_id`, ordered by date then start.
    pub async fn company_appointments(&self, company_id: Ulid) -> Vec<Appointment> {
        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for day in days {
            let guard = day.read().await;
            out.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.company_id == company_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.range.date(), a.range.start_minute(), a.id));
        out
    }

    pub async fn get_validation_record(&self, id: &Ulid) -> Option<ValidationRecord> {
        let record = self.get_validation(id)?;
        let guard = record.read().await;
        Some(guard.clone())
    }

    pub async fn validation_for_appointment(&self, appointment_id: &Ulid) -> Option<ValidationRecord> {
        let id = self
            .validation_by_appointment
            .get(appointment_id)
            .map(|e| *e.value())?;
        self.get_validation_record(&id).await
    }

    /// Windows on `date` that can hold a visit of `duration` minutes without
    /// breaking the overlap, buffer or start-window rules.
    pub async fn available_windows(
        &self,
        engineer_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    ) -> Vec<Window> {
        let existing = match self.get_day(&DayKey::new(engineer_id, date)) {
            Some(day) => day.read().await.booked_slots(None),
            None => Vec::new(),
        };
        let free = free_windows(&self.policy, date, &existing);
        fitting_windows(&self.policy, &free, duration)
    }

    /// Dry-run of the slot rules for a proposed visit. Nothing is locked
    /// past the read, so an accepted answer can still lose a later race.
    pub async fn check_slot(
        &self,
        request: &SlotRequest,
        actor: &Actor,
    ) -> Result<ConflictResult, EngineError> {
        let range = TimeRange::from_times(request.date, request.start_time, request.end_time)?;
        let existing = match self.get_day(&DayKey::new(request.engineer_id, request.date)) {
            Some(day) => day.read().await.booked_slots(None),
            None => Vec::new(),
        };
        let ctx = CheckContext {
            operation: SlotOperation::Create,
            kind: request.kind,
            role: actor.role,
            now: self.clock.now(),
        };
        Ok(check(&self.policy, &range, &existing, &ctx))
    }

    /// Statuses `actor` may move the visit to from where it stands now.
    pub async fn appointment_targets(
        &self,
        id: &Ulid,
        actor: &Actor,
    ) -> Result<Vec<AppointmentStatus>, EngineError> {
        let appointment = self
            .get_appointment(id)
            .await
            .ok_or(EngineError::NotFound(*id))?;
        Ok(available_targets(&appointment, actor))
    }
}
