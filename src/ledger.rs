//! Reminder ledger
//!
//! Owns the lifecycle of [`ReminderInstance`] records:
//!
//! ```text
//! sent ──reply──▶ taken | not_taken | postponed
//!   │                                   │
//!   └─delivery failed─▶ error           └─spawns─▶ scheduled_postponed ──dispatcher──▶ sent
//! ```
//!
//! `taken`, `not_taken`, `postponed` and `error` are terminal. The pending
//! reminder for a patient is always the newest `sent` one; nothing else
//! enforces uniqueness.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{AppError, AppResult, DeliveryError};
use crate::models::{Medication, Patient, ReminderInstance, ReminderStatus, SentMessage};

#[derive(Clone)]
pub struct ReminderLedger {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl ReminderLedger {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// New `sent` reminder, not yet persisted. Dispatcher ticks write these
    /// together through [`commit_batch`](Self::commit_batch).
    pub fn create(&self, medication: &Medication, patient: &Patient, scheduled_time: &str) -> ReminderInstance {
        ReminderInstance {
            id: Uuid::new_v4().to_string(),
            medication_id: medication.id.clone(),
            patient_id: patient.id.clone(),
            created_at: self.clock.now(),
            status: ReminderStatus::Sent,
            attempt: 1,
            scheduled_time: scheduled_time.to_string(),
            message_sid: None,
            delivery_status: None,
            response_code: None,
            responded_at: None,
            postpone_count: None,
            delay_minutes: None,
            due_at: None,
            error_detail: None,
        }
    }

    #[cfg(test)]
    pub fn create_and_store(
        &self,
        medication: &Medication,
        patient: &Patient,
        scheduled_time: &str,
    ) -> AppResult<ReminderInstance> {
        let reminder = self.create(medication, patient, scheduled_time);
        self.db.insert_reminder(&reminder)?;
        Ok(reminder)
    }

    /// One atomic write for a tick: fresh reminders plus postponed ones
    /// promoted to `sent`. Returns the ids of the promotions that applied;
    /// a reminder another tick already promoted is left out.
    pub fn commit_batch(&self, created: &[ReminderInstance], promoted: &[ReminderInstance]) -> AppResult<Vec<String>> {
        if created.is_empty() && promoted.is_empty() {
            return Ok(Vec::new());
        }
        self.db.commit_reminder_batch(created, promoted)
    }

    /// Success stores the gateway id; failure is terminal (`error`).
    pub fn record_delivery_outcome(
        &self,
        reminder_id: &str,
        result: &Result<SentMessage, DeliveryError>,
    ) -> AppResult<()> {
        match result {
            Ok(message) => {
                self.db.mark_delivered(reminder_id, &message.id, &message.status)?;
                log::info!("Reminder {} delivered as {} ({})", reminder_id, message.id, message.status);
            }
            Err(e) => {
                self.db.mark_delivery_failed(reminder_id, &e.to_string())?;
                log::warn!("Reminder {} delivery failed: {}", reminder_id, e);
            }
        }
        Ok(())
    }

    pub fn latest_pending(&self, patient_id: &str) -> AppResult<Option<ReminderInstance>> {
        self.db.latest_reminder_with_status(patient_id, ReminderStatus::Sent)
    }

    /// Reply-driven transition out of `sent`. Returns false when the reminder
    /// had already left `sent` (a concurrent reply or a failed delivery won).
    pub fn transition(&self, reminder_id: &str, new_status: ReminderStatus, response_code: &str) -> AppResult<bool> {
        if !ReminderStatus::Sent.accepts_reply(new_status) {
            return Err(AppError::InvalidInput(format!(
                "{} is not a reply transition",
                new_status
            )));
        }

        let applied = self
            .db
            .update_reminder_response(reminder_id, new_status, response_code, self.clock.now())?;
        if applied {
            log::info!("Reminder {} -> {} (reply {})", reminder_id, new_status, response_code);
        } else {
            match self.db.get_reminder(reminder_id)? {
                Some(current) if current.status.is_terminal() => log::warn!(
                    "Reminder {} already {}; reply {} not applied",
                    reminder_id,
                    current.status,
                    response_code
                ),
                _ => log::warn!("Reminder {} not pending; reply {} not applied", reminder_id, response_code),
            }
        }
        Ok(applied)
    }

    /// Follow-up for a postponed reminder, due `delay_minutes` from now.
    pub fn create_postponed(&self, original: &ReminderInstance, delay_minutes: i64) -> AppResult<ReminderInstance> {
        let now = self.clock.now();
        let due_at = Duration::try_minutes(delay_minutes)
            .filter(|delay| *delay > Duration::zero())
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| AppError::InvalidInput(format!("invalid postpone delay: {} minutes", delay_minutes)))?;
        let follow_up = ReminderInstance {
            id: Uuid::new_v4().to_string(),
            medication_id: original.medication_id.clone(),
            patient_id: original.patient_id.clone(),
            created_at: now,
            status: ReminderStatus::ScheduledPostponed,
            attempt: 1,
            scheduled_time: original.scheduled_time.clone(),
            message_sid: None,
            delivery_status: None,
            response_code: None,
            responded_at: None,
            postpone_count: Some(original.postpone_count.unwrap_or(0) + 1),
            delay_minutes: Some(delay_minutes),
            due_at: Some(due_at),
            error_detail: None,
        };
        self.db.insert_reminder(&follow_up)?;

        log::info!(
            "Reminder {} postponed {} min as {} (scheduled {})",
            original.id,
            delay_minutes,
            follow_up.id,
            follow_up.scheduled_time
        );
        Ok(follow_up)
    }

    /// Postponed reminders whose delay has elapsed, oldest first.
    pub fn due_postponed(&self, now: DateTime<Utc>) -> AppResult<Vec<ReminderInstance>> {
        self.db.list_due_postponed(now)
    }

    /// `scheduled_postponed` → `sent`, in memory. Persisted by `commit_batch`.
    /// Restamped with the send time so a reply goes to the reminder the
    /// patient received last.
    pub fn promote(&self, reminder: &ReminderInstance) -> ReminderInstance {
        ReminderInstance {
            status: ReminderStatus::Sent,
            attempt: 1,
            created_at: self.clock.now(),
            ..reminder.clone()
        }
    }

    pub fn get(&self, reminder_id: &str) -> AppResult<Option<ReminderInstance>> {
        self.db.get_reminder(reminder_id)
    }
}
