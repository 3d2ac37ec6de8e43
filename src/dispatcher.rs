//! Reminder dispatcher
//!
//! Called once per tick. Finds medications due at the current local minute,
//! promotes postponed reminders whose delay has elapsed, commits both in one
//! batch and only then talks to the gateway.

use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::clock::Calendar;
use crate::config::Config;
use crate::db::Database;
use crate::error::AppResult;
use crate::gateway::MessageGateway;
use crate::ledger::ReminderLedger;
use crate::models::{Medication, Patient, ReminderInstance};
use crate::schedule;
use crate::templates;

/// What a single tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub created: usize,
    pub promoted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        self.created == 0 && self.promoted == 0 && self.skipped == 0
    }
}

struct Outbound {
    reminder: ReminderInstance,
    patient: Patient,
    medication: Medication,
    promoted: bool,
}

pub struct Dispatcher {
    db: Database,
    ledger: ReminderLedger,
    gateway: Arc<dyn MessageGateway>,
    calendar: Calendar,
    country_code: String,
    postpone_delay_minutes: i64,
    last_fired_minute: Mutex<Option<String>>,
}

impl Dispatcher {
    pub fn new(db: Database, gateway: Arc<dyn MessageGateway>, calendar: Calendar, config: &Config) -> Self {
        let ledger = ReminderLedger::new(db.clone(), calendar.clock());
        Self {
            db,
            ledger,
            gateway,
            calendar,
            country_code: config.country_code.clone(),
            postpone_delay_minutes: config.postpone_delay_minutes,
            last_fired_minute: Mutex::new(None),
        }
    }

    pub fn ledger(&self) -> &ReminderLedger {
        &self.ledger
    }

    pub async fn run_tick(&self) -> AppResult<TickSummary> {
        let mut summary = TickSummary::default();
        let current_day = self.calendar.now_day_of_week();
        let current_time = self.calendar.now_time_of_day();

        let mut outbound = Vec::new();
        let mut created = Vec::new();
        let mut promoted = Vec::new();

        let minute = format!("{} {}", self.calendar.local_now().date_naive(), current_time);
        let fresh_minute = !self.minute_fired(&minute);

        if fresh_minute {
            let medications = self.db.list_active_medications()?;
            for medication in medications
                .into_iter()
                .filter(|m| schedule::is_due(m, current_day, &current_time))
            {
                let patient = match self.db.get_patient(&medication.patient_id) {
                    Ok(Some(p)) => p,
                    Ok(None) => {
                        log::warn!(
                            "[dispatcher] Patient {} not found for medication {}",
                            medication.patient_id,
                            medication.id
                        );
                        summary.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        log::error!("[dispatcher] Patient lookup failed for medication {}: {}", medication.id, e);
                        summary.skipped += 1;
                        continue;
                    }
                };

                let reminder = self.ledger.create(&medication, &patient, &current_time);
                created.push(reminder.clone());
                outbound.push(Outbound {
                    reminder,
                    patient,
                    medication,
                    promoted: false,
                });
            }
        }

        for queued in self.ledger.due_postponed(self.calendar.now())? {
            match self.load_context(&queued) {
                Ok(Some((patient, medication))) => {
                    let reminder = self.ledger.promote(&queued);
                    promoted.push(reminder.clone());
                    outbound.push(Outbound {
                        reminder,
                        patient,
                        medication,
                        promoted: true,
                    });
                }
                // inactive medication or removed patient: stays queued
                Ok(None) => {
                    log::debug!("[dispatcher] Postponed reminder {} held back", queued.id);
                }
                Err(e) => {
                    log::error!("[dispatcher] Lookup failed for postponed reminder {}: {}", queued.id, e);
                    summary.skipped += 1;
                }
            }
        }

        let applied = self.ledger.commit_batch(&created, &promoted)?;
        if fresh_minute {
            self.mark_minute_fired(minute);
        }
        summary.created = created.len();
        summary.promoted = applied.len();

        // a promotion another tick already applied is delivered there
        outbound.retain(|entry| !entry.promoted || applied.contains(&entry.reminder.id));

        for entry in outbound {
            let body = templates::reminder(&entry.patient, &entry.medication, self.postpone_delay_minutes);
            let to = format!("+{}{}", self.country_code, entry.patient.phone);
            let result = self.gateway.send(&to, &body).await;

            if result.is_ok() {
                summary.delivered += 1;
            } else {
                summary.failed += 1;
            }
            if let Err(e) = self.ledger.record_delivery_outcome(&entry.reminder.id, &result) {
                log::error!(
                    "[dispatcher] Could not record delivery of reminder {}: {}",
                    entry.reminder.id,
                    e
                );
            }
        }

        Ok(summary)
    }

    /// Scheduled reminders fire at most once per local minute, even when two
    /// ticks land inside it. A minute counts as fired once its batch is
    /// committed.
    fn minute_fired(&self, minute: &str) -> bool {
        let last = match self.last_fired_minute.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fired = last.as_deref() == Some(minute);
        if fired {
            log::debug!("[dispatcher] Minute {} already dispatched", minute);
        }
        fired
    }

    fn mark_minute_fired(&self, minute: String) {
        let mut last = match self.last_fired_minute.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(minute);
    }

    fn load_context(&self, reminder: &ReminderInstance) -> AppResult<Option<(Patient, Medication)>> {
        let medication = match self.db.get_medication(&reminder.medication_id)? {
            Some(m) if m.active => m,
            _ => return Ok(None),
        };
        Ok(self.db.get_patient(&reminder.patient_id)?.map(|p| (p, medication)))
    }
}

/// Background loop driving [`Dispatcher::run_tick`]. A failed tick is logged
/// and the next one runs on schedule.
pub async fn run_scheduler(dispatcher: Arc<Dispatcher>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::info!("[scheduler] Started, ticking every {}s", every.as_secs());

    loop {
        ticker.tick().await;

        match dispatcher.run_tick().await {
            Ok(summary) if summary.is_idle() => {}
            Ok(summary) => log::info!(
                "[scheduler] Tick: {} created, {} promoted, {} delivered, {} failed, {} skipped",
                summary.created,
                summary.promoted,
                summary.delivered,
                summary.failed,
                summary.skipped
            ),
            Err(e) => log::error!("[scheduler] Tick failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::error::DeliveryError;
    use crate::gateway::RecordingGateway;
    use crate::models::{ReminderStatus, SentMessage};
    use crate::reply::ReplyInterpreter;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        db: Database,
        clock: Arc<FixedClock>,
        gateway: Arc<RecordingGateway>,
        dispatcher: Dispatcher,
    }

    // 2026-10-19 is a Monday
    fn fixture_at(hour: u32, minute: u32) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(FixedClock::at_local(2026, 10, 19, hour, minute));
        let gateway = Arc::new(RecordingGateway::new());
        let calendar = Calendar::new(clock.clone(), chrono_tz::America::Sao_Paulo);
        let dispatcher = Dispatcher::new(db.clone(), gateway.clone(), calendar, &Config::default());
        Fixture {
            db,
            clock,
            gateway,
            dispatcher,
        }
    }

    fn register(db: &Database, phone: &str, days: Vec<u8>, times: &[&str]) -> (Patient, Medication) {
        let patient = Patient::new("Dona Maria".to_string(), phone.to_string());
        let medication = Medication::new(
            patient.id.clone(),
            "Losartana".to_string(),
            "50mg".to_string(),
            days,
            times.iter().map(|t| t.to_string()).collect(),
        );
        db.register_patient(&patient, std::slice::from_ref(&medication)).unwrap();
        (patient, medication)
    }

    #[tokio::test]
    async fn test_due_medication_sends_one_reminder() {
        let f = fixture_at(8, 0);
        let (patient, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);

        let summary = f.dispatcher.run_tick().await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.delivered, 1);

        let sent = f.gateway.sent_to("+5511999990000");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Losartana"));

        let pending = f.dispatcher.ledger().latest_pending(&patient.id).unwrap().unwrap();
        assert_eq!(pending.scheduled_time, "08:00");
        assert_eq!(pending.attempt, 1);
        assert_eq!(pending.message_sid.as_deref(), Some("SM0001"));
    }

    #[tokio::test]
    async fn test_nothing_due_off_schedule() {
        let f = fixture_at(8, 1);
        register(&f.db, "11999990000", vec![1], &["08:00"]);
        register(&f.db, "11999990001", vec![2], &["08:01"]);

        let summary = f.dispatcher.run_tick().await.unwrap();
        assert!(summary.is_idle());
        assert!(f.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_medication_never_fires() {
        let f = fixture_at(8, 0);
        let (patient, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);
        f.db.deactivate_medications(&patient.id, f.clock.now()).unwrap();

        f.dispatcher.run_tick().await.unwrap();
        assert!(f.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_isolated() {
        let f = fixture_at(8, 0);
        let (bad, _) = register(&f.db, "11000000000", vec![1], &["08:00"]);
        let (good, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);
        f.gateway.fail_for("+5511000000000");

        let summary = f.dispatcher.run_tick().await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);

        let failed = f.db.list_reminders_by_patient(&bad.id).unwrap();
        assert_eq!(failed[0].status, ReminderStatus::Error);
        assert!(failed[0].error_detail.is_some());
        assert!(f.dispatcher.ledger().latest_pending(&bad.id).unwrap().is_none());
        assert!(f.dispatcher.ledger().latest_pending(&good.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_same_minute_fires_once() {
        let f = fixture_at(8, 0);
        let (patient, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);

        f.dispatcher.run_tick().await.unwrap();
        f.clock.advance(ChronoDuration::seconds(30));
        let second = f.dispatcher.run_tick().await.unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(f.db.list_reminders_by_patient(&patient.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_postponed_reminder_refires_after_delay() {
        let f = fixture_at(8, 0);
        let (patient, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);
        f.dispatcher.run_tick().await.unwrap();

        let original = f.dispatcher.ledger().latest_pending(&patient.id).unwrap().unwrap();
        f.dispatcher
            .ledger()
            .transition(&original.id, ReminderStatus::Postponed, "3")
            .unwrap();
        let follow_up = f.dispatcher.ledger().create_postponed(&original, 10).unwrap();

        f.clock.advance(ChronoDuration::minutes(5));
        let early = f.dispatcher.run_tick().await.unwrap();
        assert_eq!(early.promoted, 0);

        f.clock.advance(ChronoDuration::minutes(5));
        let due = f.dispatcher.run_tick().await.unwrap();
        assert_eq!(due.promoted, 1);
        assert_eq!(due.created, 0);
        assert_eq!(f.gateway.sent_to("+5511999990000").len(), 2);

        let pending = f.dispatcher.ledger().latest_pending(&patient.id).unwrap().unwrap();
        assert_eq!(pending.id, follow_up.id);
        assert_eq!(pending.scheduled_time, "08:00");
        assert_eq!(pending.status, ReminderStatus::Sent);
    }

    #[tokio::test]
    async fn test_postponed_held_after_opt_out() {
        let f = fixture_at(8, 0);
        let (patient, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);
        f.dispatcher.run_tick().await.unwrap();

        let original = f.dispatcher.ledger().latest_pending(&patient.id).unwrap().unwrap();
        let follow_up = f.dispatcher.ledger().create_postponed(&original, 10).unwrap();
        f.db.deactivate_medications(&patient.id, f.clock.now()).unwrap();

        f.clock.advance(ChronoDuration::minutes(10));
        let summary = f.dispatcher.run_tick().await.unwrap();
        assert_eq!(summary.promoted, 0);
        assert_eq!(f.gateway.sent().len(), 1);

        let queued = f.dispatcher.ledger().get(&follow_up.id).unwrap().unwrap();
        assert_eq!(queued.status, ReminderStatus::ScheduledPostponed);
    }

    /// Checks the store from inside `send`: the reminder must already be
    /// committed and not yet marked delivered.
    struct CommitCheckingGateway {
        db: Database,
        patient_id: String,
        seen: std::sync::Mutex<Vec<ReminderInstance>>,
    }

    #[async_trait::async_trait]
    impl MessageGateway for CommitCheckingGateway {
        async fn send(&self, _to: &str, _body: &str) -> Result<SentMessage, DeliveryError> {
            let stored = self.db.list_reminders_by_patient(&self.patient_id).unwrap();
            self.seen.lock().unwrap().extend(stored);
            Ok(SentMessage {
                id: "SM9".to_string(),
                status: "queued".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_batch_is_committed_before_delivery() {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(FixedClock::at_local(2026, 10, 19, 8, 0));
        let (patient, _) = register(&db, "11999990000", vec![1], &["08:00"]);
        let gateway = Arc::new(CommitCheckingGateway {
            db: db.clone(),
            patient_id: patient.id.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let calendar = Calendar::new(clock.clone(), chrono_tz::America::Sao_Paulo);
        let dispatcher = Dispatcher::new(db.clone(), gateway.clone(), calendar, &Config::default());

        let summary = dispatcher.run_tick().await.unwrap();
        assert_eq!(summary.delivered, 1);

        let seen = gateway.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, ReminderStatus::Sent);
        assert!(seen[0].message_sid.is_none());

        let stored = db.get_reminder(&seen[0].id).unwrap().unwrap();
        assert_eq!(stored.message_sid.as_deref(), Some("SM9"));
    }

    #[tokio::test]
    async fn test_failed_commit_retries_within_minute() {
        let f = fixture_at(8, 0);
        let (patient, _) = register(&f.db, "11999990000", vec![1], &["08:00"]);
        f.db.execute_batch(
            "CREATE TEMP TRIGGER reject_reminders BEFORE INSERT ON reminders \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        assert!(f.dispatcher.run_tick().await.is_err());
        assert!(f.gateway.sent().is_empty());

        f.db.execute_batch("DROP TRIGGER reject_reminders;").unwrap();
        f.clock.advance(ChronoDuration::seconds(30));
        let retry = f.dispatcher.run_tick().await.unwrap();

        assert_eq!(retry.created, 1);
        assert_eq!(f.db.list_reminders_by_patient(&patient.id).unwrap().len(), 1);
        assert_eq!(f.gateway.sent_to("+5511999990000").len(), 1);
    }

    #[tokio::test]
    async fn test_reply_after_refire_answers_refired_medication() {
        let f = fixture_at(8, 0);
        let patient = Patient::new("Dona Maria".to_string(), "11999990000".to_string());
        let morning = Medication::new(
            patient.id.clone(),
            "Losartana".to_string(),
            "50mg".to_string(),
            vec![1],
            vec!["08:00".to_string()],
        );
        let later = Medication::new(
            patient.id.clone(),
            "Metformina".to_string(),
            "850mg".to_string(),
            vec![1],
            vec!["08:05".to_string()],
        );
        f.db.register_patient(&patient, &[morning.clone(), later.clone()]).unwrap();
        let replies = ReplyInterpreter::new(f.db.clone(), f.gateway.clone(), f.clock.clone(), &Config::default());
        let from = "whatsapp:+5511999990000";

        f.dispatcher.run_tick().await.unwrap();
        f.clock.advance(ChronoDuration::minutes(1));
        replies.handle_reply(from, "3").await.unwrap();

        f.clock.advance(ChronoDuration::minutes(4));
        assert_eq!(f.dispatcher.run_tick().await.unwrap().created, 1);

        f.clock.advance(ChronoDuration::minutes(6));
        assert_eq!(f.dispatcher.run_tick().await.unwrap().promoted, 1);
        let last = f.gateway.sent_to("+5511999990000").pop().unwrap();
        assert!(last.contains("Losartana"));

        replies.handle_reply(from, "1").await.unwrap();

        let reminders = f.db.list_reminders_by_patient(&patient.id).unwrap();
        let status_of = |medication: &Medication, status: ReminderStatus| {
            reminders
                .iter()
                .filter(|r| r.medication_id == medication.id && r.status == status)
                .count()
        };
        assert_eq!(status_of(&morning, ReminderStatus::Taken), 1);
        assert_eq!(status_of(&morning, ReminderStatus::Sent), 0);
        assert_eq!(status_of(&later, ReminderStatus::Sent), 1);
        assert_eq!(status_of(&later, ReminderStatus::Taken), 0);
    }
}
