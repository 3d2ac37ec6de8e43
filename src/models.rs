use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Patient receiving reminders
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub id: String,
    pub name: String,
    pub phone: String, // normalized, without prefix or country code
    pub created_at: DateTime<Utc>,
}

impl Patient {
    pub fn new(name: String, phone: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            phone,
            created_at: Utc::now(),
        }
    }
}

/// Medication with its weekly firing schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub id: String,
    pub patient_id: String,
    pub name: String,
    pub dosage: String,
    pub active: bool,
    pub days: Vec<u8>,       // 0 = Sunday .. 6 = Saturday
    pub times: Vec<String>,  // "HH:MM"
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Medication {
    pub fn new(patient_id: String, name: String, dosage: String, days: Vec<u8>, times: Vec<String>) -> Self {
        let mut days = days;
        days.sort_unstable();
        days.dedup();
        Self {
            id: Uuid::new_v4().to_string(),
            patient_id,
            name,
            dosage,
            active: true,
            days,
            times,
            created_at: Utc::now(),
            deactivated_at: None,
        }
    }
}

/// Lifecycle of a single reminder instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Sent,
    Taken,
    NotTaken,
    Postponed,
    ScheduledPostponed,
    Error,
}

impl ReminderStatus {
    pub const ALL: [ReminderStatus; 6] = [
        ReminderStatus::Sent,
        ReminderStatus::Taken,
        ReminderStatus::NotTaken,
        ReminderStatus::Postponed,
        ReminderStatus::ScheduledPostponed,
        ReminderStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Sent => "sent",
            ReminderStatus::Taken => "taken",
            ReminderStatus::NotTaken => "not_taken",
            ReminderStatus::Postponed => "postponed",
            ReminderStatus::ScheduledPostponed => "scheduled_postponed",
            ReminderStatus::Error => "error",
        }
    }

    /// No transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReminderStatus::Taken
                | ReminderStatus::NotTaken
                | ReminderStatus::Postponed
                | ReminderStatus::Error
        )
    }

    /// Whether `next` is a valid reply-driven transition from `self`.
    pub fn accepts_reply(&self, next: ReminderStatus) -> bool {
        *self == ReminderStatus::Sent
            && matches!(
                next,
                ReminderStatus::Taken | ReminderStatus::NotTaken | ReminderStatus::Postponed
            )
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReminderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown reminder status '{}'", s))
    }
}

/// One dose reminder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderInstance {
    pub id: String,
    pub medication_id: String,
    pub patient_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ReminderStatus,
    pub attempt: u32,
    pub scheduled_time: String, // original "HH:MM", kept across postpones
    pub message_sid: Option<String>,
    pub delivery_status: Option<String>,
    pub response_code: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub postpone_count: Option<u32>,
    pub delay_minutes: Option<i64>,
    pub due_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

/// Gateway acknowledgement for an accepted message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentMessage {
    pub id: String,
    pub status: String,
}

/// Patient answer codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCode {
    Taken,
    NotTaken,
    Postpone,
}

impl ReplyCode {
    pub fn parse(body: &str) -> Option<Self> {
        match body {
            "1" => Some(ReplyCode::Taken),
            "2" => Some(ReplyCode::NotTaken),
            "3" => Some(ReplyCode::Postpone),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ReplyCode::Taken => "1",
            ReplyCode::NotTaken => "2",
            ReplyCode::Postpone => "3",
        }
    }

    pub fn target_status(&self) -> ReminderStatus {
        match self {
            ReplyCode::Taken => ReminderStatus::Taken,
            ReplyCode::NotTaken => ReminderStatus::NotTaken,
            ReplyCode::Postpone => ReminderStatus::Postponed,
        }
    }
}

/// Per-day reminder tally for one patient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdherenceReport {
    pub patient_id: String,
    pub date: NaiveDate,
    pub total: u32,
    pub sent: u32,
    pub taken: u32,
    pub not_taken: u32,
    pub postponed: u32,
    pub scheduled_postponed: u32,
    pub error: u32,
    /// taken / (taken + not_taken) * 100
    pub adherence_rate: f64,
}

impl AdherenceReport {
    pub fn empty(patient_id: &str, date: NaiveDate) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            date,
            total: 0,
            sent: 0,
            taken: 0,
            not_taken: 0,
            postponed: 0,
            scheduled_postponed: 0,
            error: 0,
            adherence_rate: 0.0,
        }
    }

    pub fn add(&mut self, status: ReminderStatus, count: u32) {
        self.total += count;
        match status {
            ReminderStatus::Sent => self.sent += count,
            ReminderStatus::Taken => self.taken += count,
            ReminderStatus::NotTaken => self.not_taken += count,
            ReminderStatus::Postponed => self.postponed += count,
            ReminderStatus::ScheduledPostponed => self.scheduled_postponed += count,
            ReminderStatus::Error => self.error += count,
        }
        let answered = self.taken + self.not_taken;
        self.adherence_rate = if answered > 0 {
            (self.taken as f64 / answered as f64) * 100.0
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in ReminderStatus::ALL {
            assert_eq!(status.as_str().parse::<ReminderStatus>(), Ok(status));
        }
        assert!("done".parse::<ReminderStatus>().is_err());
    }

    #[test]
    fn test_only_sent_accepts_replies() {
        assert!(ReminderStatus::Sent.accepts_reply(ReminderStatus::Taken));
        assert!(ReminderStatus::Sent.accepts_reply(ReminderStatus::Postponed));
        assert!(!ReminderStatus::Sent.accepts_reply(ReminderStatus::Error));
        assert!(!ReminderStatus::Taken.accepts_reply(ReminderStatus::NotTaken));
        assert!(!ReminderStatus::ScheduledPostponed.accepts_reply(ReminderStatus::Taken));
        assert!(!ReminderStatus::ScheduledPostponed.is_terminal());
        assert!(ReminderStatus::Error.is_terminal());
    }

    #[test]
    fn test_reply_code_parse() {
        assert_eq!(ReplyCode::parse("1"), Some(ReplyCode::Taken));
        assert_eq!(ReplyCode::parse("2"), Some(ReplyCode::NotTaken));
        assert_eq!(ReplyCode::parse("3"), Some(ReplyCode::Postpone));
        assert_eq!(ReplyCode::parse("4"), None);
        assert_eq!(ReplyCode::parse("1 "), None);
    }

    #[test]
    fn test_adherence_rate_ignores_unanswered() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let mut report = AdherenceReport::empty("p1", date);
        report.add(ReminderStatus::Taken, 3);
        report.add(ReminderStatus::NotTaken, 1);
        report.add(ReminderStatus::Sent, 2);
        assert_eq!(report.total, 6);
        assert!((report.adherence_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ReminderStatus::ScheduledPostponed).unwrap();
        assert_eq!(json, "\"scheduled_postponed\"");
    }
}
