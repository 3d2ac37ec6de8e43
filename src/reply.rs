//! Inbound reply handling
//!
//! Turns a patient's WhatsApp answer into a ledger transition, an opt-out or
//! a help message. Ledger writes always finish before the outbound
//! confirmation is attempted.

use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::error::AppResult;
use crate::gateway::MessageGateway;
use crate::ledger::ReminderLedger;
use crate::models::{Patient, ReplyCode};
use crate::templates;

/// Strips the transport prefix (`whatsapp:`), punctuation and the country
/// code. The country code is only removed from numbers written in
/// international form, so a national number whose area code happens to equal
/// it is left alone.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let number = raw.rsplit(':').next().unwrap_or(raw).trim();
    let international = number.starts_with('+');
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();

    if country_code.is_empty() {
        return digits;
    }
    match digits.strip_prefix(country_code) {
        Some(national) if international || national.len() >= 10 => national.to_string(),
        _ => digits,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyOutcome {
    PatientNotFound {
        phone: String,
    },
    /// `reminder_id` is `None` when nothing was pending.
    Recorded {
        code: ReplyCode,
        reminder_id: Option<String>,
        follow_up_id: Option<String>,
    },
    OptedOut {
        deactivated: usize,
    },
    Help,
}

pub struct ReplyInterpreter {
    db: Database,
    ledger: ReminderLedger,
    gateway: Arc<dyn MessageGateway>,
    clock: Arc<dyn Clock>,
    country_code: String,
    postpone_delay_minutes: i64,
}

impl ReplyInterpreter {
    pub fn new(db: Database, gateway: Arc<dyn MessageGateway>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let ledger = ReminderLedger::new(db.clone(), Arc::clone(&clock));
        Self {
            db,
            ledger,
            gateway,
            clock,
            country_code: config.country_code.clone(),
            postpone_delay_minutes: config.postpone_delay_minutes,
        }
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    pub async fn handle_reply(&self, raw_from: &str, raw_body: &str) -> AppResult<ReplyOutcome> {
        let phone = normalize_phone(raw_from, &self.country_code);
        let body = raw_body.trim();

        let Some(patient) = self.db.find_patient_by_phone(&phone)? else {
            log::warn!("[reply] No patient registered for {}", phone);
            return Ok(ReplyOutcome::PatientNotFound { phone });
        };

        if let Some(code) = ReplyCode::parse(body) {
            let outcome = self.record_answer(&patient, code)?;
            self.notify(&patient, &templates::confirmation(code, self.postpone_delay_minutes))
                .await;
            return Ok(outcome);
        }

        if body.eq_ignore_ascii_case(templates::OPT_OUT_KEYWORD) {
            let deactivated = self.db.deactivate_medications(&patient.id, self.clock.now())?;
            log::info!("[reply] Patient {} opted out ({} medications)", patient.id, deactivated);
            self.notify(&patient, &templates::opt_out()).await;
            return Ok(ReplyOutcome::OptedOut { deactivated });
        }

        log::debug!("[reply] Unrecognized reply from patient {}", patient.id);
        self.notify(&patient, &templates::help()).await;
        Ok(ReplyOutcome::Help)
    }

    fn record_answer(&self, patient: &Patient, code: ReplyCode) -> AppResult<ReplyOutcome> {
        let Some(pending) = self.ledger.latest_pending(&patient.id)? else {
            log::info!("[reply] Reply {} from patient {} with nothing pending", code.code(), patient.id);
            return Ok(ReplyOutcome::Recorded {
                code,
                reminder_id: None,
                follow_up_id: None,
            });
        };

        if !self.ledger.transition(&pending.id, code.target_status(), code.code())? {
            return Ok(ReplyOutcome::Recorded {
                code,
                reminder_id: None,
                follow_up_id: None,
            });
        }

        let follow_up_id = if code == ReplyCode::Postpone {
            let follow_up = self.ledger.create_postponed(&pending, self.postpone_delay_minutes)?;
            Some(follow_up.id)
        } else {
            None
        };

        Ok(ReplyOutcome::Recorded {
            code,
            reminder_id: Some(pending.id),
            follow_up_id,
        })
    }

    async fn notify(&self, patient: &Patient, body: &str) {
        let to = format!("+{}{}", self.country_code, patient.phone);
        match self.gateway.send(&to, body).await {
            Ok(message) => log::debug!("[reply] Sent {} to patient {}", message.id, patient.id),
            Err(e) => log::error!("[reply] Could not message patient {}: {}", patient.id, e),
        }
    }
}
