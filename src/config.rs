//! Process configuration
//!
//! Read once at startup from the environment (and `.env`), then handed to the
//! dispatcher, the reply interpreter and the gateway.

use crate::error::{AppError, AppResult};
use chrono_tz::Tz;
use std::ops::RangeInclusive;
use std::path::PathBuf;

pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";
pub const DEFAULT_COUNTRY_CODE: &str = "55";
pub const DEFAULT_POSTPONE_MINUTES: i64 = 10;
pub const MAX_POSTPONE_MINUTES: i64 = 24 * 60;

/// Twilio WhatsApp credentials
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender in transport form, e.g. `whatsapp:+14155238886`
    pub from: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub http_port: u16,
    pub timezone: Tz,
    pub country_code: String,
    pub tick_interval_secs: u64,
    pub postpone_delay_minutes: i64,
    pub log_level: String,
    /// `None` when any credential is missing; sends then fail as not configured.
    pub gateway: Option<GatewayConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("lembrete.db"),
            http_port: 3030,
            timezone: chrono_tz::America::Sao_Paulo,
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            tick_interval_secs: 60,
            postpone_delay_minutes: DEFAULT_POSTPONE_MINUTES,
            log_level: "info".to_string(),
            gateway: None,
        }
    }
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so parsing can be tested without
    /// touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_path = match get("DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let http_port = parse_or(get("HTTP_PORT"), "HTTP_PORT", 3030u16)?;
        let tick_interval_secs = parse_or(get("TICK_INTERVAL_SECS"), "TICK_INTERVAL_SECS", 60u64)?;
        // a tick longer than a minute would skip firing minutes
        ensure_range("TICK_INTERVAL_SECS", tick_interval_secs, 1..=60)?;
        let postpone_delay_minutes = parse_or(
            get("POSTPONE_DELAY_MINUTES"),
            "POSTPONE_DELAY_MINUTES",
            DEFAULT_POSTPONE_MINUTES,
        )?;
        ensure_range("POSTPONE_DELAY_MINUTES", postpone_delay_minutes, 1..=MAX_POSTPONE_MINUTES)?;

        let tz_name = get("TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let timezone: Tz = tz_name
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("TIMEZONE: unknown timezone '{}'", tz_name)))?;

        let country_code = get("COUNTRY_CODE")
            .map(|c| c.trim().trim_start_matches('+').to_string())
            .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_string());

        let gateway = match (
            get("TWILIO_ACCOUNT_SID"),
            get("TWILIO_AUTH_TOKEN"),
            get("TWILIO_WHATSAPP_FROM"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from)) => Some(GatewayConfig {
                account_sid,
                auth_token,
                from: ensure_transport_prefix(&from),
            }),
            _ => None,
        };

        Ok(Self {
            database_path,
            http_port,
            timezone,
            country_code,
            tick_interval_secs,
            postpone_delay_minutes,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            gateway,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> AppResult<T> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("{}: cannot parse '{}'", key, v))),
        None => Ok(default),
    }
}

fn ensure_range<T>(key: &str, value: T, range: RangeInclusive<T>) -> AppResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "{}: {} is outside {}..={}",
            key,
            value,
            range.start(),
            range.end()
        )))
    }
}

fn ensure_transport_prefix(number: &str) -> String {
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{}", number)
    }
}

/// Default database location under the user's data directory
fn default_db_path() -> AppResult<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| AppError::Custom("Cannot find data directory".to_string()))?;
    let app_dir = data_dir.join("lembrete");
    std::fs::create_dir_all(&app_dir)?;
    Ok(app_dir.join("lembrete.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_gateway() {
        let config = Config::from_lookup(lookup(&[("DATABASE_PATH", "/tmp/x.db")])).unwrap();
        assert_eq!(config.http_port, 3030);
        assert_eq!(config.timezone, chrono_tz::America::Sao_Paulo);
        assert_eq!(config.country_code, "55");
        assert_eq!(config.postpone_delay_minutes, 10);
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_gateway_requires_all_credentials() {
        let partial = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/x.db"),
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", ""),
            ("TWILIO_WHATSAPP_FROM", "+14155238886"),
        ]))
        .unwrap();
        assert!(partial.gateway.is_none());

        let full = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/x.db"),
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", "secret"),
            ("TWILIO_WHATSAPP_FROM", "+14155238886"),
        ]))
        .unwrap();
        assert_eq!(full.gateway.unwrap().from, "whatsapp:+14155238886");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_tz = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/x.db"),
            ("TIMEZONE", "Mars/Olympus"),
        ]));
        assert!(matches!(bad_tz, Err(AppError::InvalidInput(_))));

        let bad_port = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/x.db"),
            ("HTTP_PORT", "eighty"),
        ]));
        assert!(matches!(bad_port, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        for (key, value) in [
            ("POSTPONE_DELAY_MINUTES", "100000000000000"),
            ("POSTPONE_DELAY_MINUTES", "0"),
            ("POSTPONE_DELAY_MINUTES", "-5"),
            ("POSTPONE_DELAY_MINUTES", "1441"),
            ("TICK_INTERVAL_SECS", "0"),
            ("TICK_INTERVAL_SECS", "61"),
        ] {
            let result = Config::from_lookup(lookup(&[("DATABASE_PATH", "/tmp/x.db"), (key, value)]));
            assert!(matches!(result, Err(AppError::InvalidInput(_))), "{}={}", key, value);
        }

        let edge = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/x.db"),
            ("POSTPONE_DELAY_MINUTES", "1440"),
            ("TICK_INTERVAL_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(edge.postpone_delay_minutes, 1440);
        assert_eq!(edge.tick_interval_secs, 30);
    }
}
