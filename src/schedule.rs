//! Schedule matching
//!
//! A medication fires when the local weekday is in its day set and the local
//! "HH:MM" equals one of its times. Minute granularity, no tolerance window:
//! a tick that never runs for a given minute is simply missed.

use crate::models::Medication;

pub fn is_due(medication: &Medication, current_day: u8, current_time: &str) -> bool {
    medication.days.contains(&current_day) && medication.times.iter().any(|t| t == current_time)
}

/// Accepts zero-padded 24h "HH:MM" only.
pub fn is_valid_time_of_day(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    match (value[..2].parse::<u8>(), value[3..].parse::<u8>()) {
        (Ok(h), Ok(m)) => {
            h < 24 && m < 60 && bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit)
        }
        _ => false,
    }
}
