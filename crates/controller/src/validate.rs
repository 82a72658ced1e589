//! Side-effect-free validation of the primitive values commands carry:
//! `hh:mm` times of day, their daily cron recurrence, and sprinkle durations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// A 24h time of day. Accepts `h:mm` or `hh:mm` (hours `0`-`23`, minutes
/// always two digits) and always renders zero-padded as `hh:mm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn minute_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    /// The daily recurrence firing at this minute.
    pub fn cron_spec(self) -> CronSpec {
        CronSpec {
            hour: self.hour,
            minute: self.minute,
        }
    }
}

fn invalid_time(s: &str) -> CommandError {
    CommandError::InvalidValue(format!(
        "Invalid time format: {s}. Please use hh:mm in 24h format"
    ))
}

impl FromStr for TimeOfDay {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s.split_once(':').ok_or_else(|| invalid_time(s))?;

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !(1..=2).contains(&h.len()) || !all_digits(h) || m.len() != 2 || !all_digits(m) {
            return Err(invalid_time(s));
        }

        let hour: u8 = h.parse().map_err(|_| invalid_time(s))?;
        let minute: u8 = m.parse().map_err(|_| invalid_time(s))?;
        Self::new(hour, minute).ok_or_else(|| invalid_time(s))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = CommandError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Daily recurrence at a fixed minute. Renders in the six-field
/// `sec min hour day month weekday` form the job scheduler expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSpec {
    hour: u8,
    minute: u8,
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0 {} {} * * *", self.minute, self.hour)
    }
}

/// A sprinkle duration must be a JSON integer greater than zero.
pub fn validate_duration_ms(value: &Value) -> Result<u64, CommandError> {
    if !value.is_number() {
        return Err(CommandError::InvalidValue(
            "Invalid millisecond value. time has to be numerical.".into(),
        ));
    }
    match value.as_u64() {
        Some(ms) if ms > 0 => Ok(ms),
        _ => Err(CommandError::InvalidValue(format!(
            "Invalid millisecond value {value}. time has to be a positive whole number."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_single_digit_hour_and_normalizes() {
        let t: TimeOfDay = "7:05".parse().unwrap();
        assert_eq!(t.to_string(), "07:05");
        assert_eq!(t.minute_of_day(), 7 * 60 + 5);
    }

    #[test]
    fn accepts_boundaries() {
        assert_eq!("00:00".parse::<TimeOfDay>().unwrap().to_string(), "00:00");
        assert_eq!("23:59".parse::<TimeOfDay>().unwrap().to_string(), "23:59");
        assert_eq!("19:30".parse::<TimeOfDay>().unwrap().to_string(), "19:30");
    }

    #[test]
    fn rejects_out_of_pattern_strings() {
        for bad in [
            "24:00", "23:60", "7:5", "007:00", "12:345", "12-30", "", ":", "ab:cd", " 7:30",
            "7:30 ", "+7:30", "12:3a", "29:00",
        ] {
            let err = bad.parse::<TimeOfDay>().unwrap_err();
            assert!(
                err.to_string().contains("Please use hh:mm in 24h format"),
                "{bad:?} -> {err}"
            );
        }
    }

    fn cron(s: &str) -> Result<CronSpec, CommandError> {
        s.parse::<TimeOfDay>().map(TimeOfDay::cron_spec)
    }

    #[test]
    fn cron_expression_is_daily_at_that_minute() {
        assert_eq!(cron("7:30").unwrap().to_string(), "0 30 7 * * *");
        assert_eq!(cron("00:05").unwrap().to_string(), "0 5 0 * * *");
    }

    #[test]
    fn cron_expression_rejects_invalid_time() {
        assert!(matches!(cron("25:00"), Err(CommandError::InvalidValue(_))));
    }

    #[test]
    fn cron_expression_is_accepted_by_scheduler() {
        for t in ["0:00", "07:30", "12:00", "23:59"] {
            let spec = cron(t).unwrap().to_string();
            let job = tokio_cron_scheduler::Job::new_async(spec.as_str(), |_id, _sched| {
                Box::pin(async {})
            });
            assert!(job.is_ok(), "scheduler rejected {spec}");
        }
    }

    #[test]
    fn serde_round_trips_as_string() {
        let t: TimeOfDay = serde_json::from_value(json!("6:00")).unwrap();
        assert_eq!(serde_json::to_value(t).unwrap(), json!("06:00"));
        assert!(serde_json::from_value::<TimeOfDay>(json!("6:0")).is_err());
        assert!(serde_json::from_value::<TimeOfDay>(json!(600)).is_err());
    }

    #[test]
    fn duration_must_be_positive_integer() {
        assert_eq!(validate_duration_ms(&json!(15000)).unwrap(), 15000);
        assert!(validate_duration_ms(&json!(0)).is_err());
        assert!(validate_duration_ms(&json!(-5)).is_err());
        assert!(validate_duration_ms(&json!(1.5)).is_err());
    }

    #[test]
    fn duration_must_be_numeric() {
        let err = validate_duration_ms(&json!("15000")).unwrap_err();
        assert!(err.to_string().contains("has to be numerical"));
        assert!(validate_duration_ms(&json!(null)).is_err());
    }
}
