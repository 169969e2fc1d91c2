//! Cron expression parsing and interval checks.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ValidationError;

/// Fire times sampled when measuring a schedule's shortest interval.
const INTERVAL_SAMPLES: usize = 10;

/// A parsed cron schedule.
///
/// Accepts the classic 5-field form (minute first) as well as the 6/7-field
/// form with seconds and optional year.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::Schedule {
            expression: expression.to_string(),
            reason,
        };
        let normalized = normalize(expression).map_err(invalid)?;
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    /// Parse and reject schedules that fire more often than `min_interval`.
    pub fn parse_with_min_interval(
        expression: &str,
        min_interval: Duration,
    ) -> Result<Self, ValidationError> {
        let parsed = Self::parse(expression)?;
        if let Some(shortest) = parsed.shortest_interval()
            && shortest < min_interval
        {
            return Err(ValidationError::Schedule {
                expression: expression.to_string(),
                reason: format!(
                    "fires every {}s, minimum is {}s",
                    shortest.as_secs(),
                    min_interval.as_secs()
                ),
            });
        }
        Ok(parsed)
    }

    /// The expression as given by the caller.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Smallest gap between the next few fire times.
    pub fn shortest_interval(&self) -> Option<Duration> {
        let fires: Vec<DateTime<Utc>> = self.schedule.upcoming(Utc).take(INTERVAL_SAMPLES).collect();
        fires
            .windows(2)
            .filter_map(|pair| (pair[1] - pair[0]).to_std().ok())
            .min()
    }
}

/// Expand 5-field expressions to the seconds-first form.
fn normalize(expression: &str) -> Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5, 6, or 7 fields, got {n}")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn five_field_expressions_are_minute_first() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 10, 2, 30).unwrap();
        let next = schedule.next_after(start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap());
        assert_eq!(schedule.expression(), "*/5 * * * *");
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let schedule = CronSchedule::parse("30 0 3 * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 30).unwrap()
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(CronSchedule::parse("every day").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("99 * * * *").is_err());
    }

    #[test]
    fn min_interval_is_enforced() {
        let min = Duration::from_secs(300);
        assert!(CronSchedule::parse_with_min_interval("*/5 * * * *", min).is_ok());
        let err = CronSchedule::parse_with_min_interval("* * * * *", min).unwrap_err();
        assert!(err.to_string().contains("minimum is 300s"));
        assert_eq!(
            CronSchedule::parse("0 * * * *").unwrap().shortest_interval(),
            Some(Duration::from_secs(3600))
        );
    }
}
