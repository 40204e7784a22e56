use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Cron expression has no upcoming fire time: {0}")]
    Exhausted(String),
}

/// A cron schedule with timezone support.
///
/// Accepts the classic 5-field form (`minute hour day month weekday`) as well
/// as the 6-field form with a leading seconds field. In both forms numeric
/// weekdays count from Sunday as `0` (or `7`), as crontab does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: String,
    pub timezone: String,
    #[serde(skip)]
    schedule: Option<Schedule>,
    #[serde(skip)]
    tz: Option<Tz>,
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Bring an expression into the seconds-first form the parser expects.
///
/// A 5-field expression gets a leading `0` seconds field. Numeric weekdays
/// follow crontab (`0` and `7` are Sunday, `1` is Monday) and are rewritten
/// as names, since the parser counts Sunday as `1`.
fn normalize(expression: &str) -> Result<String, CronError> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if fields.len() >= 6 {
        fields[5] = weekday_field(&fields[5])
            .map_err(|reason| CronError::InvalidExpression(format!("{}: {}", expression, reason)))?;
    }
    Ok(fields.join(" "))
}

fn weekday_number(token: &str) -> Result<u32, String> {
    match token.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{}'", token)),
    }
}

/// Rewrite one weekday field. Named and `*`/`?` items pass through as is.
fn weekday_field(field: &str) -> Result<String, String> {
    let mut items = Vec::new();

    for item in field.split(',') {
        if item.is_empty() || item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => match step.parse::<u32>() {
                Ok(step) if step > 0 => (base, Some(step)),
                _ => return Err(format!("invalid step in '{}'", item)),
            },
            None => (item, None),
        };

        let (start, end) = match base {
            "*" | "?" if step.is_none() => {
                items.push(base.to_string());
                continue;
            }
            "*" => (0, 6),
            _ => match base.split_once('-') {
                Some((start, end)) => (weekday_number(start)?, weekday_number(end)?),
                None => {
                    let day = weekday_number(base)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };
        if start > end {
            return Err(format!("descending range '{}'", item));
        }

        let mut days: Vec<usize> = (start..=end)
            .step_by(step.unwrap_or(1) as usize)
            .map(|day| (day % 7) as usize)
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.into_iter().map(|day| WEEKDAY_NAMES[day].to_string()));
    }

    Ok(items.join(","))
}

fn parse_schedule(expression: &str) -> Result<Schedule, CronError> {
    Schedule::from_str(&normalize(expression)?)
        .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))
}

impl CronSchedule {
    /// Create a new CronSchedule with UTC timezone
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a new CronSchedule with a specific timezone
    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let schedule = parse_schedule(expression)?;

        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(CronSchedule {
            expression: expression.trim().to_string(),
            timezone: timezone.to_string(),
            schedule: Some(schedule),
            tz: Some(tz),
        })
    }

    /// Get the next execution time strictly after the given datetime
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let schedule = self.schedule.as_ref()?;
        let tz = self.tz.as_ref()?;

        let after_tz = after.with_timezone(tz);
        let next_tz = schedule.after(&after_tz).next()?;

        Some(next_tz.with_timezone(&Utc))
    }

    /// Like [`next_execution`](Self::next_execution) but reports a schedule
    /// that will never fire again as an error.
    pub fn require_next(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        self.next_execution(after)
            .ok_or_else(|| CronError::Exhausted(self.expression.clone()))
    }

    /// Validate that the cron expression is valid
    pub fn validate(expression: &str) -> Result<(), CronError> {
        parse_schedule(expression)?;
        Ok(())
    }

    /// Reinitialize the schedule and timezone after deserialization
    pub fn reinitialize(&mut self) -> Result<(), CronError> {
        self.schedule = Some(parse_schedule(&self.expression)?);
        self.tz = Some(
            self.timezone
                .parse::<Tz>()
                .map_err(|_| CronError::InvalidTimezone(self.timezone.clone()))?,
        );
        Ok(())
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Expressions used by the stock recurring jobs.
pub mod expressions {
    pub const EVERY_TWO_HOURS: &str = "0 */2 * * *";
    pub const EVERY_THIRTY_MINUTES: &str = "*/30 * * * *";
    pub const DAILY_AT_3AM: &str = "0 3 * * *";
    pub const MONTHLY_FIRST_AT_3AM: &str = "0 3 1 * *";
}
