//! Five-field cron expressions (`minute hour day-of-month month day-of-week`) that gate
//! when a scheduled campaign may start.
//!
//! Every field takes `*`, a value, a range `a-b`, a list `a,b,c` and steps (`*/n`, `a-b/n`,
//! `a/n`). Expressions are matched against UTC time. Day of week counts from Sunday = 0;
//! 7 is accepted as Sunday as well.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::AppError;

struct Bounds {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [Bounds; 5] = [
    Bounds { name: "minute", min: 0, max: 59 },
    Bounds { name: "hour", min: 0, max: 23 },
    Bounds { name: "day of month", min: 1, max: 31 },
    Bounds { name: "month", min: 1, max: 12 },
    Bounds { name: "day of week", min: 0, max: 7 },
];

const DAY_OF_WEEK: usize = 4;

/// A parsed cron expression. Bit `n` of a field mask is set when value `n` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSchedule {
    fields: [u64; 5],
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, AppError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != FIELDS.len() {
            return Err(AppError::Validation(format!(
                "cron expression '{}' has {} fields, expected 5",
                expr,
                parts.len()
            )));
        }

        let mut fields = [0u64; 5];
        for ((mask, part), bounds) in fields.iter_mut().zip(&parts).zip(&FIELDS) {
            *mask = parse_field(part, bounds).map_err(|reason| {
                AppError::Validation(format!("cron {} field '{}': {}", bounds.name, part, reason))
            })?;
        }
        if fields[DAY_OF_WEEK] & (1 << 7) != 0 {
            fields[DAY_OF_WEEK] |= 1;
        }

        Ok(Self { fields })
    }

    /// Whether the minute containing `at` is selected.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let values = [
            at.minute(),
            at.hour(),
            at.day(),
            at.month(),
            at.weekday().num_days_from_sunday(),
        ];
        self.fields
            .iter()
            .zip(values)
            .all(|(mask, value)| mask & (1u64 << value) != 0)
    }
}

fn parse_field(field: &str, bounds: &Bounds) -> Result<u64, String> {
    let mut mask = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_number(step)?)),
            None => (item, None),
        };
        if step == Some(0) {
            return Err("step must be positive".into());
        }

        let (start, end) = if range == "*" {
            (bounds.min, bounds.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_number(a)?, parse_number(b)?)
        } else {
            let value = parse_number(range)?;
            // `a/n` runs to the end of the field.
            (value, if step.is_some() { bounds.max } else { value })
        };

        if start < bounds.min || end > bounds.max {
            return Err(format!(
                "values must be within {}-{}",
                bounds.min, bounds.max
            ));
        }
        if start > end {
            return Err(format!("range {}-{} is reversed", start, end));
        }

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn parse_number(s: &str) -> Result<u32, String> {
    s.parse()
        .map_err(|_| format!("'{}' is not a number", s))
}
