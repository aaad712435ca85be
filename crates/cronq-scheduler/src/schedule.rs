use std::borrow::Cow;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

/// Parse a cron expression.
///
/// Seconds-first 6/7-field form (`sec min hour dom month dow [year]`). A
/// classic 5-field expression is accepted and fires at second 0.
pub fn parse(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize(expr)).map_err(|e| SchedulerError::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Compute the first occurrence of `expr` strictly after `reference` (unix
/// seconds, UTC). A `reference` of 0 means "now".
pub fn next_occurrence(expr: &str, reference: i64) -> Result<i64> {
    let schedule = parse(expr)?;
    let from = if reference > 0 {
        DateTime::<Utc>::from_timestamp(reference, 0).ok_or_else(|| {
            SchedulerError::Validation(format!("timestamp out of range: {reference}"))
        })?
    } else {
        Utc::now()
    };

    schedule
        .after(&from)
        .next()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| SchedulerError::NoOccurrence {
            expr: expr.to_string(),
        })
}

fn normalize(expr: &str) -> Cow<'_, str> {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        Cow::Owned(format!("0 {trimmed}"))
    } else {
        Cow::Borrowed(trimmed)
    }
}
