use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{WorkoutEnvironment, WorkoutKind};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_date(value: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").with_context(|| format!("failed to parse {field}"))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_workout_kind(value: &str) -> Result<WorkoutKind> {
    match value {
        "walking" => Ok(WorkoutKind::Walking),
        "running" => Ok(WorkoutKind::Running),
        other => Err(anyhow!("unknown workout kind {other}")),
    }
}

pub fn parse_environment(value: &str) -> Result<WorkoutEnvironment> {
    match value {
        "indoor" => Ok(WorkoutEnvironment::Indoor),
        "outdoor" => Ok(WorkoutEnvironment::Outdoor),
        other => Err(anyhow!("unknown workout environment {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workout_kind_round_trips_through_storage_name() {
        for kind in [WorkoutKind::Walking, WorkoutKind::Running] {
            assert_eq!(parse_workout_kind(kind.as_str()).unwrap(), kind);
        }
        for environment in [WorkoutEnvironment::Indoor, WorkoutEnvironment::Outdoor] {
            assert_eq!(parse_environment(environment.as_str()).unwrap(), environment);
        }
        assert!(parse_workout_kind("cycling").is_err());
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert!(to_u64(-1, "steps").is_err());
        assert_eq!(to_u64(42, "steps").unwrap(), 42);
    }
}
