use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    db::{
        helpers::{format_date, parse_date, parse_datetime, to_i64, to_u64},
        Database,
    },
    models::DailyStepRecord,
};

fn row_to_daily_steps(row: &Row) -> Result<DailyStepRecord> {
    let date: String = row.get("date")?;
    let steps: i64 = row.get("steps")?;
    let goal: i64 = row.get("goal")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(DailyStepRecord {
        date: parse_date(&date, "date")?,
        steps: to_u64(steps, "steps")?,
        goal: to_u64(goal, "goal")?,
        goal_met: row.get("goal_met")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    /// One row per day; the latest write for a day wins.
    pub async fn upsert_daily_steps(&self, record: &DailyStepRecord) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO daily_steps (date, steps, goal, goal_met, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(date) DO UPDATE SET
                     steps = excluded.steps,
                     goal = excluded.goal,
                     goal_met = excluded.goal_met,
                     updated_at = excluded.updated_at",
                params![
                    format_date(record.date),
                    to_i64(record.steps)?,
                    to_i64(record.goal)?,
                    record.goal_met,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to upsert daily steps for {}", record.date))?;
            Ok(())
        })
        .await
    }

    pub async fn get_daily_steps(&self, date: NaiveDate) -> Result<Option<DailyStepRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT date, steps, goal, goal_met, updated_at FROM daily_steps WHERE date = ?1",
            )?;
            let record = stmt
                .query_row(params![format_date(date)], |row| Ok(row_to_daily_steps(row)))
                .optional()?
                .transpose()?;
            Ok(record)
        })
        .await
    }

    /// Days in `from..=to`, oldest first.
    pub async fn list_daily_steps(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyStepRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT date, steps, goal, goal_met, updated_at
                 FROM daily_steps
                 WHERE date >= ?1 AND date <= ?2
                 ORDER BY date ASC",
            )?;
            let mut rows = stmt.query(params![format_date(from), format_date(to)])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_daily_steps(row)?);
            }
            Ok(records)
        })
        .await
    }
}
