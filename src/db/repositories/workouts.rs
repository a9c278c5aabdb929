use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    db::{
        helpers::{
            parse_datetime, parse_environment, parse_optional_datetime, parse_workout_kind,
            to_i64, to_u64,
        },
        Database,
    },
    models::WorkoutRecord,
};

const WORKOUT_COLUMNS: &str = "id, workout_kind, environment, start_date, end_date, duration_seconds,
     distance_meters, step_count, active_calories, average_heart_rate, average_pace,
     average_cadence, elevation_gain, external_id, is_completed, is_interrupted,
     route_points, heart_rate_samples, created_at, updated_at";

fn row_to_workout(row: &Row) -> Result<WorkoutRecord> {
    let workout_kind: String = row.get("workout_kind")?;
    let environment: String = row.get("environment")?;
    let start_date: String = row.get("start_date")?;
    let end_date: Option<String> = row.get("end_date")?;
    let step_count: i64 = row.get("step_count")?;
    let route_points: String = row.get("route_points")?;
    let heart_rate_samples: String = row.get("heart_rate_samples")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(WorkoutRecord {
        id: row.get("id")?,
        workout_kind: parse_workout_kind(&workout_kind)?,
        environment: parse_environment(&environment)?,
        start_date: parse_datetime(&start_date, "start_date")?,
        end_date: parse_optional_datetime(end_date, "end_date")?,
        duration_seconds: row.get("duration_seconds")?,
        distance_meters: row.get("distance_meters")?,
        step_count: to_u64(step_count, "step_count")?,
        active_calories: row.get("active_calories")?,
        average_heart_rate: row.get("average_heart_rate")?,
        average_pace: row.get("average_pace")?,
        average_cadence: row.get("average_cadence")?,
        elevation_gain: row.get("elevation_gain")?,
        external_id: row.get("external_id")?,
        is_completed: row.get("is_completed")?,
        is_interrupted: row.get("is_interrupted")?,
        route_points: serde_json::from_str(&route_points).context("failed to parse route_points")?,
        heart_rate_samples: serde_json::from_str(&heart_rate_samples)
            .context("failed to parse heart_rate_samples")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn collect_workouts(
    stmt: &mut rusqlite::Statement<'_>,
    query_params: impl rusqlite::Params,
) -> Result<Vec<WorkoutRecord>> {
    let mut rows = stmt.query(query_params)?;
    let mut workouts = Vec::new();
    while let Some(row) = rows.next()? {
        workouts.push(row_to_workout(row)?);
    }
    Ok(workouts)
}

fn insert_sql(verb: &str) -> String {
    format!(
        "{verb} INTO workouts ({WORKOUT_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
    )
}

fn insert_record(conn: &rusqlite::Connection, sql: &str, record: &WorkoutRecord) -> Result<usize> {
    let changed = conn.execute(
        sql,
        params![
            record.id,
            record.workout_kind.as_str(),
            record.environment.as_str(),
            record.start_date.to_rfc3339(),
            record.end_date.map(|dt| dt.to_rfc3339()),
            record.duration_seconds,
            record.distance_meters,
            to_i64(record.step_count)?,
            record.active_calories,
            record.average_heart_rate,
            record.average_pace,
            record.average_cadence,
            record.elevation_gain,
            record.external_id,
            record.is_completed,
            record.is_interrupted,
            serde_json::to_string(&record.route_points)?,
            serde_json::to_string(&record.heart_rate_samples)?,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(changed)
}

impl Database {
    pub async fn insert_workout(&self, record: &WorkoutRecord) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            insert_record(conn, &insert_sql("INSERT"), &record)
                .with_context(|| format!("failed to insert workout {}", record.id))?;
            Ok(())
        })
        .await
    }

    /// Inserts a workout materialised from the health store. Returns `false`
    /// when a record with the same external id already exists.
    pub async fn insert_reconciled_workout(&self, record: &WorkoutRecord) -> Result<bool> {
        let record = record.clone();
        self.execute(move |conn| {
            let changed = insert_record(conn, &insert_sql("INSERT OR IGNORE"), &record)
                .context("failed to insert reconciled workout")?;
            Ok(changed > 0)
        })
        .await
    }

    /// Saves live metrics of an in-progress workout.
    pub async fn update_workout_progress(&self, record: &WorkoutRecord) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE workouts
                 SET duration_seconds = ?1,
                     distance_meters = ?2,
                     step_count = ?3,
                     active_calories = ?4,
                     average_heart_rate = ?5,
                     average_pace = ?6,
                     average_cadence = ?7,
                     elevation_gain = ?8,
                     route_points = ?9,
                     heart_rate_samples = ?10,
                     updated_at = ?11
                 WHERE id = ?12 AND is_completed = 0",
                params![
                    record.duration_seconds,
                    record.distance_meters,
                    to_i64(record.step_count)?,
                    record.active_calories,
                    record.average_heart_rate,
                    record.average_pace,
                    record.average_cadence,
                    record.elevation_gain,
                    serde_json::to_string(&record.route_points)?,
                    serde_json::to_string(&record.heart_rate_samples)?,
                    record.updated_at.to_rfc3339(),
                    record.id,
                ],
            )
            .context("failed to update workout progress")?;
            Ok(())
        })
        .await
    }

    /// Writes the final state of a workout. Returns `false` if the row was
    /// already completed, so completion happens exactly once.
    pub async fn complete_workout(&self, record: &WorkoutRecord) -> Result<bool> {
        let record = record.clone();
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE workouts
                     SET end_date = ?1,
                         duration_seconds = ?2,
                         distance_meters = ?3,
                         step_count = ?4,
                         active_calories = ?5,
                         average_heart_rate = ?6,
                         average_pace = ?7,
                         average_cadence = ?8,
                         elevation_gain = ?9,
                         external_id = ?10,
                         is_completed = 1,
                         is_interrupted = ?11,
                         route_points = ?12,
                         heart_rate_samples = ?13,
                         updated_at = ?14
                     WHERE id = ?15 AND is_completed = 0",
                    params![
                        record.end_date.map(|dt| dt.to_rfc3339()),
                        record.duration_seconds,
                        record.distance_meters,
                        to_i64(record.step_count)?,
                        record.active_calories,
                        record.average_heart_rate,
                        record.average_pace,
                        record.average_cadence,
                        record.elevation_gain,
                        record.external_id,
                        record.is_interrupted,
                        serde_json::to_string(&record.route_points)?,
                        serde_json::to_string(&record.heart_rate_samples)?,
                        record.updated_at.to_rfc3339(),
                        record.id,
                    ],
                )
                .with_context(|| format!("failed to complete workout {}", record.id))?;
            Ok(changed > 0)
        })
        .await
    }

    /// Finalises a workout left open by a crash.
    pub async fn mark_workout_interrupted(&self, record: &WorkoutRecord) -> Result<bool> {
        let mut record = record.clone();
        record.is_interrupted = true;
        self.complete_workout(&record).await
    }

    pub async fn get_workout(&self, workout_id: &str) -> Result<Option<WorkoutRecord>> {
        let workout_id = workout_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {WORKOUT_COLUMNS} FROM workouts WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let workout = stmt
                .query_row(params![workout_id], |row| Ok(row_to_workout(row)))
                .optional()?
                .transpose()?;
            Ok(workout)
        })
        .await
    }

    /// Most recent first.
    pub async fn list_workouts(&self, limit: usize) -> Result<Vec<WorkoutRecord>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {WORKOUT_COLUMNS} FROM workouts ORDER BY start_date DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            collect_workouts(&mut stmt, params![to_i64(limit as u64)?])
        })
        .await
    }

    pub async fn delete_workout(&self, workout_id: &str) -> Result<bool> {
        let workout_id = workout_id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute("DELETE FROM workouts WHERE id = ?1", params![workout_id])?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn external_workout_ids(&self) -> Result<HashSet<String>> {
        self.execute(|conn| {
            let mut stmt =
                conn.prepare("SELECT external_id FROM workouts WHERE external_id IS NOT NULL")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(ids)
        })
        .await
    }

    pub async fn get_incomplete_workouts(&self) -> Result<Vec<WorkoutRecord>> {
        self.execute(|conn| {
            let sql = format!(
                "SELECT {WORKOUT_COLUMNS} FROM workouts WHERE is_completed = 0 ORDER BY start_date DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            collect_workouts(&mut stmt, params![])
        })
        .await
    }
}
