//! Persisted workout and daily step entities.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workout::{WorkoutEnvironment, WorkoutKind, WorkoutMetrics};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateSample {
    pub bpm: f64,
    pub timestamp: DateTime<Utc>,
}

/// One workout as stored locally.
///
/// Inserted optimistically at workout start with zero metrics, updated while
/// the session runs and finalised once by [`WorkoutRecord::complete`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutRecord {
    pub id: String,
    pub workout_kind: WorkoutKind,
    pub environment: WorkoutEnvironment,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// Active duration in seconds, excluding paused time when it came from
    /// the sensor session.
    pub duration_seconds: f64,
    pub distance_meters: f64,
    pub step_count: u64,
    pub active_calories: f64,
    pub average_heart_rate: Option<f64>,
    pub average_pace: Option<f64>,
    pub average_cadence: Option<f64>,
    pub elevation_gain: Option<f64>,
    /// Identifier of the matching workout in the health store; the
    /// deduplication key for reconciliation.
    pub external_id: Option<String>,
    pub is_completed: bool,
    /// Finalised at launch after the app died mid-workout.
    #[serde(default)]
    pub is_interrupted: bool,
    pub route_points: Vec<RoutePoint>,
    pub heart_rate_samples: Vec<HeartRateSample>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkoutRecord {
    pub fn begin(
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workout_kind,
            environment,
            start_date,
            end_date: None,
            duration_seconds: 0.0,
            distance_meters: 0.0,
            step_count: 0,
            active_calories: 0.0,
            average_heart_rate: None,
            average_pace: None,
            average_cadence: None,
            elevation_gain: None,
            external_id: None,
            is_completed: false,
            is_interrupted: false,
            route_points: Vec::new(),
            heart_rate_samples: Vec::new(),
            created_at: start_date,
            updated_at: start_date,
        }
    }

    /// Copies live metrics into the record. Zero-valued averages mean
    /// "undefined" and are stored as `None`.
    pub fn apply_metrics(&mut self, metrics: &WorkoutMetrics, at: DateTime<Utc>) {
        self.duration_seconds = metrics.elapsed_seconds;
        self.distance_meters = metrics.distance_meters;
        self.step_count = metrics.step_count;
        self.active_calories = metrics.active_calories;
        self.average_heart_rate = positive(metrics.average_heart_rate);
        self.average_pace = positive(metrics.average_pace);
        self.average_cadence = positive(metrics.cadence);
        self.updated_at = at;
    }

    /// Copies the route and heart-rate series a sensor session collected.
    /// Elevation gain is only defined when the route carried altitudes.
    pub fn apply_samples(
        &mut self,
        route_points: Vec<RoutePoint>,
        heart_rate_samples: Vec<HeartRateSample>,
        elevation_gain: f64,
    ) {
        let has_altitude = route_points.iter().any(|point| point.altitude.is_some());
        self.elevation_gain = (has_altitude && elevation_gain.is_finite()).then_some(elevation_gain.max(0.0));
        self.route_points = route_points;
        self.heart_rate_samples = heart_rate_samples;
    }

    /// Finalises the record. Returns `false` if it was already completed.
    ///
    /// With `preserve_duration`, a non-zero duration already on the record
    /// (reported by the sensor session, pauses excluded) is kept; otherwise the
    /// wall-clock span `end_date - start_date` is used.
    pub fn complete(&mut self, end_date: DateTime<Utc>, preserve_duration: bool) -> bool {
        if self.is_completed {
            return false;
        }

        let keep_existing = preserve_duration && self.duration_seconds > 0.0;
        if !keep_existing {
            let span_ms = (end_date - self.start_date).num_milliseconds().max(0);
            self.duration_seconds = span_ms as f64 / 1000.0;
        }

        self.end_date = Some(end_date);
        self.is_completed = true;
        self.updated_at = end_date;
        true
    }
}

fn positive(value: f64) -> Option<f64> {
    (value > 0.0 && value.is_finite()).then_some(value)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyStepRecord {
    pub date: NaiveDate,
    pub steps: u64,
    pub goal: u64,
    pub goal_met: bool,
    pub updated_at: DateTime<Utc>,
}

impl DailyStepRecord {
    pub fn new(date: NaiveDate, steps: u64, goal: u64, updated_at: DateTime<Utc>) -> Self {
        Self {
            date,
            steps,
            goal,
            goal_met: goal > 0 && steps >= goal,
            updated_at,
        }
    }
}
