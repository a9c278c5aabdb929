use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::hardware::SensorSample;
use crate::models::{
    pace_from_speed, HeartRateSample, RoutePoint, WorkoutEnvironment, WorkoutKind, WorkoutMetrics,
    WorkoutStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutSessionState {
    pub status: WorkoutStatus,
    pub workout_kind: Option<WorkoutKind>,
    pub environment: Option<WorkoutEnvironment>,
    pub started_at: Option<DateTime<Utc>>,
    /// Total time spent in closed pause intervals.
    pub paused_ms: u64,
    pub last_pause_at: Option<DateTime<Utc>>,
    pub metrics: WorkoutMetrics,
    pub elevation_gain: f64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub route_points: Vec<RoutePoint>,
    #[serde(skip)]
    pub heart_rate_samples: Vec<HeartRateSample>,
    #[serde(skip)]
    heart_rate_sum: f64,
}

impl WorkoutSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(
        &mut self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        now: DateTime<Utc>,
    ) {
        *self = Self {
            status: WorkoutStatus::Running,
            workout_kind: Some(workout_kind),
            environment: Some(environment),
            started_at: Some(now),
            ..Self::default()
        };
    }

    /// Active time: `now - start - paused`, including an open pause.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };

        let mut paused_ms = self.paused_ms as i64;
        if let Some(paused_at) = self.last_pause_at {
            paused_ms += (now - paused_at).num_milliseconds().max(0);
        }

        let active_ms = (now - started_at).num_milliseconds() - paused_ms;
        active_ms.max(0) as f64 / 1000.0
    }

    /// Refreshes elapsed time and the metrics derived from it.
    pub fn sync_elapsed(&mut self, now: DateTime<Utc>) {
        if !self.status.is_active() {
            return;
        }
        let elapsed = self.elapsed_seconds(now);
        // never let the clock run backwards on a skewed `now`
        self.metrics.elapsed_seconds = self.metrics.elapsed_seconds.max(elapsed);
        self.metrics.recompute_derived();
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(WorkoutStatus::Paused) {
            return false;
        }
        self.sync_elapsed(now);
        self.status = WorkoutStatus::Paused;
        self.last_pause_at = Some(now);
        true
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != WorkoutStatus::Paused {
            return false;
        }
        self.close_pause(now);
        self.status = WorkoutStatus::Running;
        true
    }

    fn close_pause(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.last_pause_at.take() {
            let pause_ms = (now - paused_at).num_milliseconds().max(0) as u64;
            self.paused_ms = self.paused_ms.saturating_add(pause_ms);
        }
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(WorkoutStatus::Ended) {
            return false;
        }
        self.sync_elapsed(now);
        self.close_pause(now);
        self.status = WorkoutStatus::Ended;
        true
    }

    /// Hard reset after a hardware fault. No graceful pause.
    pub fn fail(&mut self, message: String) {
        *self = Self {
            last_error: Some(message),
            ..Self::default()
        };
    }

    /// Applies one hardware sample. Returns `false` when the session does
    /// not accept updates (idle or ended).
    pub fn apply_sample(&mut self, sample: SensorSample, at: DateTime<Utc>) -> bool {
        if !self.status.is_active() {
            return false;
        }

        match sample {
            SensorSample::HeartRate { bpm } => {
                if bpm <= 0.0 || !bpm.is_finite() {
                    return false;
                }
                self.metrics.current_heart_rate = bpm;
                self.heart_rate_sum += bpm;
                self.heart_rate_samples.push(HeartRateSample { bpm, timestamp: at });
                self.metrics.average_heart_rate =
                    self.heart_rate_sum / self.heart_rate_samples.len() as f64;
            }
            SensorSample::Distance { total_meters } => {
                self.metrics.distance_meters = self.metrics.distance_meters.max(total_meters);
            }
            SensorSample::Steps { total } => {
                self.metrics.step_count = self.metrics.step_count.max(total);
            }
            SensorSample::ActiveEnergy { total_kcal } => {
                self.metrics.active_calories = self.metrics.active_calories.max(total_kcal);
            }
            SensorSample::Speed { meters_per_second } => {
                self.metrics.current_pace = pace_from_speed(meters_per_second);
            }
            SensorSample::Location {
                latitude,
                longitude,
                altitude,
            } => {
                let previous_altitude = self.route_points.last().and_then(|point| point.altitude);
                if let (Some(previous), Some(current)) = (previous_altitude, altitude) {
                    if current > previous {
                        self.elevation_gain += current - previous;
                    }
                }
                self.route_points.push(RoutePoint {
                    latitude,
                    longitude,
                    altitude,
                    timestamp: at,
                });
            }
        }

        self.sync_elapsed(at);
        true
    }
}
