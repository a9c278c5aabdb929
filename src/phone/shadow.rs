use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    models::{WorkoutEnvironment, WorkoutKind, WorkoutMetrics},
    protocol::MetricSnapshot,
};

/// The phone's eventually consistent copy of the watch session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredShadowState {
    pub metrics: WorkoutMetrics,
    pub is_mirroring: bool,
    /// Phone-only workout on local sensors; never mirrored.
    pub is_local: bool,
    /// The watch started this session without being asked.
    pub is_watch_initiated: bool,
    pub is_paused: bool,
    /// Daily total captured once when mirroring began.
    pub steps_before_workout: u64,
    pub workout_kind: Option<WorkoutKind>,
    pub environment: Option<WorkoutEnvironment>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    paused_ms: i64,
    #[serde(skip)]
    pause_started_at: Option<DateTime<Utc>>,
}

impl MirroredShadowState {
    pub fn begin(
        &mut self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        started_at: DateTime<Utc>,
        steps_before_workout: u64,
        is_watch_initiated: bool,
    ) {
        *self = Self {
            metrics: WorkoutMetrics::default(),
            is_mirroring: true,
            is_local: false,
            is_watch_initiated,
            is_paused: false,
            steps_before_workout,
            workout_kind: Some(workout_kind),
            environment: Some(environment),
            started_at: Some(started_at),
            paused_ms: 0,
            pause_started_at: None,
        };
    }

    pub fn begin_local(
        &mut self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        started_at: DateTime<Utc>,
        steps_before_workout: u64,
    ) {
        self.begin(workout_kind, environment, started_at, steps_before_workout, false);
        self.is_mirroring = false;
        self.is_local = true;
    }

    pub fn is_active(&self) -> bool {
        self.is_mirroring || self.is_local
    }

    /// `S + W`: the day's total before the workout plus the workout's own
    /// steps. The live daily total is never consulted here; it already
    /// contains W.
    pub fn total_daily_steps(&self) -> u64 {
        self.steps_before_workout
            .saturating_add(self.metrics.step_count)
    }

    /// Full-state overwrite. Returns `false` (and changes nothing) once
    /// mirroring has stopped, so a late snapshot cannot resurrect a session.
    pub fn apply_snapshot(&mut self, snapshot: &MetricSnapshot) -> bool {
        if !self.is_mirroring {
            return false;
        }
        snapshot.apply_to(&mut self.metrics);
        self.metrics.recompute_derived();
        true
    }

    /// Follows the watch's pause state. Returns `true` if it changed.
    pub fn set_paused(&mut self, paused: bool, now: DateTime<Utc>) -> bool {
        if paused == self.is_paused {
            return false;
        }
        if paused {
            self.pause_started_at = Some(now);
        } else if let Some(pause_started_at) = self.pause_started_at.take() {
            self.paused_ms += (now - pause_started_at).num_milliseconds().max(0);
        }
        self.is_paused = paused;
        true
    }

    /// Local approximation of the watch's elapsed time; may be a tick off.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };
        let mut paused_ms = self.paused_ms;
        if let Some(pause_started_at) = self.pause_started_at {
            paused_ms += (now - pause_started_at).num_milliseconds().max(0);
        }
        ((now - started_at).num_milliseconds() - paused_ms).max(0) as f64 / 1000.0
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_mirroring || self.is_paused {
            return false;
        }
        let elapsed = self.elapsed_seconds(now);
        self.metrics.elapsed_seconds = self.metrics.elapsed_seconds.max(elapsed);
        self.metrics.recompute_derived();
        true
    }

    /// Stops mirroring but keeps the last metrics for the record writer.
    pub fn finish(&mut self) {
        self.is_mirroring = false;
        self.is_local = false;
        self.is_paused = false;
        self.pause_started_at = None;
        self.workout_kind = None;
        self.environment = None;
    }
}
