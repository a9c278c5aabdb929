use serde::{Deserialize, Serialize};

/// Converts a speed in m/s into a pace in minutes per kilometre.
pub const METERS_PER_SECOND_TO_MIN_PER_KM: f64 = 1000.0 / 60.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WorkoutKind {
    Walking,
    Running,
}

impl WorkoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkoutKind::Walking => "walking",
            WorkoutKind::Running => "running",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            WorkoutKind::Walking => "Walk",
            WorkoutKind::Running => "Run",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WorkoutEnvironment {
    Indoor,
    Outdoor,
}

impl WorkoutEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkoutEnvironment::Indoor => "indoor",
            WorkoutEnvironment::Outdoor => "outdoor",
        }
    }
}

/// Lifecycle of one sensor session. Only the device running the sensor
/// session is authoritative for this value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WorkoutStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Ended,
}

impl WorkoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkoutStatus::Idle => "idle",
            WorkoutStatus::Running => "running",
            WorkoutStatus::Paused => "paused",
            WorkoutStatus::Ended => "ended",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, WorkoutStatus::Running | WorkoutStatus::Paused)
    }

    /// Whether a new session may begin from this status. `Ended` is terminal
    /// for its own session; a new one starts from a fresh state rather than
    /// moving the old one back to running.
    pub fn can_begin_session(&self) -> bool {
        matches!(self, WorkoutStatus::Idle | WorkoutStatus::Ended)
    }

    /// The only legal edges within one session: idle→running,
    /// running⇄paused, running|paused→ended. See [`Self::can_begin_session`]
    /// for starting over after an end.
    pub fn can_transition_to(&self, next: WorkoutStatus) -> bool {
        matches!(
            (self, next),
            (WorkoutStatus::Idle, WorkoutStatus::Running)
                | (WorkoutStatus::Running, WorkoutStatus::Paused)
                | (WorkoutStatus::Paused, WorkoutStatus::Running)
                | (WorkoutStatus::Running, WorkoutStatus::Ended)
                | (WorkoutStatus::Paused, WorkoutStatus::Ended)
        )
    }
}

/// Live metrics of a session. Cumulative fields never decrease; the
/// `current_*` fields track the latest sample and may fluctuate.
///
/// Paces are minutes per kilometre, cadence is steps per minute. A value of
/// zero means "not yet defined".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutMetrics {
    pub elapsed_seconds: f64,
    pub distance_meters: f64,
    pub step_count: u64,
    pub active_calories: f64,
    pub current_heart_rate: f64,
    pub average_heart_rate: f64,
    pub current_pace: f64,
    pub average_pace: f64,
    pub cadence: f64,
}

impl WorkoutMetrics {
    /// Recomputes the fields derived from distance, steps and elapsed time.
    pub fn recompute_derived(&mut self) {
        self.average_pace = average_pace(self.distance_meters, self.elapsed_seconds);
        self.cadence = cadence(self.step_count, self.elapsed_seconds);
    }
}

/// Pace in min/km for an instantaneous speed, or 0 when not moving.
pub fn pace_from_speed(meters_per_second: f64) -> f64 {
    if meters_per_second > 0.0 && meters_per_second.is_finite() {
        METERS_PER_SECOND_TO_MIN_PER_KM / meters_per_second
    } else {
        0.0
    }
}

/// Average pace in min/km, undefined (0) until both distance and elapsed
/// time are positive.
pub fn average_pace(distance_meters: f64, elapsed_seconds: f64) -> f64 {
    if distance_meters <= 0.0 || elapsed_seconds <= 0.0 {
        return 0.0;
    }
    pace_from_speed(distance_meters / elapsed_seconds)
}

pub fn cadence(step_count: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    step_count as f64 / elapsed_seconds * 60.0
}
