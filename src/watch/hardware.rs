use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    error::HardwareError,
    models::{WorkoutEnvironment, WorkoutKind},
};

/// One delivery from the sensor hardware. Totals are cumulative since
/// session start; instantaneous values are the latest reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SensorSample {
    HeartRate { bpm: f64 },
    Distance { total_meters: f64 },
    Steps { total: u64 },
    ActiveEnergy { total_kcal: f64 },
    Speed { meters_per_second: f64 },
    Location {
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    Sample {
        sample: SensorSample,
        at: DateTime<Utc>,
    },
    /// The underlying session died; fatal for the current workout.
    Failed(HardwareError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkoutConfiguration {
    pub workout_kind: WorkoutKind,
    pub environment: WorkoutEnvironment,
    pub start_date: DateTime<Utc>,
}

/// Workout as saved by the hardware session into the health store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedWorkout {
    pub external_id: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Active duration; paused intervals are already excluded.
    pub duration_seconds: f64,
    pub distance_meters: f64,
    pub step_count: u64,
    pub active_calories: f64,
    pub average_heart_rate: Option<f64>,
}

/// Hardware-backed workout session (the sensor owner).
#[async_trait]
pub trait WorkoutHardware: Send + Sync + 'static {
    /// Configures and starts collection. Samples and failures arrive on the
    /// returned stream until `finalize`.
    async fn begin(
        &self,
        configuration: &WorkoutConfiguration,
    ) -> Result<mpsc::UnboundedReceiver<HardwareEvent>, HardwareError>;

    async fn pause(&self, at: DateTime<Utc>);

    async fn resume(&self, at: DateTime<Utc>);

    /// Stops collection and saves the workout.
    async fn finalize(&self, end_date: DateTime<Utc>) -> Result<FinalizedWorkout, HardwareError>;
}
