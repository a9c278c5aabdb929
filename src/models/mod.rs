pub mod record;
pub mod workout;

pub use record::{DailyStepRecord, HeartRateSample, RoutePoint, WorkoutRecord};
pub use workout::{
    average_pace, cadence, pace_from_speed, WorkoutEnvironment, WorkoutKind, WorkoutMetrics,
    WorkoutStatus, METERS_PER_SECOND_TO_MIN_PER_KM,
};
