//! Message vocabulary exchanged between the phone and the watch.
//!
//! Both roles build and parse messages with these types so the two sides
//! cannot drift. Messages carry no sequence numbers: commands are
//! serialised by their senders and snapshots are full-state overwrites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{WorkoutEnvironment, WorkoutKind, WorkoutMetrics, WorkoutStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    StartWorkout,
    PauseWorkout,
    ResumeWorkout,
    EndWorkout,
    WorkoutStarted,
    WorkoutEnded,
    Error,
}

impl CommandKind {
    /// Kinds a peer may send as a request (the rest only appear as replies).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            CommandKind::StartWorkout
                | CommandKind::PauseWorkout
                | CommandKind::ResumeWorkout
                | CommandKind::EndWorkout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workout_kind: Option<WorkoutKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<WorkoutEnvironment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CommandMessage {
    fn bare(kind: CommandKind) -> Self {
        Self {
            kind,
            workout_kind: None,
            environment: None,
            error_message: None,
        }
    }

    pub fn start(workout_kind: WorkoutKind, environment: WorkoutEnvironment) -> Self {
        Self {
            workout_kind: Some(workout_kind),
            environment: Some(environment),
            ..Self::bare(CommandKind::StartWorkout)
        }
    }

    pub fn pause() -> Self {
        Self::bare(CommandKind::PauseWorkout)
    }

    pub fn resume() -> Self {
        Self::bare(CommandKind::ResumeWorkout)
    }

    pub fn end() -> Self {
        Self::bare(CommandKind::EndWorkout)
    }

    pub fn started() -> Self {
        Self::bare(CommandKind::WorkoutStarted)
    }

    pub fn ended() -> Self {
        Self::bare(CommandKind::WorkoutEnded)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::bare(CommandKind::Error)
        }
    }
}

/// Full-state metrics pushed from the sensor side. Never a delta.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub distance_meters: f64,
    pub step_count: u64,
    pub active_calories: f64,
    pub current_heart_rate: f64,
    pub average_heart_rate: f64,
    pub current_pace: f64,
}

impl From<&WorkoutMetrics> for MetricSnapshot {
    fn from(metrics: &WorkoutMetrics) -> Self {
        Self {
            distance_meters: metrics.distance_meters,
            step_count: metrics.step_count,
            active_calories: metrics.active_calories,
            current_heart_rate: metrics.current_heart_rate,
            average_heart_rate: metrics.average_heart_rate,
            current_pace: metrics.current_pace,
        }
    }
}

impl MetricSnapshot {
    /// Overwrites the mirrored fields of `metrics`, leaving the locally
    /// derived ones (elapsed time, averages over it) to the caller.
    pub fn apply_to(&self, metrics: &mut WorkoutMetrics) {
        metrics.distance_meters = self.distance_meters;
        metrics.step_count = self.step_count;
        metrics.active_calories = self.active_calories;
        metrics.current_heart_rate = self.current_heart_rate;
        metrics.average_heart_rate = self.average_heart_rate;
        metrics.current_pace = self.current_pace;
    }
}

/// Lifecycle callbacks of the mirrored sensor session as observed by the
/// passive device. These are not replies to commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum SessionSignal {
    #[serde(rename_all = "camelCase")]
    Started {
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        started_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StateChanged { status: WorkoutStatus },
    #[serde(rename_all = "camelCase")]
    Ended {
        #[serde(default)]
        external_id: Option<String>,
        #[serde(default)]
        duration_seconds: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Failed { message: String },
}

/// Everything that travels over the device link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum Envelope {
    Command(CommandMessage),
    Snapshot(MetricSnapshot),
    Signal(SessionSignal),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_command_wire_shape() {
        let envelope = Envelope::Command(CommandMessage::start(
            WorkoutKind::Running,
            WorkoutEnvironment::Outdoor,
        ));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "command",
                "body": {
                    "kind": "startWorkout",
                    "workoutKind": "running",
                    "environment": "outdoor"
                }
            })
        );
    }

    #[test]
    fn error_reply_carries_message() {
        let value = serde_json::to_value(CommandMessage::error("already running")).unwrap();
        assert_eq!(value, json!({ "kind": "error", "errorMessage": "already running" }));
    }

    #[test]
    fn ended_signal_tolerates_missing_fields() {
        let parsed: Envelope = serde_json::from_value(json!({
            "type": "signal",
            "body": { "signal": "ended" }
        }))
        .unwrap();
        assert_eq!(
            parsed,
            Envelope::Signal(SessionSignal::Ended {
                external_id: None,
                duration_seconds: None
            })
        );
    }

    #[test]
    fn snapshot_overwrites_only_mirrored_fields() {
        let mut metrics = WorkoutMetrics {
            elapsed_seconds: 42.0,
            step_count: 10,
            ..WorkoutMetrics::default()
        };
        let snapshot = MetricSnapshot {
            step_count: 500,
            distance_meters: 400.0,
            ..MetricSnapshot::default()
        };
        snapshot.apply_to(&mut metrics);
        assert_eq!(metrics.step_count, 500);
        assert_eq!(metrics.distance_meters, 400.0);
        assert_eq!(metrics.elapsed_seconds, 42.0);
    }

    #[test]
    fn only_control_kinds_are_requests() {
        assert!(CommandKind::StartWorkout.is_request());
        assert!(CommandKind::EndWorkout.is_request());
        assert!(!CommandKind::WorkoutStarted.is_request());
        assert!(!CommandKind::Error.is_request());
    }
}
