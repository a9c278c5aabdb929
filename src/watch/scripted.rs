//! Scriptable stand-in for the sensor hardware.
//!
//! Drives the simulation binary and tests: samples and failures are pushed
//! by the caller, and `finalize` reports totals of what was pushed.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::hardware::{
    FinalizedWorkout, HardwareEvent, SensorSample, WorkoutConfiguration, WorkoutHardware,
};
use crate::error::HardwareError;

#[derive(Default)]
struct ScriptState {
    events_tx: Option<mpsc::UnboundedSender<HardwareEvent>>,
    configuration: Option<WorkoutConfiguration>,
    paused_at: Option<DateTime<Utc>>,
    paused_ms: i64,
    distance_meters: f64,
    step_count: u64,
    active_calories: f64,
    heart_rates: Vec<f64>,
    begin_error: Option<HardwareError>,
    finalize_error: Option<HardwareError>,
    finalize_calls: usize,
}

#[derive(Default)]
pub struct ScriptedHardware {
    state: Mutex<ScriptState>,
}

impl ScriptedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delivers a sample as if the sensor produced it now.
    pub fn emit(&self, sample: SensorSample) -> bool {
        self.emit_at(sample, Utc::now())
    }

    pub fn emit_at(&self, sample: SensorSample, at: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        match sample {
            SensorSample::Distance { total_meters } => {
                state.distance_meters = state.distance_meters.max(total_meters)
            }
            SensorSample::Steps { total } => state.step_count = state.step_count.max(total),
            SensorSample::ActiveEnergy { total_kcal } => {
                state.active_calories = state.active_calories.max(total_kcal)
            }
            SensorSample::HeartRate { bpm } => state.heart_rates.push(bpm),
            SensorSample::Speed { .. } | SensorSample::Location { .. } => {}
        }

        match &state.events_tx {
            Some(tx) => tx.send(HardwareEvent::Sample { sample, at }).is_ok(),
            None => false,
        }
    }

    /// Kills the running session from the hardware side.
    pub fn fail(&self, message: &str) -> bool {
        let state = self.lock();
        match &state.events_tx {
            Some(tx) => tx
                .send(HardwareEvent::Failed(HardwareError::SessionFailed(
                    message.to_string(),
                )))
                .is_ok(),
            None => false,
        }
    }

    pub fn fail_next_begin(&self, error: HardwareError) {
        self.lock().begin_error = Some(error);
    }

    pub fn fail_next_finalize(&self, error: HardwareError) {
        self.lock().finalize_error = Some(error);
    }

    pub fn finalize_calls(&self) -> usize {
        self.lock().finalize_calls
    }
}

#[async_trait]
impl WorkoutHardware for ScriptedHardware {
    async fn begin(
        &self,
        configuration: &WorkoutConfiguration,
    ) -> Result<mpsc::UnboundedReceiver<HardwareEvent>, HardwareError> {
        let mut state = self.lock();
        if let Some(err) = state.begin_error.take() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let finalize_error = state.finalize_error.take();
        *state = ScriptState {
            events_tx: Some(tx),
            configuration: Some(*configuration),
            finalize_error,
            ..ScriptState::default()
        };
        Ok(rx)
    }

    async fn pause(&self, at: DateTime<Utc>) {
        let mut state = self.lock();
        if state.paused_at.is_none() {
            state.paused_at = Some(at);
        }
    }

    async fn resume(&self, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(paused_at) = state.paused_at.take() {
            state.paused_ms += (at - paused_at).num_milliseconds().max(0);
        }
    }

    async fn finalize(&self, end_date: DateTime<Utc>) -> Result<FinalizedWorkout, HardwareError> {
        let mut state = self.lock();
        state.finalize_calls += 1;
        state.events_tx = None;

        if let Some(err) = state.finalize_error.take() {
            return Err(err);
        }
        let configuration = state
            .configuration
            .ok_or_else(|| HardwareError::Finalization("no session was started".into()))?;

        if let Some(paused_at) = state.paused_at.take() {
            state.paused_ms += (end_date - paused_at).num_milliseconds().max(0);
        }
        let active_ms =
            (end_date - configuration.start_date).num_milliseconds() - state.paused_ms;
        let average_heart_rate = (!state.heart_rates.is_empty())
            .then(|| state.heart_rates.iter().sum::<f64>() / state.heart_rates.len() as f64);

        Ok(FinalizedWorkout {
            external_id: Some(Uuid::new_v4().to_string()),
            start_date: configuration.start_date,
            end_date,
            duration_seconds: active_ms.max(0) as f64 / 1000.0,
            distance_meters: state.distance_meters,
            step_count: state.step_count,
            active_calories: state.active_calories,
            average_heart_rate,
        })
    }
}
