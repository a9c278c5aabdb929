//! The platform health-data store, consumed through a narrow async port.

use std::{collections::BTreeMap, sync::Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    models::{WorkoutEnvironment, WorkoutKind, WorkoutRecord},
};

/// A workout as the health store knows it, whoever wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalWorkout {
    pub external_id: String,
    pub workout_kind: WorkoutKind,
    pub environment: WorkoutEnvironment,
    pub start_date: DateTime<Utc>,
    /// `None` while the owning session is still recording.
    pub end_date: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub distance_meters: f64,
    pub step_count: u64,
    pub active_calories: f64,
    pub average_heart_rate: Option<f64>,
}

impl ExternalWorkout {
    pub fn is_completed(&self) -> bool {
        self.end_date.is_some()
    }
}

#[async_trait]
pub trait HealthStore: Send + Sync + 'static {
    async fn today_step_count(&self) -> Result<u64>;

    /// Daily totals for every day in `from..=to` that has data.
    async fn step_counts(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<(NaiveDate, u64)>>;

    async fn distance_for_date(&self, date: NaiveDate) -> Result<f64>;

    async fn active_calories_for_date(&self, date: NaiveDate) -> Result<f64>;

    async fn average_heart_rate_for_date(&self, date: NaiveDate) -> Result<Option<f64>>;

    /// Live today's-step total. The receiver starts at the current value.
    fn subscribe_step_count(&self) -> watch::Receiver<u64>;

    /// Writes a completed workout and returns its store identifier.
    async fn save_workout(&self, record: &WorkoutRecord) -> Result<String>;

    /// Workouts that started at or after `since`, including in-progress ones.
    async fn recent_workouts(&self, since: DateTime<Utc>) -> Result<Vec<ExternalWorkout>>;
}

#[derive(Default)]
struct MemoryData {
    steps: BTreeMap<NaiveDate, u64>,
    distance: BTreeMap<NaiveDate, f64>,
    calories: BTreeMap<NaiveDate, f64>,
    heart_rates: BTreeMap<NaiveDate, Vec<f64>>,
    workouts: Vec<ExternalWorkout>,
    fail_writes: bool,
}

/// In-memory health store for the simulation and tests.
pub struct MemoryHealthStore {
    data: Mutex<MemoryData>,
    steps_tx: watch::Sender<u64>,
    clock: SharedClock,
}

impl MemoryHealthStore {
    pub fn new(clock: SharedClock) -> Self {
        let (steps_tx, _) = watch::channel(0);
        Self {
            data: Mutex::new(MemoryData::default()),
            steps_tx,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryData> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Sets the step total for `date`, notifying subscribers when it is today.
    pub fn set_steps(&self, date: NaiveDate, steps: u64) {
        self.lock().steps.insert(date, steps);
        if date == self.today() {
            self.steps_tx.send_replace(steps);
        }
    }

    pub fn add_distance(&self, date: NaiveDate, meters: f64) {
        *self.lock().distance.entry(date).or_default() += meters;
    }

    pub fn add_active_calories(&self, date: NaiveDate, kcal: f64) {
        *self.lock().calories.entry(date).or_default() += kcal;
    }

    pub fn add_heart_rate(&self, date: NaiveDate, bpm: f64) {
        self.lock().heart_rates.entry(date).or_default().push(bpm);
    }

    /// Simulates a workout synced into the store by another writer.
    pub fn insert_external(&self, workout: ExternalWorkout) {
        self.lock().workouts.push(workout);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn workout_count(&self) -> usize {
        self.lock().workouts.len()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn today_step_count(&self) -> Result<u64> {
        let today = self.today();
        Ok(self.lock().steps.get(&today).copied().unwrap_or(0))
    }

    async fn step_counts(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<(NaiveDate, u64)>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()
            .steps
            .range(from..=to)
            .map(|(date, steps)| (*date, *steps))
            .collect())
    }

    async fn distance_for_date(&self, date: NaiveDate) -> Result<f64> {
        Ok(self.lock().distance.get(&date).copied().unwrap_or(0.0))
    }

    async fn active_calories_for_date(&self, date: NaiveDate) -> Result<f64> {
        Ok(self.lock().calories.get(&date).copied().unwrap_or(0.0))
    }

    async fn average_heart_rate_for_date(&self, date: NaiveDate) -> Result<Option<f64>> {
        let data = self.lock();
        Ok(data
            .heart_rates
            .get(&date)
            .filter(|samples| !samples.is_empty())
            .map(|samples| samples.iter().sum::<f64>() / samples.len() as f64))
    }

    fn subscribe_step_count(&self) -> watch::Receiver<u64> {
        self.steps_tx.subscribe()
    }

    async fn save_workout(&self, record: &WorkoutRecord) -> Result<String> {
        let mut data = self.lock();
        if data.fail_writes {
            return Err(anyhow!("health store refused the workout write"));
        }

        let external_id = record
            .external_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        data.workouts.push(ExternalWorkout {
            external_id: external_id.clone(),
            workout_kind: record.workout_kind,
            environment: record.environment,
            start_date: record.start_date,
            end_date: record.end_date,
            duration_seconds: record.duration_seconds,
            distance_meters: record.distance_meters,
            step_count: record.step_count,
            active_calories: record.active_calories,
            average_heart_rate: record.average_heart_rate,
        });
        Ok(external_id)
    }

    async fn recent_workouts(&self, since: DateTime<Utc>) -> Result<Vec<ExternalWorkout>> {
        Ok(self
            .lock()
            .workouts
            .iter()
            .filter(|workout| workout.start_date >= since)
            .cloned()
            .collect())
    }
}
