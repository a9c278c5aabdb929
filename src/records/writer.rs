use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::{
    clock::SharedClock,
    db::Database,
    health::HealthStore,
    models::{
        HeartRateSample, RoutePoint, WorkoutEnvironment, WorkoutKind, WorkoutMetrics,
        WorkoutRecord,
    },
};

struct OpenRecord {
    record: WorkoutRecord,
    /// `false` while the optimistic insert has not reached the database.
    stored: bool,
}

/// Turns one session into one persisted [`WorkoutRecord`].
///
/// Persistence failures never interrupt a workout: they are logged, the
/// in-memory record stays authoritative and the next save retries.
#[derive(Clone)]
pub struct WorkoutRecordWriter {
    db: Database,
    health: Arc<dyn HealthStore>,
    clock: SharedClock,
    current: Arc<Mutex<Option<OpenRecord>>>,
}

impl WorkoutRecordWriter {
    pub fn new(db: Database, health: Arc<dyn HealthStore>, clock: SharedClock) -> Self {
        Self {
            db,
            health,
            clock,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn current(&self) -> Option<WorkoutRecord> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|open| open.record.clone())
    }

    /// Creates the record with zero metrics as soon as the workout starts.
    pub async fn begin(
        &self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        start_date: DateTime<Utc>,
    ) -> WorkoutRecord {
        let record = WorkoutRecord::begin(workout_kind, environment, start_date);

        let stored = match self.db.insert_workout(&record).await {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to insert workout {}: {err:?}", record.id);
                false
            }
        };

        let mut current = self.current.lock().await;
        if let Some(previous) = current.as_ref() {
            warn!(
                "Replacing unfinished workout record {} with {}",
                previous.record.id, record.id
            );
        }
        *current = Some(OpenRecord {
            record: record.clone(),
            stored,
        });
        record
    }

    pub async fn save_progress(&self, metrics: &WorkoutMetrics) {
        let now = self.clock.now();
        let mut current = self.current.lock().await;
        let Some(open) = current.as_mut() else {
            return;
        };

        open.record.apply_metrics(metrics, now);
        self.persist_progress(open).await;
    }

    /// Adds the route and heart-rate detail of a local sensor session to the
    /// open record; it is written out on completion.
    pub async fn attach_samples(
        &self,
        route_points: Vec<RoutePoint>,
        heart_rate_samples: Vec<HeartRateSample>,
        elevation_gain: f64,
    ) {
        let mut current = self.current.lock().await;
        let Some(open) = current.as_mut() else {
            return;
        };
        open.record
            .apply_samples(route_points, heart_rate_samples, elevation_gain);
    }

    async fn persist_progress(&self, open: &mut OpenRecord) {
        let result = if open.stored {
            self.db.update_workout_progress(&open.record).await
        } else {
            self.db.insert_workout(&open.record).await
        };

        match result {
            Ok(()) => open.stored = true,
            Err(err) => warn!("Failed to save progress for workout {}: {err:?}", open.record.id),
        }
    }

    /// Finalises the open record.
    ///
    /// `hardware_duration` is the sensor-session duration with pauses already
    /// excluded; it is kept when non-zero, otherwise the wall-clock span is
    /// used. Workouts without an external id are written to the health store
    /// so reconciliation recognises them later.
    pub async fn complete(
        &self,
        metrics: &WorkoutMetrics,
        external_id: Option<String>,
        hardware_duration: Option<f64>,
    ) -> Option<WorkoutRecord> {
        let end_date = self.clock.now();
        let mut open = self.current.lock().await.take()?;

        let record = &mut open.record;
        record.apply_metrics(metrics, end_date);
        record.duration_seconds = hardware_duration.unwrap_or(0.0);
        record.external_id = external_id;
        record.complete(end_date, true);

        if record.external_id.is_none() {
            match self.health.save_workout(record).await {
                Ok(id) => record.external_id = Some(id),
                Err(err) => warn!("Failed to save workout {} to the health store: {err:?}", record.id),
            }
        }

        if !open.stored {
            if let Err(err) = self.db.insert_workout(&open.record).await {
                error!("Failed to insert workout {}: {err:?}", open.record.id);
                return Some(open.record);
            }
        }

        match self.db.complete_workout(&open.record).await {
            Ok(true) => info!(
                "Saved workout {} ({:.0}s, {} steps)",
                open.record.id, open.record.duration_seconds, open.record.step_count
            ),
            Ok(false) => warn!("Workout {} was already completed", open.record.id),
            Err(err) => error!("Failed to complete workout {}: {err:?}", open.record.id),
        }

        Some(open.record)
    }

    /// Finalises workouts left open by a previous run and flags them as
    /// interrupted. The last saved progress is taken as the end.
    pub async fn recover_incomplete(&self) -> anyhow::Result<usize> {
        let incomplete = self.db.get_incomplete_workouts().await?;
        let mut recovered = 0;

        for mut record in incomplete {
            warn!(
                "Recovered incomplete workout {}; marking as interrupted",
                record.id
            );
            let end_date = record.updated_at.max(record.start_date);
            record.complete(end_date, true);
            if self.db.mark_workout_interrupted(&record).await? {
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        health::MemoryHealthStore,
    };
    use chrono::{Duration, Timelike};
    use tempfile::TempDir;

    struct Fixture {
        writer: WorkoutRecordWriter,
        db: Database,
        health: Arc<MemoryHealthStore>,
        clock: ManualClock,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("records.db")).unwrap();
        let clock = ManualClock::new(Utc::now().with_nanosecond(0).unwrap());
        let health = Arc::new(MemoryHealthStore::new(Arc::new(clock.clone())));
        let writer = WorkoutRecordWriter::new(db.clone(), health.clone(), Arc::new(clock.clone()));
        Fixture {
            writer,
            db,
            health,
            clock,
            _dir: dir,
        }
    }

    fn metrics(elapsed: f64, steps: u64) -> WorkoutMetrics {
        WorkoutMetrics {
            elapsed_seconds: elapsed,
            step_count: steps,
            distance_meters: steps as f64 * 0.8,
            ..WorkoutMetrics::default()
        }
    }

    #[tokio::test]
    async fn hardware_duration_is_preserved() {
        let f = fixture();
        let record = f
            .writer
            .begin(WorkoutKind::Running, WorkoutEnvironment::Outdoor, f.clock.now())
            .await;
        assert!(f.db.get_workout(&record.id).await.unwrap().is_some());

        // 30 minutes on the wall clock, 25 of them active
        f.clock.advance(Duration::minutes(30));
        let done = f
            .writer
            .complete(&metrics(1_500.0, 3_000), Some("hk-1".into()), Some(1_500.0))
            .await
            .unwrap();

        assert_eq!(done.duration_seconds, 1_500.0);
        let stored = f.db.get_workout(&record.id).await.unwrap().unwrap();
        assert!(stored.is_completed);
        assert_eq!(stored.duration_seconds, 1_500.0);
        assert_eq!(stored.external_id.as_deref(), Some("hk-1"));
        // it already lives in the health store, so nothing is written there
        assert_eq!(f.health.workout_count(), 0);
    }

    #[tokio::test]
    async fn missing_hardware_duration_falls_back_to_wall_clock() {
        let f = fixture();
        f.writer
            .begin(WorkoutKind::Walking, WorkoutEnvironment::Indoor, f.clock.now())
            .await;
        f.clock.advance(Duration::minutes(20));

        let done = f
            .writer
            .complete(&metrics(900.0, 1_000), None, Some(0.0))
            .await
            .unwrap();
        assert_eq!(done.duration_seconds, 1_200.0);
        // local-only workouts are written to the health store
        assert!(done.external_id.is_some());
        assert_eq!(f.health.workout_count(), 1);
    }

    #[tokio::test]
    async fn progress_is_saved_and_completion_happens_once() {
        let f = fixture();
        let record = f
            .writer
            .begin(WorkoutKind::Running, WorkoutEnvironment::Outdoor, f.clock.now())
            .await;

        f.clock.advance(Duration::seconds(60));
        f.writer.save_progress(&metrics(60.0, 150)).await;
        let stored = f.db.get_workout(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.step_count, 150);

        assert!(f.writer.complete(&metrics(61.0, 160), None, None).await.is_some());
        assert!(f.writer.complete(&metrics(99.0, 999), None, None).await.is_none());
        assert!(f.writer.current().await.is_none());
    }

    #[tokio::test]
    async fn health_store_failure_does_not_block_completion() {
        let f = fixture();
        let record = f
            .writer
            .begin(WorkoutKind::Walking, WorkoutEnvironment::Outdoor, f.clock.now())
            .await;
        f.health.set_fail_writes(true);
        f.clock.advance(Duration::seconds(300));

        let done = f.writer.complete(&metrics(300.0, 400), None, None).await.unwrap();
        assert!(done.external_id.is_none());
        assert!(f.db.get_workout(&record.id).await.unwrap().unwrap().is_completed);
    }

    #[tokio::test]
    async fn crashed_workouts_are_recovered_as_interrupted() {
        let f = fixture();
        let record = f
            .writer
            .begin(WorkoutKind::Running, WorkoutEnvironment::Outdoor, f.clock.now())
            .await;
        f.clock.advance(Duration::seconds(120));
        f.writer.save_progress(&metrics(110.0, 300)).await;

        // a fresh writer after relaunch
        let relaunched = WorkoutRecordWriter::new(f.db.clone(), f.health.clone(), Arc::new(f.clock.clone()));
        assert_eq!(relaunched.recover_incomplete().await.unwrap(), 1);
        assert_eq!(relaunched.recover_incomplete().await.unwrap(), 0);

        let stored = f.db.get_workout(&record.id).await.unwrap().unwrap();
        assert!(stored.is_completed);
        assert!(stored.is_interrupted);
        assert_eq!(stored.duration_seconds, 110.0);
    }

    #[tokio::test]
    async fn attached_samples_are_stored_on_completion() {
        let f = fixture();
        let start = f.clock.now();
        let record = f
            .writer
            .begin(WorkoutKind::Walking, WorkoutEnvironment::Outdoor, start)
            .await;

        let route = [Some(10.0), Some(15.0), None]
            .into_iter()
            .enumerate()
            .map(|(i, altitude)| RoutePoint {
                latitude: 52.0 + i as f64 * 0.001,
                longitude: 4.0,
                altitude,
                timestamp: start + Duration::seconds(i as i64 * 10),
            })
            .collect();
        let heart_rate = vec![HeartRateSample {
            bpm: 118.0,
            timestamp: start,
        }];
        f.writer.attach_samples(route, heart_rate, 5.0).await;
        f.clock.advance(Duration::seconds(30));
        f.writer.complete(&metrics(30.0, 40), None, Some(30.0)).await;

        let stored = f.db.get_workout(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.route_points.len(), 3);
        assert_eq!(stored.route_points[2].altitude, None);
        assert_eq!(stored.heart_rate_samples.len(), 1);
        assert_eq!(stored.elevation_gain, Some(5.0));
    }

    #[tokio::test]
    async fn flat_route_without_altitude_has_no_elevation_gain() {
        let f = fixture();
        let start = f.clock.now();
        let record = f
            .writer
            .begin(WorkoutKind::Running, WorkoutEnvironment::Outdoor, start)
            .await;
        let route = vec![RoutePoint {
            latitude: 52.0,
            longitude: 4.0,
            altitude: None,
            timestamp: start,
        }];
        f.writer.attach_samples(route, Vec::new(), 0.0).await;
        f.writer.complete(&metrics(10.0, 20), None, Some(10.0)).await;

        let stored = f.db.get_workout(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.route_points.len(), 1);
        assert_eq!(stored.elevation_gain, None);
    }
}
