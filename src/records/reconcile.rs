//! Materialises workouts that reached the health store without going
//! through this app (synced from another device, written by another app).

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::SharedClock,
    db::Database,
    health::{ExternalWorkout, HealthStore},
    models::WorkoutRecord,
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

fn record_from_external(workout: &ExternalWorkout, end_date: DateTime<Utc>) -> WorkoutRecord {
    let mut record =
        WorkoutRecord::begin(workout.workout_kind, workout.environment, workout.start_date);
    record.duration_seconds = workout.duration_seconds;
    record.distance_meters = workout.distance_meters;
    record.step_count = workout.step_count;
    record.active_calories = workout.active_calories;
    record.average_heart_rate = workout.average_heart_rate;
    record.external_id = Some(workout.external_id.clone());
    record.complete(end_date, true);
    record
}

/// One reconciliation pass. Returns how many records were created.
///
/// Only completed external workouts are considered, so a workout still being
/// recorded is never duplicated. Running it twice creates nothing new.
pub async fn reconcile(
    db: &Database,
    health: &dyn HealthStore,
    clock: &SharedClock,
    lookback_days: i64,
) -> Result<usize> {
    let since = clock.now() - ChronoDuration::days(lookback_days.max(0));
    let external = health
        .recent_workouts(since)
        .await
        .context("failed to fetch recent health store workouts")?;
    let known = db.external_workout_ids().await?;

    let mut created = 0;
    for workout in external.iter().filter(|workout| workout.is_completed()) {
        if known.contains(&workout.external_id) {
            continue;
        }
        let Some(end_date) = workout.end_date else {
            continue;
        };
        // the unique index settles a race with a live completion
        if db.insert_reconciled_workout(&record_from_external(workout, end_date)).await? {
            created += 1;
        }
    }

    if created > 0 {
        log_info!("reconciliation imported {created} workout(s) from the health store");
    }
    Ok(created)
}

/// Runs [`reconcile`] on a fixed cadence until stopped.
pub struct Reconciler {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        db: Database,
        health: Arc<dyn HealthStore>,
        clock: SharedClock,
        interval: Duration,
        lookback_days: i64,
    ) {
        if self.handle.is_some() {
            return;
        }

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = reconcile(&db, health.as_ref(), &clock, lookback_days).await {
                            log_error!("reconciliation pass failed: {err:?}");
                        }
                    }
                    _ = token.cancelled() => {
                        log_info!("reconciliation loop shutting down");
                        break;
                    }
                }
            }
        });

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("reconciliation task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}
