use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::SharedClock,
    db::Database,
    health::HealthStore,
    models::DailyStepRecord,
    shared_store::SharedStore,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Keeps the shared daily step total and today's [`DailyStepRecord`] in
/// line with the health store's live step count.
pub struct DailyStepTracker {
    health: Arc<dyn HealthStore>,
    shared_store: SharedStore,
    db: Database,
    clock: SharedClock,
    daily_goal: u64,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl DailyStepTracker {
    pub fn new(
        health: Arc<dyn HealthStore>,
        shared_store: SharedStore,
        db: Database,
        clock: SharedClock,
        daily_goal: i64,
    ) -> Self {
        Self {
            health,
            shared_store,
            db,
            clock,
            daily_goal: daily_goal.max(0) as u64,
            handle: None,
            cancel_token: None,
        }
    }

    /// One-off pull of today's total.
    pub async fn refresh(&self) -> Result<u64> {
        let steps = self
            .health
            .today_step_count()
            .await
            .context("failed to query today's step count")?;
        record_steps(&self.shared_store, &self.db, &self.clock, self.daily_goal, steps).await;
        Ok(steps)
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let steps_rx = self.health.subscribe_step_count();
        let shared_store = self.shared_store.clone();
        let db = self.db.clone();
        let clock = self.clock.clone();
        let daily_goal = self.daily_goal;

        self.handle = Some(tokio::spawn(async move {
            track_steps(steps_rx, shared_store, db, clock, daily_goal, token).await;
        }));
        self.cancel_token = Some(cancel_token);
        log_info!("daily step tracking started");
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.await.context("step tracking task failed to join")?;
        }
        Ok(())
    }
}

async fn track_steps(
    mut steps_rx: watch::Receiver<u64>,
    shared_store: SharedStore,
    db: Database,
    clock: SharedClock,
    daily_goal: u64,
    cancel_token: CancellationToken,
) {
    loop {
        let steps = *steps_rx.borrow_and_update();
        record_steps(&shared_store, &db, &clock, daily_goal, steps).await;

        tokio::select! {
            changed = steps_rx.changed() => {
                if changed.is_err() {
                    log_debug!("step subscription closed");
                    break;
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn record_steps(
    shared_store: &SharedStore,
    db: &Database,
    clock: &SharedClock,
    daily_goal: u64,
    steps: u64,
) {
    let now = clock.now();
    let today = now.date_naive();

    if let Err(err) = shared_store.set_daily_step_total(today, steps) {
        log_warn!("failed to publish daily step total: {err:?}");
    }
    if let Err(err) = db
        .upsert_daily_steps(&DailyStepRecord::new(today, steps, daily_goal, now))
        .await
    {
        log_warn!("failed to save daily steps: {err:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        health::MemoryHealthStore,
    };
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn live_step_count_reaches_shared_store_and_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("steps.db")).unwrap();
        let clock = ManualClock::new(Utc::now());
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let health = Arc::new(MemoryHealthStore::new(shared_clock.clone()));
        let shared_store = SharedStore::open(dir.path().join("group.json")).unwrap();
        let today = clock.now().date_naive();

        health.set_steps(today, 4_000);
        let mut tracker = DailyStepTracker::new(
            health.clone(),
            shared_store.clone(),
            db.clone(),
            shared_clock,
            10_000,
        );
        assert_eq!(tracker.refresh().await.unwrap(), 4_000);
        assert_eq!(shared_store.daily_step_total(), 4_000);

        tracker.start();
        health.set_steps(today, 10_200);
        for _ in 0..100 {
            if shared_store.daily_step_total() == 10_200 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tracker.stop().await.unwrap();

        assert_eq!(shared_store.daily_step_total(), 10_200);
        let record = db.get_daily_steps(today).await.unwrap().unwrap();
        assert_eq!(record.steps, 10_200);
        assert!(record.goal_met);
    }
}
