use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time,
};

use super::{
    hardware::{FinalizedWorkout, HardwareEvent, WorkoutConfiguration, WorkoutHardware},
    state::WorkoutSessionState,
};
use crate::{
    clock::SharedClock,
    error::SessionError,
    models::{WorkoutEnvironment, WorkoutKind, WorkoutMetrics, WorkoutStatus},
};

const EVENT_CAPACITY: usize = 64;

/// What a sensor session publishes to its observers (mirror, UI, records).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        started_at: DateTime<Utc>,
    },
    StateChanged { status: WorkoutStatus },
    Metrics { metrics: WorkoutMetrics },
    Ended {
        metrics: WorkoutMetrics,
        finalized: Option<FinalizedWorkout>,
    },
    Failed { message: String },
}

/// Owner of the hardware workout session; the single authority for
/// start/pause/resume/end and for raw metric collection.
#[derive(Clone)]
pub struct SensorSession {
    state: Arc<Mutex<WorkoutSessionState>>,
    hardware: Arc<dyn WorkoutHardware>,
    clock: SharedClock,
    events: broadcast::Sender<SessionEvent>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    collector: Arc<Mutex<Option<JoinHandle<()>>>>,
    lifecycle: Arc<Mutex<()>>,
    tick_interval: Duration,
}

impl SensorSession {
    pub fn new(hardware: Arc<dyn WorkoutHardware>, clock: SharedClock, tick_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(WorkoutSessionState::new())),
            hardware,
            clock,
            events,
            ticker: Arc::new(Mutex::new(None)),
            collector: Arc::new(Mutex::new(None)),
            lifecycle: Arc::new(Mutex::new(())),
            tick_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn get_state(&self) -> WorkoutSessionState {
        let mut guard = self.state.lock().await;
        guard.sync_elapsed(self.clock.now());
        guard.clone()
    }

    pub async fn status(&self) -> WorkoutStatus {
        self.state.lock().await.status
    }

    pub async fn metrics(&self) -> WorkoutMetrics {
        let mut guard = self.state.lock().await;
        guard.sync_elapsed(self.clock.now());
        guard.metrics
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn start(
        &self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
    ) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.state.lock().await.status.can_begin_session() {
            return Err(SessionError::AlreadyActive);
        }

        let started_at = self.clock.now();
        let configuration = WorkoutConfiguration {
            workout_kind,
            environment,
            start_date: started_at,
        };

        // A failed begin leaves the previous state untouched.
        let hardware_events = self.hardware.begin(&configuration).await.map_err(|err| {
            error!("Failed to start {} workout: {err}", workout_kind.as_str());
            SessionError::from(err)
        })?;

        self.state
            .lock()
            .await
            .begin(workout_kind, environment, started_at);

        self.spawn_collector(hardware_events).await;
        self.spawn_ticker().await;

        info!(
            "Started {} {} workout",
            environment.as_str(),
            workout_kind.as_str()
        );
        self.emit(SessionEvent::Started {
            workout_kind,
            environment,
            started_at,
        });
        Ok(())
    }

    /// No-op unless running.
    pub async fn pause(&self) {
        let now = self.clock.now();
        let paused = self.state.lock().await.pause(now);
        if paused {
            self.hardware.pause(now).await;
            self.emit(SessionEvent::StateChanged {
                status: WorkoutStatus::Paused,
            });
        }
    }

    /// No-op unless paused.
    pub async fn resume(&self) {
        let now = self.clock.now();
        let resumed = self.state.lock().await.resume(now);
        if resumed {
            self.hardware.resume(now).await;
            self.emit(SessionEvent::StateChanged {
                status: WorkoutStatus::Running,
            });
        }
    }

    /// Ends the session and finalises it on the hardware.
    ///
    /// Returns `Ok(None)` when finalisation failed: local cleanup still
    /// happened and callers should fall back to the locally tracked metrics.
    pub async fn end(&self) -> Result<Option<FinalizedWorkout>, SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        let end_date = self.clock.now();

        let metrics = {
            let mut state = self.state.lock().await;
            if !state.end(end_date) {
                return Err(SessionError::NoActiveSession);
            }
            state.metrics
        };

        self.cancel_ticker().await;
        self.cancel_collector().await;

        let finalized = match self.hardware.finalize(end_date).await {
            Ok(finalized) => Some(finalized),
            Err(err) => {
                error!("Workout finalization failed, keeping local metrics: {err}");
                self.state.lock().await.last_error = Some(err.to_string());
                None
            }
        };

        info!(
            "Ended workout after {:.0}s ({} steps, {:.0} m)",
            metrics.elapsed_seconds, metrics.step_count, metrics.distance_meters
        );
        self.emit(SessionEvent::Ended {
            metrics,
            finalized: finalized.clone(),
        });
        Ok(finalized)
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn spawn_collector(&self, mut hardware_events: mpsc::UnboundedReceiver<HardwareEvent>) {
        let mut collector_guard = self.collector.lock().await;
        if let Some(handle) = collector_guard.take() {
            handle.abort();
        }

        let session = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = hardware_events.recv().await {
                match event {
                    HardwareEvent::Sample { sample, at } => {
                        let metrics = {
                            let mut state = session.state.lock().await;
                            state.apply_sample(sample, at).then_some(state.metrics)
                        };
                        if let Some(metrics) = metrics {
                            session.emit(SessionEvent::Metrics { metrics });
                        }
                    }
                    HardwareEvent::Failed(err) => {
                        session.handle_failure(err.to_string()).await;
                        break;
                    }
                }
            }
        });

        *collector_guard = Some(handle);
    }

    /// Hardware died mid-workout: hard reset to idle and tell observers.
    /// The caller that is affected did not initiate anything, so nothing is
    /// returned; the error lives in `last_error` and the `Failed` event.
    async fn handle_failure(&self, message: String) {
        {
            let mut state = self.state.lock().await;
            if !state.status.is_active() {
                return;
            }
            state.fail(message.clone());
        }

        warn!("Workout session failed: {message}");
        self.cancel_ticker().await;
        self.emit(SessionEvent::Failed { message });
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                let metrics = {
                    let mut guard = state.lock().await;
                    match guard.status {
                        WorkoutStatus::Running => {
                            guard.sync_elapsed(clock.now());
                            Some(guard.metrics)
                        }
                        WorkoutStatus::Paused => None,
                        WorkoutStatus::Idle | WorkoutStatus::Ended => break,
                    }
                };

                if let Some(metrics) = metrics {
                    let _ = events.send(SessionEvent::Metrics { metrics });
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    async fn cancel_collector(&self) {
        if let Some(handle) = self.collector.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        error::HardwareError,
        watch::{hardware::SensorSample, scripted::ScriptedHardware},
    };
    use chrono::Duration as ChronoDuration;

    fn session() -> (SensorSession, Arc<ScriptedHardware>, ManualClock) {
        let hardware = Arc::new(ScriptedHardware::new());
        let clock = ManualClock::new(Utc::now());
        let session = SensorSession::new(
            hardware.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        );
        (session, hardware, clock)
    }

    async fn wait_for_steps(session: &SensorSession, steps: u64) {
        for _ in 0..50 {
            if session.metrics().await.step_count == steps {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("step count never reached {steps}");
    }

    #[tokio::test]
    async fn start_twice_is_already_active_and_keeps_metrics() {
        let (session, hardware, clock) = session();
        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(20));
        hardware.emit(SensorSample::Steps { total: 40 });
        wait_for_steps(&session, 40).await;

        let err = session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Indoor)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::AlreadyActive);

        session.pause().await;
        let err = session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Indoor)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::AlreadyActive);

        let state = session.get_state().await;
        assert_eq!(state.metrics.step_count, 40);
        assert_eq!(state.workout_kind, Some(WorkoutKind::Running));
    }

    #[tokio::test]
    async fn end_without_session_is_rejected_and_changes_nothing() {
        let (session, hardware, _clock) = session();
        assert_eq!(session.end().await.unwrap_err(), SessionError::NoActiveSession);

        session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        hardware.emit(SensorSample::Steps { total: 12 });
        wait_for_steps(&session, 12).await;
        session.end().await.unwrap();

        let before = session.get_state().await;
        assert_eq!(session.end().await.unwrap_err(), SessionError::NoActiveSession);
        let after = session.get_state().await;
        assert_eq!(before.metrics, after.metrics);
        assert_eq!(after.status, WorkoutStatus::Ended);
        assert_eq!(hardware.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn resume_after_thirty_seconds_accumulates_pause() {
        let (session, _hardware, clock) = session();
        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(60));
        session.pause().await;
        clock.advance(ChronoDuration::seconds(30));
        session.resume().await;
        clock.advance(ChronoDuration::seconds(10));

        let state = session.get_state().await;
        assert_eq!(state.paused_ms, 30_000);
        assert_eq!(state.metrics.elapsed_seconds, 70.0);
        assert_eq!(state.status, WorkoutStatus::Running);
    }

    #[tokio::test]
    async fn pause_and_resume_from_wrong_state_are_noops() {
        let (session, _hardware, _clock) = session();
        let mut events = session.subscribe();

        session.pause().await;
        session.resume().await;
        assert_eq!(session.status().await, WorkoutStatus::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_finalize_still_cleans_up() {
        let (session, hardware, clock) = session();
        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Indoor)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(90));
        hardware.fail_next_finalize(HardwareError::Finalization("store unavailable".into()));

        let finalized = session.end().await.unwrap();
        assert!(finalized.is_none());
        assert_eq!(session.status().await, WorkoutStatus::Ended);
        assert!(session.last_error().await.unwrap().contains("store unavailable"));
        assert_eq!(session.metrics().await.elapsed_seconds, 90.0);
    }

    #[tokio::test]
    async fn ended_session_is_replaced_by_a_fresh_one() {
        let (session, hardware, clock) = session();
        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        hardware.emit(SensorSample::Steps { total: 90 });
        wait_for_steps(&session, 90).await;
        clock.advance(ChronoDuration::seconds(30));
        session.end().await.unwrap();
        assert_eq!(session.status().await, WorkoutStatus::Ended);

        session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Indoor)
            .await
            .unwrap();
        let state = session.get_state().await;
        assert_eq!(state.status, WorkoutStatus::Running);
        assert_eq!(state.workout_kind, Some(WorkoutKind::Walking));
        assert_eq!(state.metrics.step_count, 0);
        assert_eq!(state.paused_ms, 0);
    }

    #[tokio::test]
    async fn finalized_duration_excludes_pauses() {
        let (session, _hardware, clock) = session();
        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(100));
        session.pause().await;
        clock.advance(ChronoDuration::seconds(50));
        session.resume().await;
        clock.advance(ChronoDuration::seconds(20));

        let finalized = session.end().await.unwrap().unwrap();
        assert_eq!(finalized.duration_seconds, 120.0);
        assert!(finalized.external_id.is_some());
    }

    #[tokio::test]
    async fn hardware_failure_resets_to_idle_and_reports() {
        let (session, hardware, _clock) = session();
        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        let mut events = session.subscribe();

        hardware.fail("heart rate sensor lost");

        let event = time::timeout(Duration::from_secs(1), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Failed { message }) => break message,
                    Ok(_) => continue,
                    Err(err) => panic!("event stream closed: {err}"),
                }
            }
        })
        .await
        .unwrap();

        assert!(event.contains("heart rate sensor lost"));
        assert_eq!(session.status().await, WorkoutStatus::Idle);
        assert_eq!(session.end().await.unwrap_err(), SessionError::NoActiveSession);

        // a fresh session can start after the reset
        session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Indoor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_begin_leaves_session_idle() {
        let (session, hardware, _clock) = session();
        hardware.fail_next_begin(HardwareError::NotAuthorized);

        let err = session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Hardware(_)));
        assert_eq!(session.status().await, WorkoutStatus::Idle);
    }
}
