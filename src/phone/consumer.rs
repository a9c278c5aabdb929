//! Phone-side follower of the watch's workout session.
//!
//! The consumer never owns sensors while mirroring. It keeps a shadow of
//! the watch session, republishes it to the live-status surface and the
//! record writer, and forwards user intents to the watch as commands. When
//! the watch is unreachable it can instead run a phone-only workout on
//! local sensors.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{live_status::LiveStatusPublisher, shadow::MirroredShadowState};
use crate::{
    channel::{CommandChannel, MetricsHandler, SignalHandler},
    clock::SharedClock,
    error::SessionError,
    models::{WorkoutEnvironment, WorkoutKind, WorkoutMetrics, WorkoutRecord, WorkoutStatus},
    protocol::{MetricSnapshot, SessionSignal},
    records::WorkoutRecordWriter,
    settings::SyncSettings,
    shared_store::SharedStore,
    watch::{SensorSession, SessionEvent, WorkoutHardware},
};

const ENABLE_LOGS: bool = true;
const EVENT_CAPACITY: usize = 16;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "message", rename_all = "camelCase")]
pub enum EndReason {
    Ended,
    Failed(String),
    /// Nothing arrived from the watch within the stale timeout.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ConsumerEvent {
    #[serde(rename_all = "camelCase")]
    WorkoutStarted {
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        is_mirrored: bool,
        is_watch_initiated: bool,
    },
    #[serde(rename_all = "camelCase")]
    WorkoutEnded {
        reason: EndReason,
        record: Option<WorkoutRecord>,
    },
}

struct Ticker {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

struct LocalWorkout {
    session: SensorSession,
    forwarder: JoinHandle<()>,
}

enum TickOutcome {
    Idle,
    Advanced(WorkoutMetrics),
    Stale,
}

/// A start the phone asked the watch for.
struct StartRequest {
    workout_kind: WorkoutKind,
    environment: WorkoutEnvironment,
    sent_at: Instant,
}

impl StartRequest {
    /// Only a matching session start that arrives while the reply could
    /// still be pending belongs to this request.
    fn claims(&self, workout_kind: WorkoutKind, environment: WorkoutEnvironment, window: Duration) -> bool {
        self.workout_kind == workout_kind
            && self.environment == environment
            && self.sent_at.elapsed() <= window
    }
}

/// Collaborators the consumer is built from.
pub struct ConsumerDeps {
    pub channel: CommandChannel,
    pub shared_store: SharedStore,
    pub live_status: Arc<LiveStatusPublisher>,
    pub writer: WorkoutRecordWriter,
    pub settings: SyncSettings,
    pub clock: SharedClock,
    /// Phone sensors for the unreachable-watch fallback.
    pub local_hardware: Option<Arc<dyn WorkoutHardware>>,
}

struct Inner {
    channel: CommandChannel,
    shared_store: SharedStore,
    live_status: Arc<LiveStatusPublisher>,
    writer: WorkoutRecordWriter,
    settings: SyncSettings,
    clock: SharedClock,
    local_hardware: Option<Arc<dyn WorkoutHardware>>,
    shadow: Mutex<MirroredShadowState>,
    state_tx: watch::Sender<MirroredShadowState>,
    events: broadcast::Sender<ConsumerEvent>,
    ticker: Mutex<Option<Ticker>>,
    local: Mutex<Option<LocalWorkout>>,
    requested: std::sync::Mutex<Option<StartRequest>>,
    last_heard: std::sync::Mutex<Instant>,
    lifecycle: Mutex<()>,
}

#[derive(Clone)]
pub struct MirroredSessionConsumer {
    inner: Arc<Inner>,
}

impl MirroredSessionConsumer {
    pub fn new(deps: ConsumerDeps) -> Self {
        let (state_tx, _) = watch::channel(MirroredShadowState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                channel: deps.channel,
                shared_store: deps.shared_store,
                live_status: deps.live_status,
                writer: deps.writer,
                settings: deps.settings,
                clock: deps.clock,
                local_hardware: deps.local_hardware,
                shadow: Mutex::new(MirroredShadowState::default()),
                state_tx,
                events,
                ticker: Mutex::new(None),
                local: Mutex::new(None),
                requested: std::sync::Mutex::new(None),
                last_heard: std::sync::Mutex::new(Instant::now()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Registers for snapshots and session signals on the channel.
    pub fn attach(&self) {
        let handler = Arc::new(self.clone());
        self.inner.channel.on_metrics_received(handler.clone());
        self.inner.channel.on_session_signal(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.events.subscribe()
    }

    /// Shadow snapshots for UI observers; the latest value is always current.
    pub fn watch_state(&self) -> watch::Receiver<MirroredShadowState> {
        self.inner.state_tx.subscribe()
    }

    pub async fn state(&self) -> MirroredShadowState {
        self.inner.shadow.lock().await.clone()
    }

    pub async fn is_mirroring(&self) -> bool {
        self.inner.shadow.lock().await.is_mirroring
    }

    pub async fn is_active(&self) -> bool {
        self.inner.shadow.lock().await.is_active()
    }

    /// Asks the watch to start a workout.
    ///
    /// Success only means the watch accepted the command; mirroring begins
    /// when the session-start signal arrives. Reachability errors are the
    /// cue for [`Self::start_local_workout`].
    pub async fn start_mirrored_workout(
        &self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
    ) -> Result<(), SessionError> {
        if self.is_active().await {
            return Err(SessionError::AlreadyActive);
        }

        self.set_requested(workout_kind, environment);
        if let Err(err) = self
            .inner
            .channel
            .send_start_workout(workout_kind, environment)
            .await
        {
            self.clear_requested();
            log_warn!("watch did not start {} workout: {err}", workout_kind.as_str());
            return Err(err.into());
        }
        Ok(())
    }

    /// Phone-only workout on local sensors, without mirroring.
    pub async fn start_local_workout(
        &self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
    ) -> Result<(), SessionError> {
        let Some(hardware) = self.inner.local_hardware.clone() else {
            return Err(SessionError::Hardware(
                "this device has no workout sensors".to_string(),
            ));
        };

        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_active().await {
            return Err(SessionError::AlreadyActive);
        }

        let session = SensorSession::new(
            hardware,
            self.inner.clock.clone(),
            self.inner.settings.tick_interval(),
        );
        let events = session.subscribe();
        session.start(workout_kind, environment).await?;
        let started_at = session
            .get_state()
            .await
            .started_at
            .unwrap_or_else(|| self.inner.clock.now());

        let steps_before = self.steps_before_workout();
        {
            let mut shadow = self.inner.shadow.lock().await;
            shadow.begin_local(workout_kind, environment, started_at, steps_before);
            self.inner
                .live_status
                .start(workout_kind, self.inner.settings.daily_step_goal, steps_before)
                .await;
            self.publish(&shadow);
        }
        self.inner
            .writer
            .begin(workout_kind, environment, started_at)
            .await;

        let forwarder = tokio::spawn(self.clone().forward_local_events(events));
        *self.inner.local.lock().await = Some(LocalWorkout { session, forwarder });
        self.spawn_ticker().await;

        log_info!("started phone-only {} workout", workout_kind.as_str());
        self.emit(ConsumerEvent::WorkoutStarted {
            workout_kind,
            environment,
            is_mirrored: false,
            is_watch_initiated: false,
        });
        Ok(())
    }

    /// Drains a quick-action or shortcut hand-off and asks the watch to
    /// start it. Returns the kind that was requested, if any.
    pub async fn start_pending_workout(&self) -> Result<Option<WorkoutKind>, SessionError> {
        let pending = self
            .inner
            .shared_store
            .take_pending_workout()
            .map_err(|err| SessionError::Persistence(err.to_string()))?;

        let Some(workout_kind) = pending else {
            return Ok(None);
        };
        log_info!("starting pending {} workout", workout_kind.as_str());
        self.start_mirrored_workout(workout_kind, WorkoutEnvironment::Outdoor)
            .await?;
        Ok(Some(workout_kind))
    }

    pub async fn pause_workout(&self) -> Result<(), SessionError> {
        if let Some(session) = self.local_session().await {
            session.pause().await;
            return Ok(());
        }
        if !self.is_mirroring().await {
            return Err(SessionError::NoActiveSession);
        }
        self.inner.channel.send_pause_workout().await?;
        Ok(())
    }

    pub async fn resume_workout(&self) -> Result<(), SessionError> {
        if let Some(session) = self.local_session().await {
            session.resume().await;
            return Ok(());
        }
        if !self.is_mirroring().await {
            return Err(SessionError::NoActiveSession);
        }
        self.inner.channel.send_resume_workout().await?;
        Ok(())
    }

    /// Ends the active workout.
    ///
    /// A phone-only workout is finalised here and its record returned. A
    /// mirrored workout is ended on the watch; its record follows with the
    /// end signal as [`ConsumerEvent::WorkoutEnded`], so `Ok(None)` is
    /// returned.
    pub async fn end_workout(&self) -> Result<Option<WorkoutRecord>, SessionError> {
        let local = self.inner.local.lock().await.take();
        if let Some(local) = local {
            let finalized = local.session.end().await;
            local.forwarder.abort();
            let finalized = finalized?;
            let metrics = local.session.metrics().await;

            let collected = local.session.get_state().await;
            self.inner
                .writer
                .attach_samples(
                    collected.route_points,
                    collected.heart_rate_samples,
                    collected.elevation_gain,
                )
                .await;

            let (external_id, duration) = match finalized {
                Some(workout) => (workout.external_id, Some(workout.duration_seconds)),
                None => (None, None),
            };
            return Ok(self
                .finish(EndReason::Ended, external_id, duration, Some(metrics))
                .await);
        }

        if !self.is_mirroring().await {
            return Err(SessionError::NoActiveSession);
        }
        self.inner.channel.send_end_workout().await?;
        Ok(None)
    }

    /// Session-start signal from the watch, solicited or not.
    pub async fn on_session_observed(
        &self,
        workout_kind: WorkoutKind,
        environment: WorkoutEnvironment,
        started_at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_active().await {
            return Err(SessionError::AlreadyActive);
        }

        let is_watch_initiated = !self.take_requested().is_some_and(|request| {
            request.claims(workout_kind, environment, self.inner.settings.command_timeout())
        });
        let steps_before = self.steps_before_workout();
        {
            let mut shadow = self.inner.shadow.lock().await;
            shadow.begin(
                workout_kind,
                environment,
                started_at,
                steps_before,
                is_watch_initiated,
            );
            self.inner
                .live_status
                .start(workout_kind, self.inner.settings.daily_step_goal, steps_before)
                .await;
            self.publish(&shadow);
        }
        self.touch();

        self.inner
            .writer
            .begin(workout_kind, environment, started_at)
            .await;
        self.spawn_ticker().await;

        log_info!(
            "mirroring {} workout (watch initiated: {is_watch_initiated}, steps before: {steps_before})",
            workout_kind.as_str()
        );
        self.emit(ConsumerEvent::WorkoutStarted {
            workout_kind,
            environment,
            is_mirrored: true,
            is_watch_initiated,
        });
        Ok(())
    }

    async fn on_snapshot(&self, snapshot: MetricSnapshot) {
        let mut shadow = self.inner.shadow.lock().await;
        if !shadow.apply_snapshot(&snapshot) {
            log_debug!("ignoring snapshot outside a mirrored workout");
            return;
        }
        self.touch();
        self.inner
            .live_status
            .update(&shadow.metrics, shadow.total_daily_steps(), shadow.is_paused)
            .await;
        self.publish(&shadow);
    }

    async fn on_status_changed(&self, status: WorkoutStatus, mirrored: bool) {
        let now = self.inner.clock.now();
        let mut shadow = self.inner.shadow.lock().await;
        let following = if mirrored {
            shadow.is_mirroring
        } else {
            shadow.is_local
        };
        if !following {
            return;
        }
        if mirrored {
            self.touch();
        }

        let paused = status == WorkoutStatus::Paused;
        if shadow.set_paused(paused, now) {
            log_debug!("workout {}", if paused { "paused" } else { "resumed" });
            self.inner
                .live_status
                .update(&shadow.metrics, shadow.total_daily_steps(), shadow.is_paused)
                .await;
            self.publish(&shadow);
        }
    }

    /// Leaves the active state. Returns the completed record, or `None` if
    /// nothing was active or the record could not be written.
    async fn finish(
        &self,
        reason: EndReason,
        external_id: Option<String>,
        hardware_duration: Option<f64>,
        final_metrics: Option<WorkoutMetrics>,
    ) -> Option<WorkoutRecord> {
        // keeps a session start from creating its live status before this end
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (metrics, total_daily_steps) = {
            let mut shadow = self.inner.shadow.lock().await;
            if !shadow.is_active() {
                return None;
            }
            if let Some(metrics) = final_metrics {
                shadow.metrics = metrics;
            }
            let metrics = shadow.metrics;
            let total_daily_steps = shadow.total_daily_steps();
            shadow.finish();
            self.publish(&shadow);
            (metrics, total_daily_steps)
        };
        self.stop_ticker().await;
        self.clear_requested();

        // nothing updates an inactive shadow, so the surface can be ended
        // without holding it
        let final_content = (reason == EndReason::Ended).then_some((&metrics, total_daily_steps));
        self.inner.live_status.end(final_content).await;

        // a local session that failed on its own is still parked here; its
        // forwarder may be the caller, so it is left to exit by itself
        drop(self.inner.local.lock().await.take());

        let record = self
            .inner
            .writer
            .complete(&metrics, external_id, hardware_duration)
            .await;

        match &reason {
            EndReason::Ended => log_info!("workout ended"),
            EndReason::Failed(message) => log_warn!("workout failed on the sensor side: {message}"),
            EndReason::Stale => log_warn!("no word from the watch in time; stopped mirroring"),
        }
        self.emit(ConsumerEvent::WorkoutEnded {
            reason,
            record: record.clone(),
        });
        record
    }

    async fn forward_local_events(self, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log_debug!("local session forwarder skipped {skipped} events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                SessionEvent::Metrics { metrics } => {
                    let mut shadow = self.inner.shadow.lock().await;
                    if !shadow.is_local {
                        break;
                    }
                    shadow.metrics = metrics;
                    self.inner
                        .live_status
                        .update(&shadow.metrics, shadow.total_daily_steps(), shadow.is_paused)
                        .await;
                    self.publish(&shadow);
                }
                SessionEvent::StateChanged { status } => {
                    self.on_status_changed(status, false).await;
                }
                SessionEvent::Failed { message } => {
                    self.finish(EndReason::Failed(message), None, None, None)
                        .await;
                    break;
                }
                SessionEvent::Ended { .. } => break,
                SessionEvent::Started { .. } => {}
            }
        }
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.inner.ticker.lock().await;
        if let Some(previous) = ticker_guard.take() {
            previous.cancel_token.cancel();
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().tick_loop(cancel_token.clone()));
        *ticker_guard = Some(Ticker {
            cancel_token,
            handle,
        });
    }

    /// May run on the ticker itself, so the task is not awaited.
    async fn stop_ticker(&self) {
        if let Some(ticker) = self.inner.ticker.lock().await.take() {
            ticker.cancel_token.cancel();
        }
    }

    /// Stops background work without ending the workout; an open record is
    /// left for launch recovery.
    pub async fn shutdown(&self) {
        let ticker = self.inner.ticker.lock().await.take();
        if let Some(ticker) = ticker {
            ticker.cancel_token.cancel();
            if let Err(err) = ticker.handle.await {
                log::error!("consumer ticker failed to join: {err}");
            }
        }
        if let Some(local) = self.inner.local.lock().await.take() {
            local.forwarder.abort();
        }
    }

    async fn tick_loop(self, cancel_token: CancellationToken) {
        let tick_interval = self.inner.settings.tick_interval();
        let save_every = u64::from(self.inner.settings.progress_save_every_ticks.max(1));

        let mut interval = time::interval_at(Instant::now() + tick_interval, tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {}
            }
            ticks += 1;

            match self.tick(&cancel_token).await {
                TickOutcome::Idle => {}
                TickOutcome::Advanced(metrics) => {
                    if ticks % save_every == 0 {
                        let writer = self.inner.writer.clone();
                        tokio::spawn(async move {
                            writer.save_progress(&metrics).await;
                        });
                    }
                }
                TickOutcome::Stale => {
                    self.finish(EndReason::Stale, None, None, None).await;
                    break;
                }
            }
        }
        log_debug!("consumer ticker stopped after {ticks} ticks");
    }

    async fn tick(&self, cancel_token: &CancellationToken) -> TickOutcome {
        let local = self.local_session().await;
        let local_metrics = match &local {
            Some(session) => Some(session.metrics().await),
            None => None,
        };

        let now = self.inner.clock.now();
        let mut shadow = self.inner.shadow.lock().await;
        if cancel_token.is_cancelled() || !shadow.is_active() {
            return TickOutcome::Idle;
        }
        if shadow.is_mirroring && self.is_stale(shadow.is_paused) {
            return TickOutcome::Stale;
        }

        let advanced = match local_metrics {
            Some(metrics) if shadow.is_local => {
                shadow.metrics = metrics;
                !shadow.is_paused
            }
            _ => shadow.tick(now),
        };
        if !advanced {
            return TickOutcome::Idle;
        }

        self.inner
            .live_status
            .update(&shadow.metrics, shadow.total_daily_steps(), shadow.is_paused)
            .await;
        self.publish(&shadow);
        TickOutcome::Advanced(shadow.metrics)
    }

    async fn local_session(&self) -> Option<SensorSession> {
        self.inner
            .local
            .lock()
            .await
            .as_ref()
            .map(|local| local.session.clone())
    }

    /// Read once per workout; the live total already includes workout steps.
    fn steps_before_workout(&self) -> u64 {
        let today = self.inner.clock.now().date_naive();
        match self.inner.shared_store.daily_step_date() {
            Some(date) if date != today => 0,
            _ => self.inner.shared_store.daily_step_total(),
        }
    }

    fn publish(&self, shadow: &MirroredShadowState) {
        self.inner.state_tx.send_replace(shadow.clone());
    }

    fn emit(&self, event: ConsumerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn touch(&self) {
        *self
            .inner
            .last_heard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// A paused watch sends nothing, so pauses get the longer timeout.
    fn is_stale(&self, paused: bool) -> bool {
        let timeout = if paused {
            self.inner.settings.mirror_paused_stale_timeout()
        } else {
            self.inner.settings.mirror_stale_timeout()
        };
        self.inner
            .last_heard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
            >= timeout
    }

    fn set_requested(&self, workout_kind: WorkoutKind, environment: WorkoutEnvironment) {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(StartRequest {
            workout_kind,
            environment,
            sent_at: Instant::now(),
        });
    }

    fn clear_requested(&self) {
        self.take_requested();
    }

    fn take_requested(&self) -> Option<StartRequest> {
        self.inner
            .requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl MetricsHandler for MirroredSessionConsumer {
    async fn handle_metrics(&self, snapshot: MetricSnapshot) {
        self.on_snapshot(snapshot).await;
    }
}

#[async_trait]
impl SignalHandler for MirroredSessionConsumer {
    async fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Started {
                workout_kind,
                environment,
                started_at,
            } => {
                if let Err(err) = self
                    .on_session_observed(workout_kind, environment, started_at)
                    .await
                {
                    log_warn!("ignoring session start from the watch: {err}");
                }
            }
            SessionSignal::StateChanged { status } => {
                self.on_status_changed(status, true).await;
            }
            SessionSignal::Ended {
                external_id,
                duration_seconds,
            } => {
                if !self.is_mirroring().await {
                    log_debug!("end signal without a mirrored workout");
                    return;
                }
                self.finish(EndReason::Ended, external_id, duration_seconds, None)
                    .await;
            }
            SessionSignal::Failed { message } => {
                if !self.is_mirroring().await {
                    return;
                }
                self.finish(EndReason::Failed(message), None, None, None)
                    .await;
            }
        }
    }
}
