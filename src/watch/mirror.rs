//! Forwards the sensor session to the paired phone.
//!
//! Lifecycle events go out as [`SessionSignal`]s the moment they happen;
//! metrics are coalesced and pushed as full snapshots on a fixed cadence.
//! Lifecycle signals the phone could not be reached for are held in order
//! and replayed once the link is back, so the phone never keeps mirroring a
//! session the watch has already ended.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use super::session::{SensorSession, SessionEvent};
use crate::{
    channel::CommandChannel,
    error::ChannelError,
    protocol::{MetricSnapshot, SessionSignal},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub struct SessionMirror {
    session: SensorSession,
    channel: CommandChannel,
    snapshot_interval: Duration,
    cancel_token: Mutex<Option<CancellationToken>>,
    job: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMirror {
    pub fn new(session: SensorSession, channel: CommandChannel, snapshot_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            session,
            channel,
            snapshot_interval,
            cancel_token: Mutex::new(None),
            job: Mutex::new(None),
        })
    }

    pub async fn start(&self) {
        let mut job_guard = self.job.lock().await;
        if job_guard.is_some() {
            log_debug!("session mirror already running");
            return;
        }

        let cancel_token = CancellationToken::new();
        *self.cancel_token.lock().await = Some(cancel_token.clone());

        let events = self.session.subscribe();
        let channel = self.channel.clone();
        let interval = self.snapshot_interval;
        *job_guard = Some(tokio::spawn(async move {
            mirror_loop(events, channel, interval, cancel_token).await;
        }));
        log_info!("session mirror started");
    }

    pub async fn stop(&self) {
        if let Some(token) = self.cancel_token.lock().await.take() {
            token.cancel();
        }
        if let Some(handle) = self.job.lock().await.take() {
            if let Err(err) = handle.await {
                log::error!("session mirror task failed to join: {err}");
            }
        }
    }
}

/// Lifecycle traffic waiting for the phone to become reachable.
enum Held {
    Snapshot(MetricSnapshot),
    Signal(SessionSignal),
}

#[derive(Default)]
struct Backlog {
    held: VecDeque<Held>,
}

impl Backlog {
    fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    fn hold_snapshot(&mut self, snapshot: MetricSnapshot) {
        self.held.push_back(Held::Snapshot(snapshot));
    }

    /// Consecutive state changes collapse into the latest one.
    fn hold_signal(&mut self, signal: SessionSignal) {
        if let SessionSignal::StateChanged { .. } = signal {
            if let Some(Held::Signal(SessionSignal::StateChanged { .. })) = self.held.back() {
                self.held.pop_back();
            }
        }
        self.held.push_back(Held::Signal(signal));
    }

    /// Sends held traffic in order. Returns `true` once nothing is left.
    async fn flush(&mut self, channel: &CommandChannel) -> bool {
        if self.held.is_empty() {
            return true;
        }
        if channel.check_preconditions().is_err() {
            return false;
        }

        while let Some(next) = self.held.pop_front() {
            match next {
                Held::Snapshot(snapshot) => channel.send_snapshot(snapshot).await,
                Held::Signal(signal) => match channel.send_signal(signal.clone()).await {
                    Ok(()) => log_debug!("delivered {signal:?}"),
                    Err(err @ ChannelError::Encoding(_)) => {
                        log_warn!("dropping undeliverable {signal:?}: {err}");
                    }
                    Err(err) => {
                        log_debug!("phone still unreachable: {err}");
                        self.held.push_front(Held::Signal(signal));
                        return false;
                    }
                },
            }
        }
        true
    }

    async fn send(&mut self, channel: &CommandChannel, signal: SessionSignal) {
        self.hold_signal(signal);
        if !self.flush(channel).await {
            log_warn!(
                "phone unreachable; holding {} session update(s) until it is back",
                self.held.len()
            );
        }
    }
}

async fn mirror_loop(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    channel: CommandChannel,
    snapshot_interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(snapshot_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut mirroring = false;
    let mut pending: Option<MetricSnapshot> = None;
    let mut backlog = Backlog::default();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                // snapshots must not overtake held lifecycle signals
                if !backlog.flush(&channel).await {
                    continue;
                }
                if mirroring {
                    if let Some(snapshot) = pending.take() {
                        channel.send_snapshot(snapshot).await;
                    }
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log_debug!("mirror lagged behind by {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match event {
                    SessionEvent::Started { workout_kind, environment, started_at } => {
                        mirroring = true;
                        pending = None;
                        backlog.send(&channel, SessionSignal::Started { workout_kind, environment, started_at }).await;
                    }
                    SessionEvent::StateChanged { status } => {
                        backlog.send(&channel, SessionSignal::StateChanged { status }).await;
                    }
                    SessionEvent::Metrics { metrics } => {
                        if mirroring {
                            pending = Some(MetricSnapshot::from(&metrics));
                        }
                    }
                    SessionEvent::Ended { metrics, finalized } => {
                        mirroring = false;
                        pending = None;
                        // final totals must land before the phone stops listening
                        backlog.hold_snapshot(MetricSnapshot::from(&metrics));
                        let (external_id, duration_seconds) = match finalized {
                            Some(workout) => (workout.external_id, Some(workout.duration_seconds)),
                            None => (None, None),
                        };
                        backlog.send(&channel, SessionSignal::Ended { external_id, duration_seconds }).await;
                    }
                    SessionEvent::Failed { message } => {
                        mirroring = false;
                        pending = None;
                        backlog.send(&channel, SessionSignal::Failed { message }).await;
                    }
                }
            }
        }
    }

    if !backlog.is_empty() {
        log_warn!("session mirror stopped with undelivered session updates");
    }
    log_info!("session mirror stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{LoopbackTransport, MetricsHandler, SignalHandler},
        clock::system_clock,
        models::{WorkoutEnvironment, WorkoutKind},
        settings::SyncSettings,
        watch::{hardware::SensorSample, scripted::ScriptedHardware},
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        log: StdMutex<Vec<String>>,
        snapshots: StdMutex<Vec<MetricSnapshot>>,
    }

    #[async_trait]
    impl MetricsHandler for Recorder {
        async fn handle_metrics(&self, snapshot: MetricSnapshot) {
            self.log.lock().unwrap().push("snapshot".into());
            self.snapshots.lock().unwrap().push(snapshot);
        }
    }

    #[async_trait]
    impl SignalHandler for Recorder {
        async fn handle_signal(&self, signal: SessionSignal) {
            let name = match signal {
                SessionSignal::Started { .. } => "started",
                SessionSignal::StateChanged { .. } => "state",
                SessionSignal::Ended { .. } => "ended",
                SessionSignal::Failed { .. } => "failed",
            };
            self.log.lock().unwrap().push(name.into());
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn lifecycle_is_forwarded_with_final_snapshot_before_end() {
        let (phone_link, watch_link) = LoopbackTransport::pair();
        let settings = SyncSettings::default();
        let phone = CommandChannel::new(phone_link, &settings);
        let watch = CommandChannel::new(watch_link, &settings);

        let recorder = Arc::new(Recorder::default());
        phone.on_metrics_received(recorder.clone());
        phone.on_session_signal(recorder.clone());
        phone.start().await;

        let hardware = Arc::new(ScriptedHardware::new());
        let session = SensorSession::new(hardware.clone(), system_clock(), Duration::from_secs(1));
        let mirror = SessionMirror::new(session.clone(), watch, Duration::from_millis(20));
        mirror.start().await;

        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        hardware.emit(SensorSample::Steps { total: 500 });
        wait_until(|| recorder.snapshots.lock().unwrap().iter().any(|s| s.step_count == 500)).await;

        session.end().await.unwrap();
        wait_until(|| recorder.log.lock().unwrap().contains(&"ended".to_string())).await;

        let log = recorder.log.lock().unwrap().clone();
        assert_eq!(log.first().map(String::as_str), Some("started"));
        let ended_at = log.iter().position(|entry| entry == "ended").unwrap();
        assert_eq!(log[ended_at - 1], "snapshot");
        mirror.stop().await;
    }

    #[tokio::test]
    async fn end_while_out_of_range_is_replayed_before_the_next_start() {
        let (phone_link, watch_link) = LoopbackTransport::pair();
        let settings = SyncSettings::default();
        let phone = CommandChannel::new(phone_link, &settings);
        let watch = CommandChannel::new(watch_link.clone(), &settings);

        let recorder = Arc::new(Recorder::default());
        phone.on_metrics_received(recorder.clone());
        phone.on_session_signal(recorder.clone());
        phone.start().await;

        let hardware = Arc::new(ScriptedHardware::new());
        let session = SensorSession::new(hardware.clone(), system_clock(), Duration::from_secs(1));
        let mirror = SessionMirror::new(session.clone(), watch, Duration::from_millis(20));
        mirror.start().await;

        session
            .start(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        wait_until(|| recorder.log.lock().unwrap().contains(&"started".to_string())).await;

        watch_link.update_link(|link| link.is_reachable = false);
        session.pause().await;
        hardware.emit(SensorSample::Steps { total: 310 });
        session.end().await.unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert!(!recorder.log.lock().unwrap().contains(&"ended".to_string()));

        watch_link.update_link(|link| link.is_reachable = true);
        wait_until(|| recorder.log.lock().unwrap().contains(&"ended".to_string())).await;
        session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Outdoor)
            .await
            .unwrap();
        wait_until(|| recorder.log.lock().unwrap().iter().filter(|entry| *entry == "started").count() == 2).await;

        let log = recorder.log.lock().unwrap().clone();
        let position = |name: &str| log.iter().position(|entry| entry == name).unwrap();
        let ended_at = position("ended");
        assert!(position("state") < ended_at);
        assert_eq!(log[ended_at - 1], "snapshot");
        assert_eq!(log[ended_at + 1..].iter().position(|entry| entry == "started"), Some(0));
        assert!(recorder.snapshots.lock().unwrap().iter().any(|s| s.step_count == 310));
        mirror.stop().await;
    }

    #[tokio::test]
    async fn hardware_failure_reaches_the_phone() {
        let (phone_link, watch_link) = LoopbackTransport::pair();
        let settings = SyncSettings::default();
        let phone = CommandChannel::new(phone_link, &settings);
        let watch = CommandChannel::new(watch_link, &settings);

        let recorder = Arc::new(Recorder::default());
        phone.on_session_signal(recorder.clone());
        phone.start().await;

        let hardware = Arc::new(ScriptedHardware::new());
        let session = SensorSession::new(hardware.clone(), system_clock(), Duration::from_secs(1));
        let mirror = SessionMirror::new(session.clone(), watch, Duration::from_millis(20));
        mirror.start().await;

        session
            .start(WorkoutKind::Walking, WorkoutEnvironment::Indoor)
            .await
            .unwrap();
        hardware.fail("session interrupted");

        wait_until(|| recorder.log.lock().unwrap().contains(&"failed".to_string())).await;
        mirror.stop().await;
    }
}
