//! Projection of the mirrored session onto the OS live-status surface
//! (lock screen / banner). Best effort: it never blocks the workout.
//!
//! Every surface call is bounded by a timeout. An entry whose update timed
//! out is treated as stalled and gets no further updates; its end is still
//! attempted.

use std::{
    future::Future,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::Mutex, time};
use uuid::Uuid;

use crate::{
    error::SurfaceError,
    goals::progress_toward_goal,
    models::{WorkoutKind, WorkoutMetrics},
};

const ENABLE_LOGS: bool = true;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DismissalPolicy {
    Immediate,
    /// Let the OS keep the final content around for its default period.
    Default,
}

/// Fixed for the lifetime of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatusAttributes {
    pub workout_kind: WorkoutKind,
    pub daily_goal: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatusContent {
    pub elapsed_seconds: f64,
    pub distance_meters: f64,
    pub step_count: u64,
    pub total_daily_steps: u64,
    pub active_calories: f64,
    pub current_heart_rate: f64,
    pub current_pace: f64,
    pub goal_progress: f64,
    pub is_paused: bool,
}

impl LiveStatusContent {
    pub fn new(metrics: &WorkoutMetrics, total_daily_steps: u64, daily_goal: i64, is_paused: bool) -> Self {
        Self {
            elapsed_seconds: metrics.elapsed_seconds,
            distance_meters: metrics.distance_meters,
            step_count: metrics.step_count,
            total_daily_steps,
            active_calories: metrics.active_calories,
            current_heart_rate: metrics.current_heart_rate,
            current_pace: metrics.current_pace,
            goal_progress: progress_toward_goal(total_daily_steps, daily_goal),
            is_paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LiveStatusHandle(pub String);

#[async_trait]
pub trait LiveStatusSurface: Send + Sync + 'static {
    async fn create(
        &self,
        attributes: &LiveStatusAttributes,
        initial: &LiveStatusContent,
    ) -> Result<LiveStatusHandle, SurfaceError>;

    async fn update(
        &self,
        handle: &LiveStatusHandle,
        content: &LiveStatusContent,
    ) -> Result<(), SurfaceError>;

    async fn end(
        &self,
        handle: &LiveStatusHandle,
        final_content: Option<&LiveStatusContent>,
        policy: DismissalPolicy,
    ) -> Result<(), SurfaceError>;
}

struct ActiveEntry {
    handle: LiveStatusHandle,
    attributes: LiveStatusAttributes,
    stalled: bool,
}

pub struct LiveStatusPublisher {
    surface: Arc<dyn LiveStatusSurface>,
    enabled: bool,
    call_timeout: Duration,
    active: Mutex<Option<ActiveEntry>>,
}

impl LiveStatusPublisher {
    pub fn new(surface: Arc<dyn LiveStatusSurface>, enabled: bool) -> Self {
        Self {
            surface,
            enabled,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            active: Mutex::new(None),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Replaces any existing entry with a fresh one. Failure is logged and
    /// the workout continues without a live status.
    pub async fn start(&self, workout_kind: WorkoutKind, daily_goal: i64, initial_daily_steps: u64) {
        if !self.enabled {
            log_debug!("live status disabled in settings");
            return;
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.dismiss(&previous, None, DismissalPolicy::Immediate).await;
        }

        let attributes = LiveStatusAttributes {
            workout_kind,
            daily_goal,
        };
        let initial = LiveStatusContent::new(
            &WorkoutMetrics::default(),
            initial_daily_steps,
            daily_goal,
            false,
        );

        match self.bounded(self.surface.create(&attributes, &initial)).await {
            Ok(handle) => {
                log_info!("live status started for {}", workout_kind.as_str());
                *active = Some(ActiveEntry {
                    handle,
                    attributes,
                    stalled: false,
                });
            }
            Err(err) => log_warn!("live status unavailable: {err}"),
        }
    }

    /// No-op without an active entry or once the entry has stalled.
    pub async fn update(&self, metrics: &WorkoutMetrics, total_daily_steps: u64, is_paused: bool) {
        let mut active = self.active.lock().await;
        let Some(entry) = active.as_mut() else {
            return;
        };
        if entry.stalled {
            return;
        }

        let content = LiveStatusContent::new(
            metrics,
            total_daily_steps,
            entry.attributes.daily_goal,
            is_paused,
        );
        match self.bounded(self.surface.update(&entry.handle, &content)).await {
            Ok(()) => {}
            Err(err @ SurfaceError::TimedOut(_)) => {
                log_warn!("live status stalled, no further updates for this workout: {err}");
                entry.stalled = true;
            }
            Err(err) => log_debug!("live status update dropped: {err}"),
        }
    }

    /// Publishes the final metrics (if any) and dismisses the entry. The
    /// entry reference is cleared regardless of the outcome.
    pub async fn end(&self, final_metrics: Option<(&WorkoutMetrics, u64)>) {
        let Some(entry) = self.active.lock().await.take() else {
            return;
        };

        let final_content = final_metrics.map(|(metrics, total_daily_steps)| {
            LiveStatusContent::new(metrics, total_daily_steps, entry.attributes.daily_goal, false)
        });
        let policy = if final_content.is_some() {
            DismissalPolicy::Default
        } else {
            DismissalPolicy::Immediate
        };
        self.dismiss(&entry, final_content.as_ref(), policy).await;
    }

    async fn dismiss(
        &self,
        entry: &ActiveEntry,
        final_content: Option<&LiveStatusContent>,
        policy: DismissalPolicy,
    ) {
        let ended = self
            .bounded(self.surface.end(&entry.handle, final_content, policy))
            .await;
        if let Err(err) = ended {
            log_warn!("failed to end live status: {err}");
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, SurfaceError>>,
    ) -> Result<T, SurfaceError> {
        match time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SurfaceError::TimedOut(self.call_timeout.as_millis() as u64)),
        }
    }
}

/// Surface that only logs; used where no OS surface exists.
#[derive(Default)]
pub struct LoggingLiveStatusSurface;

#[async_trait]
impl LiveStatusSurface for LoggingLiveStatusSurface {
    async fn create(
        &self,
        attributes: &LiveStatusAttributes,
        initial: &LiveStatusContent,
    ) -> Result<LiveStatusHandle, SurfaceError> {
        log::info!(
            "[live status] {} started, {} of {} daily steps",
            attributes.workout_kind.display_name(),
            initial.total_daily_steps,
            attributes.daily_goal
        );
        Ok(LiveStatusHandle(Uuid::new_v4().to_string()))
    }

    async fn update(
        &self,
        _handle: &LiveStatusHandle,
        content: &LiveStatusContent,
    ) -> Result<(), SurfaceError> {
        log::debug!(
            "[live status] {:.0}s {:.0} m {} steps ({} today){}",
            content.elapsed_seconds,
            content.distance_meters,
            content.step_count,
            content.total_daily_steps,
            if content.is_paused { " paused" } else { "" }
        );
        Ok(())
    }

    async fn end(
        &self,
        _handle: &LiveStatusHandle,
        final_content: Option<&LiveStatusContent>,
        policy: DismissalPolicy,
    ) -> Result<(), SurfaceError> {
        match final_content {
            Some(content) => log::info!(
                "[live status] ended at {} steps ({} today), dismissal {policy:?}",
                content.step_count,
                content.total_daily_steps
            ),
            None => log::info!("[live status] dismissed"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCall {
    Create(LiveStatusContent),
    Update(LiveStatusContent),
    End(Option<LiveStatusContent>, DismissalPolicy),
}

/// Surface that records every call, for assertions.
#[derive(Default)]
pub struct RecordingLiveStatusSurface {
    calls: StdMutex<Vec<SurfaceCall>>,
    disabled: StdMutex<bool>,
}

impl RecordingLiveStatusSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create` fail as if the user turned live statuses off.
    pub fn set_disabled(&self, disabled: bool) {
        *self.disabled.lock().unwrap_or_else(|p| p.into_inner()) = disabled;
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn last_content(&self) -> Option<LiveStatusContent> {
        self.calls().into_iter().rev().find_map(|call| match call {
            SurfaceCall::Create(content) | SurfaceCall::Update(content) => Some(content),
            SurfaceCall::End(content, _) => content,
        })
    }

    fn record(&self, call: SurfaceCall) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }
}

#[async_trait]
impl LiveStatusSurface for RecordingLiveStatusSurface {
    async fn create(
        &self,
        _attributes: &LiveStatusAttributes,
        initial: &LiveStatusContent,
    ) -> Result<LiveStatusHandle, SurfaceError> {
        if *self.disabled.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(SurfaceError::Disabled);
        }
        self.record(SurfaceCall::Create(initial.clone()));
        Ok(LiveStatusHandle(Uuid::new_v4().to_string()))
    }

    async fn update(
        &self,
        _handle: &LiveStatusHandle,
        content: &LiveStatusContent,
    ) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::Update(content.clone()));
        Ok(())
    }

    async fn end(
        &self,
        _handle: &LiveStatusHandle,
        final_content: Option<&LiveStatusContent>,
        policy: DismissalPolicy,
    ) -> Result<(), SurfaceError> {
        self.record(SurfaceCall::End(final_content.cloned(), policy));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> (LiveStatusPublisher, Arc<RecordingLiveStatusSurface>) {
        let surface = Arc::new(RecordingLiveStatusSurface::new());
        (LiveStatusPublisher::new(surface.clone(), true), surface)
    }

    #[tokio::test]
    async fn update_without_entry_is_a_noop() {
        let (publisher, surface) = publisher();
        publisher.update(&WorkoutMetrics::default(), 100, false).await;
        publisher.end(None).await;
        assert!(surface.calls().is_empty());
    }

    #[tokio::test]
    async fn start_replaces_an_existing_entry() {
        let (publisher, surface) = publisher();
        publisher.start(WorkoutKind::Walking, 10_000, 4_000).await;
        publisher.start(WorkoutKind::Running, 10_000, 4_200).await;

        let calls = surface.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[1], SurfaceCall::End(None, DismissalPolicy::Immediate)));
        assert!(publisher.is_active().await);
    }

    #[tokio::test]
    async fn final_metrics_are_published_before_dismissal() {
        let (publisher, surface) = publisher();
        publisher.start(WorkoutKind::Running, 10_000, 4_000).await;

        let metrics = WorkoutMetrics {
            step_count: 500,
            ..WorkoutMetrics::default()
        };
        publisher.update(&metrics, 4_500, false).await;
        publisher.end(Some((&metrics, 4_500))).await;
        publisher.update(&metrics, 4_600, false).await;

        let calls = surface.calls();
        match calls.last() {
            Some(SurfaceCall::End(Some(content), DismissalPolicy::Default)) => {
                assert_eq!(content.total_daily_steps, 4_500);
                assert!((content.goal_progress - 0.45).abs() < 1e-9);
            }
            other => panic!("unexpected last call {other:?}"),
        }
        assert!(!publisher.is_active().await);
    }

    /// Accepts the entry, then never answers an update.
    #[derive(Default)]
    struct StallingSurface {
        updates: StdMutex<usize>,
        ended: StdMutex<bool>,
    }

    #[async_trait]
    impl LiveStatusSurface for StallingSurface {
        async fn create(
            &self,
            _attributes: &LiveStatusAttributes,
            _initial: &LiveStatusContent,
        ) -> Result<LiveStatusHandle, SurfaceError> {
            Ok(LiveStatusHandle("stuck".into()))
        }

        async fn update(
            &self,
            _handle: &LiveStatusHandle,
            _content: &LiveStatusContent,
        ) -> Result<(), SurfaceError> {
            *self.updates.lock().unwrap() += 1;
            std::future::pending().await
        }

        async fn end(
            &self,
            _handle: &LiveStatusHandle,
            _final_content: Option<&LiveStatusContent>,
            _policy: DismissalPolicy,
        ) -> Result<(), SurfaceError> {
            *self.ended.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_surface_cannot_hold_up_the_caller() {
        let surface = Arc::new(StallingSurface::default());
        let publisher = LiveStatusPublisher::new(surface.clone(), true)
            .with_call_timeout(Duration::from_millis(30));
        publisher.start(WorkoutKind::Running, 10_000, 0).await;

        let metrics = WorkoutMetrics::default();
        let bounded = time::timeout(Duration::from_secs(1), async {
            publisher.update(&metrics, 10, false).await;
            // the stalled entry is skipped instead of timing out again
            publisher.update(&metrics, 20, false).await;
            publisher.update(&metrics, 30, false).await;
            publisher.end(Some((&metrics, 30))).await;
        })
        .await;

        assert!(bounded.is_ok());
        assert_eq!(*surface.updates.lock().unwrap(), 1);
        assert!(*surface.ended.lock().unwrap());
        assert!(!publisher.is_active().await);
    }

    #[tokio::test]
    async fn disabled_surface_does_not_fail_the_caller() {
        let (publisher, surface) = publisher();
        surface.set_disabled(true);
        publisher.start(WorkoutKind::Walking, 10_000, 0).await;
        assert!(!publisher.is_active().await);

        let off = LiveStatusPublisher::new(surface.clone(), false);
        surface.set_disabled(false);
        off.start(WorkoutKind::Walking, 10_000, 0).await;
        assert!(surface.calls().is_empty());
    }
}
