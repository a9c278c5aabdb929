use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast;

use stridelink_lib::{
    channel::LoopbackTransport,
    clock::system_clock,
    db::Database,
    error::{ChannelError, SessionError},
    health::{ExternalWorkout, MemoryHealthStore},
    models::{WorkoutEnvironment, WorkoutKind, WorkoutRecord, WorkoutStatus},
    phone::{ConsumerEvent, EndReason, MirroredShadowState, RecordingLiveStatusSurface},
    records::reconcile,
    settings::SyncSettings,
    shared_store::SharedStore,
    watch::{ScriptedHardware, SensorSample, WorkoutHardware},
    PhoneDeps, PhoneServices, WatchServices,
};

const WAIT: Duration = Duration::from_secs(3);

struct Pair {
    phone: PhoneServices,
    watch: WatchServices,
    hardware: Arc<ScriptedHardware>,
    surface: Arc<RecordingLiveStatusSurface>,
    health: Arc<MemoryHealthStore>,
    phone_link: Arc<LoopbackTransport>,
    watch_link: Arc<LoopbackTransport>,
    _dir: TempDir,
}

fn fast_settings() -> SyncSettings {
    SyncSettings {
        tick_interval_ms: 20,
        snapshot_interval_ms: 20,
        command_timeout_ms: 1_000,
        ..SyncSettings::default()
    }
}

async fn pair(daily_steps: u64, local_hardware: Option<Arc<dyn WorkoutHardware>>) -> Pair {
    let dir = TempDir::new().unwrap();
    let settings = fast_settings();
    let clock = system_clock();
    let (phone_link, watch_link) = LoopbackTransport::pair();

    let hardware = Arc::new(ScriptedHardware::new());
    let watch = WatchServices::new(watch_link.clone(), hardware.clone(), clock.clone(), &settings);
    watch.start().await;

    let health = Arc::new(MemoryHealthStore::new(clock.clone()));
    health.set_steps(Utc::now().date_naive(), daily_steps);
    let surface = Arc::new(RecordingLiveStatusSurface::new());

    let phone = PhoneServices::new(PhoneDeps {
        transport: phone_link.clone(),
        db: Database::new(dir.path().join("phone.db")).unwrap(),
        health: health.clone(),
        shared_store: SharedStore::open(dir.path().join("shared.json")).unwrap(),
        surface: surface.clone(),
        local_hardware,
        clock,
        settings,
    });
    phone.start().await.unwrap();

    Pair {
        phone,
        watch,
        hardware,
        surface,
        health,
        phone_link,
        watch_link,
        _dir: dir,
    }
}

async fn wait_for_shadow(pair: &Pair, check: impl FnMut(&MirroredShadowState) -> bool) -> MirroredShadowState {
    let mut state = pair.phone.consumer.watch_state();
    let seen = tokio::time::timeout(WAIT, state.wait_for(check))
        .await
        .expect("shadow never reached the expected state")
        .expect("consumer dropped");
    seen.clone()
}

async fn wait_for_watch_status(pair: &Pair, status: WorkoutStatus) {
    for _ in 0..300 {
        if pair.watch.session.status().await == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("watch never reached {status:?}");
}

async fn next_end(events: &mut broadcast::Receiver<ConsumerEvent>) -> (EndReason, Option<WorkoutRecord>) {
    let wait = async {
        loop {
            if let ConsumerEvent::WorkoutEnded { reason, record } = events.recv().await.unwrap() {
                return (reason, record);
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("workout never ended")
}

#[tokio::test]
async fn phone_started_workout_is_mirrored() {
    let pair = pair(4_000, None).await;

    pair.phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();

    let shadow = wait_for_shadow(&pair, |state| state.is_mirroring).await;
    wait_for_watch_status(&pair, WorkoutStatus::Running).await;

    assert_eq!(shadow.steps_before_workout, 4_000);
    assert!(!shadow.is_watch_initiated);
    assert_eq!(shadow.workout_kind, Some(WorkoutKind::Running));

    let mut record = None;
    for _ in 0..100 {
        record = pair.phone.writer.current().await;
        if record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = record.expect("no open workout record");
    assert!(!record.is_completed);
    assert!(pair.phone.db.get_workout(&record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn mirrored_steps_are_added_to_the_daily_total_once() {
    let pair = pair(4_000, None).await;
    pair.phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();
    wait_for_shadow(&pair, |state| state.is_mirroring).await;

    // the health store's live total picks up the workout's steps as well
    pair.health.set_steps(Utc::now().date_naive(), 4_500);
    pair.hardware.emit(SensorSample::Steps { total: 500 });

    let shadow = wait_for_shadow(&pair, |state| state.metrics.step_count == 500).await;
    assert_eq!(shadow.total_daily_steps(), 4_500);

    for _ in 0..100 {
        if pair.surface.last_content().map(|content| content.total_daily_steps) == Some(4_500) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pair.surface.last_content().unwrap().total_daily_steps, 4_500);
}

#[tokio::test]
async fn unpaired_watch_is_reported_before_delivery() {
    let pair = pair(0, None).await;
    pair.phone_link.update_link(|link| link.is_paired = false);

    let err = pair
        .phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::Channel(ChannelError::WatchNotPaired));
    assert_eq!(pair.phone_link.delivery_attempts(), 0);
    assert_eq!(pair.watch.session.status().await, WorkoutStatus::Idle);
}

#[tokio::test]
async fn pause_and_resume_follow_the_watch() {
    let pair = pair(0, None).await;
    pair.phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Walking, WorkoutEnvironment::Indoor)
        .await
        .unwrap();
    wait_for_shadow(&pair, |state| state.is_mirroring).await;

    pair.phone.consumer.pause_workout().await.unwrap();
    wait_for_watch_status(&pair, WorkoutStatus::Paused).await;
    wait_for_shadow(&pair, |state| state.is_paused).await;

    pair.phone.consumer.resume_workout().await.unwrap();
    wait_for_watch_status(&pair, WorkoutStatus::Running).await;
    let shadow = wait_for_shadow(&pair, |state| !state.is_paused).await;
    assert!(shadow.is_mirroring);
}

#[tokio::test]
async fn ending_from_the_phone_saves_one_record() {
    let pair = pair(1_000, None).await;
    let mut events = pair.phone.consumer.subscribe();

    pair.phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();
    wait_for_shadow(&pair, |state| state.is_mirroring).await;

    pair.hardware.emit(SensorSample::Steps { total: 640 });
    pair.hardware.emit(SensorSample::Distance { total_meters: 510.0 });
    wait_for_shadow(&pair, |state| state.metrics.step_count == 640).await;

    assert_eq!(pair.phone.consumer.end_workout().await.unwrap(), None);
    let (reason, record) = next_end(&mut events).await;
    let record = record.unwrap();

    assert_eq!(reason, EndReason::Ended);
    assert_eq!(pair.watch.session.status().await, WorkoutStatus::Ended);
    assert_eq!(record.step_count, 640);
    assert_eq!(record.distance_meters, 510.0);
    assert!(record.is_completed);
    let external_id = record.external_id.clone().unwrap();

    // late snapshots cannot reopen the session
    assert!(!pair.phone.consumer.is_mirroring().await);

    // the same workout synced through the health store is not duplicated
    let start = record.start_date;
    pair.health.insert_external(ExternalWorkout {
        external_id,
        workout_kind: WorkoutKind::Running,
        environment: WorkoutEnvironment::Outdoor,
        start_date: start,
        end_date: record.end_date,
        duration_seconds: record.duration_seconds,
        distance_meters: 510.0,
        step_count: 640,
        active_calories: 0.0,
        average_heart_rate: None,
    });
    let created = reconcile(
        &pair.phone.db,
        pair.health.as_ref(),
        &system_clock(),
        7,
    )
    .await
    .unwrap();
    assert_eq!(created, 0);
    assert_eq!(pair.phone.db.list_workouts(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn watch_started_workout_is_observed_by_the_phone() {
    let pair = pair(2_500, None).await;

    pair.watch
        .session
        .start(WorkoutKind::Walking, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();

    let shadow = wait_for_shadow(&pair, |state| state.is_mirroring).await;
    assert!(shadow.is_watch_initiated);
    assert_eq!(shadow.workout_kind, Some(WorkoutKind::Walking));
    assert_eq!(shadow.steps_before_workout, 2_500);
}

#[tokio::test]
async fn watch_failure_reaches_the_phone() {
    let pair = pair(0, None).await;
    let mut events = pair.phone.consumer.subscribe();

    pair.phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();
    wait_for_shadow(&pair, |state| state.is_mirroring).await;

    assert!(pair.hardware.fail("heart rate sensor disconnected"));
    let (reason, _) = next_end(&mut events).await;

    assert!(matches!(reason, EndReason::Failed(message) if message.contains("heart rate sensor disconnected")));
    assert!(!pair.phone.consumer.is_active().await);
    assert_eq!(
        pair.phone.consumer.end_workout().await.unwrap_err(),
        SessionError::NoActiveSession
    );
}

#[tokio::test]
async fn unreachable_watch_falls_back_to_phone_sensors() {
    let phone_hardware = Arc::new(ScriptedHardware::new());
    let pair = pair(0, Some(phone_hardware.clone())).await;
    pair.phone_link.update_link(|link| link.is_reachable = false);

    let err = pair
        .phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Walking, WorkoutEnvironment::Outdoor)
        .await
        .unwrap_err();
    let SessionError::Channel(channel_err) = err else {
        panic!("expected a channel error, got {err:?}");
    };
    assert!(channel_err.is_reachability());

    pair.phone
        .consumer
        .start_local_workout(WorkoutKind::Walking, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();
    phone_hardware.emit(SensorSample::Steps { total: 75 });
    wait_for_shadow(&pair, |state| state.metrics.step_count == 75).await;

    let record = pair.phone.consumer.end_workout().await.unwrap().unwrap();
    assert_eq!(record.step_count, 75);
    assert!(record.is_completed);
    assert_eq!(pair.watch.session.status().await, WorkoutStatus::Idle);
}

#[tokio::test]
async fn pending_hand_off_starts_a_mirrored_workout() {
    let pair = pair(0, None).await;
    pair.phone
        .shared_store
        .set_pending_workout(WorkoutKind::Walking)
        .unwrap();

    let started = pair.phone.consumer.start_pending_workout().await.unwrap();
    assert_eq!(started, Some(WorkoutKind::Walking));

    let shadow = wait_for_shadow(&pair, |state| state.is_mirroring).await;
    assert_eq!(shadow.workout_kind, Some(WorkoutKind::Walking));
    assert_eq!(pair.phone.consumer.start_pending_workout().await.unwrap(), None);
}

#[tokio::test]
async fn end_while_paused_and_out_of_range_reaches_the_phone_later() {
    let pair = pair(1_000, None).await;
    let mut events = pair.phone.consumer.subscribe();

    pair.phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();
    wait_for_shadow(&pair, |state| state.is_mirroring).await;
    pair.hardware.emit(SensorSample::Steps { total: 240 });
    wait_for_shadow(&pair, |state| state.metrics.step_count == 240).await;

    pair.phone.consumer.pause_workout().await.unwrap();
    wait_for_watch_status(&pair, WorkoutStatus::Paused).await;
    wait_for_shadow(&pair, |state| state.is_paused).await;

    // the watch walks out of range and the workout is ended on the wrist
    pair.watch_link.update_link(|link| link.is_reachable = false);
    pair.watch.session.end().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.phone.consumer.is_mirroring().await);

    pair.watch_link.update_link(|link| link.is_reachable = true);
    let (reason, record) = next_end(&mut events).await;
    let record = record.unwrap();
    assert_eq!(reason, EndReason::Ended);
    assert_eq!(record.workout_kind, WorkoutKind::Running);
    assert_eq!(record.step_count, 240);
    assert!(record.external_id.is_some());
    assert!(!pair.phone.consumer.is_mirroring().await);

    // the next session is mirrored on its own
    pair.watch
        .session
        .start(WorkoutKind::Walking, WorkoutEnvironment::Outdoor)
        .await
        .unwrap();
    let shadow = wait_for_shadow(&pair, |state| state.workout_kind == Some(WorkoutKind::Walking)).await;
    assert!(shadow.is_mirroring);
    assert!(shadow.is_watch_initiated);
    assert_eq!(shadow.steps_before_workout, 1_000);

    pair.hardware.emit(SensorSample::Steps { total: 77 });
    let shadow = wait_for_shadow(&pair, |state| state.metrics.step_count == 77).await;
    assert_eq!(shadow.workout_kind, Some(WorkoutKind::Walking));

    let stored = pair.phone.db.get_workout(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.step_count, 240);
    assert!(stored.is_completed);
}
