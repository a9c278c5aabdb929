pub mod channel;
pub mod clock;
pub mod db;
pub mod error;
pub mod goals;
pub mod health;
pub mod models;
pub mod phone;
pub mod protocol;
pub mod records;
pub mod settings;
pub mod shared_store;
mod utils;
pub mod watch;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::Mutex;

use channel::{CommandChannel, DeviceTransport, LoopbackTransport};
use clock::SharedClock;
use db::Database;
use health::{HealthStore, MemoryHealthStore};
use models::{WorkoutEnvironment, WorkoutKind};
use phone::{
    ConsumerDeps, ConsumerEvent, DailyStepTracker, LiveStatusPublisher, LiveStatusSurface,
    LoggingLiveStatusSurface, MirroredSessionConsumer,
};
use records::{reconcile, Reconciler, WorkoutRecordWriter};
use settings::{SettingsStore, SyncSettings};
use shared_store::SharedStore;
use watch::{
    ScriptedHardware, SensorSample, SensorSession, SessionMirror, WatchCommandHandler,
    WorkoutHardware,
};

/// The authoritative role: owns the sensor session and mirrors it out.
pub struct WatchServices {
    pub channel: CommandChannel,
    pub session: SensorSession,
    pub mirror: Arc<SessionMirror>,
}

impl WatchServices {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        hardware: Arc<dyn WorkoutHardware>,
        clock: SharedClock,
        settings: &SyncSettings,
    ) -> Self {
        let channel = CommandChannel::new(transport, settings);
        let session = SensorSession::new(hardware, clock, settings.tick_interval());
        let mirror = SessionMirror::new(
            session.clone(),
            channel.clone(),
            settings.snapshot_interval(),
        );
        Self {
            channel,
            session,
            mirror,
        }
    }

    pub async fn start(&self) {
        self.channel
            .on_command_received(Arc::new(WatchCommandHandler::new(self.session.clone())));
        self.mirror.start().await;
        self.channel.start().await;
    }

    pub async fn shutdown(&self) {
        self.mirror.stop().await;
        self.channel.shutdown().await;
    }
}

/// Everything the phone role is built from.
pub struct PhoneDeps {
    pub transport: Arc<dyn DeviceTransport>,
    pub db: Database,
    pub health: Arc<dyn HealthStore>,
    pub shared_store: SharedStore,
    pub surface: Arc<dyn LiveStatusSurface>,
    pub local_hardware: Option<Arc<dyn WorkoutHardware>>,
    pub clock: SharedClock,
    pub settings: SyncSettings,
}

/// The passive role: mirrors the watch and owns persistence.
pub struct PhoneServices {
    pub channel: CommandChannel,
    pub consumer: MirroredSessionConsumer,
    pub writer: WorkoutRecordWriter,
    pub db: Database,
    pub health: Arc<dyn HealthStore>,
    pub shared_store: SharedStore,
    pub settings: SyncSettings,
    clock: SharedClock,
    step_tracker: Mutex<DailyStepTracker>,
    reconciler: Mutex<Reconciler>,
}

impl PhoneServices {
    pub fn new(deps: PhoneDeps) -> Self {
        let channel = CommandChannel::new(deps.transport, &deps.settings);
        let writer = WorkoutRecordWriter::new(deps.db.clone(), deps.health.clone(), deps.clock.clone());
        let live_status = Arc::new(
            LiveStatusPublisher::new(deps.surface, deps.settings.live_status_enabled)
                .with_call_timeout(deps.settings.live_status_call_timeout()),
        );
        let consumer = MirroredSessionConsumer::new(ConsumerDeps {
            channel: channel.clone(),
            shared_store: deps.shared_store.clone(),
            live_status,
            writer: writer.clone(),
            settings: deps.settings.clone(),
            clock: deps.clock.clone(),
            local_hardware: deps.local_hardware,
        });
        let step_tracker = DailyStepTracker::new(
            deps.health.clone(),
            deps.shared_store.clone(),
            deps.db.clone(),
            deps.clock.clone(),
            deps.settings.daily_step_goal,
        );

        Self {
            channel,
            consumer,
            writer,
            db: deps.db,
            health: deps.health,
            shared_store: deps.shared_store,
            settings: deps.settings,
            clock: deps.clock,
            step_tracker: Mutex::new(step_tracker),
            reconciler: Mutex::new(Reconciler::new()),
        }
    }

    /// Launch sequence: finalise workouts a crash left open, wire the
    /// channel, then start step tracking and reconciliation.
    pub async fn start(&self) -> Result<()> {
        let recovered = self
            .writer
            .recover_incomplete()
            .await
            .context("failed to recover incomplete workouts")?;
        if recovered > 0 {
            warn!("Recovered {recovered} workout(s) interrupted by the last shutdown");
        }

        self.consumer.attach();
        self.channel.start().await;

        {
            let mut tracker = self.step_tracker.lock().await;
            if let Err(err) = tracker.refresh().await {
                warn!("Initial step count unavailable: {err:?}");
            }
            tracker.start();
        }

        if let Err(err) = reconcile(
            &self.db,
            self.health.as_ref(),
            &self.clock,
            self.settings.reconciliation_lookback_days,
        )
        .await
        {
            warn!("Launch reconciliation failed: {err:?}");
        }
        self.reconciler.lock().await.start(
            self.db.clone(),
            self.health.clone(),
            self.clock.clone(),
            self.settings.reconciliation_interval(),
            self.settings.reconciliation_lookback_days,
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.consumer.shutdown().await;
        if let Err(err) = self.reconciler.lock().await.stop().await {
            error!("Failed to stop reconciliation: {err:?}");
        }
        if let Err(err) = self.step_tracker.lock().await.stop().await {
            error!("Failed to stop step tracking: {err:?}");
        }
        self.channel.shutdown().await;
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("STRIDELINK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("stridelink"))
}

/// Runs one short paired workout between an in-process phone and watch.
async fn simulate() -> Result<()> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let mut settings = SettingsStore::new(data_dir.join("settings.json"))?.current();
    settings.tick_interval_ms = settings.tick_interval_ms.min(250);
    settings.snapshot_interval_ms = settings.snapshot_interval_ms.min(250);

    let clock = clock::system_clock();
    let (phone_link, watch_link) = LoopbackTransport::pair();

    let hardware = Arc::new(ScriptedHardware::new());
    let watch = WatchServices::new(watch_link, hardware.clone(), clock.clone(), &settings);
    watch.start().await;

    let health = Arc::new(MemoryHealthStore::new(clock.clone()));
    health.set_steps(clock.now().date_naive(), 4_000);

    let phone = PhoneServices::new(PhoneDeps {
        transport: phone_link,
        db: Database::new(data_dir.join("stridelink.sqlite3"))?,
        health,
        shared_store: SharedStore::open(data_dir.join("shared.json"))?,
        surface: Arc::new(LoggingLiveStatusSurface),
        local_hardware: None,
        clock,
        settings,
    });
    phone.start().await?;

    let mut events = phone.consumer.subscribe();
    phone
        .consumer
        .start_mirrored_workout(WorkoutKind::Running, WorkoutEnvironment::Outdoor)
        .await?;

    let mut shadow = phone.consumer.watch_state();
    tokio::time::timeout(Duration::from_secs(5), shadow.wait_for(|state| state.is_mirroring))
        .await
        .context("watch session never reached the phone")?
        .context("consumer went away")?;

    for i in 1..=8u64 {
        hardware.emit(SensorSample::Steps { total: i * 110 });
        hardware.emit(SensorSample::Distance {
            total_meters: i as f64 * 90.0,
        });
        hardware.emit(SensorSample::HeartRate {
            bpm: 120.0 + i as f64 * 3.0,
        });
        hardware.emit(SensorSample::Speed {
            meters_per_second: 3.0,
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        if i == 4 {
            phone.consumer.pause_workout().await?;
            tokio::time::sleep(Duration::from_millis(600)).await;
            phone.consumer.resume_workout().await?;
        }
    }

    phone.consumer.end_workout().await?;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ConsumerEvent::WorkoutEnded { reason, record }) => return Some((reason, record)),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .context("watch never confirmed the end of the workout")?;

    match ended {
        Some((reason, Some(record))) => info!(
            "Workout ended ({reason:?}): {} {:.0}s, {} steps, {:.0} m, external id {:?}",
            record.workout_kind.display_name(),
            record.duration_seconds,
            record.step_count,
            record.distance_meters,
            record.external_id
        ),
        Some((reason, None)) => warn!("Workout ended ({reason:?}) without a saved record"),
        None => warn!("Consumer stopped before the workout ended"),
    }

    let stored = phone.db.list_workouts(5).await?;
    info!("{} workout(s) on record", stored.len());

    phone.shutdown().await;
    watch.shutdown().await;
    Ok(())
}

pub fn run() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("StrideLink simulation starting up...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start async runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(simulate()) {
        error!("Simulation failed: {err:?}");
    }
}
