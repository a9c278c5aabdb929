use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Tunables shared by both device roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Reply deadline for a command; expiry surfaces as `SendFailed`.
    pub command_timeout_ms: u64,
    pub snapshot_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub progress_save_every_ticks: u32,
    pub daily_step_goal: i64,
    pub live_status_enabled: bool,
    pub reconciliation_interval_secs: u64,
    pub reconciliation_lookback_days: i64,
    pub activation_retry_step_ms: u64,
    pub activation_retry_max_ms: u64,
    /// Phone stops mirroring when no snapshot or signal arrives for this long.
    pub mirror_stale_timeout_ms: u64,
    /// Same, while the mirrored workout is paused and the watch sends nothing.
    pub mirror_paused_stale_timeout_ms: u64,
    /// Upper bound on a single live-status surface call.
    pub live_status_call_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            snapshot_interval_ms: 1_000,
            tick_interval_ms: 1_000,
            progress_save_every_ticks: 10,
            daily_step_goal: 10_000,
            live_status_enabled: true,
            reconciliation_interval_secs: 15 * 60,
            reconciliation_lookback_days: 7,
            activation_retry_step_ms: 500,
            activation_retry_max_ms: 30_000,
            mirror_stale_timeout_ms: 60_000,
            mirror_paused_stale_timeout_ms: 30 * 60_000,
            live_status_call_timeout_ms: 2_000,
        }
    }
}

impl SyncSettings {
    /// Defaults with `STRIDELINK_DEBUG` applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        let debug_mode = std::env::var("STRIDELINK_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if debug_mode {
            self.tick_interval_ms = 250;
            self.snapshot_interval_ms = 250;
            self.progress_save_every_ticks = 1;
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn mirror_stale_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_stale_timeout_ms.max(1))
    }

    pub fn mirror_paused_stale_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_paused_stale_timeout_ms.max(1))
    }

    pub fn live_status_call_timeout(&self) -> Duration {
        Duration::from_millis(self.live_status_call_timeout_ms.max(1))
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs.max(1))
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<SyncSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring malformed settings at {}: {err}", path.display());
                SyncSettings::default()
            })
        } else {
            SyncSettings::default()
        };
        data.apply_env_overrides();

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> SyncSettings {
        self.read().clone()
    }

    pub fn update(&self, settings: SyncSettings) -> Result<()> {
        let mut guard = self.write();
        *guard = settings;
        self.persist(&guard)
    }

    pub fn set_daily_step_goal(&self, goal: i64) -> Result<()> {
        let mut guard = self.write();
        guard.daily_step_goal = goal;
        self.persist(&guard)
    }

    pub fn set_live_status_enabled(&self, enabled: bool) -> Result<()> {
        let mut guard = self.write();
        guard.live_status_enabled = enabled;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: SyncSettings = serde_json::from_str(&contents)?;
        *self.write() = data;
        Ok(())
    }

    fn persist(&self, data: &SyncSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, SyncSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SyncSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
