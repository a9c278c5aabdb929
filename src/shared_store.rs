//! App-group key/value store shared between the app, its extensions and
//! intent handlers.
//!
//! Every read goes back to disk because other processes write the same file;
//! writes are whole-file and last-write-wins.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use crate::models::WorkoutKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
struct SharedValues {
    daily_step_total: u64,
    daily_step_date: Option<NaiveDate>,
    pending_workout_kind: Option<WorkoutKind>,
    should_start_workout: bool,
}

#[derive(Clone)]
pub struct SharedStore {
    path: Option<Arc<PathBuf>>,
    cache: Arc<RwLock<SharedValues>>,
}

impl SharedStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create shared store directory {}", parent.display())
            })?;
        }

        let store = Self {
            path: Some(Arc::new(path)),
            cache: Arc::new(RwLock::new(SharedValues::default())),
        };
        store.load()?;
        Ok(store)
    }

    /// Process-local store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cache: Arc::new(RwLock::new(SharedValues::default())),
        }
    }

    /// Latest known step total for today, as written by whichever process
    /// last observed the health store.
    pub fn daily_step_total(&self) -> u64 {
        self.snapshot().daily_step_total
    }

    pub fn daily_step_date(&self) -> Option<NaiveDate> {
        self.snapshot().daily_step_date
    }

    pub fn set_daily_step_total(&self, date: NaiveDate, steps: u64) -> Result<()> {
        self.mutate(|values| {
            values.daily_step_total = steps;
            values.daily_step_date = Some(date);
        })
    }

    /// Hand-off from quick actions and voice shortcuts: remember which
    /// workout to start once the app is foregrounded.
    pub fn set_pending_workout(&self, kind: WorkoutKind) -> Result<()> {
        self.mutate(|values| {
            values.pending_workout_kind = Some(kind);
            values.should_start_workout = true;
        })
    }

    /// Drains the pending hand-off, if any.
    pub fn take_pending_workout(&self) -> Result<Option<WorkoutKind>> {
        let values = self.snapshot();
        if !values.should_start_workout {
            return Ok(None);
        }

        self.mutate(|values| {
            values.pending_workout_kind = None;
            values.should_start_workout = false;
        })?;
        Ok(values.pending_workout_kind)
    }

    fn snapshot(&self) -> SharedValues {
        if let Err(err) = self.load() {
            log::warn!("Shared store unreadable, using cached values: {err:#}");
        }
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(path.as_path())
            .with_context(|| format!("failed to read shared store {}", path.display()))?;
        let values: SharedValues = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse shared store {}", path.display()))?;
        *self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = values;
        Ok(())
    }

    fn mutate(&self, apply: impl FnOnce(&mut SharedValues)) -> Result<()> {
        if let Err(err) = self.load() {
            log::warn!("Overwriting unreadable shared store: {err:#}");
        }

        let mut guard = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut guard);

        if let Some(path) = &self.path {
            let serialized = serde_json::to_string_pretty(&*guard)?;
            fs::write(path.as_path(), serialized)
                .with_context(|| format!("failed to write shared store {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pending_workout_is_drained_once() {
        let store = SharedStore::in_memory();
        store.set_pending_workout(WorkoutKind::Running).unwrap();

        assert_eq!(store.take_pending_workout().unwrap(), Some(WorkoutKind::Running));
        assert_eq!(store.take_pending_workout().unwrap(), None);
    }

    #[test]
    fn writes_from_another_handle_are_visible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group").join("shared.json");
        let app = SharedStore::open(path.clone()).unwrap();
        let widget = SharedStore::open(path).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        widget.set_daily_step_total(today, 4_000).unwrap();

        assert_eq!(app.daily_step_total(), 4_000);
        assert_eq!(app.daily_step_date(), Some(today));
    }

    #[test]
    fn last_write_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.json");
        let a = SharedStore::open(path.clone()).unwrap();
        let b = SharedStore::open(path).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();

        a.set_daily_step_total(today, 100).unwrap();
        b.set_daily_step_total(today, 90).unwrap();
        assert_eq!(a.daily_step_total(), 90);
    }
}
