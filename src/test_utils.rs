//! In-memory doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tempfile::TempDir;

use crate::alarm_clock::{AlarmClock, AlarmKey, AlarmPayload, AlarmState, FiredAlarm};
use crate::database::Database;
use crate::error::QuickTodoError;
use crate::notifications::{Notification, NotificationKey, NotificationSink};
use crate::tasks::TaskStore;

pub fn temp_store() -> (TempDir, TaskStore) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, TaskStore::new(db))
}

#[derive(Default)]
pub struct RecordingSink {
    shown: Mutex<Vec<Notification>>,
    dismissed: Mutex<Vec<NotificationKey>>,
}

impl RecordingSink {
    pub fn shown_titles(&self) -> Vec<String> {
        self.shown.lock().unwrap().iter().map(|n| n.title.clone()).collect()
    }

    pub fn dismissed(&self) -> Vec<NotificationKey> {
        self.dismissed.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn show(&self, notification: &Notification) -> Result<(), QuickTodoError> {
        self.shown.lock().unwrap().push(notification.clone());
        Ok(())
    }

    fn dismiss(&self, key: NotificationKey) {
        self.dismissed.lock().unwrap().push(key);
    }
}

/// Alarm clock that never fires on its own; tests fire keys by hand.
#[derive(Default)]
pub struct RecordingClock {
    entries: Mutex<HashMap<AlarmKey, (AlarmState, AlarmPayload)>>,
    unavailable: AtomicBool,
}

impl RecordingClock {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn payload(&self, key: AlarmKey) -> Option<AlarmPayload> {
        self.entries.lock().unwrap().get(&key).map(|(_, p)| p.clone())
    }

    /// Fire an armed key. Returns `None` if it is not armed.
    pub fn fire(&self, key: AlarmKey) -> Option<FiredAlarm> {
        let mut entries = self.entries.lock().unwrap();
        let (state, payload) = entries.get_mut(&key)?;
        if !matches!(state, AlarmState::Armed { .. }) {
            return None;
        }
        *state = AlarmState::Fired;
        Some(FiredAlarm {
            key,
            payload: payload.clone(),
        })
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|(state, _)| matches!(state, AlarmState::Armed { .. }))
            .count()
    }

    pub fn snapshot(&self) -> Vec<(AlarmKey, AlarmState, AlarmPayload)> {
        let mut all: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, (state, payload))| (*key, *state, payload.clone()))
            .collect();
        all.sort_by_key(|(key, _, _)| *key);
        all
    }
}

impl AlarmClock for RecordingClock {
    fn set(
        &self,
        key: AlarmKey,
        fire_at: i64,
        payload: AlarmPayload,
    ) -> Result<(), QuickTodoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QuickTodoError::AlarmClockUnavailable(
                "recording clock switched off".to_string(),
            ));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key, (AlarmState::Armed { fire_at }, payload));
        Ok(())
    }

    fn cancel(&self, key: AlarmKey) {
        self.entries.lock().unwrap().remove(&key);
    }

    fn state(&self, key: AlarmKey) -> AlarmState {
        self.entries
            .lock()
            .unwrap()
            .get(&key)
            .map(|(state, _)| *state)
            .unwrap_or(AlarmState::Unarmed)
    }

    fn keys(&self) -> Vec<AlarmKey> {
        let mut keys: Vec<AlarmKey> = self.entries.lock().unwrap().keys().copied().collect();
        keys.sort();
        keys
    }
}
