use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::error::QuickTodoError;
use crate::utils::Utils;

/// What an alarm entry stands for.
///
/// `Due` and `Reminder` are real one-shot timers. `DeleteMarker` only ever
/// appears in a reconciliation plan and means "make sure nothing is armed
/// or shown for this task".
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Due,
    Reminder,
    DeleteMarker,
}

impl AlarmKind {
    /// Kinds that occupy a slot in the alarm table.
    pub const TIMER_KINDS: [AlarmKind; 2] = [AlarmKind::Due, AlarmKind::Reminder];

    pub fn is_timer(&self) -> bool {
        Self::TIMER_KINDS.contains(self)
    }
}

/// Identity of an alarm slot. Derived only from the task id and kind, so the
/// same task always maps to the same slot, including after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmKey {
    task_id: i64,
    kind: AlarmKind,
}

impl AlarmKey {
    pub fn new(task_id: i64, kind: AlarmKind) -> Self {
        AlarmKey { task_id, kind }
    }

    pub fn due(task_id: i64) -> Self {
        Self::new(task_id, AlarmKind::Due)
    }

    pub fn reminder(task_id: i64) -> Self {
        Self::new(task_id, AlarmKind::Reminder)
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.task_id)
    }
}

/// Data carried by an armed alarm and handed back when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmPayload {
    pub task_id: i64,
    pub kind: AlarmKind,
    pub title: String,
    pub notify_text: String,
    /// The task's due time when the alarm was armed.
    pub due_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredAlarm {
    pub key: AlarmKey,
    pub payload: AlarmPayload,
}

/// Per-key timer state: `Unarmed -> Armed -> Fired`. `set` from any state
/// arms, `cancel` from any state disarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Unarmed,
    Armed { fire_at: i64 },
    Fired,
}

/// One-shot wall-clock timers keyed by `AlarmKey`.
pub trait AlarmClock: Send + Sync {
    /// Arm `key` to fire at `fire_at` (epoch millis), replacing whatever was
    /// armed under the same key. A time in the past fires as soon as possible.
    fn set(&self, key: AlarmKey, fire_at: i64, payload: AlarmPayload) -> Result<(), QuickTodoError>;

    /// Disarm `key`. Unknown keys are ignored.
    fn cancel(&self, key: AlarmKey);

    fn state(&self, key: AlarmKey) -> AlarmState;

    /// Keys currently armed or fired, i.e. every slot that is not `Unarmed`.
    fn keys(&self) -> Vec<AlarmKey>;
}

struct WheelEntry {
    generation: u64,
    state: AlarmState,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct WheelState {
    entries: HashMap<AlarmKey, WheelEntry>,
    next_generation: u64,
}

/// In-process alarm clock: every armed key owns a sleeping tokio task.
///
/// A generation number is recorded per key each time it is armed; a timer
/// only delivers if its generation is still current, so a replaced or
/// cancelled timer can never fire. Fired alarms are sent over an unbounded
/// channel, once each.
pub struct TimerWheelClock {
    inner: Arc<Mutex<WheelState>>,
    fired_tx: UnboundedSender<FiredAlarm>,
    shutdown: CancellationToken,
    handle: Handle,
}

impl TimerWheelClock {
    /// Must be called from within a tokio runtime.
    pub fn new(fired_tx: UnboundedSender<FiredAlarm>) -> Result<Self, QuickTodoError> {
        let handle = Handle::try_current().map_err(|e| {
            QuickTodoError::AlarmClockUnavailable(format!("no timer runtime: {}", e))
        })?;

        Ok(TimerWheelClock {
            inner: Arc::new(Mutex::new(WheelState::default())),
            fired_tx,
            shutdown: CancellationToken::new(),
            handle,
        })
    }

    pub fn channel() -> Result<(Self, UnboundedReceiver<FiredAlarm>), QuickTodoError> {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Ok((Self::new(fired_tx)?, fired_rx))
    }

    /// Drop every pending timer. Later `set` calls fail with `AlarmClockUnavailable`.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.lock_state().entries.clear();
    }

    pub fn armed_count(&self) -> usize {
        self.lock_state()
            .entries
            .values()
            .filter(|entry| matches!(entry.state, AlarmState::Armed { .. }))
            .count()
    }

    fn lock_state(&self) -> MutexGuard<'_, WheelState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(
        inner: &Mutex<WheelState>,
        fired_tx: &UnboundedSender<FiredAlarm>,
        key: AlarmKey,
        generation: u64,
        payload: AlarmPayload,
    ) {
        let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get_mut(&key) {
            Some(entry) if entry.generation == generation => {
                entry.state = AlarmState::Fired;
                entry.cancel = None;
                if fired_tx.send(FiredAlarm { key, payload }).is_err() {
                    warn!("Alarm {} fired but nobody is listening", key);
                }
            }
            _ => trace!("Alarm {} generation {} superseded, not delivering", key, generation),
        }
    }
}

impl AlarmClock for TimerWheelClock {
    fn set(
        &self,
        key: AlarmKey,
        fire_at: i64,
        payload: AlarmPayload,
    ) -> Result<(), QuickTodoError> {
        if self.shutdown.is_cancelled() {
            return Err(QuickTodoError::AlarmClockUnavailable(
                "timer wheel is shut down".to_string(),
            ));
        }

        let token = self.shutdown.child_token();
        let generation = {
            let mut state = self.lock_state();
            let generation = state.next_generation;
            state.next_generation += 1;

            let previous = state.entries.insert(
                key,
                WheelEntry {
                    generation,
                    state: AlarmState::Armed { fire_at },
                    cancel: Some(token.clone()),
                },
            );
            if let Some(cancel) = previous.and_then(|entry| entry.cancel) {
                cancel.cancel();
            }
            generation
        };

        let delay = Duration::from_millis((fire_at - Utils::now_millis()).max(0) as u64);
        debug!("Arming alarm {} in {:?}", key, delay);

        let inner = Arc::clone(&self.inner);
        let fired_tx = self.fired_tx.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    Self::deliver(&inner, &fired_tx, key, generation, payload);
                }
            }
        });

        Ok(())
    }

    fn cancel(&self, key: AlarmKey) {
        if let Some(entry) = self.lock_state().entries.remove(&key) {
            if let Some(cancel) = entry.cancel {
                cancel.cancel();
            }
            debug!("Cancelled alarm {}", key);
        }
    }

    fn state(&self, key: AlarmKey) -> AlarmState {
        self.lock_state()
            .entries
            .get(&key)
            .map(|entry| entry.state)
            .unwrap_or(AlarmState::Unarmed)
    }

    fn keys(&self) -> Vec<AlarmKey> {
        let mut keys: Vec<AlarmKey> = self.lock_state().entries.keys().copied().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tokio::time::timeout;

    fn payload(task_id: i64, due_at: i64) -> AlarmPayload {
        AlarmPayload {
            task_id,
            kind: AlarmKind::Due,
            title: format!("task {}", task_id),
            notify_text: "Due Now!".to_string(),
            due_at,
        }
    }

    #[test]
    fn test_key_identity() {
        assert_eq!(AlarmKey::due(5), AlarmKey::new(5, AlarmKind::Due));
        assert_ne!(AlarmKey::due(5), AlarmKey::reminder(5));
        assert_ne!(AlarmKey::due(5), AlarmKey::due(6));
        assert_eq!(AlarmKey::reminder(9).to_string(), "reminder/9");
        assert_eq!(AlarmKind::from_str("delete_marker").unwrap(), AlarmKind::DeleteMarker);
    }

    #[test]
    fn test_new_outside_runtime_is_unavailable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = TimerWheelClock::new(tx).err().unwrap();
        assert!(matches!(err, QuickTodoError::AlarmClockUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_at_due_time() {
        let (clock, mut rx) = TimerWheelClock::channel().unwrap();
        let fire_at = Utils::now_millis() + 60_000;
        clock.set(AlarmKey::due(1), fire_at, payload(1, fire_at)).unwrap();
        assert_eq!(clock.state(AlarmKey::due(1)), AlarmState::Armed { fire_at });

        // Nothing before the due time
        assert!(timeout(Duration::from_secs(30), rx.recv()).await.is_err());

        let fired = timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.key, AlarmKey::due(1));
        assert_eq!(fired.payload, payload(1, fire_at));
        assert_eq!(clock.state(AlarmKey::due(1)), AlarmState::Fired);
        assert_eq!(clock.armed_count(), 0);

        // Exactly once
        assert!(timeout(Duration::from_secs(3600), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_fire_time_fires_immediately() {
        let (clock, mut rx) = TimerWheelClock::channel().unwrap();
        let fire_at = Utils::now_millis() - 3_600_000;
        clock.set(AlarmKey::due(2), fire_at, payload(2, fire_at)).unwrap();

        let fired = timeout(Duration::from_millis(10), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.key, AlarmKey::due(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_existing_timer() {
        let (clock, mut rx) = TimerWheelClock::channel().unwrap();
        let first = Utils::now_millis() + 10_000;
        let second = Utils::now_millis() + 120_000;
        clock.set(AlarmKey::due(3), first, payload(3, first)).unwrap();
        clock.set(AlarmKey::due(3), second, payload(3, second)).unwrap();
        assert_eq!(clock.armed_count(), 1);

        let fired = timeout(Duration::from_secs(300), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.payload.due_at, second);
        assert!(timeout(Duration::from_secs(300), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms() {
        let (clock, mut rx) = TimerWheelClock::channel().unwrap();
        let fire_at = Utils::now_millis() + 1_000;
        clock.set(AlarmKey::due(4), fire_at, payload(4, fire_at)).unwrap();
        clock.cancel(AlarmKey::due(4));
        clock.cancel(AlarmKey::due(4));
        clock.cancel(AlarmKey::due(404));

        assert_eq!(clock.state(AlarmKey::due(4)), AlarmState::Unarmed);
        assert!(clock.keys().is_empty());
        assert!(timeout(Duration::from_secs(60), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_then_cancel_returns_to_unarmed() {
        let (clock, mut rx) = TimerWheelClock::channel().unwrap();
        let fire_at = Utils::now_millis();
        clock.set(AlarmKey::due(5), fire_at, payload(5, fire_at)).unwrap();
        rx.recv().await.unwrap();
        assert_eq!(clock.state(AlarmKey::due(5)), AlarmState::Fired);

        clock.cancel(AlarmKey::due(5));
        assert_eq!(clock.state(AlarmKey::due(5)), AlarmState::Unarmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_clock_rejects_set() {
        let (clock, mut rx) = TimerWheelClock::channel().unwrap();
        let fire_at = Utils::now_millis() + 1_000;
        clock.set(AlarmKey::due(6), fire_at, payload(6, fire_at)).unwrap();
        clock.close();

        let err = clock.set(AlarmKey::due(7), fire_at, payload(7, fire_at)).unwrap_err();
        assert!(matches!(err, QuickTodoError::AlarmClockUnavailable(_)));
        assert_eq!(clock.armed_count(), 0);
        assert!(timeout(Duration::from_secs(60), rx.recv()).await.is_err());
    }
}
