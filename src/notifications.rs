use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde::Serialize;
use strum::Display;
use tokio::sync::mpsc::UnboundedSender;

use crate::alarm_clock::{AlarmKind, FiredAlarm};
use crate::config::NotificationConfig;
use crate::error::QuickTodoError;
use crate::tasks::{TaskReader, TaskScope};
use crate::utils::Utils;

/// Notification slot for a task. Every notification for a task, whichever
/// alarm produced it, lands in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NotificationKey(i64);

impl NotificationKey {
    pub fn for_task(task_id: i64) -> Self {
        NotificationKey(task_id)
    }

    pub fn task_id(&self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub key: NotificationKey,
    pub task_id: i64,
    pub kind: AlarmKind,
    pub title: String,
    pub text: String,
    /// Timestamp shown with the notification (the task's due time).
    pub when: i64,
    pub sound: bool,
    pub vibrate: bool,
    /// Activating the notification dismisses it.
    pub auto_cancel: bool,
}

/// Reference handed to the UI when a notification is activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRef {
    pub task_id: i64,
    pub uri: String,
}

impl TaskRef {
    pub fn new(task_id: i64) -> Self {
        TaskRef {
            task_id,
            uri: TaskScope::Item(task_id).uri(),
        }
    }
}

/// Events for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    NotificationActivated(TaskRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SuppressReason {
    Deleted,
    Completed,
    NoDueDate,
    /// Due time changed after the alarm was armed.
    Rescheduled,
    StoreUnavailable,
    SinkUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Shown(NotificationKey),
    Suppressed(SuppressReason),
}

/// The system notification facility.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: &Notification) -> Result<(), QuickTodoError>;

    fn dismiss(&self, key: NotificationKey);
}

/// Prints notifications to the terminal running the daemon.
pub struct ConsoleNotificationSink;

impl NotificationSink for ConsoleNotificationSink {
    fn show(&self, notification: &Notification) -> Result<(), QuickTodoError> {
        let mut effects = Vec::new();
        if notification.sound {
            effects.push("sound");
        }
        if notification.vibrate {
            effects.push("vibrate");
        }

        println!(
            "🔔 [{}] {} - {} (due {}){}  (enter {} to open)",
            notification.task_id,
            notification.title,
            notification.text,
            Utils::format_local_millis(notification.when),
            if effects.is_empty() {
                String::new()
            } else {
                format!(" [{}]", effects.join(", "))
            },
            notification.task_id
        );
        info!(
            "Showing notification for task {} ({})",
            notification.task_id, notification.kind
        );
        Ok(())
    }

    fn dismiss(&self, key: NotificationKey) {
        debug!("Dismissed notification for task {}", key.task_id());
    }
}

/// Turns fired alarms into notifications after re-validating them against
/// the task store, and tracks which notifications are currently shown.
pub struct NotificationPresenter {
    tasks: Arc<dyn TaskReader>,
    sink: Arc<dyn NotificationSink>,
    settings: NotificationConfig,
    shown: Mutex<HashMap<NotificationKey, Notification>>,
    ui_events: Option<UnboundedSender<UiEvent>>,
}

impl NotificationPresenter {
    pub fn new(
        tasks: Arc<dyn TaskReader>,
        sink: Arc<dyn NotificationSink>,
        settings: NotificationConfig,
    ) -> Self {
        NotificationPresenter {
            tasks,
            sink,
            settings,
            shown: Mutex::new(HashMap::new()),
            ui_events: None,
        }
    }

    pub fn with_ui_events(mut self, ui_events: UnboundedSender<UiEvent>) -> Self {
        self.ui_events = Some(ui_events);
        self
    }

    /// Handle a fired alarm: show it if the task still warrants it,
    /// otherwise suppress it and clear anything stale for the task.
    pub fn on_fire(&self, fired: &FiredAlarm) -> FireOutcome {
        let task_id = fired.payload.task_id;

        let task = match self.tasks.get_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => return self.suppress(fired, SuppressReason::Deleted),
            Err(e) => {
                warn!("Could not re-validate alarm {} against the store: {}", fired.key, e);
                return self.suppress(fired, SuppressReason::StoreUnavailable);
            }
        };

        if task.completed {
            return self.suppress(fired, SuppressReason::Completed);
        }
        if !task.has_due_date || task.due_at <= 0 {
            return self.suppress(fired, SuppressReason::NoDueDate);
        }
        if task.due_at != fired.payload.due_at {
            return self.suppress(fired, SuppressReason::Rescheduled);
        }

        let notification = Notification {
            key: NotificationKey::for_task(task.id),
            task_id: task.id,
            kind: fired.payload.kind,
            title: task.title,
            text: fired.payload.notify_text.clone(),
            when: task.due_at,
            sound: self.settings.sound_enabled,
            vibrate: self.settings.vibrate_enabled,
            auto_cancel: true,
        };

        match self.show(notification) {
            Ok(key) => FireOutcome::Shown(key),
            Err(e) => {
                error!("Failed to show notification for task {}: {}", task_id, e);
                FireOutcome::Suppressed(SuppressReason::SinkUnavailable)
            }
        }
    }

    fn suppress(&self, fired: &FiredAlarm, reason: SuppressReason) -> FireOutcome {
        match reason {
            SuppressReason::Deleted | SuppressReason::Completed | SuppressReason::NoDueDate => {
                self.cancel(fired.payload.task_id)
            }
            // A rescheduled task's replacement alarm owns the slot now
            SuppressReason::Rescheduled
            | SuppressReason::StoreUnavailable
            | SuppressReason::SinkUnavailable => {}
        }
        info!("Suppressed alarm {} ({})", fired.key, reason);
        FireOutcome::Suppressed(reason)
    }

    /// Remove any shown notification for the task. No-op if none is shown.
    pub fn cancel(&self, task_id: i64) {
        let key = NotificationKey::for_task(task_id);
        if self.lock_shown().remove(&key).is_some() {
            self.sink.dismiss(key);
        }
    }

    /// Resolve a shown notification back to its task, dismissing it.
    pub fn activate(&self, key: NotificationKey) -> Option<TaskRef> {
        let notification = {
            let mut shown = self.lock_shown();
            let notification = shown.get(&key)?.clone();
            if notification.auto_cancel {
                shown.remove(&key);
            }
            notification
        };
        if notification.auto_cancel {
            self.sink.dismiss(key);
        }

        let task_ref = TaskRef::new(notification.task_id);
        if let Some(ui_events) = &self.ui_events {
            if ui_events
                .send(UiEvent::NotificationActivated(task_ref.clone()))
                .is_err()
            {
                debug!("No UI listening for activation of task {}", notification.task_id);
            }
        }
        Some(task_ref)
    }

    pub fn shown(&self, task_id: i64) -> Option<Notification> {
        self.lock_shown()
            .get(&NotificationKey::for_task(task_id))
            .cloned()
    }

    pub fn shown_task_ids(&self) -> Vec<i64> {
        self.lock_shown().keys().map(|key| key.task_id()).collect()
    }

    pub fn shown_count(&self) -> usize {
        self.lock_shown().len()
    }

    fn show(&self, notification: Notification) -> Result<NotificationKey, QuickTodoError> {
        let key = notification.key;
        self.sink.show(&notification)?;
        self.lock_shown().insert(key, notification);
        Ok(key)
    }

    fn lock_shown(&self) -> MutexGuard<'_, HashMap<NotificationKey, Notification>> {
        self.shown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
