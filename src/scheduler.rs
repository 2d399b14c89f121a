use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, warn, Level};
use logging_timer::timer;

use crate::alarm_clock::{AlarmClock, AlarmKey, AlarmKind, AlarmPayload};
use crate::config::NotificationConfig;
use crate::error::QuickTodoError;
use crate::notifications::NotificationPresenter;
use crate::tasks::{Task, TaskEvent, TaskReader, TaskScope};
use crate::utils::Utils;

const DUE_TEXT: &str = "Due Now!";

/// Whether a reconciliation may arm new alarms or only tear old ones down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Rearm,
    CancelOnly,
}

/// One entry of a task's reconciliation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledAlarm {
    pub task_id: i64,
    pub kind: AlarmKind,
    /// Epoch millis. Unused for `DeleteMarker`.
    pub fire_at: i64,
}

impl ScheduledAlarm {
    pub fn key(&self) -> AlarmKey {
        AlarmKey::new(self.task_id, self.kind)
    }

    /// The alarm operations that bring `task` to its correct state.
    ///
    /// Every plan starts with a `DeleteMarker`, so whatever was armed or shown
    /// before is torn down before anything is re-armed. In `Rearm` mode an
    /// open task with a usable due date then gets its `Due` alarm, preceded
    /// by a `Reminder` when a lead time is configured and the reminder time
    /// is still ahead of `now`.
    pub fn plan(
        task: &Task,
        mode: ReconcileMode,
        remind_before_millis: i64,
        now: i64,
    ) -> Vec<ScheduledAlarm> {
        let mut plan = vec![ScheduledAlarm {
            task_id: task.id,
            kind: AlarmKind::DeleteMarker,
            fire_at: 0,
        }];

        if mode == ReconcileMode::CancelOnly || !task.wants_due_alarm() {
            return plan;
        }

        if remind_before_millis > 0 {
            let remind_at = task.due_at.saturating_sub(remind_before_millis);
            if remind_at > now {
                plan.push(ScheduledAlarm {
                    task_id: task.id,
                    kind: AlarmKind::Reminder,
                    fire_at: remind_at,
                });
            }
        }

        plan.push(ScheduledAlarm {
            task_id: task.id,
            kind: AlarmKind::Due,
            fire_at: task.due_at,
        });
        plan
    }

    fn notify_text(&self, remind_before_millis: i64) -> String {
        match self.kind {
            AlarmKind::Reminder => format!("Due in {} minutes", remind_before_millis / 60_000),
            _ => DUE_TEXT.to_string(),
        }
    }
}

/// What a reconciliation did. Failures to arm are collected as warnings
/// rather than returned as errors.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub armed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub warnings: Vec<QuickTodoError>,
    /// Set when this reconciliation surfaced the "alarms unavailable" warning to the user.
    pub surfaced_unavailable: bool,
}

impl ReconcileOutcome {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Keeps the live alarm set equal to what the task store says it should be.
pub struct ReminderScheduler {
    tasks: Arc<dyn TaskReader>,
    clock: Arc<dyn AlarmClock>,
    presenter: Arc<NotificationPresenter>,
    remind_before_millis: i64,
    unavailable_reported: AtomicBool,
}

impl ReminderScheduler {
    pub fn new(
        tasks: Arc<dyn TaskReader>,
        clock: Arc<dyn AlarmClock>,
        presenter: Arc<NotificationPresenter>,
        settings: &NotificationConfig,
    ) -> Self {
        ReminderScheduler {
            tasks,
            clock,
            presenter,
            remind_before_millis: settings.remind_before_millis(),
            unavailable_reported: AtomicBool::new(false),
        }
    }

    /// Route a task store change notification.
    pub fn handle_event(&self, event: TaskEvent) -> ReconcileOutcome {
        match event {
            TaskEvent::Changed(task_id) => self.reconcile_one(task_id),
            TaskEvent::Deleted(task_id) => self.cancel_all(task_id),
            TaskEvent::BulkReset => self.reconcile_all(),
        }
    }

    pub fn reconcile_one(&self, task_id: i64) -> ReconcileOutcome {
        self.reconcile(TaskScope::Item(task_id), ReconcileMode::Rearm)
    }

    /// Cancel alarms and notifications for a task without re-arming.
    pub fn cancel_all(&self, task_id: i64) -> ReconcileOutcome {
        self.reconcile(TaskScope::Item(task_id), ReconcileMode::CancelOnly)
    }

    pub fn reconcile_all(&self) -> ReconcileOutcome {
        let _tmr = timer!(Level::Trace; "ReminderScheduler::reconcile_all");
        self.reconcile(TaskScope::All, ReconcileMode::Rearm)
    }

    pub fn reconcile(&self, scope: TaskScope, mode: ReconcileMode) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        match scope {
            TaskScope::Item(task_id) => self.reconcile_item(task_id, mode, &mut outcome),
            TaskScope::All => self.reconcile_every_task(mode, &mut outcome),
        }

        self.track_availability(&mut outcome);
        debug!(
            "Reconciled {:?} ({:?}): armed {}, cancelled {}, skipped {}, warnings {}",
            scope,
            mode,
            outcome.armed,
            outcome.cancelled,
            outcome.skipped,
            outcome.warnings.len()
        );
        outcome
    }

    fn reconcile_item(&self, task_id: i64, mode: ReconcileMode, outcome: &mut ReconcileOutcome) {
        if mode == ReconcileMode::CancelOnly {
            self.cancel_task(task_id, outcome);
            return;
        }

        match self.tasks.get_task(task_id) {
            Ok(Some(task)) => self.apply_plan(&task, mode, outcome),
            Ok(None) => {
                // Vanished before we got to it; make sure nothing is left behind
                debug!("{}, skipping", QuickTodoError::NotFound(task_id));
                self.cancel_task(task_id, outcome);
                outcome.skipped += 1;
            }
            Err(e) => {
                warn!("Could not read task {} for reconciliation: {}", task_id, e);
                self.cancel_task(task_id, outcome);
                outcome.skipped += 1;
            }
        }
    }

    fn reconcile_every_task(&self, mode: ReconcileMode, outcome: &mut ReconcileOutcome) {
        let tasks = match self.tasks.list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Could not list tasks for full reconciliation: {}", e);
                outcome.warnings.push(e);
                return;
            }
        };

        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            seen.insert(task.id);
            self.apply_plan(task, mode, outcome);
        }

        for task_id in self.orphaned_task_ids(&seen) {
            debug!("Dropping alarms for task {} which no longer exists", task_id);
            self.cancel_task(task_id, outcome);
        }
    }

    /// Tasks that still hold an alarm or a shown notification but are not in `live`.
    pub fn orphaned_task_ids(&self, live: &HashSet<i64>) -> Vec<i64> {
        let mut orphans: Vec<i64> = self
            .clock
            .keys()
            .iter()
            .map(|key| key.task_id())
            .chain(self.presenter.shown_task_ids())
            .filter(|task_id| !live.contains(task_id))
            .collect();
        orphans.sort_unstable();
        orphans.dedup();
        orphans
    }

    fn apply_plan(&self, task: &Task, mode: ReconcileMode, outcome: &mut ReconcileOutcome) {
        if task.has_invalid_due_date() {
            debug!(
                "{}, treating as no alarm",
                QuickTodoError::InvalidTaskState {
                    task_id: task.id,
                    reason: "has a due date flag but no due time".to_string(),
                }
            );
        }

        let now = Utils::now_millis();
        for alarm in ScheduledAlarm::plan(task, mode, self.remind_before_millis, now) {
            if alarm.kind.is_timer() {
                self.arm(&alarm, task, outcome);
            } else {
                self.cancel_task(task.id, outcome);
            }
        }
    }

    fn cancel_task(&self, task_id: i64, outcome: &mut ReconcileOutcome) {
        self.clock.cancel(AlarmKey::due(task_id));
        self.clock.cancel(AlarmKey::reminder(task_id));
        self.presenter.cancel(task_id);
        outcome.cancelled += 1;
    }

    fn arm(&self, alarm: &ScheduledAlarm, task: &Task, outcome: &mut ReconcileOutcome) {
        let payload = AlarmPayload {
            task_id: task.id,
            kind: alarm.kind,
            title: task.title.clone(),
            notify_text: alarm.notify_text(self.remind_before_millis),
            due_at: task.due_at,
        };

        match self.clock.set(alarm.key(), alarm.fire_at, payload) {
            Ok(()) => outcome.armed += 1,
            Err(e) if e.is_recoverable() => {
                warn!("Could not arm alarm {}: {}", alarm.key(), e);
                outcome.warnings.push(e);
            }
            Err(e) => {
                error!("Arming alarm {} failed: {}", alarm.key(), e);
                outcome.warnings.push(e);
            }
        }
    }

    /// Surface a total inability to arm alarms once, until arming works again.
    fn track_availability(&self, outcome: &mut ReconcileOutcome) {
        if outcome.armed > 0 {
            self.unavailable_reported.store(false, Ordering::Release);
            return;
        }

        let unavailable = outcome
            .warnings
            .iter()
            .find(|e| matches!(e, QuickTodoError::AlarmClockUnavailable(_)));

        if let Some(e) = unavailable {
            if !self.unavailable_reported.swap(true, Ordering::AcqRel) {
                error!("No reminders can be scheduled: {}", e);
                eprintln!(
                    "⚠️  Reminders are currently unavailable ({}). \
                     They will be rescheduled on the next change or restart.",
                    e
                );
                outcome.surfaced_unavailable = true;
            }
        }
    }
}
