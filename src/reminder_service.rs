use std::collections::HashMap;
use std::future::Future;
use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rusqlite::Connection;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Interval, MissedTickBehavior};

use crate::alarm_clock::{AlarmClock, AlarmState, FiredAlarm, TimerWheelClock};
use crate::config::NotificationConfig;
use crate::database::Database;
use crate::error::QuickTodoError;
use crate::notifications::{
    FireOutcome, NotificationKey, NotificationPresenter, NotificationSink, UiEvent,
};
use crate::scheduler::{ReconcileOutcome, ReminderScheduler};
use crate::tasks::{Task, TaskEvent, TaskScope, TaskStore};
use crate::utils::Utils;

/// Writers stamp `modified_at` before they commit, so a row can land with a
/// stamp slightly older than the newest one already seen.
const CHANGE_GRACE_MILLIS: i64 = 2_000;

/// A line typed into the terminal running the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Open (activate) the notification shown for a task.
    Open(NotificationKey),
    /// List the alarms the service currently holds.
    Alarms,
}

impl FromStr for ConsoleCommand {
    type Err = QuickTodoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("alarms") {
            return Ok(ConsoleCommand::Alarms);
        }
        s.parse::<i64>()
            .map(|task_id| ConsoleCommand::Open(NotificationKey::for_task(task_id)))
            .map_err(|_| {
                QuickTodoError::Error(format!(
                    "Unknown command '{}': enter a task id to open its notification, or 'alarms'",
                    s
                ))
            })
    }
}

/// One unit of work for the service loop.
#[derive(Debug)]
pub enum ServiceMessage {
    Task(TaskEvent),
    Fired(FiredAlarm),
    Console(ConsoleCommand),
    Ui(UiEvent),
    /// Time to check whether another process changed the database.
    Poll,
}

/// Which rows the service has already reconciled, so a poll only routes the
/// rows another process actually touched.
#[derive(Default)]
struct ChangeCursor {
    since: i64,
    seen: HashMap<i64, Task>,
}

impl ChangeCursor {
    fn window_start(&self) -> i64 {
        self.since - CHANGE_GRACE_MILLIS
    }

    fn is_new(&self, task: &Task) -> bool {
        self.seen.get(&task.id) != Some(task)
    }

    fn record(&mut self, task: Task) {
        self.seen.insert(task.id, task);
    }

    fn forget(&mut self, task_id: i64) {
        self.seen.remove(&task_id);
    }

    fn advance(&mut self, to: i64) {
        if to > self.since {
            self.since = to;
            let start = self.window_start();
            self.seen.retain(|_, task| task.modified_at >= start);
        }
    }
}

/// The reminder daemon: a single worker that owns the alarm clock and
/// processes task events, fired alarms, console input and external-change
/// polls one at a time, so reconciliations never interleave.
pub struct ReminderService {
    store: TaskStore,
    clock: Arc<TimerWheelClock>,
    presenter: Arc<NotificationPresenter>,
    scheduler: ReminderScheduler,
    events_rx: UnboundedReceiver<TaskEvent>,
    fired_rx: UnboundedReceiver<FiredAlarm>,
    ui_rx: UnboundedReceiver<UiEvent>,
    console_tx: UnboundedSender<ConsoleCommand>,
    console_rx: UnboundedReceiver<ConsoleCommand>,
    watcher: Connection,
    last_data_version: i64,
    cursor: ChangeCursor,
    poll: Interval,
}

impl ReminderService {
    /// Must be called from within a tokio runtime.
    pub fn new(
        db: Database,
        settings: NotificationConfig,
        poll_interval: Duration,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, QuickTodoError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store = TaskStore::new(db).with_events(events_tx);
        let watcher = store.database().open_dedicated_connection()?;
        let last_data_version = Database::data_version(&watcher)?;

        let (clock, fired_rx) = TimerWheelClock::channel()?;
        let clock = Arc::new(clock);

        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let presenter = Arc::new(
            NotificationPresenter::new(Arc::new(store.clone()), sink, settings)
                .with_ui_events(ui_tx),
        );
        let scheduler = ReminderScheduler::new(
            Arc::new(store.clone()),
            clock.clone(),
            presenter.clone(),
            &settings,
        );
        let (console_tx, console_rx) = mpsc::unbounded_channel();

        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(ReminderService {
            store,
            clock,
            presenter,
            scheduler,
            events_rx,
            fired_rx,
            ui_rx,
            console_tx,
            console_rx,
            watcher,
            last_data_version,
            cursor: ChangeCursor::default(),
            poll,
        })
    }

    /// Forward stdin lines to the service as console commands.
    pub fn spawn_console_input(&self) {
        let console_tx = self.console_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("console-input".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("Stopped reading console input: {}", e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<ConsoleCommand>() {
                        Ok(command) => {
                            if console_tx.send(command).is_err() {
                                break;
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                debug!("Console input closed");
            });

        if let Err(e) = spawned {
            warn!("Could not start console input thread: {}", e);
        }
    }

    /// Bring every alarm in line with the store. Run once at startup.
    pub fn boot_sync(&mut self) -> ReconcileOutcome {
        let outcome = self.full_sync();
        if outcome.is_clean() {
            info!("Boot sync armed {} alarm(s)", outcome.armed);
        } else {
            warn!(
                "Boot sync armed {} alarm(s) with {} warning(s){}",
                outcome.armed,
                outcome.warnings.len(),
                if outcome.surfaced_unavailable {
                    "; alarms are unavailable"
                } else {
                    ""
                }
            );
        }
        outcome
    }

    /// Reconcile every task and restart change tracking from the current rows.
    fn full_sync(&mut self) -> ReconcileOutcome {
        self.refresh_data_version();
        self.reset_cursor();
        self.scheduler.reconcile_all()
    }

    fn reset_cursor(&mut self) {
        let mut cursor = ChangeCursor {
            since: Utils::now_millis(),
            seen: HashMap::new(),
        };
        match self.store.changed_since(cursor.window_start()) {
            Ok(tasks) => tasks.into_iter().for_each(|task| cursor.record(task)),
            Err(e) => warn!("Could not snapshot recent task changes: {}", e),
        }
        self.cursor = cursor;
    }

    /// Wait for the next piece of work. `None` once every source is closed.
    pub async fn next_message(&mut self) -> Option<ServiceMessage> {
        tokio::select! {
            Some(event) = self.events_rx.recv() => Some(ServiceMessage::Task(event)),
            Some(fired) = self.fired_rx.recv() => Some(ServiceMessage::Fired(fired)),
            Some(command) = self.console_rx.recv() => Some(ServiceMessage::Console(command)),
            Some(event) = self.ui_rx.recv() => Some(ServiceMessage::Ui(event)),
            _ = self.poll.tick() => Some(ServiceMessage::Poll),
        }
    }

    pub fn handle(&mut self, msg: ServiceMessage) {
        match msg {
            ServiceMessage::Task(event) => self.handle_task_event(event),
            ServiceMessage::Fired(fired) => match self.presenter.on_fire(&fired) {
                FireOutcome::Shown(key) => info!("Notified for task {}", key.task_id()),
                FireOutcome::Suppressed(reason) => {
                    info!("Alarm {} suppressed: {}", fired.key, reason)
                }
            },
            ServiceMessage::Console(command) => self.handle_console(command),
            ServiceMessage::Ui(UiEvent::NotificationActivated(task_ref)) => {
                let tasks = TaskScope::from_uri(&task_ref.uri).and_then(|s| self.store.query(s));
                match tasks {
                    Ok(tasks) => match tasks.first() {
                        Some(task) => print_task(task),
                        None => println!("Task {} no longer exists", task_ref.task_id),
                    },
                    Err(e) => warn!("Could not open {}: {}", task_ref.uri, e),
                }
            }
            ServiceMessage::Poll => self.check_external_changes(),
        }
    }

    fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Changed(task_id) => {
                match self.store.get(task_id) {
                    Ok(Some(task)) => self.cursor.record(task),
                    Ok(None) => self.cursor.forget(task_id),
                    Err(e) => warn!("Could not read task {} after change: {}", task_id, e),
                }
                self.scheduler.handle_event(event);
            }
            TaskEvent::Deleted(task_id) => {
                self.cursor.forget(task_id);
                self.scheduler.handle_event(event);
            }
            TaskEvent::BulkReset => {
                self.full_sync();
            }
        }
    }

    fn handle_console(&self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Open(key) => {
                if self.presenter.activate(key).is_none() {
                    println!("No notification is shown for task {}", key.task_id());
                }
            }
            ConsoleCommand::Alarms => {
                let mut keys = self.clock.keys();
                keys.sort();
                for key in keys {
                    let state = match self.clock.state(key) {
                        AlarmState::Armed { fire_at } => Utils::format_local_millis(fire_at),
                        AlarmState::Fired => "fired".to_string(),
                        AlarmState::Unarmed => "unarmed".to_string(),
                    };
                    let shown = self.presenter.shown(key.task_id()).is_some();
                    println!(
                        "{:<16} {:<16} {}",
                        key.to_string(),
                        state,
                        if shown { "shown" } else { "" }
                    );
                }
                println!("{} notification(s) shown", self.presenter.shown_count());
            }
        }
    }

    fn refresh_data_version(&mut self) {
        match Database::data_version(&self.watcher) {
            Ok(version) => self.last_data_version = version,
            Err(e) => warn!("Could not read database data_version: {}", e),
        }
    }

    fn check_external_changes(&mut self) {
        let version = match Database::data_version(&self.watcher) {
            Ok(version) => version,
            Err(e) => {
                warn!("Could not read database data_version: {}", e);
                return;
            }
        };
        if version == self.last_data_version {
            return;
        }
        self.last_data_version = version;

        let changed = match self.store.changed_since(self.cursor.window_start()) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Could not read changed tasks: {}", e);
                return;
            }
        };
        let newest = changed.last().map(|task| task.modified_at);
        for task in changed {
            if self.cursor.is_new(&task) {
                debug!("Task {} changed in another process", task.id);
                self.scheduler.handle_event(TaskEvent::Changed(task.id));
                self.cursor.record(task);
            }
        }
        if let Some(newest) = newest {
            self.cursor.advance(newest);
        }

        match self.store.task_ids() {
            Ok(live) => {
                for task_id in self.scheduler.orphaned_task_ids(&live) {
                    debug!("Task {} deleted in another process", task_id);
                    self.scheduler.handle_event(TaskEvent::Deleted(task_id));
                    self.cursor.forget(task_id);
                }
            }
            Err(e) => warn!("Could not list task ids: {}", e),
        }
    }

    /// Boot sync, then serve until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), QuickTodoError>
    where
        F: Future<Output = ()>,
    {
        self.boot_sync();
        println!(
            "⏰ Reminder service running ({} alarm(s) armed). Press Ctrl+C to stop.",
            self.clock.armed_count()
        );

        tokio::pin!(shutdown);
        loop {
            let msg = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                msg = self.next_message() => msg,
            };

            match msg {
                Some(msg) => self.handle(msg),
                None => {
                    error!("All reminder sources closed, stopping");
                    break;
                }
            }
        }

        self.clock.close();
        println!("   Reminder service stopped");
        Ok(())
    }
}

fn print_task(task: &Task) {
    println!("📋 Task {}: {}", task.id, task.title);
    if task.has_due_date {
        println!("   Due:  {}", Utils::format_local_millis(task.due_at));
    }
    if !task.note.is_empty() {
        println!("   Note: {}", task.note);
    }
    if task.completed {
        println!("   Completed");
    }
}
