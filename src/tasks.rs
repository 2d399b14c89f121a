use std::collections::HashSet;

use log::{debug, warn};
use rusqlite::{named_params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::database::Database;
use crate::error::QuickTodoError;
use crate::utils::Utils;

/// Due date suggested for tasks created without one (one hour out).
const DEFAULT_DUE_OFFSET_MILLIS: i64 = 3_600_000;

const TASK_COLUMNS: &str =
    "id, title, note, created_at, modified_at, due_at, has_due_date, completed";

// Open tasks first, dated before undated, then by due time
const DEFAULT_ORDER: &str = "completed, has_due_date DESC, due_at";

const URI_PREFIX: &str = "quicktodo://todos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub note: String,
    pub created_at: i64,
    pub modified_at: i64,
    /// Epoch millis; 0 means no due date.
    pub due_at: i64,
    pub has_due_date: bool,
    pub completed: bool,
}

impl Task {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Task {
            id: row.get(0)?,
            title: row.get(1)?,
            note: row.get(2)?,
            created_at: row.get(3)?,
            modified_at: row.get(4)?,
            due_at: row.get(5)?,
            has_due_date: row.get(6)?,
            completed: row.get(7)?,
        })
    }

    /// Whether this task should have a live due alarm.
    pub fn wants_due_alarm(&self) -> bool {
        self.has_due_date && self.due_at > 0 && !self.completed
    }

    /// A due date flag with no usable timestamp.
    pub fn has_invalid_due_date(&self) -> bool {
        self.has_due_date && self.due_at <= 0
    }
}

/// Fields for a new task. `due_at` of `None` means no due date.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub note: String,
    pub due_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueChange {
    Set(i64),
    Clear,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub note: Option<String>,
    pub due: Option<DueChange>,
    pub completed: Option<bool>,
}

/// Change notifications published by the store after each committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Changed(i64),
    Deleted(i64),
    BulkReset,
}

/// Which tasks an operation applies to: one task, or the whole collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskScope {
    Item(i64),
    All,
}

impl TaskScope {
    /// Route a `quicktodo://todos[/{id}]` reference to a scope.
    pub fn from_uri(uri: &str) -> Result<Self, QuickTodoError> {
        let rest = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| QuickTodoError::Error(format!("Unknown URI {}", uri)))?;

        match rest.trim_end_matches('/') {
            "" => Ok(TaskScope::All),
            id if id.starts_with('/') => id[1..]
                .parse::<i64>()
                .map(TaskScope::Item)
                .map_err(|_| QuickTodoError::Error(format!("Unknown URI {}", uri))),
            _ => Err(QuickTodoError::Error(format!("Unknown URI {}", uri))),
        }
    }

    pub fn uri(&self) -> String {
        match self {
            TaskScope::Item(id) => format!("{}/{}", URI_PREFIX, id),
            TaskScope::All => URI_PREFIX.to_string(),
        }
    }
}

/// Read access used by the scheduler and the notification presenter.
pub trait TaskReader: Send + Sync {
    fn get_task(&self, task_id: i64) -> Result<Option<Task>, QuickTodoError>;

    /// All tasks in the default order.
    fn list_tasks(&self) -> Result<Vec<Task>, QuickTodoError>;
}

/// SQLite-backed task store with an optional change hook.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
    events: Option<UnboundedSender<TaskEvent>>,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        TaskStore { db, events: None }
    }

    /// Publish a `TaskEvent` for every committed mutation.
    pub fn with_events(mut self, events: UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn create(&self, new_task: NewTask) -> Result<Task, QuickTodoError> {
        let now = Utils::now_millis();
        let (due_at, has_due_date) = match new_task.due_at {
            Some(due_at) => (due_at, true),
            None => (now + DEFAULT_DUE_OFFSET_MILLIS, false),
        };

        let mut conn = self.db.get_connection()?;
        let task = Database::immediate_transaction(&mut conn, |tx| {
            let sql = format!(
                "INSERT INTO tasks (title, note, created_at, modified_at, due_at, has_due_date, completed)
                VALUES (:title, :note, :now, :now, :due_at, :has_due_date, 0)
                RETURNING {}",
                TASK_COLUMNS
            );
            let task = tx.query_row(
                &sql,
                named_params! {
                    ":title": new_task.title,
                    ":note": new_task.note,
                    ":now": now,
                    ":due_at": due_at,
                    ":has_due_date": has_due_date,
                },
                Task::from_row,
            )?;
            Ok(task)
        })?;
        drop(conn);

        debug!("Created task {} '{}'", task.id, task.title);
        self.publish(TaskEvent::Changed(task.id));
        Ok(task)
    }

    pub fn update(&self, task_id: i64, update: TaskUpdate) -> Result<Task, QuickTodoError> {
        let now = Utils::now_millis();

        let mut conn = self.db.get_connection()?;
        let task = Database::immediate_transaction(&mut conn, |tx| {
            let mut task = Self::get_in(tx, task_id)?.ok_or(QuickTodoError::NotFound(task_id))?;

            if let Some(title) = update.title {
                task.title = title;
            }
            if let Some(note) = update.note {
                task.note = note;
            }
            match update.due {
                Some(DueChange::Set(due_at)) => {
                    task.due_at = due_at;
                    task.has_due_date = true;
                }
                Some(DueChange::Clear) => task.has_due_date = false,
                None => {}
            }
            if let Some(completed) = update.completed {
                task.completed = completed;
            }
            task.modified_at = now;

            tx.execute(
                "UPDATE tasks
                SET title = :title, note = :note, modified_at = :modified_at,
                    due_at = :due_at, has_due_date = :has_due_date, completed = :completed
                WHERE id = :id",
                named_params! {
                    ":title": task.title,
                    ":note": task.note,
                    ":modified_at": task.modified_at,
                    ":due_at": task.due_at,
                    ":has_due_date": task.has_due_date,
                    ":completed": task.completed,
                    ":id": task.id,
                },
            )?;
            Ok(task)
        })?;
        drop(conn);

        self.publish(TaskEvent::Changed(task_id));
        Ok(task)
    }

    pub fn set_completed(&self, task_id: i64, completed: bool) -> Result<Task, QuickTodoError> {
        self.update(
            task_id,
            TaskUpdate {
                completed: Some(completed),
                ..Default::default()
            },
        )
    }

    /// Delete a task. Returns false if no such task existed.
    pub fn delete(&self, task_id: i64) -> Result<bool, QuickTodoError> {
        let conn = self.db.get_connection()?;
        let count = conn.execute("DELETE FROM tasks WHERE id = ?", [task_id])?;
        drop(conn);

        if count > 0 {
            debug!("Deleted task {}", task_id);
            self.publish(TaskEvent::Deleted(task_id));
        }
        Ok(count > 0)
    }

    /// Delete every completed task in one statement. Returns how many were removed.
    pub fn purge_completed(&self) -> Result<usize, QuickTodoError> {
        let conn = self.db.get_connection()?;
        let count = conn.execute("DELETE FROM tasks WHERE completed = 1", [])?;
        drop(conn);

        debug!("Purged {} completed task(s)", count);
        if count > 0 {
            self.notify_bulk_reset();
        }
        Ok(count)
    }

    /// Tell observers the whole collection may have changed (bulk updates, imports).
    pub fn notify_bulk_reset(&self) {
        self.publish(TaskEvent::BulkReset);
    }

    pub fn get(&self, task_id: i64) -> Result<Option<Task>, QuickTodoError> {
        let conn = self.db.get_connection()?;
        Self::get_in(&conn, task_id)
    }

    /// Tasks matching `scope`, in the default order.
    pub fn query(&self, scope: TaskScope) -> Result<Vec<Task>, QuickTodoError> {
        match scope {
            TaskScope::Item(task_id) => Ok(self.get(task_id)?.into_iter().collect()),
            TaskScope::All => {
                let mut tasks = Vec::new();
                self.for_each_task(|task| {
                    tasks.push(task.clone());
                    Ok(())
                })?;
                Ok(tasks)
            }
        }
    }

    pub fn for_each_task<F>(&self, mut func: F) -> Result<(), QuickTodoError>
    where
        F: FnMut(&Task) -> Result<(), QuickTodoError>,
    {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY {}",
            TASK_COLUMNS, DEFAULT_ORDER
        ))?;

        let rows = stmt.query_map([], Task::from_row)?;

        for row in rows {
            let task = row?;
            func(&task)?;
        }

        Ok(())
    }

    /// Tasks modified at or after `since` (epoch millis), oldest change first.
    pub fn changed_since(&self, since: i64) -> Result<Vec<Task>, QuickTodoError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE modified_at >= ? ORDER BY modified_at, id",
            TASK_COLUMNS
        ))?;

        let tasks = stmt
            .query_map([since], Task::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Ids of every task currently in the store.
    pub fn task_ids(&self) -> Result<HashSet<i64>, QuickTodoError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare("SELECT id FROM tasks")?;

        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<i64>, _>>()?;
        Ok(ids)
    }

    fn get_in(conn: &rusqlite::Connection, task_id: i64) -> Result<Option<Task>, QuickTodoError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        conn.query_row(&sql, [task_id], Task::from_row)
            .optional()
            .map_err(QuickTodoError::DatabaseError)
    }

    fn publish(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("Task event {:?} dropped: no scheduler is listening", event);
            }
        }
    }
}

impl TaskReader for TaskStore {
    fn get_task(&self, task_id: i64) -> Result<Option<Task>, QuickTodoError> {
        self.get(task_id)
    }

    fn list_tasks(&self) -> Result<Vec<Task>, QuickTodoError> {
        self.query(TaskScope::All)
    }
}
