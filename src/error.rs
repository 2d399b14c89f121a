use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuickTodoError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into QuickTodoError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Task {0} not found")]
    NotFound(i64),

    #[error("Alarm clock unavailable: {0}")]
    AlarmClockUnavailable(String),

    #[error("Task {task_id} is in an invalid state: {reason}")]
    InvalidTaskState { task_id: i64, reason: String },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl QuickTodoError {
    /// Errors that a reconciliation recovers from locally rather than
    /// propagating to its caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QuickTodoError::NotFound(_)
                | QuickTodoError::AlarmClockUnavailable(_)
                | QuickTodoError::InvalidTaskState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(QuickTodoError::NotFound(4).is_recoverable());
        assert!(QuickTodoError::AlarmClockUnavailable("closed".into()).is_recoverable());
        assert!(QuickTodoError::InvalidTaskState {
            task_id: 1,
            reason: "zero due date".into()
        }
        .is_recoverable());
        assert!(!QuickTodoError::Error("boom".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(QuickTodoError::NotFound(12).to_string(), "Task 12 not found");
        assert_eq!(
            QuickTodoError::AlarmClockUnavailable("timer wheel closed".into()).to_string(),
            "Alarm clock unavailable: timer wheel closed"
        );
    }
}
