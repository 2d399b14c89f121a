use chrono::{Local, LocalResult, NaiveDateTime, TimeZone, Utc};

use crate::error::QuickTodoError;

pub struct Utils {

}

impl Utils {
    pub const DUE_FORMAT: &str = "%Y-%m-%d %H:%M";

    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Parse a local `YYYY-MM-DD HH:MM` string into epoch millis.
    pub fn parse_local_due(s: &str) -> Result<i64, QuickTodoError> {
        let naive = NaiveDateTime::parse_from_str(s.trim(), Self::DUE_FORMAT).map_err(|e| {
            QuickTodoError::Error(format!(
                "Invalid due date '{}' (expected YYYY-MM-DD HH:MM): {}",
                s, e
            ))
        })?;

        match Local.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
            // Ambiguous around a DST fall-back: take the earlier instant
            LocalResult::Ambiguous(earliest, _) => Ok(earliest.timestamp_millis()),
            LocalResult::None => Err(QuickTodoError::Error(format!(
                "Due date '{}' does not exist in the local time zone",
                s
            ))),
        }
    }

    pub fn format_local_millis(millis: i64) -> String {
        match Local.timestamp_millis_opt(millis) {
            LocalResult::Single(dt) => dt.format(Self::DUE_FORMAT).to_string(),
            LocalResult::Ambiguous(dt, _) => dt.format(Self::DUE_FORMAT).to_string(),
            LocalResult::None => format!("@{}", millis),
        }
    }
}
