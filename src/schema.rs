pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    note TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,        -- Epoch millis
    modified_at INTEGER NOT NULL,       -- Epoch millis
    due_at INTEGER NOT NULL DEFAULT 0,  -- Epoch millis, 0 = no due date
    has_due_date BOOLEAN NOT NULL DEFAULT 0,
    completed BOOLEAN NOT NULL DEFAULT 0
);

-- Matches the default listing order: open tasks first, dated before undated, then by due time
CREATE INDEX IF NOT EXISTS idx_tasks_default_order ON tasks (completed, has_due_date DESC, due_at);

COMMIT;
"#;
