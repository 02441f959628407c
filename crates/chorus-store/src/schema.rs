/// SQL DDL for the chorus log.
/// WAL mode so several instances can share one file.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    dedup_key TEXT UNIQUE,
    dedup_token TEXT,
    content TEXT NOT NULL,
    sender_label TEXT,
    committed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Drops all history. `sqlite_sequence` loses the table's entry with it, so
/// numbering restarts at 1.
pub const DROP_MESSAGES: &str = "DROP TABLE IF EXISTS messages;";

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
