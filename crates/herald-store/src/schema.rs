/// SQL DDL for the herald-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    phone_number TEXT NOT NULL,
    display_name TEXT NOT NULL,
    connection_state TEXT NOT NULL DEFAULT 'uninitialized',
    qr_code TEXT,
    last_connected_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL REFERENCES instances(id),
    recipient TEXT NOT NULL,
    content TEXT NOT NULL,
    media TEXT,
    scheduled_for TEXT,
    status TEXT NOT NULL,
    error_message TEXT,
    kind TEXT NOT NULL DEFAULT 'regular',
    transport_message_id TEXT,
    sent_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_status_scheduled ON messages(status, scheduled_for);
CREATE INDEX IF NOT EXISTS idx_messages_transport_id ON messages(transport_message_id);
CREATE INDEX IF NOT EXISTS idx_messages_instance ON messages(instance_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
