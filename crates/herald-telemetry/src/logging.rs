//! WARN+ persistence for dispatch diagnostics.
//!
//! Every stored row carries the correlation fields herald attaches to send
//! failures (`instance_id`, `message_id`, `error_kind`, `batch`) as real
//! columns, so "all auth failures for this instance" is one indexed query.
//! Anything else on the event lands in the `fields` JSON blob.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{named_params, params_from_iter, Connection, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS dispatch_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        instance_id TEXT,
        message_id TEXT,
        error_kind TEXT,
        batch INTEGER,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_dispatch_logs_instance ON dispatch_logs(instance_id, logged_at);
    CREATE INDEX IF NOT EXISTS idx_dispatch_logs_message ON dispatch_logs(message_id);
    CREATE INDEX IF NOT EXISTS idx_dispatch_logs_kind ON dispatch_logs(error_kind);
";

const DEFAULT_LIMIT: u32 = 100;

/// A persisted log row.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub instance_id: Option<String>,
    pub message_id: Option<String>,
    pub error_kind: Option<String>,
    pub batch: Option<u32>,
    pub fields: Option<String>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            logged_at: row.get("logged_at")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            instance_id: row.get("instance_id")?,
            message_id: row.get("message_id")?,
            error_kind: row.get("error_kind")?,
            batch: row.get("batch")?,
            fields: row.get("fields")?,
        })
    }
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Exact level, upper case (`WARN`, `ERROR`).
    pub level: Option<String>,
    /// Target prefix, e.g. `herald_dispatch` matches `herald_dispatch::queue`.
    pub target: Option<String>,
    pub instance_id: Option<String>,
    pub message_id: Option<String>,
    /// Classification from `SendError::error_kind`, e.g. `invalid_recipient`.
    pub error_kind: Option<String>,
    /// Dispatch run batch number.
    pub batch: Option<u32>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        let mut push = |clause: &str, value: SqlValue| {
            clauses.push(clause.to_string());
            args.push(value);
        };

        if let Some(level) = &self.level {
            push("level = ?", SqlValue::Text(level.clone()));
        }
        if let Some(target) = &self.target {
            push("target LIKE ? ESCAPE '\\'", SqlValue::Text(like_prefix(target)));
        }
        if let Some(instance_id) = &self.instance_id {
            push("instance_id = ?", SqlValue::Text(instance_id.clone()));
        }
        if let Some(message_id) = &self.message_id {
            push("message_id = ?", SqlValue::Text(message_id.clone()));
        }
        if let Some(kind) = &self.error_kind {
            push("error_kind = ?", SqlValue::Text(kind.clone()));
        }
        if let Some(batch) = self.batch {
            push("batch = ?", SqlValue::Integer(i64::from(batch)));
        }
        if let Some(since) = self.since {
            push("logged_at >= ?", SqlValue::Text(timestamp(since)));
        }

        let mut sql = String::from("SELECT * FROM dispatch_logs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        args.push(SqlValue::Integer(i64::from(self.limit.unwrap_or(DEFAULT_LIMIT))));
        (sql, args)
    }
}

fn like_prefix(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}%")
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SQLite store behind [`SqliteLogLayer`].
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn store(&self, at: DateTime<Utc>, level: Level, target: &str, captured: Captured) {
        let extra = if captured.extra.is_empty() {
            None
        } else {
            serde_json::to_string(&captured.extra).ok()
        };
        let result = self.conn.lock().execute(
            "INSERT INTO dispatch_logs
                 (logged_at, level, target, message, instance_id, message_id, error_kind, batch, fields)
             VALUES
                 (:logged_at, :level, :target, :message, :instance_id, :message_id, :error_kind, :batch, :fields)",
            named_params! {
                ":logged_at": timestamp(at),
                ":level": level.to_string(),
                ":target": target,
                ":message": captured.message.unwrap_or_default(),
                ":instance_id": captured.instance_id,
                ":message_id": captured.message_id,
                ":error_kind": captured.error_kind,
                ":batch": captured.batch,
                ":fields": extra,
            },
        );
        // Logging from inside the layer would recurse.
        if let Err(e) = result {
            eprintln!("herald-telemetry: dropped log record: {e}");
        }
    }

    pub fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (sql, args) = query.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), LogRecord::from_row)?;
        rows.collect()
    }

    /// Stored failures per `error_kind`, most frequent first.
    pub fn error_kind_counts(
        &self,
        instance_id: Option<&str>,
    ) -> Result<Vec<(String, i64)>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT error_kind, COUNT(*) AS n FROM dispatch_logs
             WHERE error_kind IS NOT NULL AND (?1 IS NULL OR instance_id = ?1)
             GROUP BY error_kind ORDER BY n DESC, error_kind",
        )?;
        let rows = stmt.query_map([instance_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }
}

/// Fields pulled off one event or span.
#[derive(Default)]
struct Captured {
    message: Option<String>,
    instance_id: Option<String>,
    message_id: Option<String>,
    error_kind: Option<String>,
    batch: Option<u32>,
    extra: Map<String, Value>,
}

impl Captured {
    fn put(&mut self, name: &str, value: Value) {
        match name {
            "message" => self.message = Some(plain(value)),
            "instance_id" => self.instance_id = Some(plain(value)),
            "message_id" => self.message_id = Some(plain(value)),
            "error_kind" => self.error_kind = Some(plain(value)),
            "batch" => match value.as_u64().and_then(|b| u32::try_from(b).ok()) {
                Some(batch) => self.batch = Some(batch),
                None => {
                    self.extra.insert(name.to_string(), value);
                }
            },
            _ => {
                self.extra.insert(name.to_string(), value);
            }
        }
    }

    /// Fill correlation ids the event itself didn't carry.
    fn inherit(&mut self, span: &SpanIds) {
        if self.instance_id.is_none() {
            self.instance_id.clone_from(&span.instance_id);
        }
        if self.message_id.is_none() {
            self.message_id.clone_from(&span.message_id);
        }
    }

    fn has_ids(&self) -> bool {
        self.instance_id.is_some() && self.message_id.is_some()
    }
}

fn plain(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for Captured {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field.name(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field.name(), Value::String(value.to_string()));
    }
}

/// Correlation ids stored on a span for events recorded inside it.
struct SpanIds {
    instance_id: Option<String>,
    message_id: Option<String>,
}

/// Layer persisting WARN and ERROR events.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        attrs.record(&mut captured);
        if captured.instance_id.is_none() && captured.message_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIds {
                instance_id: captured.instance_id,
                message_id: captured.message_id,
            });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut captured = Captured::default();
        event.record(&mut captured);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if captured.has_ids() {
                    break;
                }
                if let Some(ids) = span.extensions().get::<SpanIds>() {
                    captured.inherit(ids);
                }
            }
        }

        self.sink
            .store(Utc::now(), *meta.level(), meta.target(), captured);
    }
}
