mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "herald_dispatch" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: herald_home().join("database/herald-logs.db"),
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Keeps the log sink reachable for the life of the process and owns the
/// live stdout filter.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    base_directives: String,
    module_levels: RwLock<Vec<(String, Level)>>,
    filter: FilterHandle,
}

impl TelemetryGuard {
    /// Change the log level for a module at runtime. Later calls for the
    /// same module replace earlier ones.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), reload::Error> {
        let mut levels = self.module_levels.write();
        match levels.iter_mut().find(|(m, _)| m == module) {
            Some(entry) => entry.1 = level,
            None => levels.push((module.to_string(), level)),
        }
        self.filter
            .reload(EnvFilter::new(filter_directives(&self.base_directives, &levels)))
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// `EnvFilter` directives: the base, then one `module=level` per override.
fn filter_directives(base: &str, module_levels: &[(String, Level)]) -> String {
    let mut filter = base.to_string();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Build the subscriber without installing it. `env_directives` is the
/// `RUST_LOG` value, which replaces the configured levels when present.
fn build(
    config: &TelemetryConfig,
    env_directives: Option<String>,
) -> (impl Subscriber + Send + Sync + 'static, TelemetryGuard) {
    let (base_directives, module_levels) = match env_directives {
        Some(env) => (env, Vec::new()),
        None => (
            config.log_level.to_string().to_lowercase(),
            config.module_levels.clone(),
        ),
    };
    let (env_filter, filter) = reload::Layer::new(EnvFilter::new(filter_directives(
        &base_directives,
        &module_levels,
    )));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                let layer = SqliteLogLayer::new(sink.clone()).with_filter(LevelFilter::WARN);
                (Some(layer), Some(sink))
            }
            Err(e) => {
                eprintln!("herald-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer);

    let guard = TelemetryGuard {
        log_sink: sqlite_sink,
        base_directives,
        module_levels: RwLock::new(module_levels),
        filter,
    };
    (subscriber, guard)
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty());
    let (subscriber, guard) = build(&config, env);
    subscriber.init();
    guard
}

/// Base directory for default paths (`~/.herald`).
pub fn herald_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".herald")
}
