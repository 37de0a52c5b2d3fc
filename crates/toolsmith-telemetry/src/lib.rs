mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. `RUST_LOG` takes precedence when set.
    pub log_level: Level,
    /// Per-module overrides, e.g. `toolsmith_engine` at DEBUG.
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Keep warn+ events in SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: false,
            log_db_path: home_dir().join("logs.db"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive: {0}")]
    Filter(String),
    #[error("could not swap log filter: {0}")]
    Reload(String),
}

/// Keeps runtime control over the installed subscriber.
pub struct TelemetryGuard {
    filter: reload::Handle<EnvFilter, Registry>,
    log_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Change one module's level while running.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            match levels.iter_mut().find(|(m, _)| m == module) {
                Some(entry) => entry.1 = level,
                None => levels.push((module.to_owned(), level)),
            }
            filter_directives(self.log_level, &levels)
        };
        let filter = EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter(e.to_string()))?;
        self.filter.reload(filter).map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Persisted warn+ events, when SQLite logging is on.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

pub fn filter_directives(level: Level, modules: &[(String, Level)]) -> String {
    let mut out = level.to_string().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
    }
    out
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let text_layer =
        (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr));

    let log_sink = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("toolsmith-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("toolsmith-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        filter,
        log_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        log_sink,
    }
}

/// Parse a level name such as `debug` or `WARN`.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".toolsmith")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let modules = vec![("toolsmith_engine".to_string(), Level::DEBUG), ("reqwest".to_string(), Level::WARN)];
        assert_eq!(filter_directives(Level::INFO, &modules), "info,toolsmith_engine=debug,reqwest=warn");
        assert_eq!(filter_directives(Level::ERROR, &[]), "error");
    }

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn module_level_changes_at_runtime() {
        let guard = init_telemetry(TelemetryConfig::default());
        guard.set_module_level("toolsmith_llm", Level::TRACE).unwrap();
        guard.set_module_level("toolsmith_llm", Level::WARN).unwrap();
        assert_eq!(guard.module_levels(), vec![("toolsmith_llm".to_string(), Level::WARN)]);
        assert!(guard.logs().is_none());
    }
}
