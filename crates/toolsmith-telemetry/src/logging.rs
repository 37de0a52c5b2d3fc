use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ log line kept in SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub job_id: Option<String>,
    pub step: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring of the event target, e.g. `consultant`.
    pub target: Option<String>,
    pub job_id: Option<String>,
    pub step: Option<String>,
    /// RFC 3339 lower bound.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Rows kept when the sink is opened; older ones are dropped.
pub const MAX_RETAINED_LOGS: i64 = 20_000;

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        Self::with_retention(db_path, MAX_RETAINED_LOGS)
    }

    pub fn with_retention(db_path: &Path, keep: i64) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 job_id TEXT,
                 step TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_job_step ON logs(job_id, step);",
        )?;
        conn.execute(
            "DELETE FROM logs WHERE id <= (SELECT MAX(id) FROM logs) - ?1",
            [keep.max(0)],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn insert(&self, record: &LogInsert) {
        let result = self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, job_id, step)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.job_id,
                record.step,
            ],
        );
        if let Err(e) = result {
            // Logging from inside the layer would recurse.
            eprintln!("toolsmith-telemetry: dropped log record: {e}");
        }
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let filters = [
            ("level = ?", q.level.clone()),
            ("target LIKE ?", q.target.as_ref().map(|t| format!("%{t}%"))),
            ("job_id = ?", q.job_id.clone()),
            ("step = ?", q.step.clone()),
            ("timestamp >= ?", q.since.clone()),
        ];
        let (clauses, values): (Vec<&str>, Vec<String>) =
            filters.into_iter().filter_map(|(clause, value)| value.map(|v| (clause, v))).unzip();

        let mut sql = String::from("SELECT id, timestamp, level, target, message, fields, job_id, step FROM logs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                job_id: row.get(6)?,
                step: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn.lock().query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    job_id: Option<String>,
    step: Option<String>,
}

/// Layer persisting warn+ events, tagged with the job and step of the enclosing span.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    job_id: Option<String>,
    step: Option<String>,
}

impl FieldVisitor {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "job_id" => self.job_id = Some(value),
            "step" => self.step = Some(value),
            other => {
                self.fields.insert(other.to_owned(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = match field.name() {
            "message" => rendered,
            _ => rendered.trim_matches('"').to_owned(),
        };
        self.set(field.name(), rendered);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_owned());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_owned(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_owned(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_owned(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_owned(), value.into());
    }
}

/// Job and step recorded on a span, inherited by events inside it.
struct SpanFields {
    job_id: Option<String>,
    step: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.job_id.is_none() || visitor.step.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.job_id.is_none() {
                            visitor.job_id.clone_from(&fields.job_id);
                        }
                        if visitor.step.is_none() {
                            visitor.step.clone_from(&fields.step);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_owned(),
            message: visitor.message.unwrap_or_default(),
            fields,
            job_id: visitor.job_id,
            step: visitor.step,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.job_id.is_some() || visitor.step.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    job_id: visitor.job_id,
                    step: visitor.step,
                });
            }
        }
    }
}
