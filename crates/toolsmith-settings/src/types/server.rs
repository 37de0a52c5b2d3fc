use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound queue length per WebSocket connection.
    pub send_queue_size: usize,
    /// Push progress to connected clients. When off, progress only reaches
    /// in-process subscribers.
    pub push_enabled: bool,
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            send_queue_size: 256,
            push_enabled: true,
            heartbeat_interval_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Database file. Relative paths resolve against `~/.toolsmith`.
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { db_path: "toolsmith.db".into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Keep warn+ events in `logs.db` next to the job database.
    pub persist_warnings: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            persist_warnings: true,
        }
    }
}
