use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::JobId;
use crate::steps::PipelineStep;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Initiated,
    Started,
    InProgress,
    LlmCallPending,
    LlmDataReceived,
    Completed,
    Failed,
    Skipped,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::LlmCallPending => "llm_call_pending",
            Self::LlmDataReceived => "llm_data_received",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for ProgressStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| format!("unknown progress status: {s}"))
    }
}

/// Transient notification about a pipeline step. Delivery is best-effort and may
/// duplicate, so consumers reconcile against the stored context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub step: PipelineStep,
    pub status: ProgressStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, step: PipelineStep, status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            job_id,
            step,
            status,
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Envelope sent over push connections.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "step_progress",
            "data": self,
        })
    }

    pub fn log_entry(&self) -> ProgressLogEntry {
        ProgressLogEntry {
            step: self.step,
            status: self.status,
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Audit record of an emitted event, kept on the context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressLogEntry {
    pub step: PipelineStep,
    pub status: ProgressStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
