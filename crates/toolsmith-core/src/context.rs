use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ProgressLogEntry;
use crate::ids::{JobId, UserId};
use crate::outputs::{
    AssembledComponent, FinalProduct, FunctionSignature, JsxLayout, StateLogic, Styling,
    ValidationResult,
};
use crate::steps::{AgentName, OutputField, PipelineStep};

/// Schema version stamped on every persisted context.
pub const TCC_VERSION: &str = "1.0.0";

/// Natural-language description of the tool to build or consult about.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub inputs: Vec<InputParameter>,
    #[serde(default)]
    pub expected_output: String,
    /// Reference site for the data the tool works with, if the user gave one.
    #[serde(default)]
    pub target_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_param_type() -> String {
    "string".into()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Why a job ended in `failed`, shown to the user on the status surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub step: PipelineStep,
    pub kind: String,
    pub message: String,
}

/// The accumulating state of one tool construction job.
///
/// Agents receive a borrowed view and hand back a fresh copy; the orchestrator
/// only replaces its current context once the copy has been validated and saved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolConstructionContext {
    pub job_id: JobId,
    pub user_id: UserId,
    pub current_step: PipelineStep,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tcc_version: String,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub agent_model_mapping: BTreeMap<String, String>,
    pub request: ToolRequest,

    #[serde(default)]
    pub function_signatures: Option<Vec<FunctionSignature>>,
    #[serde(default)]
    pub state_logic: Option<StateLogic>,
    #[serde(default)]
    pub jsx_layout: Option<JsxLayout>,
    #[serde(default)]
    pub styling: Option<Styling>,
    #[serde(default)]
    pub assembled_component: Option<AssembledComponent>,
    #[serde(default)]
    pub validation_result: Option<ValidationResult>,
    #[serde(default)]
    pub final_product: Option<FinalProduct>,

    #[serde(default)]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub progress_log: Vec<ProgressLogEntry>,
}

impl ToolConstructionContext {
    pub fn new(job_id: JobId, user_id: UserId, request: ToolRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            user_id,
            current_step: PipelineStep::Initialization,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            tcc_version: TCC_VERSION.into(),
            selected_model: None,
            agent_model_mapping: BTreeMap::new(),
            request,
            function_signatures: None,
            state_logic: None,
            jsx_layout: None,
            styling: None,
            assembled_component: None,
            validation_result: None,
            final_product: None,
            failure: None,
            progress_log: Vec::new(),
        }
    }

    pub fn with_selected_model(mut self, model: Option<String>) -> Self {
        self.selected_model = model;
        self
    }

    pub fn with_agent_models(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.agent_model_mapping = mapping;
        self
    }

    /// Per-agent override, then the job's selected model, then `default`.
    pub fn model_for(&self, agent: AgentName, default: &str) -> String {
        [self.agent_model_mapping.get(agent.as_str()), self.selected_model.as_ref()]
            .into_iter()
            .flatten()
            .find(|m| !m.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    /// Advance `updated_at` without ever moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Whether the given output slot holds a non-empty value.
    pub fn has_output(&self, field: OutputField) -> bool {
        match field {
            OutputField::FunctionSignatures => {
                self.function_signatures.as_ref().is_some_and(|s| !s.is_empty())
            }
            OutputField::StateLogic => self
                .state_logic
                .as_ref()
                .is_some_and(|s| !(s.state_variables.is_empty() && s.functions.is_empty())),
            OutputField::JsxLayout => self
                .jsx_layout
                .as_ref()
                .is_some_and(|l| !l.component_structure.trim().is_empty()),
            OutputField::Styling => self
                .styling
                .as_ref()
                .is_some_and(|s| !s.styled_component_code.trim().is_empty()),
            OutputField::AssembledComponent => self
                .assembled_component
                .as_ref()
                .is_some_and(|c| !c.final_component_code.trim().is_empty()),
            OutputField::ValidationResult => self.validation_result.is_some(),
            OutputField::FinalProduct => self
                .final_product
                .as_ref()
                .is_some_and(|p| !p.component_code.trim().is_empty()),
        }
    }

    /// Output slots populated in `previous` that are no longer populated here.
    pub fn dropped_outputs(&self, previous: &Self) -> Vec<OutputField> {
        PipelineStep::ALL
            .iter()
            .filter_map(|s| s.required_output())
            .filter(|f| previous.has_output(*f) && !self.has_output(*f))
            .collect()
    }

    /// JSON snapshot of one output slot, used as progress event details.
    pub fn output_json(&self, field: OutputField) -> Option<serde_json::Value> {
        let value = match field {
            OutputField::FunctionSignatures => serde_json::to_value(&self.function_signatures),
            OutputField::StateLogic => serde_json::to_value(&self.state_logic),
            OutputField::JsxLayout => serde_json::to_value(&self.jsx_layout),
            OutputField::Styling => serde_json::to_value(&self.styling),
            OutputField::AssembledComponent => serde_json::to_value(&self.assembled_component),
            OutputField::ValidationResult => serde_json::to_value(&self.validation_result),
            OutputField::FinalProduct => serde_json::to_value(&self.final_product),
        };
        value.ok().filter(|v| !v.is_null())
    }

    /// Move one output slot from `source` into this context, leaving every other field alone.
    pub fn adopt_output(&mut self, source: Self, field: OutputField) {
        match field {
            OutputField::FunctionSignatures => self.function_signatures = source.function_signatures,
            OutputField::StateLogic => self.state_logic = source.state_logic,
            OutputField::JsxLayout => self.jsx_layout = source.jsx_layout,
            OutputField::Styling => self.styling = source.styling,
            OutputField::AssembledComponent => self.assembled_component = source.assembled_component,
            OutputField::ValidationResult => self.validation_result = source.validation_result,
            OutputField::FinalProduct => self.final_product = source.final_product,
        }
    }

    pub fn mark_failed(&mut self, step: PipelineStep, kind: &str, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.current_step = step;
        self.failure = Some(JobFailure {
            step,
            kind: kind.to_owned(),
            message: message.into(),
        });
        self.touch();
    }
}
