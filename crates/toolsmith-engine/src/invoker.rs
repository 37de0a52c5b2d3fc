use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use toolsmith_core::outputs::{
    AssembledComponent, FinalProduct, FunctionSignature, JsxLayout, StateLogic, Styling, ValidationResult,
};
use toolsmith_core::provider::{GenerationRequest, StructuredGenerator};
use toolsmith_core::{AgentName, JobId, PipelineStep, ToolConstructionContext};

use crate::error::AgentInvocationError;
use crate::schemas;

/// Runs one named agent against a context and returns a new context.
/// Implementations must not mutate the context they are given.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        job_id: &JobId,
        agent: AgentName,
        ctx: &ToolConstructionContext,
        model: &str,
    ) -> Result<ToolConstructionContext, AgentInvocationError>;
}

/// Agent invoker backed by a schema-constrained generator.
pub struct LlmAgentInvoker {
    generator: Arc<dyn StructuredGenerator>,
}

impl LlmAgentInvoker {
    pub fn new(generator: Arc<dyn StructuredGenerator>) -> Self {
        Self { generator }
    }
}

#[derive(Deserialize)]
struct SignatureList {
    signatures: Vec<FunctionSignature>,
}

fn decode<T: for<'de> Deserialize<'de>>(agent: AgentName, value: serde_json::Value) -> Result<T, AgentInvocationError> {
    serde_json::from_value(value).map_err(|e| AgentInvocationError::Contract {
        agent,
        detail: e.to_string(),
    })
}

/// Decode the generator's object into the agent's typed output and attach it to a copy of `ctx`.
pub fn apply_output(
    agent: AgentName,
    ctx: &ToolConstructionContext,
    value: serde_json::Value,
) -> Result<ToolConstructionContext, AgentInvocationError> {
    if !value.is_object() {
        return Err(AgentInvocationError::Contract {
            agent,
            detail: format!("expected a JSON object, got {value}"),
        });
    }

    let mut next = ctx.clone();
    match agent {
        AgentName::FunctionPlanner => {
            let list: SignatureList = decode(agent, value)?;
            next.function_signatures = Some(list.signatures);
        }
        AgentName::StateDesigner => next.state_logic = Some(decode::<StateLogic>(agent, value)?),
        AgentName::JsxLayout => next.jsx_layout = Some(decode::<JsxLayout>(agent, value)?),
        AgentName::TailwindStyling => next.styling = Some(decode::<Styling>(agent, value)?),
        AgentName::ComponentAssembler => {
            next.assembled_component = Some(decode::<AssembledComponent>(agent, value)?)
        }
        AgentName::CodeValidator => next.validation_result = Some(decode::<ValidationResult>(agent, value)?),
        AgentName::ToolFinalizer => next.final_product = Some(decode::<FinalProduct>(agent, value)?),
    }
    Ok(next)
}

/// Prompt carrying the request and every output produced so far.
pub fn build_prompt(agent: AgentName, ctx: &ToolConstructionContext) -> String {
    let request = serde_json::to_string_pretty(&ctx.request).unwrap_or_default();
    let mut prompt = format!("Tool request:\n{request}\n");

    for field in PipelineStep::ALL.iter().filter_map(|s| s.required_output()) {
        if let Some(value) = ctx.output_json(field) {
            prompt.push_str(&format!("\n{}:\n{}\n", field, value));
        }
    }

    prompt.push_str(&format!("\nTask: {}", schemas::agent_task(agent)));
    prompt
}

#[async_trait]
impl AgentInvoker for LlmAgentInvoker {
    #[instrument(skip(self, ctx), fields(job_id = %job_id, agent = %agent, model))]
    async fn invoke(
        &self,
        job_id: &JobId,
        agent: AgentName,
        ctx: &ToolConstructionContext,
        model: &str,
    ) -> Result<ToolConstructionContext, AgentInvocationError> {
        let request = GenerationRequest {
            model: model.to_owned(),
            system: schemas::AGENT_SYSTEM_PROMPT.to_owned(),
            prompt: build_prompt(agent, ctx),
            schema_name: agent.output_field().as_str().to_owned(),
            schema: schemas::agent_output_schema(agent),
        };

        let value = self.generator.generate(&request).await?;
        debug!(generator = self.generator.name(), "agent output received");
        apply_output(agent, ctx, value)
    }
}
