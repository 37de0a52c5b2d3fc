//! Runs the fixed sequence of construction steps against one job.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use toolsmith_core::{
    AgentName, JobId, JobStatus, PipelineStep, ProgressEvent, ProgressStatus, ToolConstructionContext,
    ToolRequest, UserId,
};
use toolsmith_llm::DEFAULT_MODEL;
use toolsmith_store::JobStateStore;

use crate::control::JobControls;
use crate::error::{AgentInvocationError, PipelineError};
use crate::invoker::AgentInvoker;
use crate::progress::ProgressChannel;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Model used when neither the agent mapping nor the job names one.
    pub default_model: String,
    /// Steps to bypass entirely. Intended for isolated testing of single agents.
    pub skip_steps: HashSet<PipelineStep>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.into(),
            skip_steps: HashSet::new(),
        }
    }
}

/// Parameters for a new construction job.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub user_id: UserId,
    pub request: ToolRequest,
    pub selected_model: Option<String>,
    pub agent_model_mapping: BTreeMap<String, String>,
}

pub struct PipelineOrchestrator {
    invoker: Arc<dyn AgentInvoker>,
    store: Arc<dyn JobStateStore>,
    progress: Arc<dyn ProgressChannel>,
    controls: Arc<JobControls>,
    config: PipelineConfig,
    active_runs: DashMap<JobId, ()>,
}

/// Clears the active-run marker however the run ends.
struct ActiveRun<'a> {
    runs: &'a DashMap<JobId, ()>,
    controls: &'a JobControls,
    job_id: JobId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.job_id);
        self.controls.release(&self.job_id);
    }
}

impl PipelineOrchestrator {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        store: Arc<dyn JobStateStore>,
        progress: Arc<dyn ProgressChannel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            invoker,
            store,
            progress,
            controls: Arc::new(JobControls::new()),
            config,
            active_runs: DashMap::new(),
        }
    }

    pub fn with_controls(mut self, controls: Arc<JobControls>) -> Self {
        self.controls = controls;
        self
    }

    pub fn controls(&self) -> &Arc<JobControls> {
        &self.controls
    }

    pub fn progress(&self) -> &Arc<dyn ProgressChannel> {
        &self.progress
    }

    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.active_runs.contains_key(job_id)
    }

    /// Build, persist and announce the initial context of a job.
    #[instrument(skip(self, job), fields(user_id = %job.user_id))]
    pub async fn create_job(&self, job: NewJob) -> Result<ToolConstructionContext, PipelineError> {
        let mut ctx = ToolConstructionContext::new(JobId::new(), job.user_id, job.request)
            .with_selected_model(job.selected_model)
            .with_agent_models(job.agent_model_mapping);

        let event = ProgressEvent::new(
            ctx.job_id.clone(),
            PipelineStep::Initialization,
            ProgressStatus::Initiated,
            format!("Tool construction job created for '{}'", ctx.request.name),
        );
        ctx.progress_log.push(event.log_entry());

        self.store.save(&ctx).await.map_err(|source| PipelineError::Persistence {
            step: PipelineStep::Initialization,
            source,
        })?;
        self.controls.register(&ctx.job_id);
        self.emit(&ctx.user_id, event).await;

        info!(job_id = %ctx.job_id, tool = %ctx.request.name, "job created");
        Ok(ctx)
    }

    /// Load a stored job and run it from where it stopped.
    pub async fn run_job(&self, job_id: &JobId) -> Result<ToolConstructionContext, PipelineError> {
        let ctx = self.store.load(job_id).await.map_err(|source| PipelineError::Persistence {
            step: PipelineStep::Initialization,
            source,
        })?;
        self.run(ctx).await
    }

    /// Run every remaining step of `ctx`. Only one run per job may be active.
    pub async fn run(&self, ctx: ToolConstructionContext) -> Result<ToolConstructionContext, PipelineError> {
        let job_id = ctx.job_id.clone();
        match self.active_runs.entry(job_id.clone()) {
            Entry::Occupied(_) => return Err(PipelineError::AlreadyRunning(job_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let _active = ActiveRun {
            runs: &self.active_runs,
            controls: &self.controls,
            job_id,
        };

        match resume_point(&ctx) {
            Some(start) => self.run_from(ctx, start).await,
            None => Ok(ctx),
        }
    }

    /// Run the job on the runtime and return immediately.
    pub fn spawn(
        self: &Arc<Self>,
        ctx: ToolConstructionContext,
    ) -> tokio::task::JoinHandle<Result<ToolConstructionContext, PipelineError>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run(ctx).await })
    }

    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id, from = %start))]
    async fn run_from(
        &self,
        mut ctx: ToolConstructionContext,
        start: PipelineStep,
    ) -> Result<ToolConstructionContext, PipelineError> {
        let mut gate = self.controls.gate(&ctx.job_id);
        ctx.status = JobStatus::InProgress;
        ctx.failure = None;

        for step in PipelineStep::ALL.into_iter().filter(|s| *s >= start) {
            if gate.ready().await.is_err() {
                return Err(self.fail(ctx, PipelineError::Cancelled { step }).await);
            }
            if let Err(e) = self.execute_step(&mut ctx, step).await {
                return Err(self.fail(ctx, e).await);
            }
        }

        ctx.status = JobStatus::Completed;
        ctx.touch();
        if let Err(e) = self.persist(&ctx, PipelineStep::FinalizingTool).await {
            return Err(self.fail(ctx, e).await);
        }
        info!(job_id = %ctx.job_id, "pipeline completed");
        Ok(ctx)
    }

    async fn execute_step(&self, ctx: &mut ToolConstructionContext, step: PipelineStep) -> Result<(), PipelineError> {
        ctx.current_step = step;

        if self.config.skip_steps.contains(&step) {
            info!(job_id = %ctx.job_id, step = %step, "step skipped");
            let event = ProgressEvent::new(ctx.job_id.clone(), step, ProgressStatus::Skipped, format!("Skipped {step}"));
            self.record(ctx, event).await;
            return self.persist(ctx, step).await;
        }

        let started = ProgressEvent::new(ctx.job_id.clone(), step, ProgressStatus::Started, step.started_message());
        self.record(ctx, started).await;

        match step.agent() {
            None => validate_request(&ctx.request)?,
            Some(agent) => self.run_agent(ctx, step, agent).await?,
        }

        let mut completed =
            ProgressEvent::new(ctx.job_id.clone(), step, ProgressStatus::Completed, step.completed_message());
        if let Some(details) = step.required_output().and_then(|field| ctx.output_json(field)) {
            completed = completed.with_details(details);
        }
        ctx.progress_log.push(completed.log_entry());
        ctx.touch();
        self.persist(ctx, step).await?;
        self.emit(&ctx.user_id, completed).await;
        Ok(())
    }

    async fn run_agent(
        &self,
        ctx: &mut ToolConstructionContext,
        step: PipelineStep,
        agent: AgentName,
    ) -> Result<(), PipelineError> {
        let field = agent.output_field();
        let model = ctx.model_for(agent, &self.config.default_model);

        let pending = ProgressEvent::new(
            ctx.job_id.clone(),
            step,
            ProgressStatus::LlmCallPending,
            format!("Calling {agent}"),
        )
        .with_details(json!({ "agent": agent, "model": model }));
        self.record(ctx, pending).await;

        let produced = self
            .invoker
            .invoke(&ctx.job_id, agent, ctx, &model)
            .await
            .map_err(|source| PipelineError::AgentInvocation { step, agent, source })?;

        if !produced.has_output(field) {
            return Err(PipelineError::AgentOutputMissing { step, field });
        }
        let contract = |detail: String| PipelineError::AgentInvocation {
            step,
            agent,
            source: AgentInvocationError::Contract { agent, detail },
        };
        if produced.job_id != ctx.job_id {
            return Err(contract(format!("returned a context for job {}", produced.job_id)));
        }
        let dropped = produced.dropped_outputs(ctx);
        if !dropped.is_empty() {
            let names: Vec<&str> = dropped.iter().map(|f| f.as_str()).collect();
            return Err(contract(format!("cleared earlier outputs: {}", names.join(", "))));
        }

        ctx.adopt_output(produced, field);

        if let Some(result) = ctx.validation_result.as_ref().filter(|_| step == PipelineStep::ValidatingCode) {
            if !result.is_valid {
                return Err(PipelineError::ValidationRejected {
                    error_count: result.errors.len(),
                    summary: result.error_summary(),
                });
            }
        }

        let received = ProgressEvent::new(
            ctx.job_id.clone(),
            step,
            ProgressStatus::LlmDataReceived,
            format!("Received {field} from {agent}"),
        );
        self.record(ctx, received).await;
        Ok(())
    }

    /// Mark the job failed, report it, and hand the error back.
    async fn fail(&self, mut ctx: ToolConstructionContext, err: PipelineError) -> PipelineError {
        let step = err.step().unwrap_or(ctx.current_step);
        error!(job_id = %ctx.job_id, step = %step, kind = err.kind(), error = %err, "pipeline failed");

        let mut details = json!({ "error": err.to_string(), "kind": err.kind() });
        if let PipelineError::ValidationRejected { error_count, .. } = &err {
            details["error_count"] = json!(error_count);
        }
        let event = ProgressEvent::new(ctx.job_id.clone(), step, ProgressStatus::Failed, err.to_string())
            .with_details(details);
        ctx.progress_log.push(event.log_entry());
        ctx.mark_failed(step, err.kind(), err.to_string());

        // A store that just failed is not trusted with the failure record.
        if !matches!(err, PipelineError::Persistence { .. }) {
            if let Err(e) = self.store.save(&ctx).await {
                warn!(job_id = %ctx.job_id, error = %e, "could not record job failure");
            }
        }
        self.emit(&ctx.user_id, event).await;
        err
    }

    async fn persist(&self, ctx: &ToolConstructionContext, step: PipelineStep) -> Result<(), PipelineError> {
        self.store
            .save(ctx)
            .await
            .map_err(|source| PipelineError::Persistence { step, source })
    }

    /// Log the event on the context, then deliver it.
    async fn record(&self, ctx: &mut ToolConstructionContext, event: ProgressEvent) {
        ctx.progress_log.push(event.log_entry());
        self.emit(&ctx.user_id, event).await;
    }

    async fn emit(&self, owner: &UserId, event: ProgressEvent) {
        let delivery = AssertUnwindSafe(self.progress.emit(owner, &event)).catch_unwind();
        if delivery.await.is_err() {
            warn!(
                job_id = %event.job_id,
                step = %event.step,
                status = event.status.as_str(),
                "progress delivery panicked"
            );
        }
    }
}

fn validate_request(request: &ToolRequest) -> Result<(), PipelineError> {
    if request.name.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("tool name is empty".into()));
    }
    if request.description.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("tool description is empty".into()));
    }
    if let Some(input) = request.inputs.iter().find(|i| i.name.trim().is_empty()) {
        return Err(PipelineError::InvalidRequest(format!(
            "input of type {} has no name",
            input.param_type
        )));
    }
    Ok(())
}

/// First step a run should execute, or `None` when the job is already done.
fn resume_point(ctx: &ToolConstructionContext) -> Option<PipelineStep> {
    match ctx.status {
        JobStatus::Completed => None,
        JobStatus::Pending => Some(PipelineStep::Initialization),
        JobStatus::Failed => Some(ctx.failure.as_ref().map_or(ctx.current_step, |f| f.step)),
        JobStatus::InProgress => Some(
            PipelineStep::ALL
                .into_iter()
                .find(|s| s.required_output().is_some_and(|f| !ctx.has_output(f)))
                .unwrap_or(PipelineStep::FinalizingTool),
        ),
    }
}
