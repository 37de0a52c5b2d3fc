//! RPC method handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use toolsmith_core::consultation::{ConsultationRequest, ConsultationRound};
use toolsmith_core::{ConnectionId, ConsultationId, JobId, ToolRequest, UserId};
use toolsmith_engine::{Consultant, GateState, NewJob, PipelineOrchestrator};
use toolsmith_store::{ConsultationRepo, Database, JobRepo, StoreError};
use toolsmith_telemetry::{LogQuery, TelemetryGuard};

use crate::client::ClientRegistry;
use crate::rpc::{self, RpcResponse};

const DEFAULT_LIST_LIMIT: u32 = 50;

/// Shared state for every handler.
pub struct HandlerState {
    pub db: Database,
    pub jobs: JobRepo,
    pub consultations: ConsultationRepo,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub consultant: Arc<Consultant>,
    pub registry: Arc<ClientRegistry>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        orchestrator: Arc<PipelineOrchestrator>,
        consultant: Arc<Consultant>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            jobs: JobRepo::new(db.clone()),
            consultations: ConsultationRepo::new(db.clone()),
            db,
            orchestrator,
            consultant,
            registry,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Route one request. `connection` is set for requests arriving over a WebSocket.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    connection: Option<&ConnectionId>,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    match method {
        "connection.identify" => connection_identify(state, connection, params, id),

        "job.create" => job_create(state, connection, params, id).await,
        "job.get" => job_get(state, params, id).await,
        "job.list" => job_list(state, connection, params, id).await,
        "job.progress" => job_progress(state, params, id).await,
        "job.pause" => job_control(state, params, id, GateState::Paused),
        "job.cancel" => job_control(state, params, id, GateState::Cancelled),
        "job.resume" => job_resume(state, params, id).await,

        "consult.run" => consult_run(state, params, id).await,
        "consult.history" => consult_history(state, params, id).await,

        "logs.query" => logs_query(state, params, id),
        "system.ping" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn store_error(id: Option<Value>, err: StoreError) -> RpcResponse {
    if err.is_not_found() {
        RpcResponse::error(id, rpc::NOT_FOUND, err.to_string())
    } else {
        RpcResponse::internal_error(id, err.to_string())
    }
}

/// Run blocking repository work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn connection_user(state: &HandlerState, connection: Option<&ConnectionId>) -> Option<UserId> {
    connection.and_then(|c| state.registry.get(c)).and_then(|c| c.user_id())
}

/// Explicit `user_id` param, else the user the connection identified as.
fn resolve_user(
    state: &HandlerState,
    connection: Option<&ConnectionId>,
    explicit: Option<UserId>,
) -> Result<UserId, String> {
    explicit
        .filter(|u| !u.as_str().trim().is_empty())
        .or_else(|| connection_user(state, connection))
        .ok_or_else(|| "Missing required parameter: user_id".to_string())
}

// ── Connection ──

fn connection_identify(
    state: &Arc<HandlerState>,
    connection: Option<&ConnectionId>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let Some(connection) = connection else {
        return RpcResponse::invalid_params(id, "connection.identify is only available over WebSocket");
    };
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    if !state.registry.identify(connection, user_id.clone()) {
        return RpcResponse::error(id, rpc::NOT_FOUND, format!("unknown connection {connection}"));
    }
    tracing::info!(connection = %connection, user_id = %user_id, "connection identified");
    RpcResponse::success(id, json!({"connection_id": connection, "user_id": user_id}))
}

// ── Jobs ──

#[derive(Deserialize)]
struct CreateJobParams {
    #[serde(default)]
    user_id: Option<UserId>,
    request: ToolRequest,
    #[serde(default)]
    selected_model: Option<String>,
    #[serde(default)]
    agent_model_mapping: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    start: bool,
}

fn default_true() -> bool {
    true
}

async fn job_create(
    state: &Arc<HandlerState>,
    connection: Option<&ConnectionId>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p: CreateJobParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let user_id = match resolve_user(state, connection, p.user_id) {
        Ok(u) => u,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let ctx = match state
        .orchestrator
        .create_job(NewJob {
            user_id,
            request: p.request,
            selected_model: p.selected_model,
            agent_model_mapping: p.agent_model_mapping,
        })
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => return RpcResponse::internal_error(id, e.to_string()),
    };

    let job_id = ctx.job_id.clone();
    let status = ctx.status;
    if p.start {
        drop(state.orchestrator.spawn(ctx));
    }
    RpcResponse::success(id, json!({"job_id": job_id, "status": status, "started": p.start}))
}

async fn job_get(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let job_id = match rpc::require_str(params, "job_id") {
        Ok(j) => JobId::from_raw(j),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let repo = state.jobs.clone();
    let running = state.orchestrator.is_running(&job_id);
    let control = state.orchestrator.controls().state(&job_id);

    match blocking(move || repo.load_sync(&job_id)).await {
        Ok(ctx) => match serde_json::to_value(&ctx) {
            Ok(context) => RpcResponse::success(id, json!({"context": context, "running": running, "control": control})),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => store_error(id, e),
    }
}

async fn job_list(
    state: &Arc<HandlerState>,
    connection: Option<&ConnectionId>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let explicit = rpc::optional_str(params, "user_id").map(UserId::from_raw);
    let user_id = match resolve_user(state, connection, explicit) {
        Ok(u) => u,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_LIST_LIMIT);
    let repo = state.jobs.clone();

    match blocking(move || repo.list_for_user(&user_id, limit)).await {
        Ok(jobs) => RpcResponse::success(id, json!({"jobs": jobs})),
        Err(e) => store_error(id, e),
    }
}

async fn job_progress(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let job_id = match rpc::require_str(params, "job_id") {
        Ok(j) => JobId::from_raw(j),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let repo = state.jobs.clone();
    match blocking(move || repo.progress(&job_id)).await {
        Ok(entries) => RpcResponse::success(id, json!({"progress": entries})),
        Err(e) => store_error(id, e),
    }
}

fn job_control(state: &Arc<HandlerState>, params: &Value, id: Option<Value>, target: GateState) -> RpcResponse {
    let job_id = match rpc::require_str(params, "job_id") {
        Ok(j) => JobId::from_raw(j),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let controls = state.orchestrator.controls();
    let changed = match target {
        GateState::Paused => controls.pause(&job_id),
        GateState::Cancelled => controls.cancel(&job_id),
        GateState::Running => controls.resume(&job_id),
    };
    RpcResponse::success(id, json!({"job_id": job_id, "changed": changed, "control": controls.state(&job_id)}))
}

/// Unpause a running job, or restart a stopped one from where it left off.
async fn job_resume(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let job_id = match rpc::require_str(params, "job_id") {
        Ok(j) => JobId::from_raw(j),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    if state.orchestrator.is_running(&job_id) {
        let changed = state.orchestrator.controls().resume(&job_id);
        return RpcResponse::success(id, json!({"job_id": job_id, "changed": changed, "restarted": false}));
    }

    let repo = state.jobs.clone();
    let lookup = job_id.clone();
    let ctx = match blocking(move || repo.load_sync(&lookup)).await {
        Ok(ctx) => ctx,
        Err(e) => return store_error(id, e),
    };
    if ctx.status == toolsmith_core::JobStatus::Completed {
        return RpcResponse::error(id, rpc::CONFLICT, format!("job {job_id} already completed"));
    }

    drop(state.orchestrator.spawn(ctx));
    RpcResponse::success(id, json!({"job_id": job_id, "changed": true, "restarted": true}))
}

// ── Consultation ──

#[derive(Deserialize)]
struct ConsultParams {
    #[serde(default)]
    consultation_id: Option<ConsultationId>,
    request: ToolRequest,
    #[serde(default)]
    history: Vec<ConsultationRound>,
    #[serde(default)]
    modifications: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Merge stored rounds with client-supplied ones, keyed by round number.
fn merge_history(stored: Vec<ConsultationRound>, supplied: Vec<ConsultationRound>) -> Vec<ConsultationRound> {
    let mut by_round: BTreeMap<u32, ConsultationRound> = stored.into_iter().map(|r| (r.round, r)).collect();
    for round in supplied {
        by_round.entry(round.round).or_insert(round);
    }
    by_round.into_values().collect()
}

async fn consult_run(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let p: ConsultParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let consultation_id = p.consultation_id.unwrap_or_default();

    let repo = state.consultations.clone();
    let lookup = consultation_id.clone();
    let stored = match blocking(move || repo.history(&lookup)).await {
        Ok(rounds) => rounds,
        Err(e) => return store_error(id, e),
    };

    let outcome = state
        .consultant
        .consult(ConsultationRequest {
            request: p.request,
            history: merge_history(stored, p.history),
            modifications: p.modifications,
            model: p.model,
        })
        .await;

    let repo = state.consultations.clone();
    let append_id = consultation_id.clone();
    let rounds = outcome.rounds.clone();
    if let Err(e) = blocking(move || repo.append(&append_id, &rounds)).await {
        tracing::warn!(consultation_id = %consultation_id, error = %e, "failed to store consultation rounds");
    }

    match serde_json::to_value(&outcome) {
        Ok(outcome) => RpcResponse::success(id, json!({"consultation_id": consultation_id, "outcome": outcome})),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

async fn consult_history(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let consultation_id = match rpc::require_str(params, "consultation_id") {
        Ok(c) => ConsultationId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let repo = state.consultations.clone();
    match blocking(move || repo.history(&consultation_id)).await {
        Ok(rounds) => RpcResponse::success(id, json!({"rounds": rounds})),
        Err(e) => store_error(id, e),
    }
}

// ── Logs ──

fn logs_query(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let Some(sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return RpcResponse::success(id, json!({"logs": [], "totalCount": 0, "enabled": false}));
    };

    let query = LogQuery {
        level: rpc::optional_str(params, "level").map(str::to_uppercase),
        target: rpc::optional_str(params, "target").map(str::to_owned),
        job_id: rpc::optional_str(params, "job_id").map(str::to_owned),
        step: rpc::optional_str(params, "step").map(str::to_owned),
        since: rpc::optional_str(params, "since").map(str::to_owned),
        limit: rpc::optional_u32(params, "limit"),
    };
    match sink.query(&query) {
        Ok(records) => RpcResponse::success(
            id,
            json!({"totalCount": records.len(), "logs": records, "enabled": true}),
        ),
        Err(e) => RpcResponse::internal_error(id, format!("Failed to query logs: {e}")),
    }
}

// ── Health ──

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);

    RpcResponse::success(
        id,
        json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "components": {
                "database": if db_ok { "ok" } else { "error" },
                "connections": state.registry.count(),
            },
        }),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use toolsmith_core::consultation::{AnalysisResult, VerificationResult};
    use toolsmith_core::{AgentName, JobStatus, ProviderError, ToolConstructionContext};
    use toolsmith_engine::consultant::HttpProber;
    use toolsmith_engine::{
        AgentInvocationError, AgentInvoker, ConsultantConfig, ListenerRegistry, PipelineConfig, ProgressHub,
    };
    use toolsmith_llm::{MockGenerator, MockResponse};

    /// Every agent call fails with a retryable provider error.
    pub(crate) struct DownInvoker;

    #[async_trait]
    impl AgentInvoker for DownInvoker {
        async fn invoke(
            &self,
            _job_id: &JobId,
            _agent: AgentName,
            _ctx: &ToolConstructionContext,
            _model: &str,
        ) -> Result<ToolConstructionContext, AgentInvocationError> {
            Err(AgentInvocationError::Provider(ProviderError::ProviderOverloaded))
        }
    }

    pub(crate) fn state() -> Arc<HandlerState> {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(ClientRegistry::new(16));
        let hub = ProgressHub::with_push(ListenerRegistry::new(), registry.clone(), registry.clone());
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::new(DownInvoker),
            Arc::new(JobRepo::new(db.clone())),
            Arc::new(hub),
            PipelineConfig::default(),
        ));
        let analysis = MockGenerator::always(MockResponse::Json(json!({
            "recommended_type": "function",
            "strategy_details": "Compute the conversion locally",
        })));
        let prober = Arc::new(HttpProber::new(Duration::from_secs(1)).unwrap());
        let consultant = Arc::new(Consultant::new(
            Arc::new(analysis),
            Arc::new(MockGenerator::always(MockResponse::text("A public API exists."))),
            prober.clone(),
            prober,
            ConsultantConfig::default(),
        ));
        Arc::new(HandlerState::new(db, orchestrator, consultant, registry))
    }

    fn request() -> Value {
        json!({"name": "unit_converter", "description": "Convert between units"})
    }

    async fn call(state: &Arc<HandlerState>, method: &str, params: Value) -> RpcResponse {
        dispatch(state, None, method, &params, Some(json!(1))).await
    }

    #[tokio::test]
    async fn unknown_method() {
        let resp = call(&state(), "job.explode", json!({})).await;
        assert_eq!(resp.error_code(), Some(rpc::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn create_without_start_then_get() {
        let state = state();
        let resp = call(
            &state,
            "job.create",
            json!({"user_id": "user_1", "request": request(), "start": false}),
        )
        .await;
        assert!(resp.success);
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "pending");
        let job_id = result["job_id"].as_str().unwrap().to_string();

        let got = call(&state, "job.get", json!({"job_id": job_id})).await.result.unwrap();
        assert_eq!(got["context"]["request"]["name"], "unit_converter");
        assert_eq!(got["running"], false);

        let list = call(&state, "job.list", json!({"user_id": "user_1"})).await.result.unwrap();
        assert_eq!(list["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn progress_is_pushed_to_owner_connections() {
        let state = state();
        let (_conn, mut rx) = state.registry.register(Some(UserId::from_raw("owner")));
        let (_other, mut other_rx) = state.registry.register(Some(UserId::from_raw("someone_else")));

        call(&state, "job.create", json!({"user_id": "owner", "request": request(), "start": false})).await;

        let pushed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(pushed["type"], "step_progress");
        assert_eq!(pushed["data"]["status"], "initiated");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn create_requires_a_user() {
        let resp = call(&state(), "job.create", json!({"request": request()})).await;
        assert_eq!(resp.error_code(), Some(rpc::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn identified_connection_supplies_user() {
        let state = state();
        let (conn, _rx) = state.registry.register(None);
        let identify = dispatch(&state, Some(&conn), "connection.identify", &json!({"user_id": "user_9"}), None).await;
        assert!(identify.success);

        let resp = dispatch(
            &state,
            Some(&conn),
            "job.create",
            &json!({"request": request(), "start": false}),
            None,
        )
        .await;
        assert!(resp.success);
        let list = dispatch(&state, Some(&conn), "job.list", &json!({}), None).await;
        assert_eq!(list.result.unwrap()["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identify_over_http_is_rejected() {
        let resp = call(&state(), "connection.identify", json!({"user_id": "u"})).await;
        assert_eq!(resp.error_code(), Some(rpc::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let resp = call(&state(), "job.get", json!({"job_id": "job_missing"})).await;
        assert_eq!(resp.error_code(), Some(rpc::NOT_FOUND));
    }

    #[tokio::test]
    async fn started_job_fails_and_records_reason() {
        let state = state();
        let result = call(&state, "job.create", json!({"user_id": "u", "request": request()}))
            .await
            .result
            .unwrap();
        let job_id = JobId::from_raw(result["job_id"].as_str().unwrap());

        let mut ctx = None;
        for _ in 0..100 {
            let loaded = state.jobs.load_sync(&job_id).unwrap();
            if loaded.status == JobStatus::Failed {
                ctx = Some(loaded);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let ctx = ctx.expect("job should fail");
        assert_eq!(ctx.failure.unwrap().kind, "agent_invocation");

        let progress = call(&state, "job.progress", json!({"job_id": job_id})).await.result.unwrap();
        assert!(progress["progress"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn resume_completed_job_conflicts() {
        let state = state();
        let mut ctx = ToolConstructionContext::new(JobId::new(), UserId::from_raw("u"), ToolRequest::default());
        ctx.status = JobStatus::Completed;
        state.jobs.save_sync(&ctx).unwrap();

        let resp = call(&state, "job.resume", json!({"job_id": ctx.job_id})).await;
        assert_eq!(resp.error_code(), Some(rpc::CONFLICT));
    }

    #[tokio::test]
    async fn controls_on_unknown_job_change_nothing() {
        let resp = call(&state(), "job.pause", json!({"job_id": "job_idle"})).await;
        assert_eq!(resp.result.unwrap()["changed"], false);
    }

    #[tokio::test]
    async fn consultation_is_stored_and_extended() {
        let state = state();
        let first = call(&state, "consult.run", json!({"request": request()})).await.result.unwrap();
        let consultation_id = first["consultation_id"].as_str().unwrap().to_string();
        assert_eq!(first["outcome"]["analysis"]["recommended_type"], "function");
        assert_eq!(first["outcome"]["rounds"].as_array().unwrap().len(), 1);

        let second = call(
            &state,
            "consult.run",
            json!({"consultation_id": consultation_id, "request": request(), "modifications": ["Support temperatures"]}),
        )
        .await
        .result
        .unwrap();
        assert_eq!(second["outcome"]["rounds"][0]["round"], 2);

        let history = call(&state, "consult.history", json!({"consultation_id": consultation_id}))
            .await
            .result
            .unwrap();
        assert_eq!(history["rounds"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn merge_prefers_stored_rounds() {
        let round = |n: u32, details: &str| ConsultationRound {
            round: n,
            modifications_requested: vec![],
            analysis: AnalysisResult::error(details),
            verification: VerificationResult::failure(details),
            timestamp: chrono::Utc::now(),
        };
        let merged = merge_history(vec![round(1, "stored")], vec![round(1, "client"), round(2, "client")]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].verification.details, "stored");
        assert_eq!(merged[1].round, 2);
    }

    #[tokio::test]
    async fn logs_disabled_without_telemetry() {
        let resp = call(&state(), "logs.query", json!({})).await;
        assert_eq!(resp.result.unwrap()["enabled"], false);
    }

    #[tokio::test]
    async fn ping_reports_healthy() {
        let resp = call(&state(), "system.ping", json!({})).await;
        assert_eq!(resp.result.unwrap()["status"], "healthy");
    }
}
