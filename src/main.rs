use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use toolsmith_core::consultation::ConsultationRequest;
use toolsmith_core::{JobId, PipelineStep};
use toolsmith_engine::consultant::HttpProber;
use toolsmith_engine::{
    Consultant, ConsultantConfig, ListenerRegistry, LlmAgentInvoker, PipelineConfig, PipelineOrchestrator,
    ProgressHub,
};
use toolsmith_llm::{ChatClient, ChatClientConfig, ReliableConfig, ReliableGenerator};
use toolsmith_server::{ClientRegistry, HandlerState, ServerConfig};
use toolsmith_settings::{SettingsError, ToolsmithSettings};
use toolsmith_store::{Database, JobRepo};
use toolsmith_telemetry::{TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "toolsmith", version, about = "Build UI tools from natural-language requests")]
struct Cli {
    /// Settings file (defaults to ~/.toolsmith/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket/HTTP server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the stored context of a job.
    Job { job_id: String },
    /// Run one strategy consultation for a tool request read from a JSON file.
    Consult {
        request: PathBuf,
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    let serving = matches!(cli.command, Command::Serve { .. });
    let telemetry = init_telemetry(&settings, serving);

    match cli.command {
        Command::Serve { port } => serve(settings, telemetry, port).await,
        Command::Job { job_id } => print_job(&settings, &job_id),
        Command::Consult { request, model } => consult(&settings, &request, model).await,
    }
}

fn load_settings(path: Option<&Path>) -> Result<Arc<ToolsmithSettings>> {
    let loaded = match path {
        Some(p) => toolsmith_settings::load_settings_from_path(p),
        None => toolsmith_settings::load_settings(),
    };
    let settings = match loaded {
        Ok(s) => s,
        Err(e @ SettingsError::InvalidValue(_)) => return Err(e).context("invalid settings"),
        Err(e) if path.is_some() => return Err(e).context("failed to load settings"),
        Err(e) => {
            eprintln!("toolsmith: {e}; using defaults");
            ToolsmithSettings::default()
        }
    };
    Ok(toolsmith_settings::init_settings(settings))
}

fn init_telemetry(settings: &ToolsmithSettings, persist_warnings: bool) -> TelemetryGuard {
    let level = toolsmith_telemetry::parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO);
    toolsmith_telemetry::init_telemetry(TelemetryConfig {
        log_level: level,
        module_levels: Vec::new(),
        json: settings.logging.json,
        log_to_sqlite: persist_warnings && settings.logging.persist_warnings,
        log_db_path: toolsmith_settings::toolsmith_home().join("logs.db"),
    })
}

fn open_database(settings: &ToolsmithSettings) -> Result<Database> {
    let path = toolsmith_settings::resolve_db_path(settings);
    Database::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

fn llm_client(settings: &ToolsmithSettings) -> Arc<ReliableGenerator<ChatClient>> {
    let api_key = settings.llm.api_key();
    if api_key.is_none() {
        tracing::warn!(env = %settings.llm.api_key_env, "no LLM API key set, requests will be unauthenticated");
    }
    let client = ChatClient::new(ChatClientConfig {
        base_url: settings.llm.base_url.clone(),
        api_key,
        request_timeout: Duration::from_millis(settings.llm.request_timeout_ms),
        research_model: settings.llm.research_model.clone(),
    });
    Arc::new(ReliableGenerator::new(
        client,
        ReliableConfig {
            max_retries: settings.llm.max_retries,
            ..Default::default()
        },
    ))
}

fn build_consultant(settings: &ToolsmithSettings, llm: Arc<ReliableGenerator<ChatClient>>) -> Result<Consultant> {
    let probe = HttpProber::new(Duration::from_millis(settings.consultant.probe_timeout_ms))
        .context("failed to build site probe client")?;
    let checker = HttpProber::new(Duration::from_millis(settings.consultant.verification_timeout_ms))
        .context("failed to build verification client")?;
    Ok(Consultant::new(
        llm.clone(),
        llm,
        Arc::new(probe),
        Arc::new(checker),
        ConsultantConfig {
            max_attempts: settings.consultant.max_attempts,
            default_model: settings.llm.default_model.clone(),
            research_model: Some(settings.llm.research_model.clone()),
        },
    ))
}

fn pipeline_config(settings: &ToolsmithSettings) -> Result<PipelineConfig> {
    let skip_steps = settings
        .pipeline
        .skip_steps
        .iter()
        .map(|s| s.parse::<PipelineStep>())
        .collect::<Result<HashSet<_>, _>>()
        .context("invalid pipeline.skipSteps")?;
    if skip_steps.contains(&PipelineStep::Initialization) {
        bail!("the initialization step cannot be skipped");
    }
    Ok(PipelineConfig {
        default_model: settings
            .pipeline
            .default_model
            .clone()
            .unwrap_or_else(|| settings.llm.default_model.clone()),
        skip_steps,
    })
}

async fn serve(settings: Arc<ToolsmithSettings>, telemetry: TelemetryGuard, port: Option<u16>) -> Result<()> {
    let db = open_database(&settings)?;
    let llm = llm_client(&settings);

    let registry = Arc::new(ClientRegistry::new(settings.server.send_queue_size));
    registry.set_push_enabled(settings.server.push_enabled);
    let progress = ProgressHub::with_push(ListenerRegistry::new(), registry.clone(), registry.clone());

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::new(LlmAgentInvoker::new(llm.clone())),
        Arc::new(JobRepo::new(db.clone())),
        Arc::new(progress),
        pipeline_config(&settings)?,
    ));
    let consultant = Arc::new(build_consultant(&settings, llm)?);

    let state = Arc::new(
        HandlerState::new(db, orchestrator, consultant, registry).with_telemetry(Arc::new(telemetry)),
    );
    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: port.unwrap_or(settings.server.port),
        heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms),
        ..Default::default()
    };

    let handle = toolsmith_server::start(config, state).await.context("failed to start server")?;
    tracing::info!(port = handle.port, push = settings.server.push_enabled, "toolsmith ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

fn print_job(settings: &ToolsmithSettings, job_id: &str) -> Result<()> {
    let repo = JobRepo::new(open_database(settings)?);
    let ctx = repo
        .load_sync(&JobId::from_raw(job_id))
        .with_context(|| format!("failed to load job {job_id}"))?;
    println!("{}", serde_json::to_string_pretty(&ctx)?);
    Ok(())
}

async fn consult(settings: &ToolsmithSettings, request: &Path, model: Option<String>) -> Result<()> {
    let raw = std::fs::read_to_string(request).with_context(|| format!("failed to read {}", request.display()))?;
    let mut input: ConsultationRequest = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(_) => ConsultationRequest {
            request: serde_json::from_str(&raw).context("expected a tool request or consultation request")?,
            ..Default::default()
        },
    };
    if model.is_some() {
        input.model = model;
    }

    let consultant = build_consultant(settings, llm_client(settings))?;
    let outcome = consultant.consult(input).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
