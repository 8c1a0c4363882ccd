use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use runloop_core::{
    default_state_dir, ConfigLoader, FilePersistence, MemoryStore, Reaper, RunScheduler,
    RunServices, StartOutcome, Worker, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use runloop_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use runloop_providers::ProviderRegistry;
use runloop_server::{serve, AppState};
use runloop_tools::ToolRegistry;
use runloop_types::{Message, RunStatus, StreamEvent, StreamEventKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const SUPPORTED_PROVIDER_IDS: [&str; 5] = ["ollama", "openai", "openrouter", "groq", "mistral"];

#[derive(Parser, Debug)]
#[command(name = "runloop-engine")]
#[command(about = "Agent run orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// HTTP server plus worker pool and reaper.
    Serve {
        #[arg(long, alias = "hostname", default_value = DEFAULT_ENGINE_HOST)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long, env = "RUNLOOP_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Runs one prompt in-process and streams its events. Ctrl-C stops the run.
    Run {
        prompt: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long, env = "RUNLOOP_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            host,
            port,
            state_dir,
            config,
            concurrency,
            api_key,
            provider,
            model,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider, model, concurrency)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("logging.initialized", "engine.main")
                    .status("ok")
                    .detail("engine jsonl logging initialized"),
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .context("invalid host or port")?;
            log_startup_paths(&state_dir, &addr);
            let loader = config_loader(overrides, config.map(PathBuf::from));
            let services = build_services(&state_dir, loader).await?;
            let worker_id = services
                .config
                .worker
                .worker_id
                .clone()
                .unwrap_or_else(generated_worker_id);
            let scheduler = RunScheduler::new(services, worker_id.clone());
            scheduler.requeue_persisted().await?;

            let shutdown = CancellationToken::new();
            let worker = Worker::new(scheduler.clone());
            let worker_task = tokio::spawn({
                let shutdown = shutdown.clone();
                async move { worker.run(shutdown).await }
            });
            let reaper = Reaper::new(scheduler.clone());
            let reaper_task = tokio::spawn({
                let shutdown = shutdown.clone();
                async move { reaper.run(shutdown).await }
            });
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested");
                        shutdown.cancel();
                    }
                }
            });
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.startup.ready", "engine.main")
                    .worker(&worker_id)
                    .status("ok"),
            );

            let state = AppState::new(scheduler).with_shutdown(shutdown.clone());
            let served = serve(addr, state).await;
            shutdown.cancel();
            // In-flight runs finish before the process exits.
            if let Err(err) = worker_task.await {
                tracing::error!(error = %err, "worker task failed");
            }
            if let Err(err) = reaper_task.await {
                tracing::error!(error = %err, "reaper task failed");
            }
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.stopped", "engine.main").worker(&worker_id),
            );
            served?;
        }
        Command::Run {
            prompt,
            thread,
            state_dir,
            config,
            api_key,
            provider,
            model,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider, model, None)?;
            let state_dir = resolve_state_dir(state_dir);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Cli, &canonical_logs_dir_from_root(&state_dir), 14)?;
            let loader = config_loader(overrides, config.map(PathBuf::from));
            let services = build_services(&state_dir, loader).await?;
            let status = run_prompt(services, thread, &prompt).await?;
            if status == RunStatus::Failed {
                anyhow::bail!("run failed");
            }
        }
    }

    Ok(())
}

async fn run_prompt(
    services: RunServices,
    thread: Option<String>,
    prompt: &str,
) -> anyhow::Result<RunStatus> {
    let scheduler = RunScheduler::new(services.clone(), "cli");
    let thread_id = thread.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));
    services
        .persistence
        .append_message(&Message::user(&thread_id, prompt))
        .await?;
    let submission = scheduler
        .submit_run(&thread_id, "local", &Uuid::new_v4().to_string())
        .await?;
    let request = scheduler
        .claim_next(Duration::from_secs(1))
        .await?
        .context("submitted run was not queued")?;

    let runner = scheduler.clone();
    let run = tokio::spawn(async move { runner.start_claimed(request).await });
    let stopper = scheduler.clone();
    let run_id = submission.run_id.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nstopping run {run_id}...");
            if let Err(err) = stopper.stop_run(&run_id).await {
                tracing::warn!(error = %err, "stop signal not delivered");
            }
        }
    });

    let events = services.events.tail(&submission.run_id, None);
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        print_event(&event?)?;
    }
    ctrl_c.abort();

    match run.await?? {
        StartOutcome::Finished(state) => {
            if let Some(code) = state.error_code.as_deref() {
                eprintln!("run {} ended {} ({code})", state.run_id, state.status);
            }
            Ok(state.status)
        }
        other => anyhow::bail!("run did not start: {other:?}"),
    }
}

fn print_event(event: &StreamEvent) -> anyhow::Result<()> {
    let payload = &event.payload;
    match event.kind {
        StreamEventKind::TextDelta => {
            let mut stdout = std::io::stdout();
            write!(stdout, "{}", payload["delta"].as_str().unwrap_or_default())?;
            stdout.flush()?;
        }
        StreamEventKind::ToolCall => {
            eprintln!("\n[tool] {} {}", payload["tool"].as_str().unwrap_or("?"), payload["arguments"]);
        }
        StreamEventKind::ToolResult => {
            eprintln!(
                "[tool] {} {} in {} ms",
                payload["tool"].as_str().unwrap_or("?"),
                payload["status"].as_str().unwrap_or("?"),
                payload["elapsed_ms"]
            );
        }
        StreamEventKind::Error => {
            eprintln!(
                "\n[error] {}: {}",
                payload["error_code"].as_str().unwrap_or("?"),
                payload["message"].as_str().unwrap_or_default()
            );
        }
        StreamEventKind::Status => {}
        StreamEventKind::Done => println!(),
    }
    Ok(())
}

fn generated_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    concurrency: Option<usize>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() && concurrency.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // Key and model without --provider apply to openai.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    if let Some(concurrency) = concurrency {
        root.insert(
            "worker".to_string(),
            serde_json::json!({ "concurrency": concurrency }),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    match flag {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default_state_dir(),
    }
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting runloop-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

fn config_loader(
    cli_overrides: Option<serde_json::Value>,
    config_path: Option<PathBuf>,
) -> ConfigLoader {
    let loader = ConfigLoader::new().project_path(config_path);
    match cli_overrides {
        Some(overrides) => loader.cli_overrides(overrides),
        None => loader,
    }
}

async fn build_services(state_dir: &Path, loader: ConfigLoader) -> anyhow::Result<RunServices> {
    let config = loader.load().await?;
    let persistence = FilePersistence::new(state_dir).await?;
    let providers = ProviderRegistry::new(config.providers_config());
    info!(
        providers = ?providers.list().await.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
        "providers configured"
    );
    Ok(RunServices::new(
        config,
        Arc::new(MemoryStore::new()),
        ToolRegistry::new(),
        providers,
        Arc::new(persistence),
    ))
}
