//! Diagnostic CLI: detect backends and run one query from a terminal,
//! printing canonical events as JSON lines. Stands in for the host
//! application during development.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentmux::{
    AgentEvent, BackendRegistry, Config, PermissionMode, PermissionResponse, QueryOutcome,
    QueryRequest,
};

const USAGE: &str = "\
Usage: agentmux-cli <command> [options]

Commands:
  list                          List registered backends
  detect                        Probe which backends are installed
  run <backend-id> <prompt>     Run one query and stream events as JSON lines
      [--cwd DIR]               Working directory (default: current)
      [--model MODEL]           Model override
      [--resume TOKEN]          Resume a prior conversation
      [--auto | --deny]         Permission mode (default: confirm)
      [--approve-all]           Approve every permission request";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentmux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env()?;
    let registry = BackendRegistry::with_defaults(&config);

    match args.first().map(String::as_str) {
        Some("list") => {
            for backend in registry.get_all() {
                let identity = backend.identity();
                println!(
                    "{:10} {} (default model: {})",
                    identity.id, identity.name, identity.default_model
                );
            }
            Ok(())
        }
        Some("detect") => {
            for info in registry.detect_installed().await {
                println!("{}", serde_json::to_string(&info)?);
            }
            Ok(())
        }
        Some("run") => run(&registry, &args[1..]).await,
        _ => {
            eprintln!("{}", USAGE);
            Err(anyhow!("missing or unknown command"))
        }
    }
}

async fn run(registry: &BackendRegistry, args: &[String]) -> Result<()> {
    let backend_id = args
        .first()
        .ok_or_else(|| anyhow!("run: missing backend id\n{}", USAGE))?;
    let prompt = args
        .get(1)
        .ok_or_else(|| anyhow!("run: missing prompt\n{}", USAGE))?;

    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
    let mut request = QueryRequest::new(prompt.clone(), cwd);
    let mut approve_all = false;

    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        match flag.as_str() {
            "--cwd" => {
                request.cwd = rest
                    .next()
                    .ok_or_else(|| anyhow!("--cwd needs a value"))?
                    .clone();
            }
            "--model" => {
                request.model = Some(
                    rest.next()
                        .ok_or_else(|| anyhow!("--model needs a value"))?
                        .clone(),
                );
            }
            "--resume" => {
                request.resume = Some(
                    rest.next()
                        .ok_or_else(|| anyhow!("--resume needs a value"))?
                        .clone(),
                );
            }
            "--auto" => request.permission_mode = PermissionMode::Auto,
            "--deny" => request.permission_mode = PermissionMode::Deny,
            "--approve-all" => approve_all = true,
            other => return Err(anyhow!("unknown flag: {}\n{}", other, USAGE)),
        }
    }

    let backend = registry.require(backend_id)?;
    let mut stream = backend.query(request).await;
    let mut outcome = None;

    while let Some(event) = stream.recv().await {
        println!("{}", serde_json::to_string(&event)?);

        match &event {
            AgentEvent::PermissionRequest { request_id, .. } => {
                backend
                    .respond_to_permission(PermissionResponse {
                        request_id: request_id.clone(),
                        approved: approve_all,
                        approve_all: approve_all.then_some(true),
                    })
                    .await;
            }
            AgentEvent::Result { outcome: o, .. } => outcome = Some(*o),
            AgentEvent::Completion { .. } => outcome = Some(QueryOutcome::Success),
            AgentEvent::Failure { .. } => outcome = Some(QueryOutcome::Error),
            _ => {}
        }
    }

    match outcome {
        Some(QueryOutcome::Success) | Some(QueryOutcome::Cancelled) => Ok(()),
        Some(QueryOutcome::Error) => Err(anyhow!("query ended with an error")),
        None => Err(anyhow!("stream ended without a terminal event")),
    }
}
