//! Conductor: runtime orchestrator for actions, workers and cluster manifests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_actions::{ActionRuntime, SelfExecLauncher};
use conductor_cluster::{ClusterApi, HttpCluster, MemoryCluster};
use conductor_core::ConductorConfig;
use conductor_runtime::{LoggingTickHook, Orchestrator, Registration, SqliteStateStore};

mod modules;
mod services;

use services::ActionServiceBuilder;

fn resolve_data_dir(arg: Option<&String>) -> PathBuf {
    if let Some(dir) = arg {
        return PathBuf::from(dir);
    }
    std::env::var("CONDUCTOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn init_tracing(to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if to_stderr {
        // stdout carries the worker protocol
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_usage() {
    println!("Conductor: runtime orchestrator");
    println!();
    println!("Usage: conductor [command]");
    println!();
    println!("Commands:");
    println!("  serve [data-dir]              Run the control loop (default)");
    println!("  worker <module>               Host an action module on stdin/stdout");
    println!("  view <dir> [overrides.json]   Show rendered templates with defaults and values");
    println!("  resolve <dir> [overrides.json] Render templates and the values that took effect");
    println!("  help                          Show this help message");
}

fn read_overrides(path: Option<&String>) -> anyhow::Result<Value> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(json!({})),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");

    init_tracing(command == "worker");

    match command {
        "serve" => serve(resolve_data_dir(args.get(2))).await,
        "worker" => {
            let Some(module) = args.get(2).cloned() else {
                eprintln!("Usage: conductor worker <module>");
                std::process::exit(1);
            };
            tokio::task::spawn_blocking(move || {
                conductor_actions::serve_stdio(&modules::catalog(), &module)
            })
            .await??;
            Ok(())
        }
        "view" | "resolve" => {
            let Some(dir) = args.get(2) else {
                eprintln!("Usage: conductor {} <dir> [overrides.json]", command);
                std::process::exit(1);
            };
            let overrides = read_overrides(args.get(3))?;
            let output = if command == "view" {
                let view = conductor_manifest::view(Path::new(dir), &overrides)?;
                json!({"files": view.files, "placeholders": view.placeholders})
            } else {
                let resolution = conductor_manifest::resolve(Path::new(dir), &overrides)?;
                json!({"files": resolution.files, "values": resolution.values})
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}. Use 'conductor help' for usage.", other);
            std::process::exit(1);
        }
    }
}

async fn serve(data_dir: PathBuf) -> anyhow::Result<()> {
    info!("Data directory: {}", data_dir.display());
    let config = ConductorConfig::load(&data_dir)?;

    let state_dir = config
        .data_paths
        .as_ref()
        .map(|p| p.state.clone())
        .unwrap_or_else(|| data_dir.join("state"));
    let store = Arc::new(
        SqliteStateStore::open(&state_dir)
            .map_err(|e| anyhow::anyhow!("Failed to open state store: {}", e))?,
    );

    let cluster: Arc<dyn ClusterApi> = match &config.cluster {
        Some(settings) => Arc::new(HttpCluster::new(&settings.api_url, settings.token.clone())?),
        None => {
            warn!("No cluster configured, reconciling against an in-memory cluster");
            Arc::new(MemoryCluster::new())
        }
    };

    let runtime = Arc::new(
        ActionRuntime::new(Arc::new(SelfExecLauncher), config.call_timeout())
            .with_context(config.worker_context.clone()),
    );

    let orchestrator = Arc::new(
        Orchestrator::new(config, store, cluster).with_hook(Arc::new(LoggingTickHook)),
    );
    orchestrator.register(Registration::new(
        "actions",
        Arc::new(ActionServiceBuilder::new(runtime.clone())),
    ));
    orchestrator.queue().push("actions");

    let control_loop = orchestrator.start();
    info!("Conductor running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    control_loop.abort();
    runtime.shutdown().await;
    Ok(())
}
