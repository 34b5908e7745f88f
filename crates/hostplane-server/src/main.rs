//! Hostplane: tenant instance lifecycle orchestration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use hostplane_core::HostplaneConfig;
use hostplane_runtime::Context;
use hostplane_server::{build_router, worker, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("HOSTPLANE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn print_help() {
    println!("Hostplane: tenant instance lifecycle orchestration");
    println!();
    println!("Usage: hostplane [command]");
    println!();
    println!("Commands:");
    println!("  serve      Start the HTTP server (default)");
    println!("  worker     Run task workers, the scheduler and the event reconciler");
    println!("  help       Show this help message");
    println!();
    println!("Environment:");
    println!("  HOSTPLANE_DATA_DIR      Data directory (default: data)");
    println!("  HOSTPLANE_CLUSTER_MODE  kube | memory");
    println!("  RUST_LOG                Log filter (default: info)");
}

async fn serve(ctx: Arc<Context>) -> anyhow::Result<()> {
    let port = ctx.config.port;
    let state = Arc::new(AppState::new(ctx.clone()));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Hostplane server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    ctx.shutdown()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");
    if matches!(command, "--help" | "-h" | "help") {
        print_help();
        return Ok(());
    }
    if !matches!(command, "serve" | "worker") {
        eprintln!("Unknown command: {}. Use 'hostplane help' for usage.", command);
        std::process::exit(1);
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = HostplaneConfig::load(&data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    let ctx = Context::startup(config)
        .map_err(|e| anyhow::anyhow!("Failed to start runtime: {}", e))?;

    match command {
        "worker" => worker::run(ctx).await,
        _ => serve(ctx).await,
    }
}
