//! QCC: single-binary assembly core server.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod error;
mod routes;
mod state;

use state::AppState;

fn resolve_data_dir() -> PathBuf {
    std::env::var("QCC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "config" => {
                let data_dir = args.get(2).map(PathBuf::from).unwrap_or_else(resolve_data_dir);
                let config = qcc_core::QccConfig::from_env(&data_dir)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            "init" => {
                let data_dir = args.get(2).map(PathBuf::from).unwrap_or_else(resolve_data_dir);
                let mut config = qcc_core::QccConfig::load(&data_dir.join("qcc.json"))?;
                config.config_path = data_dir.join("qcc.json");
                config.save()?;
                println!("Wrote {}", config.config_path.display());
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("QCC: assembly orchestration core");
                println!();
                println!("Usage: qcc [command]");
                println!();
                println!("Commands:");
                println!("  (none)                   Start the server");
                println!("  config [data-dir]        Print the effective configuration");
                println!("  init [data-dir]          Write qcc.json with current settings");
                println!("  help                     Show this help message");
                println!();
                println!("Environment: QCC_DATA_DIR, QCC_PORT, QCC_PROVIDERS, QCC_TRAIL_URL, QCC_USER_ID, RUST_LOG");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'qcc help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = qcc_core::QccConfig::from_env(&data_dir)?;
    let port = config.port;

    let assembler = qcc_runtime::Assembler::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Failed to start assembler: {}", e))?;
    let state = Arc::new(AppState::new(config, assembler));

    let app = routes::build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("QCC server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Give every cell and grant back before exiting.
    for id in state.assembler.solution_ids() {
        if let Err(e) = state.assembler.release(id).await {
            warn!("Release of {} on shutdown failed: {}", id, e);
        }
    }
    info!("QCC server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
