mod config;
mod error;
mod handlers;
mod state;

use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{load_core_config, ServerSection};
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "stowage-server", version, about = "content-addressed file storage over a ledger")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8686")]
    listen: String,

    /// Path to a JSON core configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format: "json" or "pretty"
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Seconds to wait for in-flight writers on shutdown
    #[arg(long, default_value_t = 30)]
    drain_timeout_seconds: u64,
}

fn main() {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to build tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(async_main(cli));
}

async fn async_main(cli: Cli) {
    // Read the shared service token from the environment
    let token = std::env::var("STOWAGE_TOKEN").unwrap_or_default();
    if token.is_empty() {
        eprintln!("Error: STOWAGE_TOKEN environment variable must be set");
        std::process::exit(1);
    }

    // Initialize tracing
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().init();
        }
        _ => {
            tracing_subscriber::fmt().init();
        }
    }

    let mut core_config = load_core_config(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    // The ledger credential comes from the environment, never the file.
    if let Ok(key) = std::env::var("STOWAGE_LEDGER_KEY") {
        if !key.is_empty() {
            core_config.ledger.private_key = Some(key);
        }
    }
    let max_body = (core_config.limits.max_file_size.saturating_mul(2)) as usize;

    let service = stowage_core::Stowage::new(core_config).await.unwrap_or_else(|e| {
        eprintln!("Error: failed to start stowage: {e}");
        std::process::exit(1);
    });

    let config = ServerSection {
        listen: cli.listen,
        token,
        log_format: cli.log_format,
        drain_timeout_secs: cli.drain_timeout_seconds,
    };
    let listen_addr = config.listen.clone();
    let drain_timeout = Duration::from_secs(config.drain_timeout_secs);

    let state = AppState::new(config, service.clone());
    let app = handlers::router(state, max_body);

    info!("stowage-server listening on {listen_addr}");
    let listener = TcpListener::bind(&listen_addr).await.unwrap_or_else(|e| {
        eprintln!("Error: cannot bind to {listen_addr}: {e}");
        std::process::exit(1);
    });

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        eprintln!("Error: server failed: {e}");
    }

    service.shutdown(drain_timeout).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
