#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use fanout::{BatchService, MemoryQueue, MockTextGenerator};
use server::config::{CliArgs, ServerConfig};
use server::service::handler::{AppState, router};
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let service = BatchService::new(
        config.service.clone(),
        Arc::new(MemoryQueue::new(config.queue_capacity)),
        Arc::new(MockTextGenerator::new(
            config.char_delay,
            config.max_word_pause,
        )),
    )?;

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config.server_addr, &config);

    let app = router(AppState {
        service: service.clone(),
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service, providers))
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting batch service on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting batch service on {} with {} workers, window {:?}, max {} requests per job",
            _addr,
            _config.service.num_workers,
            _config.service.batch_window,
            _config.service.max_requests_per_job
        );
    }
}

async fn shutdown_signal(service: BatchService, providers: TelemetryProviders) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // Open streams finish or fail before the listener stops waiting on them.
    service.shutdown().await;

    providers.shutdown();
}
