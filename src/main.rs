//! # Sensor Correlator - Main Application Entry Point
//!
//! Streaming correlation-analysis service for field audio sensors.
//! Sensors stream PCM chunks over a WebSocket; every chunk is correlated against
//! a fixed reference signal and the result is published to a durable queue.
//!
//! ## Startup order:
//! 1. `.env`, logging, configuration
//! 2. Reference signal (fatal if it cannot be loaded)
//! 3. Durable sink and destination queue (fatal if unavailable)
//! 4. HTTP/WebSocket server, until SIGINT or SIGTERM
//!
//! ## Application Architecture:
//! - **audio**: PCM decoding, WAV encoding, reference loading
//! - **analysis**: Normalization, cross-correlation, per-chunk orchestration
//! - **publish**: Event schema, durable sink, publisher
//! - **session**: Per-connection session loop on a bounded worker pool
//! - **websocket**: Sensor-facing transport (`/ws/sensors`)
//! - **health** / **handlers**: Operational HTTP endpoints

mod analysis;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod publish;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::analysis::orchestrator::Analyzer;
use crate::audio::format::AudioFormat;
use crate::audio::reference::ReferenceSignal;
use crate::config::AppConfig;
use crate::publish::publisher::Publisher;
use crate::publish::sink::{DeliveryMode, JournalSink};
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM has been received.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting sensor-correlator v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let format = AudioFormat::PIPELINE;
    let reference = ReferenceSignal::load(&config.pipeline.reference_path, &format)
        .with_context(|| format!("failed to load reference signal from '{}'", config.pipeline.reference_path))?;

    let sink = JournalSink::open(&config.sink.journal_dir)
        .with_context(|| format!("failed to open sink journal at '{}'", config.sink.journal_dir))?;
    sink.declare_queue(&config.sink.queue_name)
        .with_context(|| format!("failed to declare queue '{}'", config.sink.queue_name))?;

    let delivery_mode = if config.sink.persistent {
        DeliveryMode::Persistent
    } else {
        DeliveryMode::Transient
    };
    let analyzer = Analyzer::new(format, Arc::new(reference));
    let publisher = Publisher::new(Arc::new(sink), config.sink.queue_name.clone(), delivery_mode);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, analyzer, publisher);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The dashboard client runs on another origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/sensors", web::get().to(websocket::sensor_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "sensor_correlator=trace")
/// - If not set, defaults to "sensor_correlator=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_correlator=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the global shutdown flag.
///
/// Open sessions are cancelled when the server stops their connections; each
/// finishes the chunk it is working on.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
