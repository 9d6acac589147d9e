//! # SenseVoice Server - Main Application Entry Point
//!
//! Local speech-recognition service. It sets up an Actix-web HTTP server that
//! loads the SenseVoice model in the background and serves transcriptions.
//!
//! ## Subcommands:
//! - **serve** (default): HTTP service with lazy, single-flight model warm-up
//! - **prepare**: resolve and fetch the model once, record the winning
//!   `{source, modelId, device}` in the state file, and exit
//!
//! ## Application Architecture:
//! - **config**: configuration (config.toml, APP_* and SENSEVOICE_* variables)
//! - **cli**: command-line flags layered on top of the configuration
//! - **device**: "auto" device preference resolution
//! - **transcription**: model resolution, warm-up and the request path
//! - **state**: shared application state and metrics
//! - **health**: health probe (also the warm-up trigger) and metrics endpoints
//! - **middleware**: request logging and metrics collection
//! - **handlers**: the transcription and configuration endpoints
//! - **error**: HTTP error responses

mod cli;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use config::AppConfig;
use device::DeviceSelector;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::model::RecognizerHandle;
use transcription::warmup::LoadFn;
use transcription::{
    ProcessBackend, RegistryResolver, ResolveError, StateSnapshotStore, TranscriptionService, WarmupCoordinator,
};

/// Set by the signal handlers; polled by the serve loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;

    match cli.command() {
        Command::Serve(args) => {
            args.apply(&mut config);
            config.validate()?;
            serve(config).await
        }
        Command::Prepare(args) => {
            args.apply(&mut config);
            config.validate()?;
            prepare(config).await
        }
    }
}

/// Run the HTTP service until SIGINT/SIGTERM.
async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting sensevoice-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model_id = %config.model.model_id,
        hubs = %config.model.hubs,
        device = %config.model.device,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let warmup = Arc::new(WarmupCoordinator::new(build_loader(&config)?));
    let transcriber = Arc::new(TranscriptionService::new(warmup, config.inference_options()));
    let app_state = AppState::new(config.clone(), transcriber);

    if config.server.eager_warmup {
        info!("Eager warm-up enabled, loading model in the background");
        app_state.warmup.ensure_loading();
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/asr", web::post().to(handlers::transcribe_audio))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
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

/// Resolve the model once and record the winner. Exits non-zero when every
/// hub failed, after logging each hub's reason.
async fn prepare(config: AppConfig) -> Result<()> {
    info!(
        model_id = %config.model.model_id,
        hubs = %config.model.hubs,
        device = %config.model.device,
        state_path = %config.model.state_path.display(),
        "Preparing model"
    );

    let backend = process_backend(&config)?;
    let outcome = tokio::task::spawn_blocking(move || {
        let device = DeviceSelector::new(Box::new(backend.clone())).resolve(&config.model.device);
        let resolver = RegistryResolver::new(Arc::new(backend), config.construction_options())
            .with_snapshot_store(StateSnapshotStore::new(config.model.state_path.clone()));
        resolver.resolve(&config.model.model_id, &config.hub_list(), &device)
    })
    .await
    .context("prepare task failed")?;

    match outcome {
        Ok(resolved) => {
            info!(
                source = %resolved.source,
                model_id = %resolved.model_id,
                device = %resolved.device,
                "Model prepared"
            );
            Ok(())
        }
        Err(err) => {
            if let ResolveError::AllSourcesExhausted { attempts } = &err {
                for attempt in attempts {
                    error!(hub = %attempt.source, "Hub failed: {}", attempt.error);
                }
            }
            Err(err.into())
        }
    }
}

/// The worker backend, with the hub caches rooted at `model.model_dir`.
fn process_backend(config: &AppConfig) -> Result<ProcessBackend> {
    ProcessBackend::new(config.backend.command.clone(), config.backend.args.clone())
        .with_cache_root(&config.model.model_dir)
        .with_context(|| format!("failed to prepare cache root {}", config.model.model_dir.display()))
}

/// The warm-up body for serve mode: resolve the device, then walk the hubs
/// and keep the first recognizer that loads. Serve mode does not write the
/// state file.
fn build_loader(config: &AppConfig) -> Result<Arc<LoadFn>> {
    let backend = process_backend(config)?;
    let selector = DeviceSelector::new(Box::new(backend.clone()));
    let resolver = RegistryResolver::new(Arc::new(backend), config.construction_options());
    let model_id = config.model.model_id.clone();
    let hubs = config.hub_list();
    let device_preference = config.model.device.clone();

    Ok(Arc::new(move || -> Result<RecognizerHandle> {
        let device = selector.resolve(&device_preference);
        let (resolved, recognizer) = resolver.acquire(&model_id, &hubs, &device)?;
        info!(
            source = %resolved.source,
            model_id = %resolved.model_id,
            device = %resolved.device,
            "Recognizer ready"
        );
        Ok(recognizer)
    }))
}

/// Initialize tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensevoice_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize tracing")?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
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
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
