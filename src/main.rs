//! # Voice Avatar RTC - Main Application Entry Point
//!
//! Signaling server and media broker for a real-time voice avatar. A browser posts an
//! SDP offer, gets an answer back, and from then on talks to the avatar over one
//! WebRTC connection: its voice goes out to the speech pipeline workers, synthesized
//! voice and captions come back on the same connection.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The HTTP server, every session and every worker link share one tokio runtime
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **static**: The global shutdown flag
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state, metrics and the session manager
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics
//! - **handlers**: Signaling and configuration endpoints
//! - **rtc**: WebRTC sessions, the track pump and the media track adapter
//! - **broker**: Per-session worker links and the queues between them
//! - **audio**: Frames, resampling, Opus and PCM conversions
//! - **models**: Wire records for workers and the browser
//! - **error**: Custom error types and HTTP error responses

mod audio;
mod broker;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod models;
mod rtc;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the SIGTERM/SIGINT handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state**, including the session manager
/// 4. **Starts the session sweep** that reaps finished sessions
/// 5. **Runs the HTTP server** until a shutdown signal arrives
/// 6. **Shuts down every session** before exiting
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-avatar-rtc v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        max_sessions = config.webrtc.max_sessions,
        ice_servers = config.webrtc.ice_servers.len(),
        "WebRTC settings"
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    let sweep = tokio::spawn(sweep_sessions(
        app_state.clone(),
        Duration::from_secs(config.pipeline.cleanup_interval_secs.max(1)),
    ));

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/statuses", web::get().to(handlers::statuses))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .service(
                        web::scope("/RTCSignalingServer")
                            .route("/offer", web::post().to(handlers::offer))
                            .route("/cleanup", web::get().to(handlers::cleanup))
                            .route("/config.json", web::get().to(handlers::client_config)),
                    ),
            )
            .route("/health", web::get().to(health::health_check))
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

    sweep.abort();
    app_state.sessions.shutdown().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_avatar_rtc=trace")
/// - If not set, defaults to "voice_avatar_rtc=debug,actix_web=info,webrtc=warn"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_avatar_rtc=debug,actix_web=info,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Reap finished sessions every `every` until the task is aborted.
async fn sweep_sessions(state: AppState, every: Duration) {
    let mut ticks = IntervalStream::new(tokio::time::interval(every));
    while ticks.next().await.is_some() {
        let running = state.sessions.cleanup_sessions().await;
        debug!(running = running.len(), "Session sweep");
    }
}

/// Set up signal handlers for graceful shutdown.
///
/// Either SIGTERM or SIGINT sets the global shutdown flag.
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

/// Wait for the shutdown signal to be set, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
