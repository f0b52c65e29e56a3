//! # Live Voice Agent - Main Application Entry Point
//!
//! A duplex real-time voice client: it streams the microphone to a remote
//! conversational model over a WebSocket and plays the synthesized reply back
//! gaplessly. A small local HTTP server drives and observes the session.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Audio pumps, the transport and the HTTP server share one async runtime
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & Mutex**: The voice session is shared between handlers and audio callbacks
//! - **traits**: Devices and the transport sit behind traits so they can be swapped
//!
//! ## Application Architecture:
//! - **audio**: PCM conversion, capture and playback pipelines, the session state machine
//! - **live**: The remote endpoint's wire protocol and WebSocket transport
//! - **config**: Application configuration (defaults, config file, environment variables)
//! - **state**: Shared application state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Session control and configuration endpoints
//! - **websocket**: Volume and lifecycle events for UI observers
//! - **error**: Error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod audio;       // Voice core (audio/ directory)
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod live;        // Remote endpoint client (live/ directory)
mod middleware;  // Custom middleware (middleware/ directory)
mod state;       // Application state management (state.rs)
mod websocket;   // Event WebSocket (websocket.rs)

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use audio::device::AudioDevices;
use audio::session::{SessionSettings, VoiceSession};
use config::AppConfig;
use live::transport::GeminiLiveTransport;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the voice session** from the configured devices and transport
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**, tearing down any live session first
///
/// ## Error Handling:
/// If any step fails (config loading, device selection, server binding), the
/// function returns an error and the program exits with an error message.
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-voice-agent v{}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = ?config.audio.backend,
        model = %config.live.model,
        voice = %config.live.voice,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );
    if config::LiveConfig::api_key().is_none() {
        warn!("No API key found (GEMINI_API_KEY or API_KEY); connect requests will fail until one is set");
    }

    // Devices and transport are chosen once; the session holds them for its lifetime
    let devices = AudioDevices::from_config(&config.audio)?;
    let transport = GeminiLiveTransport::from_config(&config.live);
    let session = VoiceSession::new(
        SessionSettings::from_config(&config),
        devices.microphone,
        devices.output,
        Arc::new(transport),
    );

    let app_state = AppState::new(config.clone(), session.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::status))
                    .route("/session/connect", web::post().to(handlers::connect))
                    .route("/session/disconnect", web::post().to(handlers::disconnect))
                    .route("/session/interrupt", web::post().to(handlers::interrupt)),
            )
            .route("/ws/events", web::get().to(websocket::session_events))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    // The signal handling below owns shutdown
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = wait_for_shutdown() => {
            if let Err(e) = result {
                error!("Signal handling failed: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Release the microphone and speaker and close the remote connection
    session.disconnect();
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_voice_agent=trace")
/// - If not set, defaults to "live_voice_agent=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_agent=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM.
///
/// ## Rust Concepts:
/// - **tokio::select!**: Waits for whichever signal comes first
/// - **#[cfg(unix)]**: SIGTERM only exists on Unix platforms
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
