//! # Tutor Voice Relay - Server Entry Point
//!
//! Starts the Actix-web server that relays browser voice sessions to the
//! voice subprocess.
//!
//! ## Routes:
//! - `GET /ws`: the relay WebSocket
//! - `GET /health`, `GET /api/v1/health`: liveness and load
//! - `GET /api/v1/metrics`: per-endpoint and per-connection counters
//! - `GET /api/v1/config`: redacted view of the running configuration

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tutor_voice_relay::config::AppConfig;
use tutor_voice_relay::state::AppState;
use tutor_voice_relay::{handlers, health, middleware, websocket};

/// The main application entry point.
///
/// 1. Loads `.env`, sets up logging, loads and validates configuration
/// 2. Builds the shared state with the identity-provider clients
/// 3. Runs the HTTP server until it fails or a shutdown signal arrives
///
/// Any startup failure is returned and the process exits non-zero.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting tutor-voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        command = %config.voice.command,
        fallback = %config.voice.fallback_command,
        "Voice process: {:?}",
        config.voice.args
    );

    let app_state = AppState::from_config(config.clone())?;
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
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::relay_websocket))
    })
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // Stopping the workers drops every relay actor, which kills its voice process
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default `tutor_voice_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutor_voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
///
/// A signal whose handler cannot be installed is logged and never fires.
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
