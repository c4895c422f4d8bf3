//! # Therapy Call Backend - Main Application Entry Point
//!
//! An Actix-web server behind a voice-and-text companion app: chat and call
//! turns relayed to a hosted language model, session storage, metered
//! trials, and a WebSocket that runs turn-taking for live calls.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared services and request metrics
//! - **turn**: the sans-IO turn-taking controller
//! - **websocket**: `/ws/call`, one controller per connection
//! - **conversation**: one user/assistant exchange, plus session titling
//! - **inference**: chat-completions client and prompt construction
//! - **session**: per-user conversation history
//! - **trial**: per-client trial quotas
//! - **health / middleware / handlers / error**: the HTTP surface

mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod inference;
mod middleware;
mod session;
mod state;
mod trial;
mod turn;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use inference::CompletionClient;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting therapy-call-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let backend = Arc::new(CompletionClient::new(&config.inference)?);
    info!(model = backend.model(), "Inference client ready");

    let app_state = AppState::new(config.clone(), backend);
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
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .configure(routes)
            .route("/health", web::get().to(health::health_check))
    })
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
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Routes the web client calls directly, at the root.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/chat", web::post().to(handlers::chat))
        .route("/call", web::post().to(handlers::call))
        .route("/chat/rename_session", web::post().to(handlers::rename_chat_session))
        .route("/call/rename_session", web::post().to(handlers::rename_call_session))
        .route("/sessions", web::get().to(handlers::list_sessions))
        .route("/sessions/save", web::post().to(handlers::save_session))
        .route("/sessions/delete", web::post().to(handlers::delete_session))
        .route("/trial_chat_message", web::post().to(handlers::trial_chat_message))
        .route("/trial_call/status", web::get().to(handlers::trial_call_status))
        .route("/trial_call/start", web::post().to(handlers::trial_call_start))
        .route("/ws/call", web::get().to(websocket::call_websocket));
}

/// `RUST_LOG` wins; otherwise `therapy_call_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "therapy_call_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
