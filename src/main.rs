use collab_session::config::Config;
use collab_session::ws::SessionEngine;
use collab_session::{build_router, db, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use std::panic;

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "collab_session=debug,tower_http=debug,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    if config.auth_required && config.auth_jwt_secret.is_none() {
        warn!("AUTH_REQUIRED is set without AUTH_JWT_SECRET - every websocket upgrade will be rejected");
    }

    // Durable store for write-through, in memory when no database is configured
    let store = db::open_store(config.db_url.as_deref()).await;
    let store_kind = store.kind();

    // Start the session engine
    let policy = config.session_policy();
    info!("Session policy: {:?}", policy);
    let (engine, handle) = SessionEngine::new(policy, store);
    tokio::spawn(engine.run());

    let address = config.server_address();
    let app = build_router(AppState::new(handle, config, store_kind));

    // Start the HTTP/WebSocket server
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }
}
