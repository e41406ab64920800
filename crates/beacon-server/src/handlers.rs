//! HTTP/WebSocket wiring for the Beacon server.
//!
//! Builds the shared application state, mounts the WebSocket endpoint, and
//! spawns the background sweeps that keep rate buckets and typing marks
//! bounded.

use crate::auth;
use crate::config::Config;
use crate::metrics;
use crate::session;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use beacon_core::{
    AuthValidator, MessageRouter, PresenceBroadcaster, RateLimiter, RateLimiterConfig, Registry,
    RouterConfig, TypingRelay,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared server state.
pub struct AppState {
    /// The connection registry.
    pub registry: Arc<Registry>,
    /// Per-sender rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Point-to-point message router.
    pub router: MessageRouter,
    /// Presence fan-out.
    pub presence: PresenceBroadcaster,
    /// Typing indicator relay.
    pub typing: Arc<TypingRelay>,
    /// Injected credential validator.
    pub validator: Arc<dyn AuthValidator>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new());
        let limiter = Arc::new(RateLimiter::with_config(RateLimiterConfig {
            capacity: config.rate.capacity,
            window: config.rate_window(),
        }));
        let router = MessageRouter::with_config(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            RouterConfig {
                max_content_bytes: config.limits.max_message_size,
            },
        );
        let presence = PresenceBroadcaster::new(Arc::clone(&registry));
        let typing = Arc::new(TypingRelay::with_window(
            Arc::clone(&registry),
            config.typing_coalesce_window(),
        ));
        let validator = auth::build_validator(&config.auth);

        Self {
            registry,
            limiter,
            router,
            presence,
            typing,
            validator,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Background sweeps bound memory under sender/typist churn
    tokio::spawn(Arc::clone(&state.limiter).run_sweeper(config.rate_window()));
    tokio::spawn(
        Arc::clone(&state.typing).run_sweeper(config.typing_idle(), config.typing_idle()),
    );

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "users_online": stats.user_count,
        "connections": stats.connection_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run(socket, state))
}
