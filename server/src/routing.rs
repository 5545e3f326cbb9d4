//! HTTP routing configuration

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::api;
use crate::websocket::ServerState;

/// Create the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    let mut router = Router::new()
        .route("/ws", get(crate::websocket::handle_websocket))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/threads", post(api::create_thread).get(api::list_threads))
        .route("/threads/:id", get(api::get_thread))
        .route(
            "/threads/:id/messages",
            get(api::list_messages).post(api::post_message),
        )
        .route("/accounts/me/public-key", put(api::put_public_key))
        .route("/accounts/:id/public-key", get(api::get_public_key));

    // Only mount admin endpoint if a token is configured
    if state.config.admin_token.is_some() {
        router = router.route("/admin/stats", get(admin_stats));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build CORS layer from config. Permissive when no origins are configured.
fn build_cors_layer(origins: &Option<String>) -> CorsLayer {
    match origins {
        Some(list) if !list.is_empty() => {
            let parsed: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any)
        }
        _ => CorsLayer::permissive(),
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Only the protocol version and storage kind are disclosed
async fn server_info(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Parley Server",
        "protocol_version": parley_shared::PROTOCOL_VERSION,
        "storage": state.db.name(),
        "credentials_enforced": state.auth.is_enforcing(),
    }))
}

/// Admin stats, protected by bearer token
async fn admin_stats(
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let expected = state
        .config
        .admin_token
        .as_deref()
        .ok_or(StatusCode::NOT_FOUND)?;

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !parley_shared::constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let storage = match state.db.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Storage stats unavailable: {}", e);
            None
        }
    };

    Ok(Json(serde_json::json!({
        "open_sockets": state.socket_count(),
        "identified_connections": state.presence.connection_count(),
        "online_accounts": state.presence.snapshot().len(),
        "max_connections": state.config.max_connections,
        "storage": storage,
    })))
}
