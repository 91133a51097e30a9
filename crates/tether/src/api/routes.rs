//! API route definitions.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::AppState;
use super::error::ApiError;
use super::handlers;

/// Header carrying the shared secret between the chat server and the hub.
pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.server.cors_origins);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let secret: Option<Arc<str>> = state
        .config
        .server
        .internal_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(Arc::from);

    let protected_routes = Router::new()
        .route("/invoke", post(handlers::invoke))
        // Agents
        .route("/agents", get(handlers::list_agents))
        .route("/agents/register", post(handlers::register_agent))
        .route("/agents/{name}/connect", post(handlers::connect_agent))
        .route("/agents/{name}/disconnect", post(handlers::disconnect_agent))
        .route("/agents/{name}/heartbeat", post(handlers::heartbeat))
        .route("/agents/{name}/profile", put(handlers::update_profile))
        .route("/agents/{name}/ghost", get(handlers::agent_ghost))
        .route("/agents/{name}/invocable", get(handlers::agent_invocable))
        .route("/ghosts", get(handlers::ghosts))
        // Direct messages
        .route("/direct", post(handlers::direct_message))
        .route("/direct/queue", get(handlers::queue_status))
        .route("/direct/pickup/{agent}", post(handlers::pickup))
        .route("/direct/{id}/respond", post(handlers::respond_direct))
        // Backends
        .route("/backends", get(handlers::backends))
        .route("/backends/opencode/start", post(handlers::start_opencode))
        .route("/backends/opencode/stop", post(handlers::stop_opencode))
        .layer(middleware::from_fn_with_state(secret, require_secret));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Reject requests without the configured `X-Internal-Secret`. No secret, no check.
async fn require_secret(
    State(secret): State<Option<Arc<str>>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = secret.as_deref() {
        let supplied = request
            .headers()
            .get(INTERNAL_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if supplied != Some(expected) {
            return Err(ApiError::unauthorized("missing or invalid internal secret"));
        }
    }
    Ok(next.run(request).await)
}

/// CORS for the configured origins; with none configured, cross-origin requests are denied.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];
    let headers = [
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::HeaderName::from_static(INTERNAL_SECRET_HEADER),
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
    }
}
