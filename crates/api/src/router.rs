//! Application router and middleware stack.

use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::Options;
use crate::routes;
use crate::state::AppState;

/// Build the full application [`Router`] with all middleware layers.
///
/// Served by the production binary and exercised directly by tests, so both
/// see the same stack.
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.options);

    Router::new()
        .merge(routes::root::router())
        .merge(routes::secrets::router())
        .merge(routes::desired::router())
        .merge(routes::actual::router())
        .merge(routes::diff::router())
        .merge(routes::sync::router())
        .merge(routes::health::router())
        // Structured request/response tracing.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // CORS for the single configured management origin.
        .layer(cors)
        .with_state(state)
}

/// CORS: exactly one allowed origin, credentials on, preflight cached for
/// sixty seconds.
///
/// Panics at startup when the configured origin is invalid -- we want
/// misconfiguration to fail fast.
fn build_cors_layer(options: &Options) -> CorsLayer {
    let origin: HeaderValue = options
        .allowed_origin
        .parse()
        .unwrap_or_else(|e| panic!("Invalid allowed_origin '{}': {e}", options.allowed_origin));

    CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(60))
}
