#![allow(clippy::collapsible_if)]

use axum::{Router, routing};
use std::sync::Arc;

pub mod acknowledge;
pub mod auth;
pub mod body;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod interceptor;
pub mod link;
pub mod pending;
pub mod proxy;
pub mod router;
pub mod state;
pub mod store;
pub mod tls;
pub mod util;
pub mod websocket;

pub use state::AppState;

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connect", routing::any(websocket::connect_handler))
        .route(
            "/relay/{tenant_id}/{*path}",
            routing::any(proxy::relay_handler_with_path),
        )
        .route(
            "/relay/{tenant_id}",
            routing::any(proxy::relay_handler_without_path),
        )
        .route(
            "/relay/{tenant_id}/",
            routing::any(proxy::relay_handler_without_path),
        )
        .route(
            "/body/{request_id}/request",
            routing::get(body::request_body_handler),
        )
        .route(
            "/body/{origin_id}/{request_id}/response",
            routing::post(body::response_body_handler),
        )
        .route("/acknowledge", routing::post(body::acknowledge_handler))
        .route("/health", routing::get(health::health_handler))
        .with_state(state)
}
