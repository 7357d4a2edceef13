use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dispatcher = &state.dispatcher;
    Json(json!({
        "status": "UP",
        "instance_id": dispatcher.origin_id(),
        "links": dispatcher.registry().len().await,
        "pending": dispatcher.pending_calls().await,
    }))
}
