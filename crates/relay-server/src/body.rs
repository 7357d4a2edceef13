//! Out-of-band body transfer between the relay and its connectors.

use crate::{error::HttpError, link::Link, state::AppState};
use axum::{
    Json,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use rusty_relay_messages::AcknowledgeRequest;
use serde_json::json;
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;

/// Connectors identify their link with this header on body transfers.
pub const CONNECTION_ID_HEADER: &str = "x-relay-connection-id";

/// Resolves the link named by the connection id header.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Arc<Link>, HttpError> {
    let connection_id = headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| HttpError::Unauthorized("Connection id is missing from header".into()))?;

    match state.dispatcher.registry().get(connection_id).await {
        Some(link) => Ok(link),
        None => Err(HttpError::Unauthorized(format!(
            "Connection id is unknown: {connection_id}"
        ))),
    }
}

/// Streams a staged request body to the connector. Reading it to the end
/// counts as the connector having received the request.
pub async fn request_body_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let link = authorize(&state, &headers).await?;
    let connection_id = link.connection_id();
    let reader = state
        .dispatcher
        .store()
        .get_request_stream(&request_id)
        .await?;
    tracing::debug!(%request_id, %connection_id, "connector pulls request body");

    let dispatcher = state.dispatcher.clone();
    let received = futures_util::stream::once(async move {
        dispatcher.request_body_received(&request_id).await;
    })
    .filter_map(|()| std::future::ready(None::<Result<Bytes, io::Error>>));

    Ok(Body::from_stream(ReaderStream::new(reader).chain(received)).into_response())
}

pub async fn response_body_handler(
    State(state): State<Arc<AppState>>,
    Path((origin_id, request_id)): Path<(String, String)>,
    request: Request,
) -> Result<Response, HttpError> {
    let link = authorize(&state, request.headers()).await?;
    tracing::debug!(%request_id, connection_id = link.connection_id(), "connector uploads response body");

    let body = request
        .into_body()
        .into_data_stream()
        .map_err(io::Error::other)
        .boxed();
    let length = state
        .dispatcher
        .store_response_body(&origin_id, &request_id, body)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "length": length }))).into_response())
}

/// Acknowledges are accepted only for requests of the tenant the calling link serves.
pub async fn acknowledge_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(ack): Json<AcknowledgeRequest>,
) -> Result<StatusCode, HttpError> {
    let link = authorize(&state, &headers).await?;
    state
        .dispatcher
        .handle_acknowledge(link.tenant_id(), ack)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
