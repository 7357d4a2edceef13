use crate::{
    context::{InboundBody, RelayContext},
    dispatcher::Dispatcher,
    error::HttpError,
    interceptor::TransportMetadata,
    state::AppState,
    util::{self, generate_id},
};
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, TryStreamExt};
use rusty_relay_messages::{AcknowledgeMode, BodyContent, ClientRequest, TargetResponse};
use std::{io, net::SocketAddr, sync::Arc};
use tokio_util::io::ReaderStream;

/// Lets a caller pick the acknowledge mode of a single request.
pub const ACKNOWLEDGE_MODE_HEADER: &str = "x-relay-acknowledge-mode";

pub async fn relay_handler_with_path(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Path((tenant_id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    relay_handler(state, remote_addr, tenant_id, path, request).await
}

pub async fn relay_handler_without_path(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Path(tenant_id): Path<String>,
    request: Request,
) -> Response {
    relay_handler(state, remote_addr, tenant_id, String::new(), request).await
}

pub async fn relay_handler(
    state: Arc<AppState>,
    remote_addr: SocketAddr,
    tenant_id: String,
    path: String,
    request: Request,
) -> Response {
    let request_id = generate_id(20);
    tracing::info!(%request_id, %tenant_id, "🖥 relay request received");

    let (parts, body) = request.into_parts();
    let url = match parts.uri.query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };

    let client_request = ClientRequest {
        request_id,
        origin_id: state.dispatcher.origin_id().to_string(),
        tenant_id,
        method: parts.method.to_string(),
        url,
        headers: util::into_headers(&parts.headers),
        body: None,
        acknowledge_mode: acknowledge_mode(&parts.headers, state.config.acknowledge_mode),
        client_ip: Some(remote_addr.ip().to_string()),
    };
    let body = InboundBody::Streaming {
        length: content_length(&parts.headers),
        stream: body.into_data_stream().map_err(io::Error::other).boxed(),
    };
    let metadata = TransportMetadata {
        remote_addr: Some(remote_addr),
    };

    let mut ctx = RelayContext::new(
        client_request,
        body,
        metadata,
        state.dispatcher.clone(),
        state.pipeline.clone(),
    );
    match ctx.execute().await {
        Ok(response) => into_response(&state.dispatcher, response).await,
        Err(err) => HttpError::from(err).into_response(),
    }
}

fn acknowledge_mode(headers: &HeaderMap, default: AcknowledgeMode) -> AcknowledgeMode {
    headers
        .get(ACKNOWLEDGE_MODE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Removes a stored response body once the caller's response body is dropped,
/// or right away when it cannot be opened.
struct RemoveOnDrop {
    dispatcher: Arc<Dispatcher>,
    id: String,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let dispatcher = self.dispatcher.clone();
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = dispatcher.store().remove_response_stream(&id).await {
                    tracing::warn!(request_id = %id, "failed to remove response body: {err}");
                }
            });
        }
    }
}

async fn into_response(dispatcher: &Arc<Dispatcher>, response: TargetResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = util::into_header_map(&response.headers);

    let body = match response.body {
        None => Body::empty(),
        Some(BodyContent::Inline(bytes)) => {
            headers.remove(header::CONTENT_LENGTH);
            Body::from(bytes)
        }
        Some(BodyContent::Stored { id, .. }) => {
            let guard = RemoveOnDrop {
                dispatcher: dispatcher.clone(),
                id,
            };
            let reader = match dispatcher.store().get_response_stream(&guard.id).await {
                Ok(reader) => reader,
                Err(err) => return HttpError::from(err).into_response(),
            };
            Body::from_stream(ReaderStream::new(reader).map(move |chunk| {
                let _guard = &guard;
                chunk
            }))
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatcher::tests::dispatcher, interceptor::tests::request};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn stored(id: &str, status: u16) -> TargetResponse {
        let mut response = TargetResponse::for_request(&request(id), status);
        response.body = Some(BodyContent::Stored {
            id: id.to_string(),
            length: None,
        });
        response
    }

    async fn removed(dispatcher: &Dispatcher, id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.store().contains_response(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stored_body_is_streamed_then_removed() {
        let dispatcher = dispatcher();
        let mut writer = dispatcher.store().create_response_stream("r1").await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();

        let response = into_response(&dispatcher, stored("r1", 201)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
        removed(&dispatcher, "r1").await;
    }

    #[tokio::test]
    async fn test_unreadable_stored_body_is_removed() {
        let dispatcher = dispatcher();
        // never finished, so it cannot be opened
        let mut writer = dispatcher.store().create_response_stream("r1").await.unwrap();
        writer.write_all(b"hal").await.unwrap();

        let response = into_response(&dispatcher, stored("r1", 200)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        removed(&dispatcher, "r1").await;
    }
}
