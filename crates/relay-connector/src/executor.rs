use anyhow::Context;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{
    Body, Client, Method, Response,
    header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue},
};
use rusty_relay_messages::{
    AcknowledgeMode, AcknowledgeRequest, BodyContent, ClientRequest, Headers, RelayMessage,
    TargetResponse, unix_millis,
};
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::error::Error;

/// Header naming the link on out-of-band body transfers.
pub const CONNECTION_ID_HEADER: &str = "x-relay-connection-id";

/// Executes relayed requests against the private target.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    target: String,
    relay_url: String,
    http_client: Client,
    inline_body_limit: u64,
}

impl RequestExecutor {
    pub fn new(target: &str, relay_url: &str, http_client: Client, inline_body_limit: u64) -> Self {
        Self {
            target: target.trim_end_matches('/').to_string(),
            relay_url: relay_url.trim_end_matches('/').to_string(),
            http_client,
            inline_body_limit,
        }
    }

    /// Runs `request` and hands the acknowledges its mode asks for and the
    /// response to `outbound`. Failures to reach the target answer with 502.
    pub async fn execute(
        &self,
        request: ClientRequest,
        connection_id: &str,
        outbound: mpsc::Sender<RelayMessage>,
    ) {
        let started = unix_millis();
        let request_id = request.request_id.clone();

        let (response, upload) = match self.call_target(&request, connection_id, &outbound).await
        {
            Ok(response) => self.into_target_response(&request, response).await,
            Err(err) => {
                tracing::warn!(%request_id, "⚠️ request to target failed: {err:#}");
                let mut response = TargetResponse::for_request(&request, 502);
                response.headers.insert("content-type", "text/plain");
                response.body = Some(BodyContent::Inline(err.to_string().into_bytes()));
                (response, None)
            }
        };

        tracing::info!(
            %request_id,
            method = %request.method,
            url = %request.url,
            status = response.status_code,
            "➡️ relayed request to target"
        );

        if request.acknowledge_mode == AcknowledgeMode::ConnectorFinished {
            let ack = acknowledge(&request, connection_id);
            if outbound.send(ack).await.is_err() {
                return;
            }
        }

        let message = RelayMessage::Response(TargetResponse {
            request_started: started,
            request_finished: unix_millis(),
            ..response
        });
        let sent = match upload {
            None => outbound.send(message).await.is_ok(),
            Some(body) => {
                let (sent, uploaded) = tokio::join!(
                    outbound.send(message),
                    self.push_response_body(&request, connection_id, body)
                );
                if let Err(err) = uploaded {
                    tracing::error!(%request_id, "❌ failed to upload response body: {err:#}");
                }
                sent.is_ok()
            }
        };
        if !sent {
            tracing::debug!(%request_id, "link went away before the response was sent");
        }
    }

    async fn call_target(
        &self,
        request: &ClientRequest,
        connection_id: &str,
        outbound: &mpsc::Sender<RelayMessage>,
    ) -> anyhow::Result<Response> {
        let method = Method::from_str(&request.method).map_err(Error::from)?;
        let url = format!("{}{}", self.target, request.url);
        let headers = into_header_map(&request.headers)?;

        let body = match &request.body {
            None => Body::from(Vec::new()),
            Some(BodyContent::Inline(bytes)) => Body::from(bytes.clone()),
            Some(BodyContent::Stored { id, .. }) => {
                self.pull_request_body(request, id, connection_id, outbound)
                    .await?
            }
        };

        self.http_client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("request ({}) to {url} failed", request.method))
    }

    /// Streams a staged request body from the relay. With
    /// [`AcknowledgeMode::ConnectorReceived`] the acknowledge goes out once the
    /// last byte came in.
    async fn pull_request_body(
        &self,
        request: &ClientRequest,
        id: &str,
        connection_id: &str,
        outbound: &mpsc::Sender<RelayMessage>,
    ) -> anyhow::Result<Body> {
        let url = format!("{}/body/{id}/request", self.relay_url);
        let response = self
            .http_client
            .get(&url)
            .header(CONNECTION_ID_HEADER, connection_id)
            .send()
            .await
            .and_then(Response::error_for_status)
            .with_context(|| format!("failed to pull request body from {url}"))?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        if request.acknowledge_mode != AcknowledgeMode::ConnectorReceived {
            return Ok(Body::wrap_stream(stream));
        }

        let ack = acknowledge(request, connection_id);
        let outbound = outbound.clone();
        let received = futures_util::stream::once(async move {
            let _ = outbound.send(ack).await;
        })
        .filter_map(|()| std::future::ready(None::<Result<Bytes, std::io::Error>>));

        Ok(Body::wrap_stream(stream.chain(received)))
    }

    /// Small bodies are read inline. Anything else is returned for upload
    /// to the relay and referenced by the request id.
    async fn into_target_response(
        &self,
        request: &ClientRequest,
        response: Response,
    ) -> (TargetResponse, Option<Response>) {
        let mut target_response = TargetResponse::for_request(request, response.status().as_u16());
        target_response.headers = into_headers(response.headers());

        let length = response.content_length();
        if length.is_some_and(|len| len <= self.inline_body_limit) {
            target_response.body = match response.bytes().await {
                Ok(bytes) if bytes.is_empty() => None,
                Ok(bytes) => Some(BodyContent::Inline(bytes.to_vec())),
                Err(err) => {
                    tracing::warn!(request_id = %request.request_id, "failed to read target response: {err}");
                    target_response.status_code = 502;
                    None
                }
            };
            return (target_response, None);
        }

        target_response.body = Some(BodyContent::Stored {
            id: request.request_id.clone(),
            length,
        });
        (target_response, Some(response))
    }

    async fn push_response_body(
        &self,
        request: &ClientRequest,
        connection_id: &str,
        response: Response,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/body/{}/{}/response",
            self.relay_url, request.origin_id, request.request_id
        );
        self.http_client
            .post(&url)
            .header(CONNECTION_ID_HEADER, connection_id)
            .body(Body::wrap_stream(response.bytes_stream()))
            .send()
            .await
            .and_then(Response::error_for_status)
            .with_context(|| format!("failed to push response body to {url}"))?;
        Ok(())
    }
}

fn acknowledge(request: &ClientRequest, connection_id: &str) -> RelayMessage {
    RelayMessage::Acknowledge(AcknowledgeRequest {
        origin_id: request.origin_id.clone(),
        request_id: request.request_id.clone(),
        connection_id: connection_id.to_string(),
        remove_request_body_content: true,
    })
}

/// The target sees its own host, and reqwest sets the length of the body it sends.
fn into_header_map(headers: &Headers) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers.iter() {
        let name = k.parse::<HeaderName>()?;
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        map.append(name, v.parse::<HeaderValue>()?);
    }
    Ok(map)
}

fn into_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}
