use async_trait::async_trait;
use rusty_relay_messages::{ClientRequest, TargetResponse};
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Phase, RelayError};

#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct InterceptorError(pub String);

/// Transport level facts about the exchange that are not part of the request itself.
#[derive(Debug, Clone, Default)]
pub struct TransportMetadata {
    pub remote_addr: Option<std::net::SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct InterceptorContext {
    pub request: ClientRequest,
    pub response: Option<TargetResponse>,
    pub metadata: TransportMetadata,
}

impl InterceptorContext {
    pub fn new(request: ClientRequest, metadata: TransportMetadata) -> Self {
        Self {
            request,
            response: None,
            metadata,
        }
    }
}

#[derive(Debug)]
pub enum Interception {
    Continue,
    /// Answer the caller with this response instead of relaying the request.
    Respond(TargetResponse),
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(
        &self,
        ctx: &mut InterceptorContext,
    ) -> Result<Interception, InterceptorError>;
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_response(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorError>;
}

/// Request and response interceptors, each run in registration order.
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    request: Vec<Arc<dyn RequestInterceptor>>,
    response: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        self.request.push(Arc::new(interceptor));
        self
    }

    pub fn with_response(mut self, interceptor: impl ResponseInterceptor + 'static) -> Self {
        self.response.push(Arc::new(interceptor));
        self
    }

    /// Stops at the first interceptor that fails or answers on its own.
    pub async fn run_request(
        &self,
        ctx: &mut InterceptorContext,
    ) -> Result<Interception, RelayError> {
        for interceptor in &self.request {
            match interceptor.on_request(ctx).await {
                Ok(Interception::Continue) => {}
                Ok(respond) => {
                    tracing::debug!(
                        request_id = %ctx.request.request_id,
                        "request answered by interceptor {}",
                        interceptor.name()
                    );
                    return Ok(respond);
                }
                Err(err) => return Err(failure(Phase::Request, interceptor.name(), err)),
            }
        }
        Ok(Interception::Continue)
    }

    pub async fn run_response(&self, ctx: &mut InterceptorContext) -> Result<(), RelayError> {
        for interceptor in &self.response {
            interceptor
                .on_response(ctx)
                .await
                .map_err(|err| failure(Phase::Response, interceptor.name(), err))?;
        }
        Ok(())
    }
}

fn failure(phase: Phase, name: &str, err: InterceptorError) -> RelayError {
    RelayError::Interceptor {
        phase,
        name: name.to_string(),
        message: err.0,
    }
}

/// Appends the caller's address to `X-Forwarded-For`.
pub struct ForwardedFor;

#[async_trait]
impl RequestInterceptor for ForwardedFor {
    fn name(&self) -> &str {
        "forwarded-for"
    }

    async fn on_request(
        &self,
        ctx: &mut InterceptorContext,
    ) -> Result<Interception, InterceptorError> {
        let ip = ctx
            .request
            .client_ip
            .clone()
            .or_else(|| ctx.metadata.remote_addr.map(|addr| addr.ip().to_string()));

        if let Some(ip) = ip {
            let value = match ctx.request.headers.get("x-forwarded-for") {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip,
            };
            ctx.request.headers.insert("X-Forwarded-For", value);
        }
        Ok(Interception::Continue)
    }
}

/// Tags every relayed response with the request id it answered.
pub struct RequestIdHeader;

#[async_trait]
impl ResponseInterceptor for RequestIdHeader {
    fn name(&self) -> &str {
        "request-id"
    }

    async fn on_response(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorError> {
        let request_id = ctx.request.request_id.clone();
        if let Some(response) = ctx.response.as_mut() {
            response.headers.insert("X-Relay-Request-Id", request_id);
        }
        Ok(())
    }
}
