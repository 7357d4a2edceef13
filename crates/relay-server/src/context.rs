use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use rusty_relay_messages::{BodyContent, ClientRequest, TargetResponse};
use std::{io, sync::Arc};
use tokio::io::AsyncWriteExt;

use crate::{
    dispatcher::Dispatcher,
    error::{RelayError, StoreError},
    interceptor::{Interception, InterceptorContext, InterceptorPipeline, TransportMetadata},
};

/// Puts a response back together from its metadata and its separately uploaded
/// body, whichever arrives first.
#[derive(Debug, Default)]
pub enum ResponseAssembly {
    #[default]
    AwaitingBoth,
    MetadataArrived(TargetResponse),
    BodyArrived(u64),
    Complete,
}

#[derive(Debug)]
pub enum AssemblyStep {
    Waiting,
    Complete(TargetResponse),
    Duplicate,
}

impl ResponseAssembly {
    pub fn on_metadata(&mut self, response: TargetResponse) -> AssemblyStep {
        match std::mem::take(self) {
            ResponseAssembly::AwaitingBoth => {
                if response.body.as_ref().is_some_and(BodyContent::is_stored) {
                    *self = ResponseAssembly::MetadataArrived(response);
                    AssemblyStep::Waiting
                } else {
                    *self = ResponseAssembly::Complete;
                    AssemblyStep::Complete(response)
                }
            }
            ResponseAssembly::BodyArrived(length) => {
                *self = ResponseAssembly::Complete;
                AssemblyStep::Complete(attach_body(response, length))
            }
            previous => {
                *self = previous;
                AssemblyStep::Duplicate
            }
        }
    }

    pub fn on_body(&mut self, length: u64) -> AssemblyStep {
        match std::mem::take(self) {
            ResponseAssembly::AwaitingBoth => {
                *self = ResponseAssembly::BodyArrived(length);
                AssemblyStep::Waiting
            }
            ResponseAssembly::MetadataArrived(response) => {
                *self = ResponseAssembly::Complete;
                AssemblyStep::Complete(attach_body(response, length))
            }
            previous => {
                *self = previous;
                AssemblyStep::Duplicate
            }
        }
    }
}

/// Points the response at the stored body, which lives under the request id
/// once renamed, and sets its length.
fn attach_body(mut response: TargetResponse, length: u64) -> TargetResponse {
    if matches!(response.body, None | Some(BodyContent::Stored { .. })) {
        response.body = Some(BodyContent::Stored {
            id: response.request_id.clone(),
            length: Some(length),
        });
        response.headers.insert("Content-Length", length.to_string());
    }
    response
}

/// Request body as received from the caller, before staging.
pub enum InboundBody {
    Empty,
    Buffered(Bytes),
    Streaming {
        stream: BoxStream<'static, Result<Bytes, io::Error>>,
        length: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    Intercepting,
    Staging,
    Dispatched,
    Responding,
    Completed,
    Failed,
}

/// Cancels the call when the caller goes away before it finished.
struct CancelOnDrop {
    dispatcher: Arc<Dispatcher>,
    request_id: String,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.request_id.is_empty() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let request_id = std::mem::take(&mut self.request_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if dispatcher.cancel(&request_id).await {
                    tracing::info!(%request_id, "🚫 caller went away, request cancelled");
                }
            });
        }
    }
}

/// Everything one relayed call goes through, from interception to the final response.
pub struct RelayContext {
    state: RelayState,
    exchange: InterceptorContext,
    body: Option<InboundBody>,
    dispatcher: Arc<Dispatcher>,
    pipeline: Arc<InterceptorPipeline>,
    guard: Option<CancelOnDrop>,
}

impl RelayContext {
    pub fn new(
        request: ClientRequest,
        body: InboundBody,
        metadata: TransportMetadata,
        dispatcher: Arc<Dispatcher>,
        pipeline: Arc<InterceptorPipeline>,
    ) -> Self {
        Self {
            state: RelayState::Created,
            exchange: InterceptorContext::new(request, metadata),
            body: Some(body),
            dispatcher,
            pipeline,
            guard: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub async fn execute(&mut self) -> Result<TargetResponse, RelayError> {
        let result = self.run().await;
        // past this point the call is settled, nothing left to cancel
        if let Some(mut guard) = self.guard.take() {
            guard.request_id.clear();
        }

        let request_id = &self.exchange.request.request_id;
        match &result {
            Ok(response) => {
                self.state = RelayState::Completed;
                tracing::info!(
                    %request_id,
                    status = response.status_code,
                    "✅ request relayed"
                );
            }
            Err(err) => {
                self.state = RelayState::Failed;
                tracing::info!(%request_id, "❌ request failed: {err}");
            }
        }
        result
    }

    async fn run(&mut self) -> Result<TargetResponse, RelayError> {
        self.state = RelayState::Intercepting;
        if let Interception::Respond(response) =
            self.pipeline.run_request(&mut self.exchange).await?
        {
            return Ok(response);
        }

        // nothing gets staged for a tenant no connector serves
        let tenant_id = &self.exchange.request.tenant_id;
        if !self.dispatcher.can_serve(tenant_id).await {
            return Err(RelayError::NoConnector(tenant_id.clone()));
        }

        self.guard = Some(CancelOnDrop {
            dispatcher: self.dispatcher.clone(),
            request_id: self.exchange.request.request_id.clone(),
        });

        self.state = RelayState::Staging;
        let body = self.body.take().unwrap_or(InboundBody::Empty);
        let request_id = self.exchange.request.request_id.clone();
        self.exchange.request.body = stage(&self.dispatcher, &request_id, body).await?;

        self.state = RelayState::Dispatched;
        let response = self
            .dispatcher
            .relay(self.exchange.request.clone())
            .await?;

        self.state = RelayState::Responding;
        self.exchange.response = Some(response);
        if let Err(err) = self.pipeline.run_response(&mut self.exchange).await {
            if let Some(BodyContent::Stored { id, .. }) =
                self.exchange.response.take().and_then(|r| r.body)
            {
                let _ = self.dispatcher.store().remove_response_stream(&id).await;
            }
            return Err(err);
        }

        self.exchange
            .response
            .take()
            .ok_or_else(|| RelayError::CorrelationNotFound(self.exchange.request.request_id.clone()))
    }
}

/// Keeps small bodies inline and streams everything else into the body store.
/// Bodies of unknown length are buffered until they outgrow the inline limit.
async fn stage(
    dispatcher: &Dispatcher,
    request_id: &str,
    body: InboundBody,
) -> Result<Option<BodyContent>, RelayError> {
    let limit = dispatcher.settings().inline_body_limit;

    let (mut stream, length) = match body {
        InboundBody::Empty => return Ok(None),
        InboundBody::Buffered(bytes) if bytes.is_empty() => return Ok(None),
        InboundBody::Buffered(bytes) if bytes.len() <= limit => {
            return Ok(Some(BodyContent::Inline(bytes.to_vec())));
        }
        InboundBody::Buffered(bytes) => {
            let length = Some(bytes.len() as u64);
            let stream: BoxStream<'static, Result<Bytes, io::Error>> =
                futures_util::stream::once(async move { Ok(bytes) }).boxed();
            (stream, length)
        }
        InboundBody::Streaming { stream, length } => (stream, length),
    };

    let mut buffer = Vec::new();
    if length.is_none_or(|len| len <= limit as u64) {
        while buffer.len() <= limit {
            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk.map_err(|_| cancelled(request_id))?),
                None => return Ok((!buffer.is_empty()).then_some(BodyContent::Inline(buffer))),
            }
        }
    }

    let store = dispatcher.store();
    let mut writer = store.create_request_stream(request_id).await?;
    let mut written = buffer.len() as u64;
    let copied: Result<(), RelayError> = async {
        writer.write_all(&buffer).await.map_err(StoreError::from)?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|_| cancelled(request_id))?;
            writer.write_all(&chunk).await.map_err(StoreError::from)?;
            written += chunk.len() as u64;
        }
        writer.shutdown().await.map_err(StoreError::from)?;
        Ok(())
    }
    .await;

    if let Err(err) = copied {
        drop(writer);
        let _ = store.remove_request_stream(request_id).await;
        return Err(err);
    }

    tracing::debug!(%request_id, bytes = written, "request body staged");
    Ok(Some(BodyContent::Stored {
        id: request_id.to_string(),
        length: Some(written),
    }))
}

fn cancelled(request_id: &str) -> RelayError {
    RelayError::Cancelled(request_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::tests::{connect, dispatcher, next_request},
        error::Phase,
        interceptor::{InterceptorError, RequestInterceptor, ResponseInterceptor, tests::request},
    };
    use async_trait::async_trait;
    use rusty_relay_messages::{AcknowledgeMode, AcknowledgeRequest};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    fn response(body: Option<BodyContent>) -> TargetResponse {
        let mut response = TargetResponse::for_request(&request("r1"), 200);
        response.body = body;
        response
    }

    fn stored() -> Option<BodyContent> {
        Some(BodyContent::Stored {
            id: "r1".to_string(),
            length: None,
        })
    }

    #[test]
    fn test_inline_metadata_completes_immediately() {
        let mut assembly = ResponseAssembly::default();
        let step = assembly.on_metadata(response(Some(BodyContent::Inline(b"ok".to_vec()))));
        assert!(matches!(
            step,
            AssemblyStep::Complete(ref r) if r.body.as_ref().and_then(|b| b.len()) == Some(2)
        ));
        assert!(matches!(assembly.on_body(2), AssemblyStep::Duplicate));
    }

    #[test]
    fn test_metadata_then_body() {
        let mut assembly = ResponseAssembly::default();
        assert!(matches!(assembly.on_metadata(response(stored())), AssemblyStep::Waiting));

        let AssemblyStep::Complete(done) = assembly.on_body(1024) else {
            panic!("expected the response to complete");
        };
        assert_eq!(done.headers.get("content-length"), Some("1024"));
        assert_eq!(
            done.body,
            Some(BodyContent::Stored {
                id: "r1".to_string(),
                length: Some(1024)
            })
        );
    }

    #[test]
    fn test_body_then_metadata() {
        let mut assembly = ResponseAssembly::default();
        assert!(matches!(assembly.on_body(7), AssemblyStep::Waiting));
        assert!(matches!(assembly.on_body(7), AssemblyStep::Duplicate));

        let AssemblyStep::Complete(done) = assembly.on_metadata(response(stored())) else {
            panic!("expected the response to complete");
        };
        assert_eq!(done.body.unwrap().len(), Some(7));
        assert!(matches!(
            assembly.on_metadata(response(stored())),
            AssemblyStep::Duplicate
        ));
    }

    fn chunks(sizes: &[usize]) -> InboundBody {
        let chunks: Vec<Result<Bytes, io::Error>> =
            sizes.iter().map(|&n| Ok(Bytes::from(vec![b'x'; n]))).collect();
        InboundBody::Streaming {
            stream: futures_util::stream::iter(chunks).boxed(),
            length: None,
        }
    }

    #[tokio::test]
    async fn test_small_body_of_unknown_length_stays_inline() {
        let dispatcher = dispatcher();

        let staged = stage(&dispatcher, "r1", chunks(&[100, 200])).await.unwrap();
        assert_eq!(staged, Some(BodyContent::Inline(vec![b'x'; 300])));
        assert_eq!(stage(&dispatcher, "r2", chunks(&[])).await.unwrap(), None);
        assert!(!dispatcher.store().contains_request("r1"));
    }

    #[tokio::test]
    async fn test_large_body_of_unknown_length_spills_to_store() {
        let dispatcher = dispatcher();

        let staged = stage(&dispatcher, "r1", chunks(&[600, 600, 600])).await.unwrap();
        assert_eq!(
            staged,
            Some(BodyContent::Stored {
                id: "r1".to_string(),
                length: Some(1800)
            })
        );
        assert!(dispatcher.store().contains_request("r1"));
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_nothing_behind() {
        let dispatcher = dispatcher();
        let broken: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(vec![0; 2048])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")),
        ];
        let body = InboundBody::Streaming {
            stream: futures_util::stream::iter(broken).boxed(),
            length: Some(4096),
        };

        let err = stage(&dispatcher, "r1", body).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled(_)));
        assert!(!dispatcher.store().contains_request("r1"));
    }

    fn context(
        req: ClientRequest,
        body: InboundBody,
        dispatcher: &Arc<Dispatcher>,
        pipeline: InterceptorPipeline,
    ) -> RelayContext {
        RelayContext::new(
            req,
            body,
            TransportMetadata::default(),
            dispatcher.clone(),
            Arc::new(pipeline),
        )
    }

    #[tokio::test]
    async fn test_unserved_tenant_fails_before_staging() {
        let dispatcher = dispatcher();
        let polled = Arc::new(AtomicBool::new(false));
        let stream = {
            let polled = polled.clone();
            futures_util::stream::iter((0..4).map(|_| Ok::<_, io::Error>(Bytes::from(vec![1u8; 1024]))))
                .inspect(move |_| polled.store(true, Ordering::SeqCst))
                .boxed()
        };

        let mut req = request("big1");
        req.tenant_id = "T2".to_string();
        let body = InboundBody::Streaming {
            stream,
            length: Some(4096),
        };
        let mut ctx = context(req, body, &dispatcher, InterceptorPipeline::new());

        let err = ctx.execute().await.unwrap_err();
        assert!(matches!(err, RelayError::NoConnector(ref t) if t == "T2"));
        assert!(!polled.load(Ordering::SeqCst));
        assert!(!dispatcher.store().contains_request("big1"));
        assert_eq!(dispatcher.pending_calls().await, 0);
        assert_eq!(ctx.state(), RelayState::Failed);
    }

    #[tokio::test]
    async fn test_caller_gone_while_staging_reclaims_partial_body() {
        let dispatcher = dispatcher();
        let mut rx = connect(&dispatcher, "c1", "t1").await;

        let first = futures_util::stream::iter([Ok::<_, io::Error>(Bytes::from(vec![2u8; 4096]))]);
        let body = InboundBody::Streaming {
            stream: first.chain(futures_util::stream::pending()).boxed(),
            length: None,
        };
        let mut ctx = context(request("r1"), body, &dispatcher, InterceptorPipeline::new());
        let caller = tokio::spawn(async move { ctx.execute().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.store().contains_request("r1"));

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.store().contains_request("r1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.pending_calls().await, 0);
    }

    struct Reject;

    #[async_trait]
    impl ResponseInterceptor for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        async fn on_response(&self, _ctx: &mut InterceptorContext) -> Result<(), InterceptorError> {
            Err(InterceptorError("response withheld".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_response_interceptor_drops_stored_body() {
        let dispatcher = dispatcher();
        let mut rx = connect(&dispatcher, "c1", "t1").await;

        let mut req = request("r1");
        req.acknowledge_mode = AcknowledgeMode::ConnectorFinished;
        let mut ctx = context(
            req,
            InboundBody::Empty,
            &dispatcher,
            InterceptorPipeline::new().with_response(Reject),
        );
        let caller = tokio::spawn(async move {
            let result = ctx.execute().await;
            (ctx, result)
        });

        let received = next_request(&mut rx).await;
        let ack = AcknowledgeRequest {
            origin_id: "o1".to_string(),
            request_id: "r1".to_string(),
            connection_id: "c1".to_string(),
            remove_request_body_content: false,
        };
        dispatcher.handle_acknowledge("t1", ack).await.unwrap();

        let upload = futures_util::stream::iter([Ok(Bytes::from_static(b"secret"))]);
        dispatcher.store_response_body("o1", "r1", upload).await.unwrap();
        let mut response = TargetResponse::for_request(&received, 200);
        response.body = Some(BodyContent::Stored {
            id: "r1".to_string(),
            length: None,
        });
        dispatcher.handle_response(Some("c1"), response).await.unwrap();

        let (ctx, result) = caller.await.unwrap();
        assert!(matches!(
            result,
            Err(RelayError::Interceptor { phase: Phase::Response, ref name, .. }) if name == "reject"
        ));
        assert_eq!(ctx.state(), RelayState::Failed);
        assert!(!dispatcher.store().contains_response("r1"));
        assert_eq!(dispatcher.pending_calls().await, 0);
    }

    struct Maintenance;

    #[async_trait]
    impl RequestInterceptor for Maintenance {
        fn name(&self) -> &str {
            "maintenance"
        }

        async fn on_request(
            &self,
            ctx: &mut InterceptorContext,
        ) -> Result<Interception, InterceptorError> {
            Ok(Interception::Respond(TargetResponse::for_request(&ctx.request, 503)))
        }
    }

    #[tokio::test]
    async fn test_interceptor_answer_never_reaches_a_link() {
        let dispatcher = dispatcher();
        let mut rx = connect(&dispatcher, "c1", "t1").await;

        let mut ctx = context(
            request("r1"),
            chunks(&[2048]),
            &dispatcher,
            InterceptorPipeline::new().with_request(Maintenance),
        );
        let response = ctx.execute().await.unwrap();

        assert_eq!(response.status_code, 503);
        assert_eq!(ctx.state(), RelayState::Completed);
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.pending_calls().await, 0);
        assert!(!dispatcher.is_pending("r1").await);
        assert!(!dispatcher.store().contains_request("r1"));
    }
}
