//! Dispatching of client requests to connector links and correlation of
//! whatever comes back with the caller still waiting for it.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rusty_relay_messages::{AcknowledgeRequest, BodyContent, ClientRequest, RelayMessage, TargetResponse};
use std::{io, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    acknowledge::{AcknowledgeOutcome, AcknowledgeTracker},
    config::RelayConfig,
    error::{FailureKind, RelayError, StoreError},
    link::{Link, LinkRegistry},
    pending::{CallInfo, CallOutcome, PendingCallTable, Resolution},
    router::{Delivery, OriginRouter},
    store::BodyStore,
    util::generate_id,
};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub request_timeout: Duration,
    /// Links silent for longer than this are closed by [`Dispatcher::sweep`].
    pub client_timeout: Duration,
    pub body_retention: Duration,
    pub inline_body_limit: usize,
}

impl From<&RelayConfig> for DispatchSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            client_timeout: config.client_timeout,
            body_retention: config.body_retention,
            inline_body_limit: config.inline_body_limit,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub links: usize,
    pub requests: usize,
    pub bodies: usize,
}

pub struct Dispatcher {
    origin_id: String,
    registry: Arc<LinkRegistry>,
    pending: PendingCallTable,
    acks: AcknowledgeTracker,
    store: Arc<dyn BodyStore>,
    router: Arc<dyn OriginRouter>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        origin_id: impl Into<String>,
        registry: Arc<LinkRegistry>,
        store: Arc<dyn BodyStore>,
        router: Arc<dyn OriginRouter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            registry,
            pending: PendingCallTable::new(),
            acks: AcknowledgeTracker::new(),
            store,
            router,
            settings,
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn BodyStore> {
        &self.store
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn acknowledges(&self) -> &AcknowledgeTracker {
        &self.acks
    }

    pub async fn pending_calls(&self) -> usize {
        self.pending.len().await
    }

    pub async fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains(request_id).await
    }

    /// Whether a request for `tenant_id` has somewhere to go right now, on this
    /// instance or another one.
    pub async fn can_serve(&self, tenant_id: &str) -> bool {
        self.registry.has_active_link(tenant_id).await
            || self.router.serves_tenant(&self.origin_id, tenant_id).await
    }

    /// Sends `request` towards a connector of its tenant and waits for the
    /// outcome, at most for the configured request timeout.
    pub async fn relay(&self, request: ClientRequest) -> CallOutcome {
        let request_id = request.request_id.clone();
        let mut rx = self.dispatch(request).await?;

        match tokio::time::timeout(self.settings.request_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::Cancelled(request_id)),
            Err(_) => match self.pending.remove(&request_id).await {
                Some(info) => {
                    tracing::info!(%request_id, "⏰ no response within {:?}", self.settings.request_timeout);
                    self.abandon(&request_id, &info).await;
                    Err(RelayError::Timeout(request_id))
                }
                // resolved right at the deadline, the outcome is already in the channel
                None => rx
                    .try_recv()
                    .unwrap_or_else(|_| Err(RelayError::Timeout(request_id))),
            },
        }
    }

    /// Registers the pending call and hands the request to a link, or to
    /// another relay instance when no local link serves the tenant.
    pub async fn dispatch(
        &self,
        request: ClientRequest,
    ) -> Result<oneshot::Receiver<CallOutcome>, RelayError> {
        let request_id = request.request_id.clone();
        let tenant_id = request.tenant_id.clone();
        let link = self.registry.select(&tenant_id).await;

        let info = CallInfo {
            tenant_id: tenant_id.clone(),
            connection_id: link.as_ref().map(|l| l.connection_id().to_string()),
        };
        let rx = self
            .pending
            .register(&request_id, info)
            .await
            .ok_or_else(|| RelayError::DuplicateRequest(request_id.clone()))?;

        let body_staged = matches!(request.body, Some(BodyContent::Stored { .. }));
        self.acks
            .track(&request_id, &tenant_id, request.acknowledge_mode, body_staged)
            .await;

        let sent = match link {
            Some(link) => {
                tracing::debug!(
                    %request_id,
                    %tenant_id,
                    connection_id = link.connection_id(),
                    "dispatching request"
                );
                send_on(&link, request, &self.origin_id).await
            }
            None => self.router.forward_request(&self.origin_id, request).await,
        };

        if let Err(err) = sent {
            self.pending.remove(&request_id).await;
            self.acks.forget(&request_id).await;
            if body_staged {
                self.discard_request_body(&request_id).await;
            }
            return Err(err);
        }
        Ok(rx)
    }

    /// Gives up on a request: the caller stops waiting and everything staged
    /// for it is reclaimed. Returns `false` if it was no longer pending.
    ///
    /// An id that never made it into the pending table, such as one whose body
    /// was still being staged, gets its bodies reclaimed as well.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let Some(info) = self.pending.remove(request_id).await else {
            if !self.pending.was_resolved(request_id) {
                self.reclaim(request_id).await;
            }
            return false;
        };
        self.abandon(request_id, &info).await;
        true
    }

    async fn abandon(&self, request_id: &str, info: &CallInfo) {
        self.notify_links(request_id).await;
        if info.connection_id.is_none() {
            self.router.broadcast_cancel(&self.origin_id, request_id).await;
        }
        self.reclaim(request_id).await;
    }

    /// Best effort: tells every local link still carrying `request_id` to stop.
    async fn notify_links(&self, request_id: &str) {
        for link in self.registry.carrying(request_id).await {
            link.release(request_id);
            let cancel = RelayMessage::Cancel {
                request_id: request_id.to_string(),
            };
            if link.send(cancel).await.is_err() {
                tracing::debug!(%request_id, connection_id = link.connection_id(), "link gone before cancel");
            }
        }
    }

    async fn reclaim(&self, request_id: &str) {
        self.acks.forget(request_id).await;
        self.discard_request_body(request_id).await;
        if let Err(err) = self.store.remove_response_stream(request_id).await {
            tracing::warn!(%request_id, "failed to remove response body: {err}");
        }
    }

    async fn discard_request_body(&self, request_id: &str) {
        if let Err(err) = self.store.remove_request_stream(request_id).await {
            tracing::warn!(%request_id, "failed to remove request body: {err}");
        }
    }

    /// Response metadata from a connector. `connection_id` names the local link
    /// it came over, if any.
    pub async fn handle_response(
        &self,
        connection_id: Option<&str>,
        response: TargetResponse,
    ) -> Result<(), RelayError> {
        let request_id = response.request_id.clone();
        if let Some(connection_id) = connection_id {
            if let Some(link) = self.registry.get(connection_id).await {
                link.release(&request_id);
            }
        }

        if response.origin_id != self.origin_id {
            let origin_id = response.origin_id.clone();
            let stored = response.body.as_ref().is_some_and(BodyContent::is_stored);
            let delivered = self
                .router
                .deliver(&origin_id, Delivery::Response(response))
                .await;
            if delivered.is_err() && stored {
                let _ = self.store.remove_response_stream(&request_id).await;
            }
            return delivered;
        }

        // the request body goes before the caller sees the response
        if self.acks.response_arrived(&request_id).await {
            tracing::debug!(%request_id, "🧹 releasing request body, response arrived");
            self.discard_request_body(&request_id).await;
        }

        let stored = response.body.as_ref().is_some_and(BodyContent::is_stored);
        match self.pending.on_metadata(response).await {
            Resolution::Resolved(_) | Resolution::Waiting => Ok(()),
            Resolution::Duplicate => {
                tracing::debug!(%request_id, "ignoring second response");
                Ok(())
            }
            Resolution::NotFound => {
                tracing::debug!(%request_id, "response for a request nobody waits for");
                if stored {
                    let _ = self.store.remove_response_stream(&request_id).await;
                }
                Err(RelayError::CorrelationNotFound(request_id))
            }
        }
    }

    /// A response body finished uploading and now lives under the request id.
    pub async fn handle_response_body(
        &self,
        origin_id: &str,
        request_id: &str,
        length: u64,
    ) -> Result<(), RelayError> {
        let resolution = if origin_id == self.origin_id {
            match self.pending.on_body(request_id, length).await {
                Resolution::NotFound => Err(RelayError::CorrelationNotFound(request_id.to_string())),
                _ => Ok(()),
            }
        } else {
            let body = Delivery::ResponseBody {
                request_id: request_id.to_string(),
                length,
            };
            self.router.deliver(origin_id, body).await
        };

        if resolution.is_err() {
            tracing::debug!(%request_id, "dropping response body nobody waits for");
            let _ = self.store.remove_response_stream(request_id).await;
        }
        resolution
    }

    /// Writes an uploaded response body under a temporary id, moves it to the
    /// request id and reports it to the origin instance.
    pub async fn store_response_body<S>(
        &self,
        origin_id: &str,
        request_id: &str,
        mut body: S,
    ) -> Result<u64, RelayError>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        let temporary_id = format!("tmp-{}", generate_id(16));
        let mut writer = self.store.create_response_stream(&temporary_id).await?;

        let written: Result<(), StoreError> = async {
            while let Some(chunk) = body.next().await {
                writer.write_all(&chunk?).await?;
            }
            writer.shutdown().await?;
            Ok(())
        }
        .await;
        drop(writer);

        let length = match written {
            Ok(()) => self
                .store
                .rename_response_stream(&temporary_id, request_id)
                .await,
            Err(err) => Err(err),
        };
        let length = match length {
            Ok(length) => length,
            Err(err) => {
                let _ = self.store.remove_response_stream(&temporary_id).await;
                return Err(err.into());
            }
        };

        tracing::debug!(%request_id, bytes = length, "response body stored");
        self.handle_response_body(origin_id, request_id, length)
            .await?;
        Ok(length)
    }

    /// Acknowledge sent by a connector of `tenant_id`. Requests of other tenants
    /// are reported as not found.
    pub async fn handle_acknowledge(
        &self,
        tenant_id: &str,
        ack: AcknowledgeRequest,
    ) -> Result<(), RelayError> {
        if ack.origin_id != self.origin_id {
            let origin_id = ack.origin_id.clone();
            let delivery = Delivery::Acknowledge {
                tenant_id: tenant_id.to_string(),
                ack,
            };
            return self.router.deliver(&origin_id, delivery).await;
        }

        let request_id = &ack.request_id;
        match self.acks.acknowledge(tenant_id, &ack).await {
            AcknowledgeOutcome::Accepted { remove_body } => {
                tracing::debug!(%request_id, connection_id = %ack.connection_id, "request acknowledged");
                if remove_body {
                    tracing::debug!(%request_id, "🧹 releasing acknowledged request body");
                    self.store.remove_request_stream(request_id).await?;
                }
                Ok(())
            }
            AcknowledgeOutcome::Duplicate => {
                tracing::debug!(%request_id, "duplicate acknowledge");
                Ok(())
            }
            AcknowledgeOutcome::Inert => Ok(()),
            AcknowledgeOutcome::Unknown => Err(RelayError::CorrelationNotFound(request_id.clone())),
        }
    }

    /// The connector has read the whole staged request body.
    pub async fn request_body_received(&self, request_id: &str) {
        self.acks.body_received(request_id).await;
    }

    /// Adds a link that passed its handshake.
    pub async fn register_link(&self, link: Arc<Link>) {
        let tenant_id = link.tenant_id().to_string();
        tracing::info!(
            %tenant_id,
            connection_id = link.connection_id(),
            "🔗 connector link active"
        );
        self.registry.register(link).await;
        self.router
            .announce_tenant(&self.origin_id, &tenant_id, true)
            .await;
    }

    /// Removes a link and fails every request still in flight on it. Returns
    /// the number of failed requests.
    pub async fn disconnect(&self, connection_id: &str) -> usize {
        let Some(link) = self.registry.remove(connection_id).await else {
            return 0;
        };

        let tenant_id = link.tenant_id();
        if !self.registry.has_active_link(tenant_id).await {
            self.router
                .announce_tenant(&self.origin_id, tenant_id, false)
                .await;
        }

        let lost = link.take_pending();
        tracing::info!(
            %tenant_id,
            %connection_id,
            in_flight = lost.len(),
            "🔌 connector link closed"
        );
        for (request_id, origin_id) in &lost {
            self.link_lost(request_id, origin_id).await;
        }
        lost.len()
    }

    async fn link_lost(&self, request_id: &str, origin_id: &str) {
        if origin_id == self.origin_id {
            self.fail(request_id, RelayError::ConnectionLost(request_id.to_string()))
                .await;
            return;
        }

        let failure = Delivery::Failure {
            request_id: request_id.to_string(),
            kind: FailureKind::ConnectionLost,
        };
        if let Err(err) = self.router.deliver(origin_id, failure).await {
            tracing::debug!(%request_id, "could not report lost link to {origin_id}: {err}");
        }
    }

    async fn fail(&self, request_id: &str, err: RelayError) {
        if let Resolution::Resolved(_) = self.pending.resolve(request_id, Err(err)).await {
            self.reclaim(request_id).await;
        }
    }

    /// Sends a request another instance could not serve to one of the local links.
    async fn transmit_local(&self, request: ClientRequest) {
        let request_id = request.request_id.clone();
        let origin_id = request.origin_id.clone();

        let outcome = match self.registry.select(&request.tenant_id).await {
            Some(link) => send_on(&link, request, &origin_id).await,
            None => Err(RelayError::NoConnector(request.tenant_id)),
        };

        if let Err(err) = outcome {
            let failure = Delivery::Failure {
                request_id,
                kind: err.kind(),
            };
            if let Err(err) = self.router.deliver(&origin_id, failure).await {
                tracing::debug!("could not report failed forward to {origin_id}: {err}");
            }
        }
    }

    /// Entry point for traffic routed here by another relay instance.
    pub async fn on_delivery(&self, delivery: Delivery) {
        let request_id = delivery.request_id().to_string();
        let handled = match delivery {
            Delivery::Request(request) => {
                self.transmit_local(request).await;
                Ok(())
            }
            Delivery::Response(response) => self.handle_response(None, response).await,
            Delivery::ResponseBody { request_id, length } => {
                let origin_id = self.origin_id.clone();
                self.handle_response_body(&origin_id, &request_id, length)
                    .await
            }
            Delivery::Acknowledge { tenant_id, ack } => self.handle_acknowledge(&tenant_id, ack).await,
            Delivery::Failure { request_id, kind } => {
                self.fail(&request_id, kind.into_error(&request_id)).await;
                Ok(())
            }
            Delivery::Cancel { request_id } => {
                self.notify_links(&request_id).await;
                Ok(())
            }
        };

        if let Err(err) = handled {
            tracing::debug!(%request_id, "routed delivery dropped: {err}");
        }
    }

    /// Closes links that went silent and reclaims expired body streams.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let stale = self
            .registry
            .stale_links(Instant::now(), self.settings.client_timeout)
            .await;
        for link in stale {
            tracing::warn!(
                tenant_id = link.tenant_id(),
                connection_id = link.connection_id(),
                "💀 no traffic from connector for {:?}, closing link",
                link.idle_for(Instant::now())
            );
            report.links += 1;
            report.requests += self.disconnect(link.connection_id()).await;
        }

        match self.store.sweep(self.settings.body_retention).await {
            Ok(bodies) => report.bodies = bodies,
            Err(err) => tracing::warn!("body store sweep failed: {err}"),
        }
        self.acks.prune(self.settings.body_retention).await;

        report
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.sweep().await;
                        if report != SweepReport::default() {
                            tracing::debug!(?report, "sweep finished");
                        }
                    }
                }
            }
        })
    }

    /// Stops handing out links, waits up to `grace` for calls in flight and
    /// then closes every link.
    pub async fn shutdown(&self, grace: Duration) {
        let links = self.registry.drain().await;
        tracing::info!("draining {} connector links", links.len());

        let deadline = Instant::now() + grace;
        while !self.pending.is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for link in links {
            self.disconnect(link.connection_id()).await;
        }
    }
}

/// Tracks `request` on `link` and sends it. A link whose pending set was
/// already taken by a disconnect refuses the request.
async fn send_on(link: &Link, request: ClientRequest, origin_id: &str) -> Result<(), RelayError> {
    let request_id = request.request_id.clone();
    if !link.track(&request_id, origin_id) {
        return Err(RelayError::ConnectionLost(request_id));
    }
    let sent = link.send(RelayMessage::Request(request)).await;
    if sent.is_err() {
        link.release(&request_id);
    }
    sent
}
