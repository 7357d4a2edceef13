//! Delivery of relay traffic between relay server instances.
//!
//! Each instance owns its pending call table. Whatever reaches an instance for a
//! request another instance received (responses, response bodies, acknowledges,
//! link failures) is handed to an [`OriginRouter`], addressed by origin id.

use async_trait::async_trait;
use rusty_relay_messages::{AcknowledgeRequest, ClientRequest, TargetResponse};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Dispatcher,
    error::{FailureKind, RelayError},
};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Delivery {
    /// A request whose tenant has no link on the origin instance.
    Request(ClientRequest),
    Response(TargetResponse),
    ResponseBody { request_id: String, length: u64 },
    /// An acknowledge sent by a connector of `tenant_id`.
    Acknowledge {
        tenant_id: String,
        ack: AcknowledgeRequest,
    },
    Failure { request_id: String, kind: FailureKind },
    Cancel { request_id: String },
}

impl Delivery {
    pub fn request_id(&self) -> &str {
        match self {
            Delivery::Request(request) => &request.request_id,
            Delivery::Response(response) => &response.request_id,
            Delivery::Acknowledge { ack, .. } => &ack.request_id,
            Delivery::ResponseBody { request_id, .. }
            | Delivery::Failure { request_id, .. }
            | Delivery::Cancel { request_id } => request_id,
        }
    }
}

#[async_trait]
pub trait OriginRouter: Send + Sync {
    /// Hands `delivery` to the instance `origin_id`.
    async fn deliver(&self, origin_id: &str, delivery: Delivery) -> Result<(), RelayError>;

    /// Whether some instance other than `from` holds a link for `tenant_id`.
    async fn serves_tenant(&self, from: &str, tenant_id: &str) -> bool;

    /// Sends `request` to some other instance holding a link for its tenant.
    async fn forward_request(&self, from: &str, request: ClientRequest) -> Result<(), RelayError>;

    /// Tells every other instance to stop working on `request_id`.
    async fn broadcast_cancel(&self, from: &str, request_id: &str);

    /// Publishes whether `instance_id` currently has an active link for `tenant_id`.
    async fn announce_tenant(&self, instance_id: &str, tenant_id: &str, available: bool);
}

/// Router of a relay server that runs as a single instance.
#[derive(Debug, Default)]
pub struct LocalRouter;

#[async_trait]
impl OriginRouter for LocalRouter {
    async fn deliver(&self, _origin_id: &str, delivery: Delivery) -> Result<(), RelayError> {
        Err(RelayError::CorrelationNotFound(
            delivery.request_id().to_string(),
        ))
    }

    async fn serves_tenant(&self, _from: &str, _tenant_id: &str) -> bool {
        false
    }

    async fn forward_request(&self, _from: &str, request: ClientRequest) -> Result<(), RelayError> {
        Err(RelayError::NoConnector(request.tenant_id))
    }

    async fn broadcast_cancel(&self, _from: &str, _request_id: &str) {}

    async fn announce_tenant(&self, _instance_id: &str, _tenant_id: &str, _available: bool) {}
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: String,
    /// `None` addresses every instance except the sender.
    pub to: Option<String>,
    pub delivery: Delivery,
}

impl Envelope {
    fn is_for(&self, instance_id: &str) -> bool {
        match &self.to {
            Some(to) => to == instance_id,
            None => self.from != instance_id,
        }
    }
}

/// In-process bus connecting several relay instances.
#[derive(Clone)]
pub struct BroadcastRouter {
    tx: broadcast::Sender<Envelope>,
    tenants: Arc<Mutex<HashMap<String, BTreeSet<String>>>>,
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(BUS_CAPACITY).0,
            tenants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn tenants(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.tenants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance_for(&self, from: &str, tenant_id: &str) -> Option<String> {
        self.tenants()
            .get(tenant_id)
            .and_then(|instances| instances.iter().find(|i| *i != from).cloned())
    }

    fn publish(&self, envelope: Envelope) -> Result<(), RelayError> {
        let request_id = envelope.delivery.request_id().to_string();
        self.tx
            .send(envelope)
            .map(|_| ())
            .map_err(|_| RelayError::CorrelationNotFound(request_id))
    }

    /// Feeds every envelope addressed to `dispatcher` into it until `shutdown` fires.
    pub fn attach(&self, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(envelope) if envelope.is_for(dispatcher.origin_id()) => {
                            dispatcher.on_delivery(envelope.delivery).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("relay bus lagged, {skipped} deliveries lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

#[async_trait]
impl OriginRouter for BroadcastRouter {
    async fn deliver(&self, origin_id: &str, delivery: Delivery) -> Result<(), RelayError> {
        self.publish(Envelope {
            from: String::new(),
            to: Some(origin_id.to_string()),
            delivery,
        })
    }

    async fn serves_tenant(&self, from: &str, tenant_id: &str) -> bool {
        self.instance_for(from, tenant_id).is_some()
    }

    async fn forward_request(&self, from: &str, request: ClientRequest) -> Result<(), RelayError> {
        let Some(target) = self.instance_for(from, &request.tenant_id) else {
            return Err(RelayError::NoConnector(request.tenant_id));
        };

        tracing::debug!(
            request_id = %request.request_id,
            "forwarding request to relay instance {target}"
        );
        let tenant_id = request.tenant_id.clone();
        self.publish(Envelope {
            from: from.to_string(),
            to: Some(target),
            delivery: Delivery::Request(request),
        })
        .map_err(|_| RelayError::NoConnector(tenant_id))
    }

    async fn broadcast_cancel(&self, from: &str, request_id: &str) {
        let _ = self.publish(Envelope {
            from: from.to_string(),
            to: None,
            delivery: Delivery::Cancel {
                request_id: request_id.to_string(),
            },
        });
    }

    async fn announce_tenant(&self, instance_id: &str, tenant_id: &str, available: bool) {
        let mut tenants = self.tenants();
        if available {
            tenants
                .entry(tenant_id.to_string())
                .or_default()
                .insert(instance_id.to_string());
        } else if let Some(instances) = tenants.get_mut(tenant_id) {
            instances.remove(instance_id);
            if instances.is_empty() {
                tenants.remove(tenant_id);
            }
        }
    }
}
