use rusty_relay_messages::{LinkState, RelayMessage};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{RwLock, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct InFlight {
    /// Request id to origin id.
    requests: HashMap<String, String>,
    /// Set once the pending set was taken; nothing is tracked afterwards.
    closed: bool,
}

/// The server end of one connector connection.
///
/// The websocket task owns the socket; everybody else talks to the connector
/// through [`Link::send`].
pub struct Link {
    connection_id: String,
    tenant_id: String,
    sender: mpsc::Sender<RelayMessage>,
    state: Mutex<LinkState>,
    last_seen: Mutex<Instant>,
    pending: Mutex<InFlight>,
    closed: CancellationToken,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("connection_id", &self.connection_id)
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Link {
    pub fn new(
        connection_id: impl Into<String>,
        tenant_id: impl Into<String>,
        sender: mpsc::Sender<RelayMessage>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            tenant_id: tenant_id.into(),
            sender,
            state: Mutex::new(LinkState::Handshaking),
            last_seen: Mutex::new(Instant::now()),
            pending: Mutex::new(InFlight::default()),
            closed: CancellationToken::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: LinkState) {
        *lock(&self.state) = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == LinkState::Active
    }

    pub async fn send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RelayError::Transport(self.connection_id.clone()))
    }

    /// Records traffic from the connector.
    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_seen))
    }

    /// Records a request sent over this link. Returns `false` once the link
    /// was closed or its pending set taken.
    pub fn track(&self, request_id: &str, origin_id: &str) -> bool {
        let mut pending = lock(&self.pending);
        if pending.closed {
            return false;
        }
        pending
            .requests
            .insert(request_id.to_string(), origin_id.to_string());
        true
    }

    pub fn release(&self, request_id: &str) -> bool {
        lock(&self.pending).requests.remove(request_id).is_some()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        lock(&self.pending).requests.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).requests.len()
    }

    /// Empties the pending set for good, returning `(request id, origin id)` pairs.
    pub fn take_pending(&self) -> Vec<(String, String)> {
        let mut pending = lock(&self.pending);
        pending.closed = true;
        pending.requests.drain().collect()
    }

    /// Asks the websocket task to shut the connection down.
    pub fn close(&self) {
        lock(&self.pending).closed = true;
        self.set_state(LinkState::Closed);
        self.closed.cancel();
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Picks one of a tenant's active links for a request.
pub trait LinkSelector: Send + Sync {
    /// `links` are active and in registration order.
    fn select(&self, tenant_id: &str, links: &[Arc<Link>]) -> Option<Arc<Link>>;
}

/// Cycles through the links of each tenant.
#[derive(Default)]
pub struct RoundRobin {
    next: Mutex<HashMap<String, usize>>,
}

impl LinkSelector for RoundRobin {
    fn select(&self, tenant_id: &str, links: &[Arc<Link>]) -> Option<Arc<Link>> {
        if links.is_empty() {
            return None;
        }
        let mut next = lock(&self.next);
        let counter = next.entry(tenant_id.to_string()).or_default();
        let link = links[*counter % links.len()].clone();
        *counter = counter.wrapping_add(1);
        Some(link)
    }
}

/// Prefers the link with the fewest requests in flight; ties go to the older link.
#[derive(Default)]
pub struct LeastPending;

impl LinkSelector for LeastPending {
    fn select(&self, _tenant_id: &str, links: &[Arc<Link>]) -> Option<Arc<Link>> {
        links.iter().min_by_key(|link| link.pending_count()).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    RoundRobin,
    LeastPending,
}

impl SelectionPolicy {
    pub fn selector(self) -> Arc<dyn LinkSelector> {
        match self {
            SelectionPolicy::RoundRobin => Arc::new(RoundRobin::default()),
            SelectionPolicy::LeastPending => Arc::new(LeastPending),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(SelectionPolicy::RoundRobin),
            "least-pending" | "leastpending" => Ok(SelectionPolicy::LeastPending),
            other => Err(format!("unknown link selection policy: {other}")),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::RoundRobin => f.write_str("round-robin"),
            SelectionPolicy::LeastPending => f.write_str("least-pending"),
        }
    }
}

#[derive(Default)]
struct Links {
    by_tenant: HashMap<String, Vec<Arc<Link>>>,
    by_connection: HashMap<String, Arc<Link>>,
}

/// All links connected to this relay instance, grouped into per-tenant pools.
pub struct LinkRegistry {
    links: RwLock<Links>,
    selector: Arc<dyn LinkSelector>,
}

impl LinkRegistry {
    pub fn new(selector: Arc<dyn LinkSelector>) -> Self {
        Self {
            links: RwLock::new(Links::default()),
            selector,
        }
    }

    /// Adds a link that finished its handshake and marks it active.
    pub async fn register(&self, link: Arc<Link>) {
        link.set_state(LinkState::Active);
        link.touch();

        let mut links = self.links.write().await;
        links
            .by_tenant
            .entry(link.tenant_id().to_string())
            .or_default()
            .push(link.clone());
        links
            .by_connection
            .insert(link.connection_id().to_string(), link);
    }

    /// Removes and closes a link. Only the first caller for a connection gets it back.
    pub async fn remove(&self, connection_id: &str) -> Option<Arc<Link>> {
        let mut links = self.links.write().await;
        let link = links.by_connection.remove(connection_id)?;

        if let Some(pool) = links.by_tenant.get_mut(link.tenant_id()) {
            pool.retain(|l| l.connection_id() != connection_id);
            if pool.is_empty() {
                links.by_tenant.remove(link.tenant_id());
            }
        }
        drop(links);

        link.close();
        Some(link)
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<Link>> {
        self.links.read().await.by_connection.get(connection_id).cloned()
    }

    pub async fn active_links(&self, tenant_id: &str) -> Vec<Arc<Link>> {
        self.links
            .read()
            .await
            .by_tenant
            .get(tenant_id)
            .map(|pool| pool.iter().filter(|l| l.is_active()).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_active_link(&self, tenant_id: &str) -> bool {
        !self.active_links(tenant_id).await.is_empty()
    }

    pub async fn select(&self, tenant_id: &str) -> Option<Arc<Link>> {
        let links = self.active_links(tenant_id).await;
        self.selector.select(tenant_id, &links)
    }

    /// Links whose connector has been silent for longer than `client_timeout`.
    pub async fn stale_links(&self, now: Instant, client_timeout: Duration) -> Vec<Arc<Link>> {
        self.links
            .read()
            .await
            .by_connection
            .values()
            .filter(|link| link.idle_for(now) > client_timeout)
            .cloned()
            .collect()
    }

    /// Links that currently carry `request_id`.
    pub async fn carrying(&self, request_id: &str) -> Vec<Arc<Link>> {
        self.links
            .read()
            .await
            .by_connection
            .values()
            .filter(|link| link.is_pending(request_id))
            .cloned()
            .collect()
    }

    /// Stops handing out links and returns all of them for shutdown.
    pub async fn drain(&self) -> Vec<Arc<Link>> {
        let links: Vec<Arc<Link>> = self
            .links
            .read()
            .await
            .by_connection
            .values()
            .cloned()
            .collect();
        for link in &links {
            link.set_state(LinkState::Draining);
        }
        links
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.by_connection.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
