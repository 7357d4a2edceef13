use rusty_relay_messages::{AcknowledgeMode, AcknowledgeRequest};
use std::{collections::HashMap, time::Duration};
use tokio::{sync::Mutex, time::Instant};

/// How long an acknowledged request id is remembered to recognise duplicates.
const ACKNOWLEDGED_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcknowledgeState {
    Dispatched,
    ConnectorReceived,
    ConnectorFinished,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgeOutcome {
    /// First acknowledge for the request. `remove_body` is set when the staged
    /// request body may be deleted now.
    Accepted { remove_body: bool },
    /// The request was acknowledged before; at-least-once delivery makes this normal.
    Duplicate,
    /// The request is tracked with [`AcknowledgeMode::Disabled`].
    Inert,
    /// Not tracked here, or tracked for a different tenant.
    Unknown,
}

#[derive(Debug)]
struct Tracked {
    since: Instant,
    tenant_id: String,
    mode: AcknowledgeMode,
    state: AcknowledgeState,
    body_staged: bool,
    body_released: bool,
    responded: bool,
}

impl Tracked {
    fn advance(&mut self, state: AcknowledgeState) {
        self.state = self.state.max(state);
    }

    /// Marks the body released and reports whether this call did it.
    fn release_body(&mut self) -> bool {
        let release = self.body_staged && !self.body_released;
        self.body_released = true;
        release
    }
}

/// Acknowledge bookkeeping for dispatched requests.
///
/// A staged request body is released exactly once, at the first of: an
/// acknowledge asking for removal, the response of a request in
/// [`AcknowledgeMode::Disabled`], or the point where both the response and the
/// acknowledge have arrived. Acknowledges and responses may come in either order.
pub struct AcknowledgeTracker {
    requests: Mutex<HashMap<String, Tracked>>,
    /// Acknowledged request id to its tenant.
    acknowledged: moka::future::Cache<String, String>,
}

impl Default for AcknowledgeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AcknowledgeTracker {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            acknowledged: moka::future::Cache::builder()
                .time_to_live(ACKNOWLEDGED_TTL)
                .build(),
        }
    }

    pub async fn track(
        &self,
        request_id: &str,
        tenant_id: &str,
        mode: AcknowledgeMode,
        body_staged: bool,
    ) {
        self.requests.lock().await.insert(
            request_id.to_string(),
            Tracked {
                since: Instant::now(),
                tenant_id: tenant_id.to_string(),
                mode,
                state: AcknowledgeState::Dispatched,
                body_staged,
                body_released: false,
                responded: false,
            },
        );
    }

    pub async fn state(&self, request_id: &str) -> Option<AcknowledgeState> {
        self.requests.lock().await.get(request_id).map(|t| t.state)
    }

    /// The connector has read the complete staged request body.
    pub async fn body_received(&self, request_id: &str) {
        if let Some(tracked) = self.requests.lock().await.get_mut(request_id) {
            tracked.advance(AcknowledgeState::ConnectorReceived);
        }
    }

    /// Records the response and returns whether the staged request body should be removed now.
    pub async fn response_arrived(&self, request_id: &str) -> bool {
        let mut requests = self.requests.lock().await;
        let Some(tracked) = requests.get_mut(request_id) else {
            return false;
        };

        tracked.responded = true;
        tracked.advance(AcknowledgeState::ConnectorFinished);

        if tracked.mode == AcknowledgeMode::Disabled
            || tracked.state == AcknowledgeState::Acknowledged
        {
            let release = tracked.release_body();
            requests.remove(request_id);
            return release;
        }

        false
    }

    /// Applies an acknowledge sent by a connector of `tenant_id`.
    pub async fn acknowledge(&self, tenant_id: &str, ack: &AcknowledgeRequest) -> AcknowledgeOutcome {
        let mut requests = self.requests.lock().await;
        let Some(tracked) = requests.get_mut(&ack.request_id) else {
            return match self.acknowledged.get(&ack.request_id).await {
                Some(tenant) if tenant == tenant_id => AcknowledgeOutcome::Duplicate,
                _ => AcknowledgeOutcome::Unknown,
            };
        };

        if tracked.tenant_id != tenant_id {
            return AcknowledgeOutcome::Unknown;
        }
        if tracked.mode == AcknowledgeMode::Disabled {
            return AcknowledgeOutcome::Inert;
        }
        if tracked.state == AcknowledgeState::Acknowledged {
            return AcknowledgeOutcome::Duplicate;
        }

        tracked.advance(AcknowledgeState::Acknowledged);
        let remove_body = if ack.remove_request_body_content || tracked.responded {
            tracked.release_body()
        } else {
            false
        };
        let tenant = tracked.tenant_id.clone();
        if tracked.responded {
            requests.remove(&ack.request_id);
        }

        self.acknowledged.insert(ack.request_id.clone(), tenant).await;
        AcknowledgeOutcome::Accepted { remove_body }
    }

    /// Drops a request that ended without a response (timeout, cancel, lost link).
    pub async fn forget(&self, request_id: &str) {
        self.requests.lock().await.remove(request_id);
    }

    /// Drops requests tracked for longer than `max_age` whose acknowledge never came.
    pub async fn prune(&self, max_age: Duration) -> usize {
        let mut requests = self.requests.lock().await;
        let before = requests.len();
        requests.retain(|_, tracked| tracked.since.elapsed() <= max_age);
        before - requests.len()
    }

    pub async fn len(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
