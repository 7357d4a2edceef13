use rusty_relay_messages::TargetResponse;
use std::{collections::HashMap, time::Duration};
use tokio::sync::{Mutex, oneshot};

use crate::{
    context::{AssemblyStep, ResponseAssembly},
    error::RelayError,
};

/// How long resolved request ids are remembered, to tell late duplicates from
/// ids this instance never saw.
const RESOLVED_TTL: Duration = Duration::from_secs(10 * 60);

pub type CallOutcome = Result<TargetResponse, RelayError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub tenant_id: String,
    /// Local link carrying the request; `None` when another instance carries it.
    pub connection_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The caller got its outcome.
    Resolved(CallInfo),
    /// Part of the response arrived, the rest is still outstanding.
    Waiting,
    /// The entry was resolved before; the late arrival is ignored.
    Duplicate,
    NotFound,
}

struct PendingCall {
    info: CallInfo,
    assembly: ResponseAssembly,
    reply: oneshot::Sender<CallOutcome>,
}

/// Callers waiting for their response, keyed by request id.
///
/// Every entry is resolved at most once: all paths remove the entry under the
/// table lock before replying, so whichever of response, timeout, cancel or
/// lost link gets there first wins and the others see it gone.
pub struct PendingCallTable {
    calls: Mutex<HashMap<String, PendingCall>>,
    resolved: moka::future::Cache<String, ()>,
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            resolved: moka::future::Cache::builder()
                .time_to_live(RESOLVED_TTL)
                .build(),
        }
    }

    /// Returns `None` if `request_id` is already waiting.
    pub async fn register(
        &self,
        request_id: &str,
        info: CallInfo,
    ) -> Option<oneshot::Receiver<CallOutcome>> {
        let mut calls = self.calls.lock().await;
        if calls.contains_key(request_id) {
            return None;
        }
        let (reply, rx) = oneshot::channel();
        calls.insert(
            request_id.to_string(),
            PendingCall {
                info,
                assembly: ResponseAssembly::default(),
                reply,
            },
        );
        Some(rx)
    }

    pub async fn on_metadata(&self, response: TargetResponse) -> Resolution {
        let request_id = response.request_id.clone();
        self.step(&request_id, |assembly| assembly.on_metadata(response))
            .await
    }

    pub async fn on_body(&self, request_id: &str, length: u64) -> Resolution {
        self.step(request_id, |assembly| assembly.on_body(length))
            .await
    }

    async fn step(
        &self,
        request_id: &str,
        f: impl FnOnce(&mut ResponseAssembly) -> AssemblyStep,
    ) -> Resolution {
        let mut calls = self.calls.lock().await;
        let Some(call) = calls.get_mut(request_id) else {
            drop(calls);
            return self.missing(request_id);
        };

        match f(&mut call.assembly) {
            AssemblyStep::Waiting => Resolution::Waiting,
            AssemblyStep::Duplicate => Resolution::Duplicate,
            AssemblyStep::Complete(response) => {
                let Some(call) = calls.remove(request_id) else {
                    return Resolution::NotFound;
                };
                drop(calls);
                self.finish(request_id, call, Ok(response)).await
            }
        }
    }

    /// Resolves the entry with a final outcome, typically an error.
    pub async fn resolve(&self, request_id: &str, outcome: CallOutcome) -> Resolution {
        let call = self.calls.lock().await.remove(request_id);
        match call {
            Some(call) => self.finish(request_id, call, outcome).await,
            None => self.missing(request_id),
        }
    }

    /// Drops the entry without replying; the waiting side sees its channel close.
    /// Anything arriving for the id afterwards is reported as [`Resolution::NotFound`].
    pub async fn remove(&self, request_id: &str) -> Option<CallInfo> {
        let call = self.calls.lock().await.remove(request_id)?;
        Some(call.info)
    }

    async fn finish(&self, request_id: &str, call: PendingCall, outcome: CallOutcome) -> Resolution {
        self.resolved.insert(request_id.to_string(), ()).await;
        if call.reply.send(outcome).is_err() {
            tracing::debug!(%request_id, "caller stopped waiting before the outcome arrived");
        }
        Resolution::Resolved(call.info)
    }

    fn missing(&self, request_id: &str) -> Resolution {
        if self.was_resolved(request_id) {
            Resolution::Duplicate
        } else {
            Resolution::NotFound
        }
    }

    /// Whether `request_id` got its outcome recently.
    pub fn was_resolved(&self, request_id: &str) -> bool {
        self.resolved.contains_key(request_id)
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.calls.lock().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
