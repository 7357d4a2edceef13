//! Messages exchanged between the relay server and its connectors.
//!
//! Every frame on a connector link is one JSON encoded [`RelayMessage`].

use serde::{Deserialize, Serialize};

mod headers;

pub use headers::Headers;

/// Body of a relayed request or response.
///
/// Small payloads travel inline inside the message, everything else is staged in
/// the server's temporary body store and referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyContent {
    Inline(Vec<u8>),
    Stored { id: String, length: Option<u64> },
}

impl BodyContent {
    pub fn len(&self) -> Option<u64> {
        match self {
            BodyContent::Inline(bytes) => Some(bytes.len() as u64),
            BodyContent::Stored { length, .. } => *length,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, BodyContent::Stored { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcknowledgeMode {
    /// Completion is inferred from the response alone.
    #[default]
    Disabled,
    /// The connector acknowledges once it has pulled the full request body.
    ConnectorReceived,
    /// The connector acknowledges right before it hands back its response.
    ConnectorFinished,
    /// Someone outside the relay acknowledges explicitly.
    Manual,
}

impl std::str::FromStr for AcknowledgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "disabled" => Ok(AcknowledgeMode::Disabled),
            "connectorreceived" => Ok(AcknowledgeMode::ConnectorReceived),
            "connectorfinished" => Ok(AcknowledgeMode::ConnectorFinished),
            "manual" => Ok(AcknowledgeMode::Manual),
            other => Err(format!("unknown acknowledge mode: {other}")),
        }
    }
}

impl std::fmt::Display for AcknowledgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AcknowledgeMode::Disabled => "disabled",
            AcknowledgeMode::ConnectorReceived => "connector-received",
            AcknowledgeMode::ConnectorFinished => "connector-finished",
            AcknowledgeMode::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// An inbound call, as received by the relay server instance `origin_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: String,
    pub origin_id: String,
    pub tenant_id: String,
    pub method: String,
    /// Path and query relative to the connector's target.
    pub url: String,
    pub headers: Headers,
    pub body: Option<BodyContent>,
    pub acknowledge_mode: AcknowledgeMode,
    pub client_ip: Option<String>,
}

/// What the target answered, as assembled by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub request_id: String,
    pub origin_id: String,
    pub status_code: u16,
    pub headers: Headers,
    pub body: Option<BodyContent>,
    /// Unix milliseconds.
    pub request_started: u64,
    /// Unix milliseconds.
    pub request_finished: u64,
}

impl TargetResponse {
    /// A response without body for `request`, e.g. when the target could not be reached.
    pub fn for_request(request: &ClientRequest, status_code: u16) -> Self {
        let now = unix_millis();
        Self {
            request_id: request.request_id.clone(),
            origin_id: request.origin_id.clone(),
            status_code,
            headers: Headers::new(),
            body: None,
            request_started: now,
            request_finished: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeRequest {
    pub origin_id: String,
    pub request_id: String,
    pub connection_id: String,
    pub remove_request_body_content: bool,
}

/// Lifecycle of one connector link. The server side only ever uses the
/// `Handshaking`, `Active`, `Draining` and `Closed` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Active,
    Reconnecting,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMessage {
    /// First frame a connector sends after the transport is up.
    Hello {
        tenant_id: String,
        secret: String,
        connector_version: String,
    },
    /// Handshake answer, carrying the transport assigned connection id.
    Welcome {
        connection_id: String,
        keep_alive_interval_ms: u64,
    },
    Request(ClientRequest),
    /// Best effort request to stop working on `request_id`.
    Cancel { request_id: String },
    Response(TargetResponse),
    Acknowledge(AcknowledgeRequest),
    Heartbeat,
}

pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_mode_parse() {
        assert_eq!(
            "connector-finished".parse::<AcknowledgeMode>(),
            Ok(AcknowledgeMode::ConnectorFinished)
        );
        assert_eq!(
            "ConnectorReceived".parse::<AcknowledgeMode>(),
            Ok(AcknowledgeMode::ConnectorReceived)
        );
        assert_eq!("manual".parse::<AcknowledgeMode>(), Ok(AcknowledgeMode::Manual));
        assert!("sometimes".parse::<AcknowledgeMode>().is_err());
    }

    #[test]
    fn test_request_message_json() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/plain");
        headers.append("accept", "text/html");

        let message = RelayMessage::Request(ClientRequest {
            request_id: "r1".to_string(),
            origin_id: "o1".to_string(),
            tenant_id: "t1".to_string(),
            method: "POST".to_string(),
            url: "/upload?x=1".to_string(),
            headers,
            body: Some(BodyContent::Stored {
                id: "r1".to_string(),
                length: Some(42),
            }),
            acknowledge_mode: AcknowledgeMode::ConnectorReceived,
            client_ip: Some("10.0.0.1".to_string()),
        });

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json["Request"]["headers"],
            serde_json::json!([["Accept", ["text/plain", "text/html"]]])
        );
        assert_eq!(json["Request"]["body"]["Stored"]["length"], 42);

        let RelayMessage::Request(request) =
            serde_json::from_value::<RelayMessage>(json).unwrap()
        else {
            panic!("expected a request");
        };
        assert_eq!(request.headers.get_all("ACCEPT"), ["text/plain", "text/html"]);
    }

    #[test]
    fn test_heartbeat_is_a_bare_string() {
        let json = serde_json::to_string(&RelayMessage::Heartbeat).unwrap();
        assert_eq!(json, "\"Heartbeat\"");
    }
}
