use crate::{link::Link, state::AppState, util::generate_id};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use rusty_relay_messages::RelayMessage;
use std::sync::Arc;
use tokio::{sync::mpsc, time};
use tokio_stream::StreamExt;

/// Messages queued for one connector before senders have to wait.
const OUTBOUND_CAPACITY: usize = 256;

pub async fn connect_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn send(socket: &mut WebSocket, message: &RelayMessage) -> bool {
    let Ok(text) = serde_json::to_string(message) else {
        tracing::error!("failed to serialize into JSON");
        return false;
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

/// Waits for the connector's `Hello` and checks its credentials.
async fn handshake(socket: &mut WebSocket, state: &AppState) -> Option<String> {
    let hello = time::timeout(state.config.handshake_timeout, async {
        while let Some(Ok(message)) = socket.next().await {
            match message {
                Message::Text(text) => return serde_json::from_str::<RelayMessage>(text.as_str()).ok(),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await;

    match hello {
        Ok(Some(RelayMessage::Hello {
            tenant_id,
            secret,
            connector_version,
        })) => {
            if state.authenticator.authenticate(&tenant_id, &secret).await {
                tracing::debug!(%tenant_id, "connector {connector_version} authenticated");
                Some(tenant_id)
            } else {
                tracing::info!(%tenant_id, "❌ connector provided invalid credentials");
                None
            }
        }
        Ok(_) => {
            tracing::debug!("❌ connector did not start with a hello");
            None
        }
        Err(_) => {
            tracing::info!("❌ connector handshake timed out");
            None
        }
    }
}

async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(tenant_id) = handshake(&mut socket, &state).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let connection_id = generate_id(12);
    let keep_alive = state.config.keep_alive_interval;
    let welcome = RelayMessage::Welcome {
        connection_id: connection_id.clone(),
        keep_alive_interval_ms: keep_alive.as_millis() as u64,
    };
    if !send(&mut socket, &welcome).await {
        tracing::error!(%tenant_id, "failed to send welcome to connector");
        return;
    }

    let (tx, mut rx_relay) = mpsc::channel(OUTBOUND_CAPACITY);
    let link = Arc::new(Link::new(&connection_id, &tenant_id, tx));
    let closed = link.closed_token();
    state.dispatcher.register_link(link.clone()).await;

    let mut heartbeat = time::interval(keep_alive);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                tracing::debug!(%connection_id, "link closed by relay");
                break;
            }
            _ = heartbeat.tick() => {
                if !send(&mut socket, &RelayMessage::Heartbeat).await {
                    tracing::error!(%connection_id, "failed to send heartbeat to connector");
                    break;
                }
            }
            Some(relay_message) = rx_relay.recv() => {
                if !send(&mut socket, &relay_message).await {
                    tracing::error!(%connection_id, "failed to send message to connector");
                    break;
                }
            }
            result = socket.next() => {
                let Some(result) = result else { break };
                link.touch();
                match result {
                    Ok(Message::Close(_)) => {
                        tracing::debug!("received websocket close message");
                        break;
                    }
                    Ok(Message::Text(message)) => {
                        handle_message(&state, &connection_id, &tenant_id, message.as_str()).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!("received websocket error: {}", err);
                        break;
                    }
                }
            }
        }
    }

    state.dispatcher.disconnect(&connection_id).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_message(state: &AppState, connection_id: &str, tenant_id: &str, message: &str) {
    let handled = match serde_json::from_str::<RelayMessage>(message) {
        Ok(RelayMessage::Response(response)) => {
            tracing::debug!(
                request_id = %response.request_id,
                status = response.status_code,
                "received response from connector"
            );
            state
                .dispatcher
                .handle_response(Some(connection_id), response)
                .await
        }
        Ok(RelayMessage::Acknowledge(ack)) => {
            state.dispatcher.handle_acknowledge(tenant_id, ack).await
        }
        Ok(RelayMessage::Heartbeat) => Ok(()),
        Ok(other) => {
            tracing::debug!(%connection_id, "ignoring unexpected message from connector: {other:?}");
            Ok(())
        }
        Err(err) => {
            tracing::error!(%connection_id, "failed to deserialize connector message: {err}");
            Ok(())
        }
    };

    if let Err(err) = handled {
        tracing::debug!(%connection_id, "connector message dropped: {err}");
    }
}
