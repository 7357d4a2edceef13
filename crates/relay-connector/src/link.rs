use crate::{backoff::Backoff, cli::Args, error::Error, executor::RequestExecutor};
use futures_util::{Sink, SinkExt, StreamExt};
use rand::{SeedableRng, rngs::StdRng};
use rusty_relay_messages::{BodyContent, LinkState, RelayMessage, TargetResponse};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::{AbortHandle, JoinSet},
    time::{self, Instant},
};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{self, Message, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 256;

/// How a session on an established link ended.
#[derive(Debug)]
enum SessionEnd {
    /// Drained after shutdown was requested.
    Closed,
    /// Transport failure, worth reconnecting.
    Lost(Error),
}

/// What the server handed out in its `Welcome`.
#[derive(Debug)]
struct Session {
    connection_id: String,
    keep_alive: Duration,
}

/// One physical link from this connector to the relay server. Reconnects
/// with backoff until `shutdown` is cancelled.
pub struct ConnectorLink {
    index: usize,
    args: Arc<Args>,
    executor: Arc<RequestExecutor>,
    tls: Option<Arc<rustls::ClientConfig>>,
    shutdown: CancellationToken,
    state: LinkState,
}

impl ConnectorLink {
    pub fn new(
        index: usize,
        args: Arc<Args>,
        executor: Arc<RequestExecutor>,
        tls: Option<Arc<rustls::ClientConfig>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            index,
            args,
            executor,
            tls,
            shutdown,
            state: LinkState::Connecting,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn transition(&mut self, state: LinkState) {
        tracing::debug!(link = self.index, "{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub async fn run(mut self) {
        let (min, max) = self.args.reconnect_delays();
        let mut backoff = Backoff::new(min, max);
        let mut rng = StdRng::from_entropy();

        loop {
            self.transition(LinkState::Connecting);
            let end = match self.connect().await {
                Ok(socket) => self.serve(socket, &mut backoff).await,
                Err(err) => SessionEnd::Lost(err),
            };

            match end {
                SessionEnd::Closed => break,
                SessionEnd::Lost(err) if self.shutdown.is_cancelled() => {
                    tracing::debug!(link = self.index, "link lost while shutting down: {err}");
                    break;
                }
                SessionEnd::Lost(err) => {
                    let delay = backoff.next_delay(&mut rng);
                    tracing::warn!(
                        link = self.index,
                        attempt = backoff.attempt(),
                        "🔌 link lost: {err}, reconnecting in {delay:?}"
                    );
                    self.transition(LinkState::Reconnecting);
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.transition(LinkState::Closed);
        tracing::info!(link = self.index, "👋 link closed");
    }

    async fn connect(&self) -> Result<Socket, Error> {
        let request = self.args.ws_url().into_client_request()?;
        let connector = self.tls.clone().map(Connector::Rustls);

        match connect_async_tls_with_config(request, None, false, connector).await {
            Ok((socket, _)) => Ok(socket),
            Err(tungstenite::Error::Http(response)) => {
                if let Some(body) = response.body() {
                    tracing::error!("❌ server refused the upgrade: {}", String::from_utf8_lossy(body));
                }
                Err(Error::Rejected)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn handshake(&mut self, socket: &mut Socket) -> Result<Session, Error> {
        self.transition(LinkState::Handshaking);
        let hello = RelayMessage::Hello {
            tenant_id: self.args.tenant.clone(),
            secret: self.args.secret.clone(),
            connector_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        socket
            .send(Message::Text(serde_json::to_string(&hello)?.into()))
            .await?;

        let welcome = time::timeout(self.args.handshake_timeout(), async {
            while let Some(message) = socket.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        return serde_json::from_str::<RelayMessage>(text.as_str())
                            .map_err(Error::from);
                    }
                    Ok(Message::Close(_)) => return Err(Error::Rejected),
                    Ok(_) => {}
                    Err(err) => return Err(Error::from(err)),
                }
            }
            Err(Error::Rejected)
        })
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        match welcome {
            RelayMessage::Welcome {
                connection_id,
                keep_alive_interval_ms,
            } => Ok(Session {
                connection_id,
                keep_alive: Duration::from_millis(keep_alive_interval_ms.max(1)),
            }),
            other => Err(Error::UnexpectedMessage(format!("{other:?}"))),
        }
    }

    /// Runs an established link until it drains or breaks.
    async fn serve(&mut self, mut socket: Socket, backoff: &mut Backoff) -> SessionEnd {
        let session = match self.handshake(&mut socket).await {
            Ok(session) => session,
            Err(err) => return SessionEnd::Lost(err),
        };
        let connection_id = session.connection_id;
        self.transition(LinkState::Active);
        backoff.reset();
        tracing::info!(link = self.index, %connection_id, "🔗 connected to {}", self.args.server);

        let (mut write, mut read) = socket.split();
        let (tx, mut rx) = mpsc::channel::<RelayMessage>(OUTBOUND_CAPACITY);
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<String, AbortHandle> = HashMap::new();

        let client_timeout = session.keep_alive * 2;
        let mut heartbeat = time::interval(session.keep_alive);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        let end = loop {
            let draining = self.state == LinkState::Draining;
            tokio::select! {
                _ = self.shutdown.cancelled(), if !draining => {
                    tracing::info!(link = self.index, in_flight = in_flight.len(), "draining link");
                    self.transition(LinkState::Draining);
                    if in_flight.is_empty() {
                        break SessionEnd::Closed;
                    }
                }
                _ = time::sleep_until(last_seen + client_timeout) => {
                    break SessionEnd::Lost(Error::LinkDead);
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = send(&mut write, &RelayMessage::Heartbeat).await {
                        break SessionEnd::Lost(err);
                    }
                }
                Some(message) = rx.recv() => {
                    if let Err(err) = send(&mut write, &message).await {
                        break SessionEnd::Lost(err);
                    }
                }
                Some(done) = tasks.join_next() => {
                    if let Ok(request_id) = done {
                        in_flight.remove(&request_id);
                    }
                    if draining && in_flight.is_empty() {
                        break SessionEnd::Closed;
                    }
                }
                message = read.next() => {
                    last_seen = Instant::now();
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            break SessionEnd::Lost(tungstenite::Error::ConnectionClosed.into());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => break SessionEnd::Lost(err.into()),
                    };

                    match serde_json::from_str::<RelayMessage>(text.as_str()) {
                        Ok(RelayMessage::Request(request)) if draining => {
                            tracing::debug!(request_id = %request.request_id, "refusing request while draining");
                            let mut response = TargetResponse::for_request(&request, 503);
                            response.body = Some(BodyContent::Inline(b"connector is shutting down".to_vec()));
                            let _ = tx.send(RelayMessage::Response(response)).await;
                        }
                        Ok(RelayMessage::Request(request)) => {
                            let request_id = request.request_id.clone();
                            let executor = self.executor.clone();
                            let tx = tx.clone();
                            let connection_id = connection_id.clone();
                            let id = request_id.clone();
                            let handle = tasks.spawn(async move {
                                executor.execute(request, &connection_id, tx).await;
                                id
                            });
                            in_flight.insert(request_id, handle);
                        }
                        Ok(RelayMessage::Cancel { request_id }) => {
                            if let Some(handle) = in_flight.remove(&request_id) {
                                tracing::info!(%request_id, "✋ request cancelled by relay");
                                handle.abort();
                            }
                            if draining && in_flight.is_empty() {
                                break SessionEnd::Closed;
                            }
                        }
                        Ok(RelayMessage::Heartbeat) => {}
                        Ok(other) => {
                            tracing::debug!(%connection_id, "ignoring unexpected message: {other:?}");
                        }
                        Err(err) => {
                            tracing::error!(%connection_id, "failed to deserialize relay message: {err}");
                        }
                    }
                }
            }
        };

        match end {
            SessionEnd::Closed => {
                while let Ok(message) = rx.try_recv() {
                    if send(&mut write, &message).await.is_err() {
                        break;
                    }
                }
                let _ = write.send(Message::Close(None)).await;
            }
            SessionEnd::Lost(_) => tasks.abort_all(),
        }
        end
    }
}

async fn send<S>(write: &mut S, message: &RelayMessage) -> Result<(), Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{WebSocketStream, accept_async};

    type ServerSocket = WebSocketStream<TcpStream>;

    fn args(addr: SocketAddr) -> Arc<Args> {
        let server = addr.to_string();
        Arc::new(Args::parse_from([
            "rusty-relay-connector",
            "--server",
            server.as_str(),
            "--tenant",
            "t1",
            "--secret",
            "s1",
            "--target",
            "http://127.0.0.1:1",
            "--insecure",
            "--reconnect-min-ms",
            "10",
            "--reconnect-max-ms",
            "20",
            "--handshake-timeout-ms",
            "500",
        ]))
    }

    fn link(addr: SocketAddr, shutdown: CancellationToken) -> ConnectorLink {
        let args = args(addr);
        let executor = RequestExecutor::new(
            &args.target,
            &args.http_url(),
            reqwest::Client::new(),
            args.inline_body_limit,
        );
        ConnectorLink::new(0, args, Arc::new(executor), None, shutdown)
    }

    async fn recv(ws: &mut ServerSocket) -> RelayMessage {
        loop {
            let message = time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no message from connector")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = message {
                match serde_json::from_str(text.as_str()).unwrap() {
                    RelayMessage::Heartbeat => continue,
                    message => return message,
                }
            }
        }
    }

    async fn send(ws: &mut ServerSocket, message: &RelayMessage) {
        let text = serde_json::to_string(message).unwrap();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Accepts the next link and completes its handshake.
    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        match recv(&mut ws).await {
            RelayMessage::Hello {
                tenant_id, secret, ..
            } => {
                assert_eq!(tenant_id, "t1");
                assert_eq!(secret, "s1");
            }
            other => panic!("expected hello, got {other:?}"),
        }
        send(
            &mut ws,
            &RelayMessage::Welcome {
                connection_id: "c1".to_string(),
                keep_alive_interval_ms: 60_000,
            },
        )
        .await;
        ws
    }

    fn request(id: &str) -> RelayMessage {
        RelayMessage::Request(rusty_relay_messages::ClientRequest {
            request_id: id.to_string(),
            origin_id: "o1".to_string(),
            tenant_id: "t1".to_string(),
            method: "GET".to_string(),
            url: "/".to_string(),
            headers: Default::default(),
            body: None,
            acknowledge_mode: Default::default(),
            client_ip: None,
        })
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drops_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(link(listener.local_addr().unwrap(), shutdown.clone()).run());

        let ws = accept(&listener).await;
        drop(ws);
        let _ws = accept(&listener).await;

        shutdown.cancel();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_target_answers_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(link(listener.local_addr().unwrap(), shutdown.clone()).run());

        let mut ws = accept(&listener).await;
        send(&mut ws, &request("r1")).await;

        match recv(&mut ws).await {
            RelayMessage::Response(response) => {
                assert_eq!(response.request_id, "r1");
                assert_eq!(response.status_code, 502);
            }
            other => panic!("expected response, got {other:?}"),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_draining_finishes_in_flight_and_refuses_new_requests() {
        use axum::{Router, routing};
        use tokio::sync::Notify;

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let target = {
            let (started, release) = (started.clone(), release.clone());
            Router::new().route(
                "/",
                routing::get(move || async move {
                    started.notify_one();
                    release.notified().await;
                    "done"
                }),
            )
        };
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(target_listener, target).await.unwrap() });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let args = args(listener.local_addr().unwrap());
        let executor = RequestExecutor::new(
            &format!("http://{target_addr}"),
            &args.http_url(),
            reqwest::Client::new(),
            args.inline_body_limit,
        );
        let link = ConnectorLink::new(0, args, Arc::new(executor), None, shutdown.clone());
        assert_eq!(link.state(), LinkState::Connecting);
        let task = tokio::spawn(link.run());

        let mut ws = accept(&listener).await;
        send(&mut ws, &request("r1")).await;
        started.notified().await;

        shutdown.cancel();
        // give the link a moment to observe the shutdown before the next request
        time::sleep(Duration::from_millis(50)).await;
        send(&mut ws, &request("r2")).await;
        match recv(&mut ws).await {
            RelayMessage::Response(response) => {
                assert_eq!(response.request_id, "r2");
                assert_eq!(response.status_code, 503);
            }
            other => panic!("expected response, got {other:?}"),
        }

        release.notify_one();
        match recv(&mut ws).await {
            RelayMessage::Response(response) => {
                assert_eq!(response.request_id, "r1");
                assert_eq!(response.status_code, 200);
                assert_eq!(response.body, Some(BodyContent::Inline(b"done".to_vec())));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let closed = time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake_backs_off_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(link(listener.local_addr().unwrap(), shutdown.clone()).run());

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        assert!(matches!(recv(&mut ws).await, RelayMessage::Hello { .. }));
        ws.close(None).await.unwrap();

        let _ws = accept(&listener).await;
        shutdown.cancel();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
