//! WebSocket transport
//!
//! One io task owns the socket for its whole life, including reconnects, so
//! concurrent connects for a session cannot happen by construction. The
//! handle talks to the task over channels and publishes connection state on
//! a `watch`. A [`Transport`] trait fronts the handle so the session actor
//! can be tested with a channel-backed mock.

use crate::config::SessionConfig;
use crate::error::ConnectionError;
use crate::protocol::ClientMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection lifecycle as observed from outside the io task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// What the io task reports back to the session actor
#[derive(Debug)]
pub enum TransportEvent {
    /// Socket open; `epoch` increments on every successful (re)connect
    Opened { epoch: u64 },
    /// One text frame. `ordinal` restarts at 0 for each epoch.
    Frame { epoch: u64, ordinal: u64, text: String },
    StateChanged(ConnectionState),
    /// Socket gone; `clean` means a deliberate local disconnect or a
    /// normal-close frame from the server
    Closed { clean: bool },
    RetriesExhausted { attempts: u32 },
}

/// Seam between the session actor and the socket
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame. Fails fast when the socket is not open; frames are
    /// never queued across a disconnect.
    async fn send(&self, frame: &ClientMessage) -> Result<(), ConnectionError>;

    /// Close the socket deliberately. Suppresses reconnect.
    async fn disconnect(&self);

    fn state(&self) -> ConnectionState;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, frame: &ClientMessage) -> Result<(), ConnectionError> {
        (**self).send(frame).await
    }

    async fn disconnect(&self) {
        (**self).disconnect().await;
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }
}

type SendCmd = (String, oneshot::Sender<Result<(), ConnectionError>>);

/// Handle to the io task for one session's socket
pub struct WsTransport {
    outbound: mpsc::Sender<SendCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl WsTransport {
    /// Open the socket for `session_id` and spawn the io task.
    ///
    /// The first handshake happens inline so callers get an immediate
    /// [`ConnectionError::Handshake`] instead of a delayed event. Later
    /// disconnects are retried by the io task per the retry policy and
    /// surface as [`TransportEvent`]s on the returned receiver.
    pub async fn connect(
        config: &SessionConfig,
        session_id: &str,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), ConnectionError> {
        let url = ws_url(&config.endpoint, session_id)?;
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let io = IoTask {
            url,
            retry: config.retry.clone(),
            attempts: 0,
            events: event_tx,
            outbound: outbound_rx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(io.run(stream));

        Ok((
            Self {
                outbound: outbound_tx,
                state_rx,
                cancel,
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: &ClientMessage) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected {
                state: state.as_str(),
            });
        }
        let text =
            serde_json::to_string(frame).map_err(|e| ConnectionError::Socket(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbound
            .send((text, reply_tx))
            .await
            .map_err(|_| ConnectionError::NotConnected { state: "closed" })?;
        reply_rx
            .await
            .map_err(|_| ConnectionError::Socket("io task dropped the send".into()))?
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }
}

struct IoTask {
    url: String,
    retry: crate::config::RetryPolicy,
    attempts: u32,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Receiver<SendCmd>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// Why the read loop stopped
enum CloseKind {
    Deliberate,
    ServerClean,
    Unclean,
}

impl IoTask {
    async fn run(mut self, first_stream: WsStream) {
        let mut epoch: u64 = 0;
        let mut stream = Some(first_stream);

        loop {
            let Some(socket) = stream.take() else {
                // reconnect path
                match tokio_tungstenite::connect_async(self.url.as_str()).await {
                    Ok((s, _)) => stream = Some(s),
                    Err(e) => {
                        tracing::warn!(error = %e, "reconnect handshake failed");
                        if !self.backoff_or_fail().await {
                            return;
                        }
                        continue;
                    }
                }
                continue;
            };

            epoch += 1;
            self.attempts = 0;
            self.set_state(ConnectionState::Connected).await;
            let _ = self.events.send(TransportEvent::Opened { epoch }).await;
            tracing::info!(epoch, "websocket connected");

            let close = self.pump(socket, epoch).await;
            match close {
                CloseKind::Deliberate | CloseKind::ServerClean => {
                    self.set_state(ConnectionState::Disconnected).await;
                    let _ = self.events.send(TransportEvent::Closed { clean: true }).await;
                    return;
                }
                CloseKind::Unclean => {
                    let _ = self.events.send(TransportEvent::Closed { clean: false }).await;
                    if !self.backoff_or_fail().await {
                        return;
                    }
                }
            }
        }
    }

    /// Read/write loop for one connection epoch
    async fn pump(&mut self, socket: WsStream, epoch: u64) -> CloseKind {
        let (mut sink, mut source) = socket.split();
        let mut ordinal: u64 = 0;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return CloseKind::Deliberate;
                }
                cmd = self.outbound.recv() => {
                    let Some((text, reply)) = cmd else {
                        // handle dropped, treat as deliberate shutdown
                        let _ = sink.close().await;
                        return CloseKind::Deliberate;
                    };
                    let result = sink
                        .send(Message::Text(text))
                        .await
                        .map_err(|e| ConnectionError::Socket(e.to_string()));
                    let _ = reply.send(result);
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = self
                                .events
                                .send(TransportEvent::Frame { epoch, ordinal, text })
                                .await;
                            ordinal += 1;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let clean = frame
                                .as_ref()
                                .is_none_or(|f| f.code == CloseCode::Normal);
                            return if clean { CloseKind::ServerClean } else { CloseKind::Unclean };
                        }
                        Some(Ok(_)) => {
                            // binary / pong / raw frames carry nothing for us
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "websocket read error");
                            return CloseKind::Unclean;
                        }
                        None => return CloseKind::Unclean,
                    }
                }
            }
        }
    }

    /// Sleep out the backoff for the next attempt. Returns false when retries
    /// are exhausted or the transport was cancelled during the wait.
    async fn backoff_or_fail(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts > self.retry.max_attempts {
            self.set_state(ConnectionState::Failed).await;
            let _ = self
                .events
                .send(TransportEvent::RetriesExhausted {
                    attempts: self.retry.max_attempts,
                })
                .await;
            return false;
        }
        let attempt = self.attempts;
        self.set_state(ConnectionState::Reconnecting { attempt }).await;
        let delay = self.retry.delay_for(attempt);
        tracing::info!(attempt, ?delay, "reconnecting");
        tokio::select! {
            () = self.cancel.cancelled() => {
                self.set_state(ConnectionState::Disconnected).await;
                let _ = self.events.send(TransportEvent::Closed { clean: true }).await;
                false
            }
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
        let _ = self.events.send(TransportEvent::StateChanged(state)).await;
    }
}

/// Build the session URL, normalizing http(s) schemes to ws(s)
fn ws_url(endpoint: &str, session_id: &str) -> Result<String, ConnectionError> {
    let base = match endpoint {
        e if e.starts_with("ws://") || e.starts_with("wss://") => e.to_string(),
        e if e.starts_with("http://") => e.replacen("http://", "ws://", 1),
        e if e.starts_with("https://") => e.replacen("https://", "wss://", 1),
        other => {
            return Err(ConnectionError::InvalidEndpoint(other.to_string()));
        }
    };
    Ok(format!(
        "{}/ws/assist?run_id={session_id}",
        base.trim_end_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::time::Duration;

    /// Accept exactly one websocket connection, then drop it (and the
    /// listener) without a close frame. Reconnects get connection refused.
    async fn one_shot_server() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_async(stream).await;
        });
        addr
    }

    #[test]
    fn url_appends_route_and_run_id() {
        assert_eq!(
            ws_url("ws://localhost:8000", "abc").unwrap(),
            "ws://localhost:8000/ws/assist?run_id=abc"
        );
    }

    #[test]
    fn url_normalizes_http_schemes() {
        assert_eq!(
            ws_url("https://example.com/", "s1").unwrap(),
            "wss://example.com/ws/assist?run_id=s1"
        );
        assert_eq!(
            ws_url("http://example.com", "s1").unwrap(),
            "ws://example.com/ws/assist?run_id=s1"
        );
    }

    #[test]
    fn url_rejects_unknown_scheme() {
        assert!(matches!(
            ws_url("ftp://example.com", "s1"),
            Err(ConnectionError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_is_a_handshake_error() {
        let config = SessionConfig::new("ws://127.0.0.1:1");
        let result = WsTransport::connect(&config, "s1").await;
        assert!(matches!(result, Err(ConnectionError::Handshake(_))));
    }

    #[tokio::test]
    async fn retries_are_bounded_then_the_transport_fails() {
        let addr = one_shot_server().await;
        let mut config = SessionConfig::new(format!("ws://{addr}"));
        config.retry = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 2,
        };

        let (transport, mut events) = WsTransport::connect(&config, "s1").await.unwrap();

        let mut attempts_seen = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(TransportEvent::StateChanged(ConnectionState::Reconnecting {
                    attempt,
                }))) => attempts_seen.push(attempt),
                Ok(Some(TransportEvent::RetriesExhausted { attempts })) => {
                    assert_eq!(attempts, 2);
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("io task ended without exhausting retries"),
            }
        }
        assert_eq!(attempts_seen, vec![1, 2]);
        assert_eq!(transport.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn disconnect_during_backoff_stops_the_retry_loop() {
        let addr = one_shot_server().await;
        let mut config = SessionConfig::new(format!("ws://{addr}"));
        // long settle delay: the disconnect below lands inside the wait
        config.retry = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_attempts: 5,
        };

        let (transport, mut events) = WsTransport::connect(&config, "s1").await.unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(TransportEvent::Closed { clean: false })) => break,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("never saw the unclean close"),
            }
        }
        transport.disconnect().await;

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(TransportEvent::Closed { clean: true })) => break,
                Ok(Some(TransportEvent::RetriesExhausted { .. })) => {
                    panic!("kept retrying after a deliberate disconnect")
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("io task ended without a clean close"),
            }
        }
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_fails_fast_when_not_connected() {
        let (outbound, _outbound_rx) = mpsc::channel(1);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let transport = WsTransport {
            outbound,
            state_rx,
            cancel: CancellationToken::new(),
        };
        let err = transport
            .send(&ClientMessage::text_only("hi"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::NotConnected { state: "disconnected" }
        ));
    }
}
