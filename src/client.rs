//! Session client actor
//!
//! One tokio task per session owns the transport, the reducer state, and the
//! upload pipeline. Callers talk to it over a command channel and observe it
//! through a `watch`-published [`SessionSnapshot`]; protocol logic stays
//! single-threaded inside the actor.

use crate::config::SessionConfig;
use crate::error::{ConnectionError, ValidationError};
use crate::files::{spawn_ingestion, IngestUpdate, QueuedFile};
use crate::protocol::Event;
use crate::state_machine::{
    reduce, Effect, FileUploadTask, SessionId, SessionInput, SessionPhase, SessionState,
    TransitionError,
};
use crate::transport::{ConnectionState, Transport, TransportEvent, WsTransport};
use crate::turns::{group_turns, Turn};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Errors surfaced synchronously to callers of [`SessionClient`] methods.
///
/// Everything asynchronous (decode failures, reconnects, upload errors)
/// shows up in the snapshot instead.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Rejected(#[from] TransitionError),

    #[error("file {name}: {source}")]
    InvalidFile {
        name: String,
        source: ValidationError,
    },

    #[error("cannot stat {name}: {detail}")]
    Unreadable { name: String, detail: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("session actor is gone")]
    ActorGone,
}

/// Immutable view of the session, rebuilt after every reduction
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub phase: SessionPhase,
    pub turns: Vec<Turn>,
    pub pending_question: Option<String>,
    pub uploads: Vec<FileUploadTask>,
    pub decode_errors: u64,
    pub protocol_violations: u64,
}

impl SessionSnapshot {
    fn of(state: &SessionState) -> Self {
        Self {
            connection: state.connection,
            phase: state.phase.clone(),
            turns: group_turns(&state.log),
            pending_question: state.pending_question.clone(),
            uploads: state.uploads.clone(),
            decode_errors: state.decode_errors,
            protocol_violations: state.protocol_violations,
        }
    }
}

/// Seam for opening transports, so tests can hand the actor a mock.
///
/// Transport events flow into `events`, the actor's single inbound channel;
/// epoch stamping lets the reducer drop frames from a superseded socket.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
        session_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, ConnectionError>;
}

/// Production connector backed by [`WsTransport`]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
        session_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        let (transport, mut rx) = WsTransport::connect(config, session_id).await?;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(Arc::new(transport))
    }
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    SendMessage {
        text: String,
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    SendClarification {
        text: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one session's actor task
pub struct SessionClient {
    cmd: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl SessionClient {
    /// Spawn the actor for `session_id`. Must be called within a tokio
    /// runtime; the socket is not opened until [`SessionClient::connect`].
    pub fn new(config: SessionConfig, session_id: SessionId) -> Self {
        Self::with_connector(config, session_id, Arc::new(WsConnector))
    }

    pub fn with_connector(
        config: SessionConfig,
        session_id: SessionId,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let state = SessionState::new(session_id);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::of(&state));
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (ingest_tx, ingest_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);

        let actor = Actor {
            config,
            connector,
            state,
            snapshot: snapshot_tx,
            events_tx,
            ingest_tx,
            transport: None,
            upload_cancel: None,
        };
        tokio::spawn(actor.run(cmd_rx, events_rx, ingest_rx));

        Self {
            cmd: cmd_tx,
            snapshot_rx,
        }
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Submit a user message, optionally with file attachments.
    ///
    /// Attachments are validated against the file policy before anything is
    /// read; a rejected file fails the whole call and nothing is sent.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        paths: Vec<PathBuf>,
    ) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, paths, reply })
            .await
    }

    /// Answer a pending clarification question
    pub async fn send_clarification(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| Command::SendClarification { text, reply })
            .await
    }

    /// Deliberate disconnect: no reconnect, in-flight uploads cancelled
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch the snapshot; a new value is published after every reduction
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), ClientError>>) -> Command,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(make(reply))
            .await
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }
}

struct Actor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: SessionState,
    snapshot: watch::Sender<SessionSnapshot>,
    events_tx: mpsc::Sender<TransportEvent>,
    ingest_tx: mpsc::Sender<IngestUpdate>,
    transport: Option<Arc<dyn Transport>>,
    upload_cancel: Option<CancellationToken>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmds: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut ingest: mpsc::Receiver<IngestUpdate>,
    ) {
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    let Some(cmd) = cmd else {
                        // every handle dropped; tear down like a disconnect
                        if let Some(transport) = &self.transport {
                            transport.disconnect().await;
                        }
                        return;
                    };
                    self.handle_command(cmd).await;
                }
                Some(event) = events.recv() => {
                    self.handle_transport_event(event).await;
                }
                Some(update) = ingest.recv() => {
                    self.handle_ingest(update).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let _ = reply.send(self.do_connect().await);
            }
            Command::SendMessage { text, paths, reply } => {
                let _ = reply.send(self.do_send_message(text, paths).await);
            }
            Command::SendClarification { text, reply } => {
                let result = self
                    .apply(SessionInput::UserClarification { text })
                    .await
                    .map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                if let Some(transport) = self.transport.take() {
                    transport.disconnect().await;
                }
                let _ = self.apply(SessionInput::DisconnectRequested).await;
                let _ = reply.send(());
            }
        }
    }

    async fn do_connect(&mut self) -> Result<(), ClientError> {
        // One socket per session: a live transport (connected, waiting for
        // its Opened event, or reconnecting on its own) coalesces further
        // connect calls into a no-op.
        if self.transport.is_some() || self.state.phase == SessionPhase::Connecting {
            return Ok(());
        }
        self.apply(SessionInput::ConnectRequested).await?;
        let session_id = self.state.session_id.as_str().to_string();
        match self
            .connector
            .connect(&self.config, &session_id, self.events_tx.clone())
            .await
        {
            Ok(transport) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(err) => {
                // inline handshake failures count as a failed connection,
                // not a retryable transport event
                let _ = self.apply(SessionInput::TransportFailed { attempts: 0 }).await;
                Err(err.into())
            }
        }
    }

    async fn do_send_message(
        &mut self,
        text: String,
        paths: Vec<PathBuf>,
    ) -> Result<(), ClientError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| ClientError::Unreadable {
                    name: name.clone(),
                    detail: e.to_string(),
                })?;
            self.config
                .files
                .validate(&name, meta.len())
                .map_err(|source| ClientError::InvalidFile {
                    name: name.clone(),
                    source,
                })?;
            files.push(QueuedFile::new(path, meta.len()));
        }
        self.apply(SessionInput::UserSubmit { text, files }).await?;
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let input = match event {
            TransportEvent::Opened { epoch } => SessionInput::TransportOpened { epoch },
            TransportEvent::Frame { epoch, ordinal, text } => match Event::decode(&text) {
                Ok(event) => SessionInput::FrameDecoded {
                    epoch,
                    conn_ordinal: ordinal,
                    event,
                },
                Err(error) => SessionInput::FrameRejected { error },
            },
            TransportEvent::StateChanged(ConnectionState::Reconnecting { attempt }) => {
                SessionInput::TransportReconnecting { attempt }
            }
            TransportEvent::StateChanged(_) => return,
            TransportEvent::Closed { clean } => {
                if clean {
                    self.transport = None;
                }
                SessionInput::TransportClosed { clean }
            }
            TransportEvent::RetriesExhausted { attempts } => {
                self.transport = None;
                SessionInput::TransportFailed { attempts }
            }
        };
        let _ = self.apply(input).await;
    }

    async fn handle_ingest(&mut self, update: IngestUpdate) {
        let input = match update {
            IngestUpdate::Progress { task_id, pct } => SessionInput::UploadProgress { task_id, pct },
            IngestUpdate::Done { task_id, result } => SessionInput::UploadFinished { task_id, result },
        };
        let _ = self.apply(input).await;
    }

    /// Reduce one input, execute its effects, publish the new snapshot
    async fn apply(&mut self, input: SessionInput) -> Result<(), TransitionError> {
        let effects = reduce(&mut self.state, input)?;
        for effect in effects {
            self.execute(effect).await;
        }
        self.snapshot.send_replace(SessionSnapshot::of(&self.state));
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::SendFrame(frame) => {
                let result = match &self.transport {
                    Some(transport) => transport.send(&frame).await,
                    None => Err(ConnectionError::NotConnected { state: "no transport" }),
                };
                if let Err(err) = result {
                    tracing::warn!(error = %err, "frame send failed");
                    let _ = reduce(
                        &mut self.state,
                        SessionInput::SendFailed {
                            detail: err.to_string(),
                        },
                    );
                }
            }
            Effect::IngestFiles(files) => {
                let cancel = CancellationToken::new();
                self.upload_cancel = Some(cancel.clone());
                spawn_ingestion(self.config.files.clone(), files, self.ingest_tx.clone(), cancel);
            }
            Effect::CancelUploads { reason } => {
                tracing::info!(reason, "cancelling in-flight uploads");
                if let Some(cancel) = self.upload_cancel.take() {
                    cancel.cancel();
                }
            }
        }
    }
}
