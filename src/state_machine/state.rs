//! Session state types and the event log

use crate::error::{DecodeError, UploadError};
use crate::files::QueuedFile;
use crate::protocol::{Event, OutboundFile};
use crate::transport::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Opaque conversation identity, immutable for the lifetime of one client.
///
/// The backend resumes context by this id across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Session phase
// ============================================================================

/// Where the session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    /// Connected and ready for the next user action
    Connected,
    /// A turn is in flight, waiting for its terminal outcome
    AwaitingOutcome,
    /// Backend paused the turn pending a human clarification
    AwaitingClarification,
    /// Unclean close; transport is retrying with backoff
    Reconnecting { attempt: u32 },
    /// Deliberate disconnect
    Disconnected,
    /// Retries exhausted; terminal until a fresh connect
    Failed,
}

impl SessionPhase {
    /// Whether the underlying socket is usable for sends
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionPhase::Connected
                | SessionPhase::AwaitingOutcome
                | SessionPhase::AwaitingClarification
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Failed)
    }
}

// ============================================================================
// Event log
// ============================================================================

/// A user action as recorded in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    /// True when this message answers a pending clarification; the turn it
    /// opens is a child of the suspended turn.
    #[serde(default)]
    pub clarification: bool,
}

/// Attachment metadata kept in the log (content rides the wire, not the log)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub size_bytes: u64,
}

/// One entry in the session event log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    /// Opens a turn
    User(UserMessage),
    /// A decoded server event, or a locally synthesized upload event
    Server(Event),
    /// Unclean close happened while a turn was unclosed
    Interrupted,
    /// Client-local terminal outcome for the open turn
    LocalError { detail: String },
}

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum EventOrigin {
    /// Delivered by the transport; `conn_ordinal` resets to zero per
    /// connection epoch and is gapless within it.
    Server { epoch: u64, conn_ordinal: u64 },
    Local,
}

/// An immutable, ordered log record. `ordinal` is the global position and is
/// strictly increasing for the lifetime of the session; arrival order is the
/// single source of truth for turn reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedEvent {
    pub ordinal: u64,
    pub origin: EventOrigin,
    pub received_at: DateTime<Utc>,
    pub entry: LogEntry,
}

// ============================================================================
// Upload tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Encoding,
    Uploading,
    Completed,
    Failed,
}

/// Lifecycle of one attached file from enqueue to settled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileUploadTask {
    pub id: Uuid,
    pub name: String,
    pub size_bytes: u64,
    pub mime_hint: String,
    pub status: UploadStatus,
    pub progress_pct: u8,
    pub error: Option<String>,
}

impl FileUploadTask {
    pub fn is_settled(&self) -> bool {
        matches!(self.status, UploadStatus::Completed | UploadStatus::Failed)
    }
}

/// A user message waiting for its attachments to finish encoding before the
/// frame goes out.
#[derive(Debug, Clone)]
pub(crate) struct PendingSubmission {
    pub text: String,
    pub expected: Vec<Uuid>,
    pub settled: HashSet<Uuid>,
    pub encoded: Vec<OutboundFile>,
}

impl PendingSubmission {
    pub fn is_settled(&self) -> bool {
        self.settled.len() == self.expected.len()
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Everything that can drive a reduction: transport lifecycle, decoded
/// frames, user intents, and ingestion results.
#[derive(Debug)]
pub enum SessionInput {
    ConnectRequested,
    TransportOpened {
        epoch: u64,
    },
    TransportClosed {
        clean: bool,
    },
    TransportReconnecting {
        attempt: u32,
    },
    TransportFailed {
        attempts: u32,
    },
    FrameDecoded {
        epoch: u64,
        conn_ordinal: u64,
        event: Event,
    },
    FrameRejected {
        error: DecodeError,
    },
    UserSubmit {
        text: String,
        files: Vec<QueuedFile>,
    },
    UserClarification {
        text: String,
    },
    UploadProgress {
        task_id: Uuid,
        pct: u8,
    },
    UploadFinished {
        task_id: Uuid,
        result: Result<OutboundFile, UploadError>,
    },
    /// The actor failed to hand a frame to the transport
    SendFailed {
        detail: String,
    },
    DisconnectRequested,
}

// ============================================================================
// Session state
// ============================================================================

/// Reducer bookkeeping for the turn that is currently unclosed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenTurn {
    /// Ordinal of the opening `User` entry; doubles as the turn id
    pub id: u64,
    pub suspended: bool,
    pub interrupted: bool,
}

/// Complete mutable state for one session.
///
/// One instance per `SessionId`; sessions never share state.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: SessionId,
    pub connection: ConnectionState,
    pub phase: SessionPhase,
    pub log: Vec<LoggedEvent>,
    pub uploads: Vec<FileUploadTask>,
    /// Question surfaced by the last `ClarificationRequested`
    pub pending_question: Option<String>,
    /// Frames that failed to decode (logged and skipped, never fatal)
    pub decode_errors: u64,
    /// Server events that arrived with no turn unclosed
    pub protocol_violations: u64,

    pub(crate) next_ordinal: u64,
    pub(crate) open_turn: Option<OpenTurn>,
    pub(crate) pending_submission: Option<PendingSubmission>,
    /// Out-of-turn server events, buffered until the next turn opens
    pub(crate) buffered: Vec<Event>,
    pub(crate) current_epoch: u64,
    pub(crate) expected_conn_ordinal: u64,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            connection: ConnectionState::Disconnected,
            phase: SessionPhase::Idle,
            log: Vec::new(),
            uploads: Vec::new(),
            pending_question: None,
            decode_errors: 0,
            protocol_violations: 0,
            next_ordinal: 0,
            open_turn: None,
            pending_submission: None,
            buffered: Vec::new(),
            current_epoch: 0,
            expected_conn_ordinal: 0,
        }
    }

    /// Append an entry, stamping the next global ordinal
    pub(crate) fn push(&mut self, origin: EventOrigin, entry: LogEntry) -> u64 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.log.push(LoggedEvent {
            ordinal,
            origin,
            received_at: Utc::now(),
            entry,
        });
        ordinal
    }

    pub(crate) fn push_local(&mut self, entry: LogEntry) -> u64 {
        self.push(EventOrigin::Local, entry)
    }

    pub(crate) fn task_mut(&mut self, task_id: Uuid) -> Option<&mut FileUploadTask> {
        self.uploads.iter_mut().find(|t| t.id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_strictly_increasing_and_gapless() {
        let mut state = SessionState::new(SessionId::new("s1"));
        for i in 0..5 {
            let ordinal = state.push_local(LogEntry::Server(Event::StdoutChunk {
                text: format!("line {i}"),
            }));
            assert_eq!(ordinal, i);
        }
        let ordinals: Vec<u64> = state.log.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn phase_connectivity() {
        assert!(SessionPhase::AwaitingOutcome.is_connected());
        assert!(!SessionPhase::Reconnecting { attempt: 2 }.is_connected());
        assert!(SessionPhase::Failed.is_terminal());
    }
}
