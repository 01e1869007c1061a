//! Orchestra Client - realtime orchestration session client
//!
//! Client-side session layer for a WebSocket orchestration backend: a
//! reconnecting transport, a tagged-event decoder, a file ingestion
//! pipeline, and a deterministic reducer whose append-only event log is
//! projected into turns for the UI.
//!
//! The entry point is [`SessionClient`]; everything asynchronous
//! (reconnects, decode failures, upload progress) surfaces through the
//! [`SessionSnapshot`] it publishes on a `watch` channel.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

pub mod client;
pub mod config;
pub mod error;
pub mod files;
pub mod protocol;
pub mod state_machine;
pub mod transport;
pub mod turns;

pub use client::{ClientError, Connector, SessionClient, SessionSnapshot};
pub use config::{FilePolicy, RetryPolicy, SessionConfig};
pub use error::{ConnectionError, DecodeError, UploadError, ValidationError};
pub use protocol::{ArtifactItem, ClientMessage, Event, FileEncoding, OutboundFile};
pub use state_machine::{SessionId, SessionPhase};
pub use transport::{ConnectionState, Transport, TransportEvent, WsTransport};
pub use turns::{Artifact, ArtifactKind, ExecutionStep, Turn, TurnId, TurnOutcome};
