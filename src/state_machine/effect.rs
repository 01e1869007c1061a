//! Effects produced by reductions, executed by the session actor

use crate::files::QueuedFile;
use crate::protocol::ClientMessage;

/// I/O the actor must perform after a reduction.
///
/// The reducer itself never touches the socket or the filesystem.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hand a frame to the transport
    SendFrame(ClientMessage),
    /// Start reading and encoding the queued files, in order
    IngestFiles(Vec<QueuedFile>),
    /// Cancel in-flight ingestion (disconnect, failure)
    CancelUploads { reason: String },
}
