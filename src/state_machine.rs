//! Session state machine
//!
//! Elm-style split: [`reduce`] is a deterministic, I/O-free reduction over
//! [`SessionState`]; it returns [`Effect`]s that the session actor executes
//! (sending frames, starting file ingestion, cancelling uploads).

mod effect;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use state::{
    AttachmentMeta, EventOrigin, FileUploadTask, LogEntry, LoggedEvent, SessionId, SessionInput,
    SessionPhase, SessionState, UploadStatus, UserMessage,
};
pub use transition::{reduce, TransitionError};
