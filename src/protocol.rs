//! Wire protocol
//!
//! Inbound frames are JSON objects tagged by a string `"event"` field;
//! outbound frames are `user_message` payloads. Unknown inbound tags are
//! tolerated so newer backends never crash an older client.

pub mod event;
mod outbound;

pub use event::{ArtifactItem, Event};
pub use outbound::{ClientMessage, FileEncoding, OutboundFile};
