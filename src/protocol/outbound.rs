//! Outbound (client -> server) message shapes

use serde::{Deserialize, Serialize};

/// Content encoding of an outbound file payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEncoding {
    Text,
    Base64,
}

/// One attached file, content inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFile {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    pub content: String,
    pub encoding: FileEncoding,
}

/// The single outbound frame shape. Clarification replies use the same
/// shape with no files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserMessage {
        text: String,
        #[serde(default)]
        files: Vec<OutboundFile>,
    },
}

impl ClientMessage {
    pub fn text_only(text: impl Into<String>) -> Self {
        ClientMessage::UserMessage {
            text: text.into(),
            files: Vec::new(),
        }
    }
}
