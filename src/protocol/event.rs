//! Inbound events and the frame decoder

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One artifact reference as the backend reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_url: Option<String>,
}

/// Typed inbound event, decoded from a tagged JSON frame.
///
/// The `upload.*` variants are normally produced locally by the ingestion
/// pipeline but are accepted on the wire as well.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    /// The orchestrator entered a graph node
    #[serde(rename = "node")]
    NodeEntered { name: String, step: Option<u64> },
    /// Backend paused the run and wants more input from the human
    #[serde(rename = "clarify")]
    ClarificationRequested { question: String },
    /// Planner produced the markdown TODO breakdown
    #[serde(rename = "todos")]
    TodosProduced { markdown: String },
    /// Executor generated a code cell
    #[serde(rename = "code")]
    CodeProduced {
        text: String,
        filename: Option<String>,
    },
    #[serde(rename = "sandbox.stdout")]
    StdoutChunk { text: String },
    #[serde(rename = "sandbox.stderr")]
    StderrChunk { text: String },
    /// Final artifact references for the finished run
    #[serde(rename = "answer.artifacts")]
    ArtifactsProduced { items: Vec<ArtifactItem> },
    /// Terminal answer for the current turn
    #[serde(rename = "answer")]
    FinalAnswer { text: String },
    /// Explicit error from the backend; closes the turn, keeps the session
    #[serde(rename = "error")]
    BackendError { detail: String },
    #[serde(rename = "upload.progress")]
    UploadProgress { file_name: String, pct: u8 },
    #[serde(rename = "upload.completed")]
    UploadCompleted { file_name: String },
    #[serde(rename = "upload.failed")]
    UploadFailed { file_name: String, error: String },
}

// Per-tag payload shapes. Field names follow the backend's frames, which do
// not always match the variant fields (`code` carries its text under "code").

#[derive(Deserialize)]
struct NodePayload {
    name: String,
    #[serde(default)]
    step: Option<u64>,
}

#[derive(Deserialize)]
struct ClarifyPayload {
    question: String,
}

#[derive(Deserialize)]
struct TodosPayload {
    markdown: String,
}

#[derive(Deserialize)]
struct CodePayload {
    #[serde(alias = "code")]
    text: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize)]
struct TextPayload {
    text: String,
}

#[derive(Deserialize)]
struct ArtifactsPayload {
    #[serde(default)]
    items: Vec<ArtifactItem>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    detail: String,
}

#[derive(Deserialize)]
struct UploadProgressPayload {
    file_name: String,
    pct: u8,
}

#[derive(Deserialize)]
struct UploadCompletedPayload {
    file_name: String,
}

#[derive(Deserialize)]
struct UploadFailedPayload {
    file_name: String,
    error: String,
}

fn payload<T: serde::de::DeserializeOwned>(tag: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::malformed(tag, e))
}

impl Event {
    /// Decode one raw frame.
    ///
    /// Dispatches on the `"event"` discriminator. An unrecognized tag yields
    /// [`DecodeError::UnknownEvent`]; a recognized tag with a bad payload
    /// yields [`DecodeError::MalformedEvent`]. Neither is fatal to the
    /// connection.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DecodeError::malformed("<unparseable>", e))?;

        let tag = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::malformed("<untagged>", "missing \"event\" field"))?
            .to_string();

        match tag.as_str() {
            "node" => payload::<NodePayload>(&tag, value)
                .map(|p| Event::NodeEntered {
                    name: p.name,
                    step: p.step,
                }),
            "clarify" => payload::<ClarifyPayload>(&tag, value)
                .map(|p| Event::ClarificationRequested { question: p.question }),
            "todos" => payload::<TodosPayload>(&tag, value)
                .map(|p| Event::TodosProduced { markdown: p.markdown }),
            "code" => payload::<CodePayload>(&tag, value).map(|p| Event::CodeProduced {
                text: p.text,
                filename: p.filename,
            }),
            "sandbox.stdout" => {
                payload::<TextPayload>(&tag, value).map(|p| Event::StdoutChunk { text: p.text })
            }
            "sandbox.stderr" => {
                payload::<TextPayload>(&tag, value).map(|p| Event::StderrChunk { text: p.text })
            }
            "answer" => {
                payload::<TextPayload>(&tag, value).map(|p| Event::FinalAnswer { text: p.text })
            }
            "answer.artifacts" => payload::<ArtifactsPayload>(&tag, value)
                .map(|p| Event::ArtifactsProduced { items: p.items }),
            "error" => {
                payload::<ErrorPayload>(&tag, value).map(|p| Event::BackendError { detail: p.detail })
            }
            "upload.progress" => {
                payload::<UploadProgressPayload>(&tag, value).map(|p| Event::UploadProgress {
                    file_name: p.file_name,
                    pct: p.pct,
                })
            }
            "upload.completed" => payload::<UploadCompletedPayload>(&tag, value)
                .map(|p| Event::UploadCompleted { file_name: p.file_name }),
            "upload.failed" => {
                payload::<UploadFailedPayload>(&tag, value).map(|p| Event::UploadFailed {
                    file_name: p.file_name,
                    error: p.error,
                })
            }
            _ => Err(DecodeError::UnknownEvent { tag }),
        }
    }

    /// Wire discriminator for this event
    pub fn tag(&self) -> &'static str {
        match self {
            Event::NodeEntered { .. } => "node",
            Event::ClarificationRequested { .. } => "clarify",
            Event::TodosProduced { .. } => "todos",
            Event::CodeProduced { .. } => "code",
            Event::StdoutChunk { .. } => "sandbox.stdout",
            Event::StderrChunk { .. } => "sandbox.stderr",
            Event::ArtifactsProduced { .. } => "answer.artifacts",
            Event::FinalAnswer { .. } => "answer",
            Event::BackendError { .. } => "error",
            Event::UploadProgress { .. } => "upload.progress",
            Event::UploadCompleted { .. } => "upload.completed",
            Event::UploadFailed { .. } => "upload.failed",
        }
    }

    /// Events that target an upload task rather than a turn
    pub fn is_upload(&self) -> bool {
        matches!(
            self,
            Event::UploadProgress { .. } | Event::UploadCompleted { .. } | Event::UploadFailed { .. }
        )
    }

    /// Events that close the open turn
    pub fn is_outcome(&self) -> bool {
        matches!(self, Event::FinalAnswer { .. } | Event::BackendError { .. })
    }
}
