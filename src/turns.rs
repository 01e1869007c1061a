//! Turn projection over the event log
//!
//! A turn is one logical round: a user action through to its terminal
//! outcome or suspension. [`group_turns`] is a pure function of the log;
//! re-running it on the same log yields a structurally identical result, so
//! the UI can re-derive the turn list after every append.

use crate::protocol::{ArtifactItem, Event};
use crate::state_machine::{LogEntry, LoggedEvent, UserMessage};
use serde::Serialize;
use std::path::Path;

/// Identity of a turn: the global ordinal of the log entry that opened it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TurnId(pub u64);

/// Terminal outcome of a closed turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// `FinalAnswer` from the backend
    Answer { text: String },
    /// Explicit `BackendError`; the session itself stays usable
    Backend { detail: String },
    /// Client-local failure (all attachments failed, send failed, abandoned)
    Local { detail: String },
}

/// One intermediate progress event within a turn.
///
/// `ordinal` is the 1-based position within the owning turn, independent of
/// the global log ordinal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStep {
    pub ordinal: u32,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Code,
    Document,
    Chart,
}

/// A named, typed content object produced during a turn and retained for
/// later display. References content; never a second copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub content: String,
    pub language: Option<String>,
    pub filename: Option<String>,
    pub producing_turn: TurnId,
}

/// One derived turn. Never stored; always re-derived from the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub id: TurnId,
    /// Set on clarification replies: the suspended turn this one continues
    pub parent: Option<TurnId>,
    pub user: UserMessage,
    pub steps: Vec<ExecutionStep>,
    pub outcome: Option<TurnOutcome>,
    pub artifacts: Vec<Artifact>,
    pub is_open: bool,
    /// Suspended by a clarification request; unclosed but no longer open
    pub suspended: bool,
    /// A connection was lost while this turn was unclosed
    pub interrupted: bool,
}

impl Turn {
    fn open(id: TurnId, parent: Option<TurnId>, user: UserMessage) -> Self {
        Self {
            id,
            parent,
            user,
            steps: Vec::new(),
            outcome: None,
            artifacts: Vec::new(),
            is_open: true,
            suspended: false,
            interrupted: false,
        }
    }

    fn push_step(&mut self, event: Event) {
        let ordinal = u32::try_from(self.steps.len()).map_or(u32::MAX, |n| n + 1);
        self.steps.push(ExecutionStep { ordinal, event });
    }

    fn push_artifact(&mut self, kind: ArtifactKind, content: String, language: Option<String>, filename: Option<String>) {
        let id = format!("{}-{}", self.id.0, self.artifacts.len() + 1);
        self.artifacts.push(Artifact {
            id,
            kind,
            content,
            language,
            filename,
            producing_turn: self.id,
        });
    }

    fn close(&mut self, outcome: TurnOutcome) {
        self.outcome = Some(outcome);
        self.is_open = false;
    }
}

/// Group the log into ordered turns.
///
/// Artifacts attach to the turn whose open window contains the producing
/// event's global ordinal: a turn's window runs from its opening user entry
/// until the next user entry or its terminal outcome.
pub fn group_turns(log: &[LoggedEvent]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    // Index of the turn whose window is active (covers suspended turns until
    // the clarification reply opens the child).
    let mut window: Option<usize> = None;
    let mut last_suspended: Option<TurnId> = None;

    for logged in log {
        match &logged.entry {
            LogEntry::User(message) => {
                let parent = if message.clarification {
                    last_suspended
                } else {
                    None
                };
                turns.push(Turn::open(TurnId(logged.ordinal), parent, message.clone()));
                window = Some(turns.len() - 1);
            }

            LogEntry::Server(event) => {
                // Upload events track task state, not turn content.
                if event.is_upload() {
                    continue;
                }
                let Some(index) = window else {
                    // Orphans cannot normally appear: the reducer buffers
                    // out-of-turn events until a turn opens.
                    continue;
                };
                let turn = &mut turns[index];
                match event {
                    Event::ClarificationRequested { .. } => {
                        turn.suspended = true;
                        turn.is_open = false;
                        last_suspended = Some(turn.id);
                    }
                    Event::FinalAnswer { text } => {
                        turn.close(TurnOutcome::Answer { text: text.clone() });
                        window = None;
                    }
                    Event::BackendError { detail } => {
                        turn.close(TurnOutcome::Backend {
                            detail: detail.clone(),
                        });
                        window = None;
                    }
                    Event::CodeProduced { text, filename } => {
                        let language = filename.as_deref().and_then(language_for);
                        turn.push_artifact(
                            ArtifactKind::Code,
                            text.clone(),
                            language.map(str::to_string),
                            filename.clone(),
                        );
                        turn.push_step(event.clone());
                    }
                    Event::ArtifactsProduced { items } => {
                        for item in items {
                            let (kind, content) = classify_item(item);
                            turn.push_artifact(kind, content, None, Some(item.name.clone()));
                        }
                    }
                    _ => turn.push_step(event.clone()),
                }
            }

            LogEntry::Interrupted => {
                if let Some(index) = window {
                    turns[index].interrupted = true;
                }
            }

            LogEntry::LocalError { detail } => {
                if let Some(index) = window {
                    turns[index].close(TurnOutcome::Local {
                        detail: detail.clone(),
                    });
                    window = None;
                }
            }
        }
    }

    turns
}

/// Kind and display reference for a backend-reported artifact
fn classify_item(item: &ArtifactItem) -> (ArtifactKind, String) {
    let extension = Path::new(&item.name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    let kind = match extension.as_deref() {
        Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp") => ArtifactKind::Chart,
        _ => ArtifactKind::Document,
    };
    let content = item
        .view_url
        .clone()
        .or_else(|| item.path.clone())
        .unwrap_or_else(|| item.name.clone());
    (kind, content)
}

fn language_for(filename: &str) -> Option<&'static str> {
    match Path::new(filename).extension().and_then(|e| e.to_str())? {
        "py" => Some("python"),
        "rs" => Some("rust"),
        "js" => Some("javascript"),
        "ts" => Some("typescript"),
        "sh" => Some("bash"),
        "sql" => Some("sql"),
        _ => None,
    }
}
