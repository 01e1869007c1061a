//! Deterministic reduction over the session state
//!
//! [`reduce`] never performs I/O. Given the same starting state and input
//! sequence it produces the same log, phase, and effects; the session actor
//! executes the effects.

use super::effect::Effect;
use super::state::{
    AttachmentMeta, EventOrigin, FileUploadTask, LogEntry, OpenTurn, PendingSubmission,
    SessionInput, SessionPhase, SessionState, UploadStatus, UserMessage,
};
use crate::protocol::{ClientMessage, Event};
use crate::transport::ConnectionState;
use std::collections::HashSet;
use thiserror::Error;

/// Rejected inputs. These are caller errors surfaced synchronously; they
/// never change session state.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("a turn is already in flight; wait for its outcome")]
    Busy,
    #[error("no clarification is pending")]
    NoPendingClarification,
    #[error("session is not connected")]
    NotConnected,
}

/// Apply one input, returning the effects the actor must run.
pub fn reduce(
    state: &mut SessionState,
    input: SessionInput,
) -> Result<Vec<Effect>, TransitionError> {
    match input {
        SessionInput::ConnectRequested => {
            // A second connect while one is in flight coalesces to a no-op.
            if matches!(
                state.phase,
                SessionPhase::Idle | SessionPhase::Disconnected | SessionPhase::Failed
            ) {
                state.phase = SessionPhase::Connecting;
                state.connection = ConnectionState::Connecting;
            }
            Ok(vec![])
        }

        SessionInput::TransportOpened { epoch } => {
            state.current_epoch = epoch;
            state.expected_conn_ordinal = 0;
            state.connection = ConnectionState::Connected;
            // A turn that was open at disconnect time stays open. If it was
            // suspended on an unanswered question, the question survives the
            // reconnect and the reply is still accepted.
            state.phase = if state.pending_question.is_some()
                && state.open_turn.is_some_and(|t| t.suspended)
            {
                SessionPhase::AwaitingClarification
            } else {
                SessionPhase::Connected
            };
            tracing::info!(session_id = %state.session_id, epoch, "session connected");
            Ok(vec![])
        }

        SessionInput::TransportClosed { clean } => {
            // Any close while a turn is unclosed cuts its stream short; the
            // turn is not auto-closed, the human decides later whether to
            // retry or abandon it.
            flag_open_turn_interrupted(state);
            if clean {
                state.phase = SessionPhase::Disconnected;
                state.connection = ConnectionState::Disconnected;
                Ok(fail_pending_uploads(state, "cancelled by disconnect"))
            } else {
                Ok(vec![])
            }
        }

        SessionInput::TransportReconnecting { attempt } => {
            state.phase = SessionPhase::Reconnecting { attempt };
            state.connection = ConnectionState::Reconnecting { attempt };
            Ok(vec![])
        }

        SessionInput::TransportFailed { attempts } => {
            tracing::warn!(
                session_id = %state.session_id,
                attempts,
                "connection failed, retries exhausted"
            );
            state.phase = SessionPhase::Failed;
            state.connection = ConnectionState::Failed;
            Ok(fail_pending_uploads(state, "connection failed"))
        }

        SessionInput::FrameDecoded {
            epoch,
            conn_ordinal,
            event,
        } => {
            if epoch != state.current_epoch {
                tracing::warn!(
                    session_id = %state.session_id,
                    frame_epoch = epoch,
                    current_epoch = state.current_epoch,
                    "dropping frame from a stale connection"
                );
                return Ok(vec![]);
            }
            if conn_ordinal != state.expected_conn_ordinal {
                tracing::warn!(
                    session_id = %state.session_id,
                    expected = state.expected_conn_ordinal,
                    got = conn_ordinal,
                    "connection ordinal gap"
                );
            }
            state.expected_conn_ordinal = conn_ordinal + 1;
            apply_server_event(state, EventOrigin::Server { epoch, conn_ordinal }, event)
        }

        SessionInput::FrameRejected { error } => {
            state.decode_errors += 1;
            tracing::warn!(
                session_id = %state.session_id,
                tag = error.tag(),
                error = %error,
                "skipping undecodable frame"
            );
            Ok(vec![])
        }

        SessionInput::UserSubmit { text, files } => {
            match state.phase {
                SessionPhase::Connected => {}
                SessionPhase::AwaitingOutcome | SessionPhase::AwaitingClarification => {
                    return Err(TransitionError::Busy);
                }
                _ => return Err(TransitionError::NotConnected),
            }

            // A new action abandons a turn left open by an interruption.
            if state.open_turn.take().is_some() {
                state.push_local(LogEntry::LocalError {
                    detail: "abandoned after connection interruption".into(),
                });
            }

            let attachments: Vec<AttachmentMeta> = files
                .iter()
                .map(|f| AttachmentMeta {
                    name: f.name.clone(),
                    size_bytes: f.size_bytes,
                })
                .collect();
            let id = state.push_local(LogEntry::User(UserMessage {
                text: text.clone(),
                attachments,
                clarification: false,
            }));
            state.open_turn = Some(OpenTurn {
                id,
                suspended: false,
                interrupted: false,
            });
            state.phase = SessionPhase::AwaitingOutcome;
            drain_buffered(state);

            if files.is_empty() {
                Ok(vec![Effect::SendFrame(ClientMessage::UserMessage {
                    text,
                    files: vec![],
                })])
            } else {
                let expected: Vec<_> = files.iter().map(|f| f.task_id).collect();
                for file in &files {
                    state.uploads.push(FileUploadTask {
                        id: file.task_id,
                        name: file.name.clone(),
                        size_bytes: file.size_bytes,
                        mime_hint: mime_guess::from_path(&file.name)
                            .first_or_octet_stream()
                            .essence_str()
                            .to_string(),
                        status: UploadStatus::Queued,
                        progress_pct: 0,
                        error: None,
                    });
                }
                state.pending_submission = Some(PendingSubmission {
                    text,
                    expected,
                    settled: HashSet::new(),
                    encoded: Vec::new(),
                });
                Ok(vec![Effect::IngestFiles(files)])
            }
        }

        SessionInput::UserClarification { text } => {
            if state.phase != SessionPhase::AwaitingClarification {
                return Err(TransitionError::NoPendingClarification);
            }
            // The suspended parent stays unclosed in the log; the reply opens
            // a child turn which becomes the only open turn.
            let id = state.push_local(LogEntry::User(UserMessage {
                text: text.clone(),
                attachments: vec![],
                clarification: true,
            }));
            state.open_turn = Some(OpenTurn {
                id,
                suspended: false,
                interrupted: false,
            });
            state.pending_question = None;
            state.phase = SessionPhase::AwaitingOutcome;
            drain_buffered(state);
            Ok(vec![Effect::SendFrame(ClientMessage::text_only(text))])
        }

        SessionInput::UploadProgress { task_id, pct } => {
            let Some(task) = state.task_mut(task_id) else {
                tracing::warn!(%task_id, "progress for unknown upload task");
                return Ok(vec![]);
            };
            task.status = UploadStatus::Encoding;
            task.progress_pct = pct;
            let file_name = task.name.clone();
            state.push_local(LogEntry::Server(Event::UploadProgress { file_name, pct }));
            Ok(vec![])
        }

        SessionInput::UploadFinished { task_id, result } => {
            let Some(task) = state.task_mut(task_id) else {
                tracing::warn!(%task_id, "result for unknown upload task");
                return Ok(vec![]);
            };
            let file_name = task.name.clone();
            let encoded = match result {
                Ok(file) => {
                    task.status = UploadStatus::Completed;
                    task.progress_pct = 100;
                    state.push_local(LogEntry::Server(Event::UploadCompleted { file_name }));
                    Some(file)
                }
                Err(error) => {
                    task.status = UploadStatus::Failed;
                    task.error = Some(error.to_string());
                    state.push_local(LogEntry::Server(Event::UploadFailed {
                        file_name,
                        error: error.to_string(),
                    }));
                    None
                }
            };
            if let Some(pending) = &mut state.pending_submission {
                pending.settled.insert(task_id);
                if let Some(file) = encoded {
                    pending.encoded.push(file);
                }
            }
            Ok(finalize_submission(state))
        }

        SessionInput::SendFailed { detail } => {
            if state.open_turn.take().is_some() {
                state.push_local(LogEntry::LocalError { detail });
                if matches!(
                    state.phase,
                    SessionPhase::AwaitingOutcome | SessionPhase::AwaitingClarification
                ) {
                    state.phase = SessionPhase::Connected;
                }
                state.pending_question = None;
            }
            Ok(vec![])
        }

        SessionInput::DisconnectRequested => {
            flag_open_turn_interrupted(state);
            state.phase = SessionPhase::Disconnected;
            state.connection = ConnectionState::Disconnected;
            Ok(fail_pending_uploads(state, "cancelled by disconnect"))
        }
    }
}

/// Apply one decoded server event per the turn rules
fn apply_server_event(
    state: &mut SessionState,
    origin: EventOrigin,
    event: Event,
) -> Result<Vec<Effect>, TransitionError> {
    // Upload events target tasks, not turns; they are never out-of-turn.
    if event.is_upload() {
        apply_wire_upload(state, &event);
        state.push(origin, LogEntry::Server(event));
        return Ok(vec![]);
    }

    let Some(open) = state.open_turn else {
        // Protocol violation: buffered, never dropped. Drained into the
        // next turn that opens.
        tracing::warn!(
            session_id = %state.session_id,
            tag = event.tag(),
            "server event with no open turn, buffering"
        );
        state.protocol_violations += 1;
        state.buffered.push(event);
        return Ok(vec![]);
    };

    match &event {
        Event::ClarificationRequested { question } => {
            state.pending_question = Some(question.clone());
            if let Some(open) = &mut state.open_turn {
                open.suspended = true;
            }
            state.phase = SessionPhase::AwaitingClarification;
            state.push(origin, LogEntry::Server(event));
        }
        Event::FinalAnswer { .. } | Event::BackendError { .. } => {
            state.push(origin, LogEntry::Server(event));
            state.open_turn = None;
            state.pending_question = None;
            state.phase = SessionPhase::Connected;
        }
        _ => {
            // Execution progress. A resumed backend can keep streaming into
            // an interrupted turn after reconnect; that moves the session
            // back to awaiting its outcome.
            state.push(origin, LogEntry::Server(event));
            if state.phase == SessionPhase::Connected && !open.suspended {
                state.phase = SessionPhase::AwaitingOutcome;
            }
        }
    }
    Ok(vec![])
}

/// Mark the open turn interrupted, logging the marker once per interruption
fn flag_open_turn_interrupted(state: &mut SessionState) {
    if let Some(open) = &mut state.open_turn {
        if !open.interrupted {
            open.interrupted = true;
            state.push_local(LogEntry::Interrupted);
        }
    }
}

/// Mirror a wire-reported upload event onto the matching task, if any
fn apply_wire_upload(state: &mut SessionState, event: &Event) {
    let name = match event {
        Event::UploadProgress { file_name, .. }
        | Event::UploadCompleted { file_name }
        | Event::UploadFailed { file_name, .. } => file_name,
        _ => return,
    };
    let Some(task) = state
        .uploads
        .iter_mut()
        .find(|t| t.name == *name && !t.is_settled())
    else {
        return;
    };
    match event {
        Event::UploadProgress { pct, .. } => {
            task.status = UploadStatus::Uploading;
            task.progress_pct = *pct;
        }
        Event::UploadCompleted { .. } => {
            task.status = UploadStatus::Completed;
            task.progress_pct = 100;
        }
        Event::UploadFailed { error, .. } => {
            task.status = UploadStatus::Failed;
            task.error = Some(error.clone());
        }
        _ => {}
    }
}

/// Once every attachment has settled, either send the frame (text plus the
/// files that made it) or close the turn locally when nothing is sendable.
fn finalize_submission(state: &mut SessionState) -> Vec<Effect> {
    let settled = state
        .pending_submission
        .as_ref()
        .is_some_and(PendingSubmission::is_settled);
    if !settled {
        return vec![];
    }
    let Some(pending) = state.pending_submission.take() else {
        return vec![];
    };

    if pending.text.trim().is_empty() && pending.encoded.is_empty() {
        state.push_local(LogEntry::LocalError {
            detail: "all attachments failed and the message had no text".into(),
        });
        state.open_turn = None;
        state.phase = SessionPhase::Connected;
        return vec![];
    }

    vec![Effect::SendFrame(ClientMessage::UserMessage {
        text: pending.text,
        files: pending.encoded,
    })]
}

/// Fail unsettled tasks and drop the pending submission
fn fail_pending_uploads(state: &mut SessionState, reason: &str) -> Vec<Effect> {
    let had_pending = state.pending_submission.take().is_some();
    let mut failed_names = Vec::new();
    for task in &mut state.uploads {
        if !task.is_settled() {
            task.status = UploadStatus::Failed;
            task.error = Some(reason.to_string());
            failed_names.push(task.name.clone());
        }
    }
    for file_name in failed_names {
        state.push_local(LogEntry::Server(Event::UploadFailed {
            file_name,
            error: reason.to_string(),
        }));
    }
    if had_pending {
        vec![Effect::CancelUploads {
            reason: reason.to_string(),
        }]
    } else {
        vec![]
    }
}

/// Move buffered out-of-turn events into the freshly opened turn's window
fn drain_buffered(state: &mut SessionState) {
    if state.buffered.is_empty() {
        return;
    }
    let buffered = std::mem::take(&mut state.buffered);
    tracing::debug!(
        session_id = %state.session_id,
        count = buffered.len(),
        "draining buffered out-of-turn events"
    );
    for event in buffered {
        state.push_local(LogEntry::Server(event));
    }
}
