//! File ingestion pipeline
//!
//! Attached files are validated up front (see [`crate::config::FilePolicy`]),
//! then read to completion and encoded for inline submission. There is no
//! chunked transfer: progress is reported at enqueue (0) and completion
//! (100), which is all a whole-file read can honestly offer.

use crate::config::FilePolicy;
use crate::error::UploadError;
use crate::protocol::{FileEncoding, OutboundFile};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A validated file waiting to be read and encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFile {
    pub task_id: Uuid,
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

impl QueuedFile {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            task_id: Uuid::new_v4(),
            path,
            name,
            size_bytes,
        }
    }
}

/// Progress and results flowing back to the session actor
#[derive(Debug)]
pub enum IngestUpdate {
    Progress { task_id: Uuid, pct: u8 },
    Done {
        task_id: Uuid,
        result: Result<OutboundFile, UploadError>,
    },
}

/// Encode raw bytes for the wire.
///
/// Text-like files ride as UTF-8 text; anything else (including a text-like
/// file that turns out not to be valid UTF-8) is base64.
pub fn encode_contents(policy: &FilePolicy, name: &str, bytes: Vec<u8>) -> (String, FileEncoding) {
    if policy.is_text_like(name) {
        match String::from_utf8(bytes) {
            Ok(text) => (text, FileEncoding::Text),
            Err(err) => (BASE64.encode(err.into_bytes()), FileEncoding::Base64),
        }
    } else {
        (BASE64.encode(bytes), FileEncoding::Base64)
    }
}

/// Read and encode the queued files, in enqueue order, reporting per-file
/// progress on `tx`. Files are independent: one failure never blocks the
/// rest. Cancellation fails every remaining task with a cancellation reason.
pub fn spawn_ingestion(
    policy: FilePolicy,
    files: Vec<QueuedFile>,
    tx: mpsc::Sender<IngestUpdate>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for file in files {
            if cancel.is_cancelled() {
                let _ = tx
                    .send(IngestUpdate::Done {
                        task_id: file.task_id,
                        result: Err(UploadError::Cancelled {
                            reason: "session disconnected".into(),
                        }),
                    })
                    .await;
                continue;
            }

            let _ = tx
                .send(IngestUpdate::Progress {
                    task_id: file.task_id,
                    pct: 0,
                })
                .await;

            let result = tokio::select! {
                () = cancel.cancelled() => Err(UploadError::Cancelled {
                    reason: "session disconnected".into(),
                }),
                read = tokio::time::timeout(policy.upload_timeout, tokio::fs::read(&file.path)) => {
                    match read {
                        Ok(Ok(bytes)) => {
                            let (content, encoding) = encode_contents(&policy, &file.name, bytes);
                            Ok(OutboundFile {
                                name: file.name.clone(),
                                size: file.size_bytes,
                                content_type: mime_guess::from_path(&file.name)
                                    .first_or_octet_stream()
                                    .essence_str()
                                    .to_string(),
                                content,
                                encoding,
                            })
                        }
                        Ok(Err(err)) => Err(UploadError::Read(err.to_string())),
                        Err(_) => Err(UploadError::Timeout {
                            seconds: policy.upload_timeout.as_secs(),
                        }),
                    }
                }
            };

            if let Err(err) = &result {
                tracing::warn!(file = %file.name, error = %err, "file ingestion failed");
            }
            let _ = tx
                .send(IngestUpdate::Done {
                    task_id: file.task_id,
                    result,
                })
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn policy() -> FilePolicy {
        FilePolicy::default()
    }

    async fn ingest_one(file: QueuedFile) -> Vec<IngestUpdate> {
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_ingestion(policy(), vec![file], tx, CancellationToken::new());
        handle.await.unwrap();
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn text_file_is_sent_as_text() {
        let mut tmp = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let file = QueuedFile::new(tmp.path(), 11);

        let updates = ingest_one(file).await;
        assert!(matches!(updates[0], IngestUpdate::Progress { pct: 0, .. }));
        let IngestUpdate::Done { result: Ok(out), .. } = &updates[1] else {
            panic!("expected successful encode");
        };
        assert_eq!(out.content, "hello world");
        assert_eq!(out.encoding, FileEncoding::Text);
        assert_eq!(out.content_type, "text/plain");
    }

    #[tokio::test]
    async fn binary_file_is_base64_encoded() {
        let mut tmp = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        tmp.write_all(&[0x89, 0x50, 0x4e, 0x47]).unwrap();
        let file = QueuedFile::new(tmp.path(), 4);

        let updates = ingest_one(file).await;
        let IngestUpdate::Done { result: Ok(out), .. } = &updates[1] else {
            panic!("expected successful encode");
        };
        assert_eq!(out.encoding, FileEncoding::Base64);
        assert_eq!(out.content, BASE64.encode([0x89, 0x50, 0x4e, 0x47]));
        assert_eq!(out.content_type, "image/png");
    }

    #[tokio::test]
    async fn missing_file_fails_only_its_own_task() {
        let mut ok = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        ok.write_all(b"fine").unwrap();
        let missing = QueuedFile::new("/nonexistent/nope.txt", 1);
        let good = QueuedFile::new(ok.path(), 4);
        let missing_id = missing.task_id;
        let good_id = good.task_id;

        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_ingestion(
            policy(),
            vec![missing, good],
            tx,
            CancellationToken::new(),
        );
        handle.await.unwrap();

        let mut done = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let IngestUpdate::Done { task_id, result } = update {
                done.push((task_id, result.is_ok()));
            }
        }
        // submission order equals enqueue order
        assert_eq!(done, vec![(missing_id, false), (good_id, true)]);
    }

    #[tokio::test]
    async fn cancellation_fails_remaining_tasks() {
        let mut tmp = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        tmp.write_all(b"data").unwrap();
        let file = QueuedFile::new(tmp.path(), 4);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(16);
        spawn_ingestion(policy(), vec![file], tx, cancel)
            .await
            .unwrap();

        let IngestUpdate::Done { result, .. } = rx.try_recv().unwrap() else {
            panic!("expected a terminal update");
        };
        assert!(matches!(result, Err(UploadError::Cancelled { .. })));
    }

    #[test]
    fn invalid_utf8_in_text_extension_falls_back_to_base64() {
        let (content, encoding) =
            encode_contents(&policy(), "notes.txt", vec![0xff, 0xfe, 0x00]);
        assert_eq!(encoding, FileEncoding::Base64);
        assert_eq!(content, BASE64.encode([0xff, 0xfe, 0x00]));
    }

    #[test]
    fn queued_file_takes_name_from_path() {
        let file = QueuedFile::new("/tmp/reports/q3.csv", 10);
        assert_eq!(file.name, "q3.csv");
    }
}
