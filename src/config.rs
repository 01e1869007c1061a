//! Session configuration
//!
//! Policy values (retry caps, backoff base, file allow-list, size limits)
//! live here rather than in the core so deployments can tune them.

use crate::error::ValidationError;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one session client
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base endpoint, e.g. `wss://host` or `ws://localhost:8000`
    pub endpoint: String,
    pub retry: RetryPolicy,
    pub files: FilePolicy,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
            files: FilePolicy::default(),
        }
    }

    /// Read configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let endpoint =
            std::env::var("ORCHESTRA_ENDPOINT").unwrap_or_else(|_| "ws://localhost:8000".into());
        let mut config = Self::new(endpoint);
        if let Some(max) = env_parse("ORCHESTRA_MAX_RECONNECT_ATTEMPTS") {
            config.retry.max_attempts = max;
        }
        if let Some(ms) = env_parse("ORCHESTRA_RECONNECT_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_parse("ORCHESTRA_MAX_FILE_BYTES") {
            config.files.max_file_size_bytes = bytes;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Reconnect policy: delay grows linearly with the attempt count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Settle delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// File attachment policy: extension allow-list plus a per-file size cap
#[derive(Debug, Clone)]
pub struct FilePolicy {
    allowed_extensions: Vec<String>,
    /// Subset of the allow-list carried as UTF-8 text instead of base64
    text_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    /// Per-file ingestion timeout
    pub upload_timeout: Duration,
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: [
                "txt", "md", "csv", "json", "py", "pdf", "png", "jpg", "jpeg", "xlsx",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            text_extensions: ["txt", "md", "csv", "json", "py"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_file_size_bytes: 10 * 1024 * 1024,
            upload_timeout: Duration::from_secs(30),
        }
    }
}

impl FilePolicy {
    pub fn with_extensions(mut self, extensions: &[&str], text: &[&str]) -> Self {
        self.allowed_extensions = extensions.iter().map(|s| (*s).to_string()).collect();
        self.text_extensions = text.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Extensions accepted by [`FilePolicy::validate`]
    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    /// Pure pre-submission check; callable by the UI before any I/O
    pub fn validate(&self, name: &str, size_bytes: u64) -> Result<(), ValidationError> {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .ok_or(ValidationError::MissingExtension)?;

        if !self.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(ValidationError::UnsupportedExtension { extension });
        }
        if size_bytes > self.max_file_size_bytes {
            return Err(ValidationError::TooLarge {
                size_bytes,
                max_bytes: self.max_file_size_bytes,
            });
        }
        Ok(())
    }

    /// Whether a file should be carried as UTF-8 text rather than base64.
    ///
    /// Extension allow-list first, `mime_guess` as the tie-breaker for
    /// anything not listed either way.
    pub fn is_text_like(&self, name: &str) -> bool {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        match extension {
            Some(ext) if self.text_extensions.iter().any(|e| *e == ext) => true,
            Some(_) | None => mime_guess::from_path(name)
                .first()
                .is_some_and(|m| m.type_() == mime_guess::mime::TEXT),
        }
    }
}
