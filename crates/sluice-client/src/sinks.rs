use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sluice_core::error::AppError;
use sluice_core::models::Hit;
use sluice_core::traits::HitSink;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::transport_error;

/// Appends hits to a file as JSON lines.
///
/// With de-duplication enabled, a hit whose fingerprint was already written
/// (in this run or found in the file when it was opened) is skipped.
pub struct FileHitSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    seen: Option<Mutex<HashSet<String>>>,
}

impl FileHitSink {
    pub async fn open(path: impl AsRef<Path>, dedupe: bool) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();

        let seen = if dedupe {
            Some(Mutex::new(load_fingerprints(&path).await?))
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            seen,
        })
    }

    /// Record the fingerprint; false if it was already present.
    fn first_sighting(&self, hit: &Hit) -> bool {
        match &self.seen {
            Some(seen) => seen
                .lock()
                .unwrap_or_else(|poisoned| {
                    tracing::warn!("Hit sink fingerprint mutex was poisoned, recovering");
                    PoisonError::into_inner(poisoned)
                })
                .insert(hit.fingerprint()),
            None => true,
        }
    }
}

async fn load_fingerprints(path: &Path) -> Result<HashSet<String>, AppError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };

    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str::<Hit>(line).ok())
        .map(|hit| hit.fingerprint())
        .collect())
}

#[async_trait]
impl HitSink for FileHitSink {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn store(&self, hit: &Hit) -> Result<(), AppError> {
        if !self.first_sighting(hit) {
            tracing::debug!(sink = %self.name(), data = %hit.data, "Duplicate hit skipped");
            return Ok(());
        }

        let mut line = serde_json::to_string(hit)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::SinkError {
                sink: self.name(),
                message: e.to_string(),
            })?;
        file.flush().await.map_err(|e| AppError::SinkError {
            sink: self.name(),
            message: e.to_string(),
        })
    }
}

/// POSTs every hit as JSON to a URL.
#[derive(Clone)]
pub struct WebhookHitSink {
    client: Client,
    url: String,
    timeout_secs: u64,
}

impl WebhookHitSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl HitSink for WebhookHitSink {
    fn name(&self) -> String {
        format!("webhook:{}", self.url)
    }

    async fn store(&self, hit: &Hit) -> Result<(), AppError> {
        let sink_error = |message: String| AppError::SinkError {
            sink: self.name(),
            message,
        };

        let response = self
            .client
            .post(&self.url)
            .json(hit)
            .send()
            .await
            .map_err(|e| sink_error(transport_error(&e, self.timeout_secs).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(sink_error(format!("HTTP {}", status.as_u16())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sluice_core::models::HitKind;
    use uuid::Uuid;

    use super::*;
    use crate::test_server::serve_once;

    fn hit(data: &str, kind: HitKind) -> Hit {
        Hit {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            data: data.to_string(),
            kind,
            captured: serde_json::Map::new(),
            proxy: None,
            date: Utc::now(),
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hits.jsonl");
        let sink = FileHitSink::open(&path, true).await.unwrap();

        sink.store(&hit("alice:pw", HitKind::Success)).await.unwrap();
        sink.store(&hit("alice:pw", HitKind::Success)).await.unwrap();
        sink.store(&hit("alice:pw", HitKind::ToCheck)).await.unwrap();

        let written = lines(&path);
        assert_eq!(written.len(), 2);
        let first: Hit = serde_json::from_str(&written[0]).unwrap();
        assert_eq!(first.data, "alice:pw");
        assert_eq!(first.kind, HitKind::Success);
    }

    #[tokio::test]
    async fn test_file_sink_dedupes_against_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hits.jsonl");

        let first_run = FileHitSink::open(&path, true).await.unwrap();
        first_run.store(&hit("bob:pw", HitKind::Success)).await.unwrap();
        drop(first_run);

        let second_run = FileHitSink::open(&path, true).await.unwrap();
        second_run.store(&hit("bob:pw", HitKind::Success)).await.unwrap();
        second_run.store(&hit("carol:pw", HitKind::Success)).await.unwrap();

        assert_eq!(lines(&path).len(), 2);
    }

    #[tokio::test]
    async fn test_file_sink_without_dedupe_keeps_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hits.jsonl");
        let sink = FileHitSink::open(&path, false).await.unwrap();

        for _ in 0..3 {
            sink.store(&hit("dave:pw", HitKind::Success)).await.unwrap();
        }
        assert_eq!(lines(&path).len(), 3);
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_hit() {
        let url = serve_once("204 No Content", "").await;
        let sink = WebhookHitSink::new(&url, Duration::from_secs(5)).unwrap();
        sink.store(&hit("erin:pw", HitKind::Success)).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_sink_rejects_error_status() {
        let url = serve_once("500 Internal Server Error", "").await;
        let sink = WebhookHitSink::new(&url, Duration::from_secs(5)).unwrap();

        let err = sink.store(&hit("frank:pw", HitKind::Success)).await.unwrap_err();
        assert!(matches!(err, AppError::SinkError { .. }));
        assert!(err.to_string().contains("HTTP 500"));
    }
}
