//! Bounded worker pool that backfills response bodies referenced by a
//! canonical result into `{prefix}_bodies.zip`. Generalizes the teacher's
//! `ScreenshotWorker::run_with_shared_receiver` shared-`Arc<Mutex<Receiver>>`
//! pattern from screenshot capture to body download.

use crate::error::AgentError;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub const MAX_WORKERS: usize = 10;

/// One body to fetch, keyed to the request that produced it.
#[derive(Debug, Clone)]
pub struct BodyRequest {
    pub request_id: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub request_id: String,
    pub bytes: Vec<u8>,
}

/// Fetches a single response body; abstracts the HTTP client so tests can
/// substitute a fixture fetcher without a network.
#[async_trait::async_trait]
pub trait BodyClient: Send + Sync {
    async fn fetch(&self, req: &BodyRequest) -> Result<Vec<u8>, AgentError>;
}

pub struct ReqwestBodyClient {
    client: reqwest::Client,
}

impl ReqwestBodyClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestBodyClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BodyClient for ReqwestBodyClient {
    async fn fetch(&self, req: &BodyRequest) -> Result<Vec<u8>, AgentError> {
        let mut builder = self.client.get(&req.url);
        for (name, value) in &req.headers {
            let lower = name.to_ascii_lowercase();
            if lower == "accept-encoding" || lower.starts_with(':') {
                continue;
            }
            builder = builder.header(name, value);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        if std::str::from_utf8(&bytes).is_err() {
            return Err(AgentError::JobMalformed(format!(
                "body for {} is not valid UTF-8",
                req.request_id
            )));
        }
        Ok(bytes.to_vec())
    }
}

pub struct BodyFetcher {
    worker_count: usize,
    processed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl BodyFetcher {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.clamp(1, MAX_WORKERS),
            processed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Download every queued body concurrently across the worker pool and
    /// append the successful ones to `archive_path` as stored entries named
    /// `NNN-{request_id}-body.txt`, `NNN` seeded from any existing archive.
    pub async fn fetch_all(
        &self,
        client: Arc<dyn BodyClient>,
        requests: Vec<BodyRequest>,
        archive_path: PathBuf,
    ) -> Result<usize, AgentError> {
        if requests.is_empty() {
            return Ok(0);
        }

        let (tx, rx) = mpsc::channel(requests.len().max(1));
        for req in requests {
            tx.send(req)
                .await
                .map_err(|_| AgentError::Fatal("body fetch queue closed early".into()))?;
        }
        drop(tx);

        let shared_rx = Arc::new(Mutex::new(rx));
        let (result_tx, mut result_rx) = mpsc::channel(self.worker_count * 4);

        let mut handles = Vec::new();
        for worker_id in 0..self.worker_count {
            let rx = shared_rx.clone();
            let tx = result_tx.clone();
            let client = client.clone();
            let processed = self.processed.clone();
            let failed = self.failed.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(req) = next else { break };
                    match client.fetch(&req).await {
                        Ok(bytes) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                            let _ = tx
                                .send(FetchedBody {
                                    request_id: req.request_id,
                                    bytes,
                                })
                                .await;
                        }
                        Err(err) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(worker_id, request_id = %req.request_id, %err, "body fetch failed");
                        }
                    }
                }
            }));
        }
        drop(result_tx);

        let mut fetched = Vec::new();
        while let Some(body) = result_rx.recv().await {
            fetched.push(body);
        }
        for handle in handles {
            let _ = handle.await;
        }

        if fetched.is_empty() {
            return Ok(0);
        }
        let count = fetched.len();
        append_bodies_to_archive(&archive_path, fetched)?;
        Ok(count)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

fn append_bodies_to_archive(path: &PathBuf, bodies: Vec<FetchedBody>) -> Result<(), AgentError> {
    let mut next_seq = existing_entry_count(path)?;

    let file = if path.exists() {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
    } else {
        std::fs::File::create(path)
    }
    .map_err(|e| AgentError::IoError(e.to_string()))?;

    let mut writer = if path.exists() && next_seq > 0 {
        zip::ZipWriter::new_append(file)
    } else {
        zip::ZipWriter::new(file)
    }
    .map_err(|e| AgentError::IoError(e.to_string()))?;

    let options: zip::write::FileOptions<()> =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    for body in bodies {
        let name = format!("{:03}-{}-body.txt", next_seq, body.request_id);
        writer
            .start_file(name, options)
            .map_err(|e| AgentError::IoError(e.to_string()))?;
        writer
            .write_all(&body.bytes)
            .map_err(|e| AgentError::IoError(e.to_string()))?;
        next_seq += 1;
    }

    writer
        .finish()
        .map_err(|e| AgentError::IoError(e.to_string()))?;
    debug!(archive = %path.display(), count = next_seq, "bodies archive updated");
    Ok(())
}

fn existing_entry_count(path: &PathBuf) -> Result<usize, AgentError> {
    if !path.exists() {
        return Ok(0);
    }
    let file = std::fs::File::open(path).map_err(|e| AgentError::IoError(e.to_string()))?;
    let archive =
        zip::ZipArchive::new(file).map_err(|e| AgentError::IoError(e.to_string()))?;
    Ok(archive.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FixtureClient {
        bodies: StdMutex<StdHashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl BodyClient for FixtureClient {
        async fn fetch(&self, req: &BodyRequest) -> Result<Vec<u8>, AgentError> {
            self.bodies
                .lock()
                .unwrap()
                .get(&req.request_id)
                .cloned()
                .ok_or_else(|| AgentError::TransientNetwork("missing fixture".into()))
        }
    }

    #[tokio::test]
    async fn fetches_and_archives_bodies() {
        let mut bodies = StdHashMap::new();
        bodies.insert("req1".to_string(), b"<html>ok</html>".to_vec());
        bodies.insert("req2".to_string(), b"{\"a\":1}".to_vec());
        let client: Arc<dyn BodyClient> = Arc::new(FixtureClient {
            bodies: StdMutex::new(bodies),
        });

        let fetcher = BodyFetcher::new(2);
        let dir = std::env::temp_dir().join(format!("body-fetcher-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let archive = dir.join("1_bodies.zip");

        let requests = vec![
            BodyRequest {
                request_id: "req1".into(),
                url: "http://example.com/".into(),
                headers: vec![("Accept-Encoding".into(), "gzip".into())],
            },
            BodyRequest {
                request_id: "req2".into(),
                url: "http://example.com/api".into(),
                headers: vec![],
            },
        ];

        let count = fetcher.fetch_all(client, requests, archive.clone()).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(fetcher.processed_count(), 2);
        assert_eq!(fetcher.failed_count(), 0);

        let file = std::fs::File::open(&archive).unwrap();
        let archive_read = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive_read.len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn worker_count_is_clamped_to_pool_maximum() {
        let fetcher = BodyFetcher::new(50);
        assert_eq!(fetcher.worker_count, MAX_WORKERS);
    }
}
