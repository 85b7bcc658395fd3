//! Packages a completed task/job into `result.zip` and delivers it by
//! whichever route the job's output routing names: object storage, the
//! coordinator's multipart `workdone.php`, or a pub-sub retry/completion
//! queue. Grounded on the dispatcher's reqwest client construction and on
//! the teacher's worker-pool archive-writing shape reused in
//! `body_fetcher.rs`.

use crate::config::{Job, OutputRouting};
use crate::error::AgentError;
use async_trait::async_trait;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One file staged for inclusion in the result archive.
pub struct StagedFile {
    pub path: PathBuf,
    pub archive_name: String,
}

/// Object-storage backend for blob-routed uploads. A concrete implementation
/// (GCS, S3, …) lives outside this crate.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), AgentError>;
}

/// Publish-and-wait queue used for the pubsub retry/completion paths. An
/// HTTP-POST-backed implementation stands in for a managed pub-sub SDK so no
/// fabricated dependency is required.
#[async_trait]
pub trait ResultQueue: Send + Sync {
    async fn publish(&self, payload: &str) -> Result<(), AgentError>;
}

pub struct HttpResultQueue {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpResultQueue {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ResultQueue for HttpResultQueue {
    async fn publish(&self, payload: &str) -> Result<(), AgentError> {
        self.client
            .post(&self.endpoint)
            .header("Content-Type", "text/plain")
            .body(payload.to_string())
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Blob,
    Server,
}

pub struct ResultAssembler {
    client: reqwest::Client,
    global_origin: String,
}

impl ResultAssembler {
    pub fn new(global_origin: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            global_origin: global_origin.into(),
        }
    }

    /// Zip `staged` into `out_path` using stored (uncompressed) entries.
    pub fn assemble_zip(&self, staged: &[StagedFile], out_path: &Path) -> Result<(), AgentError> {
        let file = std::fs::File::create(out_path).map_err(|e| AgentError::IoError(e.to_string()))?;
        let mut writer = zip::ZipWriter::new(file);
        let options: zip::write::FileOptions<()> =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        for entry in staged {
            let bytes = std::fs::read(&entry.path).map_err(|e| AgentError::IoError(e.to_string()))?;
            writer
                .start_file(&entry.archive_name, options)
                .map_err(|e| AgentError::IoError(e.to_string()))?;
            writer
                .write_all(&bytes)
                .map_err(|e| AgentError::IoError(e.to_string()))?;
        }
        writer.finish().map_err(|e| AgentError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Deliver an assembled archive per the job's output routing, then run
    /// the retry/completion queue and cleanup steps. `run`/`cached`/`done`
    /// describe the specific shard being uploaded when sharded per-step
    /// delivery is in use; pass `(0, false, true)` for a whole-job upload.
    pub async fn finalize(
        &self,
        job: &Job,
        zip_path: &Path,
        success: bool,
        run: u32,
        cached: bool,
        done: bool,
        blob_store: Option<&dyn BlobStore>,
        retry_queue: Option<&dyn ResultQueue>,
        completion_queue: Option<&dyn ResultQueue>,
    ) -> Result<UploadOutcome, AgentError> {
        let bytes = std::fs::read(zip_path).map_err(|e| AgentError::IoError(e.to_string()))?;

        let outcome = match &job.output {
            OutputRouting::Blob { bucket, path } => {
                let store = blob_store.ok_or_else(|| {
                    AgentError::Fatal("job routes to blob storage but no BlobStore configured".into())
                })?;
                let object_path = format!("{path}/{}.zip", job.test_id);
                store.put(bucket, &object_path, bytes).await?;
                UploadOutcome::Blob
            }
            OutputRouting::Server => {
                self.upload_to_workdone(job, bytes, run, cached, done).await?;
                UploadOutcome::Server
            }
        };

        if !success {
            if let Some(queue) = retry_queue {
                if let Err(err) = queue.publish(&job.raw_payload).await {
                    warn!(test_id = %job.test_id, %err, "failed to publish retry-queue payload");
                }
            }
        } else if let Some(queue) = completion_queue {
            let summary = serde_json::json!({
                "test_id": job.test_id,
                "signature": job.signature,
                "success": success,
            })
            .to_string();
            if let Err(err) = queue.publish(&summary).await {
                warn!(test_id = %job.test_id, %err, "failed to publish completion-queue payload");
            }
        }

        Ok(outcome)
    }

    async fn upload_to_workdone(
        &self,
        job: &Job,
        bytes: Vec<u8>,
        run: u32,
        cached: bool,
        done: bool,
    ) -> Result<(), AgentError> {
        let mut query = vec![
            ("id".to_string(), job.test_id.clone()),
            ("testinfo".to_string(), "1".to_string()),
            ("done".to_string(), if done { "1" } else { "0" }.to_string()),
            ("run".to_string(), run.to_string()),
            ("cached".to_string(), if cached { "1" } else { "0" }.to_string()),
        ];
        if !job.signature.is_empty() {
            query.push(("sig".to_string(), job.signature.clone()));
        }

        let primary = format!("{}/workdone.php", job.work_server.trim_end_matches('/'));
        match self
            .post_multipart(&primary, &query, build_result_form(&bytes)?)
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(origin = %primary, %err, "workdone upload to job origin failed, falling back");
            }
        }

        let fallback = format!("{}/workdone.php", self.global_origin.trim_end_matches('/'));
        self.post_multipart(&fallback, &query, build_result_form(&bytes)?).await
    }

    async fn post_multipart(
        &self,
        url: &str,
        query: &[(String, String)],
        form: reqwest::multipart::Form,
    ) -> Result<(), AgentError> {
        let response = self
            .client
            .post(url)
            .query(query)
            .multipart(form)
            .timeout(std::time::Duration::from_secs(600))
            .send()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentError::UploadFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        info!(url, "result upload completed");
        Ok(())
    }

    /// Remove a task or job working directory after upload, logging but not
    /// failing on removal errors.
    pub fn cleanup_dir(&self, dir: &Path) {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), %err, "failed to remove working directory");
            }
        }
    }
}

/// `reqwest::multipart::Form` has no `Clone`, so the fallback-origin retry
/// rebuilds it from the same archive bytes rather than reusing one instance.
fn build_result_form(bytes: &[u8]) -> Result<reqwest::multipart::Form, AgentError> {
    let part = reqwest::multipart::Part::bytes(bytes.to_vec())
        .file_name("result.zip")
        .mime_str("application/zip")
        .map_err(|e| AgentError::Fatal(e.to_string()))?;
    Ok(reqwest::multipart::Form::new().part("file", part))
}

pub fn generate_test_info(job: &Job, staged_runs: &[(u32, bool, bool)], completed_unix: i64) -> String {
    let steps = staged_runs.len().max(1);
    let done_runs = staged_runs.iter().filter(|(_, _, done)| *done).count();
    format!(
        "{{\"id\":\"{}\",\"completed\":{},\"steps\":{},\"runs_done\":{}}}",
        job.test_id, completed_unix, steps, done_runs
    )
}

pub fn generate_test_info_ini(job: &Job, completed_unix: i64) -> String {
    format!("[test]\nid={}\ncompleted={}\n", job.test_id, completed_unix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobState, NetworkConfig, Viewport};
    use std::collections::HashMap;

    fn sample_job() -> Job {
        Job {
            test_id: "t1".into(),
            signature: "sig".into(),
            work_server: "http://origin.example/".into(),
            scheduler_job_id: None,
            runs: 1,
            first_view_only: true,
            warmup_runs: 0,
            viewport: Viewport::default(),
            timeout_seconds: 60,
            activity_timeout_ms: 2000,
            max_requests: None,
            stop_at_onload: false,
            video_enabled: false,
            tcpdump_enabled: false,
            keep_video: false,
            network: NetworkConfig::default(),
            cpu_throttle: 1.0,
            url: Some("http://example.com/".into()),
            script: None,
            headers: HashMap::new(),
            cookies: Vec::new(),
            host_overrides: HashMap::new(),
            custom_metrics: HashMap::new(),
            extensions: Vec::new(),
            output: OutputRouting::Server,
            pubsub_retry_queue: None,
            pubsub_completed_queue: None,
            warmup_countdown: 0,
            state: JobState::default(),
            success: false,
            error: None,
            raw_payload: "raw-payload-bytes".into(),
            running_lighthouse: false,
            lighthouse_throttle: false,
            profile_data_url: None,
            crux_api_key: None,
            block_list: Vec::new(),
            dns_override: Vec::new(),
        }
    }

    #[test]
    fn assembles_stored_zip_with_expected_entries() {
        let dir = std::env::temp_dir().join(format!("result-assembler-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let staged_path = dir.join("1_page_data.json");
        std::fs::write(&staged_path, b"{\"ok\":true}").unwrap();

        let assembler = ResultAssembler::new("http://global.example/");
        let out = dir.join("result.zip");
        assembler
            .assemble_zip(
                &[StagedFile {
                    path: staged_path,
                    archive_name: "1_page_data.json".into(),
                }],
                &out,
            )
            .unwrap();

        let file = std::fs::File::open(&out).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn blob_routing_requires_configured_store() {
        let mut job = sample_job();
        job.output = OutputRouting::Blob {
            bucket: "b".into(),
            path: "p".into(),
        };
        assert!(matches!(job.output, OutputRouting::Blob { .. }));
    }

    #[test]
    fn test_info_counts_completed_runs() {
        let job = sample_job();
        let info = generate_test_info(&job, &[(1, false, true), (1, true, true)], 1_700_000_000);
        assert!(info.contains("\"runs_done\":2"));
        assert!(info.contains("\"steps\":2"));
    }
}
