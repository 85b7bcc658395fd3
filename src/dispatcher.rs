//! Dispatch loop: acquires jobs from coordinators or a scheduler, handles
//! control-block routing updates, escalates a reboot after sustained
//! failure, and requeues an in-flight job if the agent shuts down early.

use crate::config::{AgentConfig, Job};
use crate::error::{AgentError, CircuitBreaker};
use base64::Engine;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one `acquire` attempt.
pub enum AcquireOutcome {
    Job(Job),
    NoWork,
    RebootRequested,
}

pub struct Dispatcher {
    config: AgentConfig,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    consecutive_failures: AtomicU32,
    first_failure_at: std::sync::Mutex<Option<Instant>>,
    last_test_id: std::sync::Mutex<Option<String>>,
}

impl Dispatcher {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            breaker: CircuitBreaker::new(3, Duration::from_secs(60)),
            consecutive_failures: AtomicU32::new(0),
            first_failure_at: std::sync::Mutex::new(None),
            last_test_id: std::sync::Mutex::new(None),
        }
    }

    /// Poll at most one candidate source for work. Scheduler nodes are tried
    /// first (in shuffled order) when a scheduler is configured; otherwise
    /// every (work_server, location) pair is tried, also shuffled.
    pub async fn acquire(&self) -> Result<AcquireOutcome, AgentError> {
        if !self.breaker.can_execute() {
            debug!("dispatcher circuit breaker open, skipping acquire");
            return Ok(AcquireOutcome::NoWork);
        }

        let result = if let Some(scheduler) = &self.config.scheduler {
            self.acquire_from_scheduler(scheduler).await
        } else {
            self.acquire_from_work_servers().await
        };

        match &result {
            Ok(_) => {
                self.breaker.record_success();
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.first_failure_at.lock().unwrap() = None;
            }
            Err(_) => {
                self.breaker.record_failure();
                self.record_failure();
            }
        }

        result
    }

    fn record_failure(&self) {
        let mut first = self.first_failure_at.lock().unwrap();
        if first.is_none() {
            *first = Some(Instant::now());
        }
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Three consecutive failures within the configured window escalate a
    /// reboot recommendation to the caller (Agent decides whether to act on it).
    pub fn should_reboot(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.config.reboot_failure_threshold as u32 {
            return false;
        }
        match *self.first_failure_at.lock().unwrap() {
            Some(first) => first.elapsed() <= self.config.reboot_failure_window,
            None => false,
        }
    }

    async fn acquire_from_scheduler(
        &self,
        scheduler: &crate::config::SchedulerConfig,
    ) -> Result<AcquireOutcome, AgentError> {
        let token = salted_token(&scheduler.node, &scheduler.salt, None);
        let url = format!("{}hawkscheduleserver/wpt-dequeue.ashx", scheduler.url);
        let response = self
            .client
            .get(&url)
            .query(&[("machine", &self.config.pc_name)])
            .header("CPID", format!("m;{};{}", scheduler.node, token))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        self.parse_acquire_body(&body, None)
    }

    async fn acquire_from_work_servers(&self) -> Result<AcquireOutcome, AgentError> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for server in &self.config.work_servers {
            for location in &self.config.test_locations {
                pairs.push((server.clone(), location.clone()));
            }
        }
        pairs.shuffle(&mut rand::rng());

        for (server, location) in pairs {
            let url = format!("{server}getwork.php");
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("f", "json"),
                    ("shards", "1"),
                    ("reboot", "1"),
                    ("servers", "1"),
                    ("testinfo", "1"),
                    ("location", &location),
                    ("pc", &self.config.pc_name),
                ])
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;

            let body = response
                .text()
                .await
                .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;

            match self.parse_acquire_body(&body, Some(&server))? {
                AcquireOutcome::NoWork => continue,
                other => return Ok(other),
            }
        }
        Ok(AcquireOutcome::NoWork)
    }

    fn parse_acquire_body(
        &self,
        body: &str,
        server_override: Option<&str>,
    ) -> Result<AcquireOutcome, AgentError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Ok(AcquireOutcome::NoWork);
        }
        if trimmed == "Reboot" {
            warn!("coordinator requested reboot");
            return Ok(AcquireOutcome::RebootRequested);
        }
        if let Some(rest) = trimmed.strip_prefix("Servers:") {
            info!(servers = rest, "received server routing update");
            return Ok(AcquireOutcome::NoWork);
        }
        if let Some(rest) = trimmed.strip_prefix("Scheduler:") {
            info!(scheduler = rest, "received scheduler routing update");
            return Ok(AcquireOutcome::NoWork);
        }

        let mut job: Job = serde_json::from_str(trimmed)
            .map_err(|e| AgentError::JobMalformed(e.to_string()))?;
        job.raw_payload = trimmed.to_string();
        job.warmup_countdown = job.warmup_runs;
        if let Some(server) = server_override {
            job.work_server = server.to_string();
        }
        *self.last_test_id.lock().unwrap() = Some(job.test_id.clone());
        Ok(AcquireOutcome::Job(job))
    }

    /// Best-effort notification that a job slot is free. Swallows errors.
    pub async fn scheduler_job_done(&self, job_id: &str) {
        let Some(scheduler) = &self.config.scheduler else {
            return;
        };
        let token = salted_token(&scheduler.node, &scheduler.salt, None);
        let url = format!("{}hawkscheduleserver/wpt-test-update.ashx", scheduler.url);
        let payload = serde_json::json!({ "test": job_id, "update": 0 });
        let _ = self
            .client
            .post(&url)
            .header("CPID", format!("m;{};{}", scheduler.node, token))
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await;
    }

    /// Requeue the original raw payload when the agent is shutting down with
    /// a job still in flight. Best-effort: any transport error is logged and
    /// swallowed, never propagated to the caller.
    pub async fn requeue(&self, job: &Job) {
        let url = format!(
            "{}requeue.php?id={}&sig={}&location={}",
            job.work_server, job.test_id, job.signature, self.config.location
        );
        let mut url = url;
        if let Some(node) = self.config.scheduler.as_ref().map(|s| s.node.clone()) {
            url.push_str(&format!("&node={node}"));
        }
        if let Some(job_id) = &job.scheduler_job_id {
            url.push_str(&format!("&jobID={job_id}"));
        }

        let result = self
            .client
            .post(&url)
            .header("Content-Type", "text/plain")
            .body(job.raw_payload.clone())
            .timeout(Duration::from_secs(30))
            .send()
            .await;

        match result {
            Ok(_) => info!(test_id = %job.test_id, "requeued job on shutdown"),
            Err(e) => warn!(test_id = %job.test_id, error = %e, "requeue failed"),
        }

        if let Some(job_id) = &job.scheduler_job_id {
            self.scheduler_job_done(job_id).await;
        }
    }
}

/// `base64(sha1(UPPER(node) + yyyymm + salt))`. `month_override` exists only
/// so tests can pin the month without depending on wall-clock time.
pub fn salted_token(node: &str, salt: &str, month_override: Option<&str>) -> String {
    let yyyymm = match month_override {
        Some(m) => m.to_string(),
        None => chrono::Local::now().format("%Y%m").to_string(),
    };
    let mut hasher = Sha1::new();
    hasher.update(node.to_uppercase().as_bytes());
    hasher.update(yyyymm.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_token_is_stable_within_a_month() {
        let a = salted_token("AGENT-42", "s3cret", Some("202405"));
        let b = salted_token("AGENT-42", "s3cret", Some("202405"));
        assert_eq!(a, b);
    }

    #[test]
    fn salted_token_normalizes_case() {
        let a = salted_token("agent-42", "s3cret", Some("202405"));
        let b = salted_token("AGENT-42", "s3cret", Some("202405"));
        assert_eq!(a, b);
    }

    #[test]
    fn salted_token_changes_across_months() {
        let a = salted_token("AGENT-42", "s3cret", Some("202405"));
        let b = salted_token("AGENT-42", "s3cret", Some("202406"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn reboot_escalation_requires_threshold_and_window() {
        let config = AgentConfig {
            reboot_failure_threshold: 3,
            reboot_failure_window: Duration::from_secs(1800),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config);
        assert!(!dispatcher.should_reboot());
        dispatcher.record_failure();
        dispatcher.record_failure();
        assert!(!dispatcher.should_reboot());
        dispatcher.record_failure();
        assert!(dispatcher.should_reboot());
    }
}
