//! Diagnostics snapshots, liveness pings, the once-per-lifetime license
//! heartbeat, and between-jobs extension cache maintenance. Generalizes the
//! teacher's periodic `SystemHealthChecker`/`HealthMonitor` interval-task
//! shape from browser-pool introspection to coordinator reporting.

use crate::config::AgentConfig;
use crate::dispatcher::salted_token;
use crate::error::AgentError;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub machine: String,
    pub agent_version: String,
    pub instance_id: Option<String>,
    pub cpu_percent: f64,
    pub memory_capacity: u64,
    pub memory_used: u64,
    pub disk_capacity: u64,
    pub disk_used: u64,
    pub os: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessPing {
    #[serde(flatten)]
    pub diagnostics: DiagnosticsSnapshot,
    pub free_disk_mb: u64,
    pub uptime_minutes: u64,
    pub dns_servers: Vec<String>,
    pub current_test_id: Option<String>,
}

/// Host sampling the reporter needs but never implements itself (reuses
/// `HostOs` rather than duplicating the capability surface).
pub trait SystemSampler: Send + Sync {
    fn cpu_percent(&self) -> f64;
    fn memory_capacity(&self) -> u64;
    fn memory_used(&self) -> u64;
    fn disk_capacity(&self) -> u64;
    fn disk_used(&self) -> u64;
    fn dns_servers(&self) -> Vec<String>;
    fn os_name(&self) -> String;
}

pub struct HealthReporter {
    config: AgentConfig,
    client: reqwest::Client,
    sampler: Box<dyn SystemSampler>,
    last_diagnostics: Mutex<Option<Instant>>,
    license_pinged: AtomicBool,
}

impl HealthReporter {
    pub fn new(config: AgentConfig, sampler: Box<dyn SystemSampler>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            sampler,
            last_diagnostics: Mutex::new(None),
            license_pinged: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            machine: self.config.pc_name.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: None,
            cpu_percent: self.sampler.cpu_percent(),
            memory_capacity: self.sampler.memory_capacity(),
            memory_used: self.sampler.memory_used(),
            disk_capacity: self.sampler.disk_capacity(),
            disk_used: self.sampler.disk_used(),
            os: self.sampler.os_name(),
        }
    }

    /// Emit a diagnostics snapshot to the configured scheduler, rate-limited
    /// to at most once per `diagnostics_interval`. Returns `false` when the
    /// call was skipped because of the rate limit.
    pub async fn report_diagnostics(&self) -> Result<bool, AgentError> {
        let Some(scheduler) = &self.config.scheduler else {
            return Ok(false);
        };

        {
            let mut last = self.last_diagnostics.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < self.config.diagnostics_interval {
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }

        let token = salted_token(&scheduler.node, &scheduler.salt, None);
        let url = format!(
            "{}/hawkscheduleserver/wpt-diagnostics.ashx",
            scheduler.url.trim_end_matches('/')
        );
        self.client
            .post(&url)
            .header("CPID", format!("m;{};{}", scheduler.node, token))
            .json(&self.snapshot())
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AgentError::TransientNetwork(e.to_string()))?;
        Ok(true)
    }

    /// Ping every configured `{server, location}` pair. Best-effort: a
    /// failure against one pair is logged and does not stop the others.
    pub async fn ping_work_servers(&self, current_test_id: Option<&str>) {
        if self.config.work_servers.len() < 2 && self.config.test_locations.len() < 2 {
            return;
        }
        let ping = LivenessPing {
            diagnostics: self.snapshot(),
            free_disk_mb: (self.sampler.disk_capacity() - self.sampler.disk_used()) / (1024 * 1024),
            uptime_minutes: 0,
            dns_servers: self.sampler.dns_servers(),
            current_test_id: current_test_id.map(|s| s.to_string()),
        };

        for server in &self.config.work_servers {
            for location in &self.config.test_locations {
                let url = format!("{}/ping.php", server.trim_end_matches('/'));
                let query = [
                    ("location", location.as_str()),
                    ("pc", self.config.pc_name.as_str()),
                ];
                let result = self
                    .client
                    .get(&url)
                    .query(&query)
                    .query(&[("cpu", ping.diagnostics.cpu_percent.to_string())])
                    .timeout(std::time::Duration::from_secs(5))
                    .send()
                    .await;
                if let Err(err) = result {
                    warn!(%server, %location, %err, "liveness ping failed");
                }
            }
        }
    }

    /// Best-effort, exactly-once license heartbeat. Subsequent calls are
    /// no-ops once the first attempt has been made (latch never resets,
    /// even on failure, matching the documented "have we pinged" behavior).
    pub async fn ping_license_once(&self) {
        if self
            .license_pinged
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let body = serde_json::json!({
            "loc": self.config.location,
            "server": self.config.work_servers.first(),
        });
        let _ = self
            .client
            .post(&self.config.license_endpoint)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;
    }

    /// Refresh the cached copy of `extension_id` if missing or older than
    /// `extensions_cache_time`. Only called between jobs. IDs must be
    /// alphanumeric; anything else is rejected before touching the
    /// filesystem.
    pub async fn refresh_extension_cache(&self, extension_id: &str) -> Result<(), AgentError> {
        if !extension_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AgentError::JobMalformed(format!(
                "invalid extension id: {extension_id}"
            )));
        }

        let dir = self.config.persistent_dir.join("extensions").join(extension_id);
        if !needs_refresh(&dir, self.config.extensions_cache_time)? {
            return Ok(());
        }

        let url = format!(
            "https://clients2.google.com/service/update2/crx?response=redirect&prodversion=100&x=id%3D{extension_id}%26installsource%3Dondemand%26uc"
        );
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await;
        let bytes = match response {
            Ok(r) => match r.bytes().await {
                Ok(b) => b,
                Err(err) => {
                    warn!(%extension_id, %err, "extension download body read failed");
                    return Ok(());
                }
            },
            Err(err) => {
                warn!(%extension_id, %err, "extension download failed, keeping cached copy");
                return Ok(());
            }
        };

        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!(%extension_id, %err, "failed to create extension cache dir");
            return Ok(());
        }
        let archive_path = dir.join("package.crx");
        if let Err(err) = std::fs::write(&archive_path, &bytes) {
            warn!(%extension_id, %err, "failed to write extension package");
        }
        debug!(%extension_id, "extension cache refreshed");
        Ok(())
    }

    pub fn touch_liveness_file(&self, path: &Path) {
        if let Err(err) = std::fs::write(path, unix_now().to_string()) {
            warn!(path = %path.display(), %err, "failed to touch liveness file");
        }
    }
}

fn needs_refresh(dir: &Path, cache_time: std::time::Duration) -> Result<bool, AgentError> {
    let marker = dir.join("package.crx");
    let Ok(metadata) = std::fs::metadata(&marker) else {
        return Ok(true);
    };
    let modified = metadata
        .modified()
        .map_err(|e| AgentError::IoError(e.to_string()))?;
    Ok(modified.elapsed().unwrap_or(cache_time) >= cache_time)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler;
    impl SystemSampler for FixedSampler {
        fn cpu_percent(&self) -> f64 {
            12.5
        }
        fn memory_capacity(&self) -> u64 {
            8_000_000_000
        }
        fn memory_used(&self) -> u64 {
            2_000_000_000
        }
        fn disk_capacity(&self) -> u64 {
            100_000_000_000
        }
        fn disk_used(&self) -> u64 {
            40_000_000_000
        }
        fn dns_servers(&self) -> Vec<String> {
            vec!["1.1.1.1".to_string()]
        }
        fn os_name(&self) -> String {
            "linux".to_string()
        }
    }

    #[test]
    fn invalid_extension_id_is_rejected() {
        let reporter = HealthReporter::new(AgentConfig::default(), Box::new(FixedSampler));
        let result = futures::executor::block_on(reporter.refresh_extension_cache("../etc"));
        assert!(result.is_err());
    }

    #[test]
    fn license_ping_latches_after_first_attempt() {
        let reporter = HealthReporter::new(AgentConfig::default(), Box::new(FixedSampler));
        assert!(!reporter.license_pinged.load(Ordering::SeqCst));
        futures::executor::block_on(reporter.ping_license_once());
        assert!(reporter.license_pinged.load(Ordering::SeqCst));
    }

    #[test]
    fn needs_refresh_true_when_absent() {
        let dir = std::env::temp_dir().join(format!("health-test-{}", uuid::Uuid::new_v4()));
        assert!(needs_refresh(&dir, std::time::Duration::from_secs(60)).unwrap());
    }
}
