//! Capability interfaces for collaborators outside this crate's scope:
//! the browser/device adapter, the traffic shaper, and host-level
//! primitives. RunController depends only on these traits, never on a
//! concrete browser or shaping backend — see the class-inheritance →
//! capability-trait redesign note.

use crate::config::{Command, NetworkConfig, Task};
use crate::error::AgentError;
use async_trait::async_trait;

/// One browser/device adapter capability set. A concrete implementation
/// (CDP socket, device bridge, remote-inspector proxy) lives outside this
/// crate; RunController drives any of them through this trait.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn prepare(&self, task: &Task) -> Result<(), AgentError>;
    async fn launch(&self, task: &Task) -> Result<(), AgentError>;
    async fn execute(&self, task: &Task, command: &Command) -> Result<(), AgentError>;

    /// True once the driver has observed a load (onload or equivalent) event
    /// for the current navigation.
    async fn has_load_event(&self, task: &Task) -> bool;

    /// Milliseconds since the last observed network/DOM activity.
    async fn idle_ms(&self, task: &Task) -> u64;

    async fn start_recording(&self, task: &Task) -> Result<(), AgentError>;
    async fn stop_capture(&self, task: &Task) -> Result<(), AgentError>;
    async fn stop_recording(&self, task: &Task) -> Result<(), AgentError>;
    async fn start_processing(&self, task: &Task) -> Result<(), AgentError>;
    async fn wait_for_processing(&self, task: &Task) -> Result<(), AgentError>;
    async fn step_complete(&self, task: &Task) -> Result<(), AgentError>;

    async fn stop(&self, task: &Task) -> Result<(), AgentError>;
    async fn shutdown(&self) -> Result<(), AgentError>;
}

/// Per-job traffic shaping. `configure` receives the already-derived
/// `NetworkConfig` (Lighthouse override already applied by the caller).
#[async_trait]
pub trait TrafficShaper: Send + Sync {
    async fn install(&self) -> Result<(), AgentError>;
    async fn configure(&self, network: &NetworkConfig) -> Result<(), AgentError>;
    async fn reset(&self) -> Result<(), AgentError>;
    async fn remove(&self) -> Result<(), AgentError>;
}

/// Host-level primitives the core needs but never implements itself:
/// process teardown, disk/uptime probes, DNS flush.
#[async_trait]
pub trait HostOs: Send + Sync {
    fn free_disk_mb(&self) -> u64;
    fn uptime_minutes(&self) -> u64;
    fn hostname(&self) -> String;
    async fn kill_process_tree(&self, pid: u32) -> Result<(), AgentError>;
    async fn flush_dns(&self) -> Result<(), AgentError>;

    /// Install a loopback route for the cloud instance metadata address
    /// (169.254.169.254) so captured traffic never leaks metadata requests
    /// into the page's own network trace. No-op on hosts with no such
    /// interface to touch.
    async fn install_metadata_blackhole_route(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// A `HostOs` that performs no real system calls, for tests and for the
/// reference pipeline before a real host adapter is plugged in.
pub struct NullHostOs;

#[async_trait]
impl HostOs for NullHostOs {
    fn free_disk_mb(&self) -> u64 {
        u64::MAX
    }
    fn uptime_minutes(&self) -> u64 {
        0
    }
    fn hostname(&self) -> String {
        "localhost".to_string()
    }
    async fn kill_process_tree(&self, _pid: u32) -> Result<(), AgentError> {
        Ok(())
    }
    async fn flush_dns(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// A no-op driver useful for tests and for wiring the pipeline end to end
/// before a real adapter is plugged in.
pub struct NullDriver;

#[async_trait]
impl BrowserDriver for NullDriver {
    async fn prepare(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn launch(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn execute(&self, _task: &Task, _command: &Command) -> Result<(), AgentError> {
        Ok(())
    }
    async fn has_load_event(&self, _task: &Task) -> bool {
        true
    }
    async fn idle_ms(&self, _task: &Task) -> u64 {
        u64::MAX
    }
    async fn start_recording(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn stop_capture(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn stop_recording(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn start_processing(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn wait_for_processing(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn step_complete(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn stop(&self, _task: &Task) -> Result<(), AgentError> {
        Ok(())
    }
    async fn shutdown(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

pub struct NullShaper;

#[async_trait]
impl TrafficShaper for NullShaper {
    async fn install(&self) -> Result<(), AgentError> {
        Ok(())
    }
    async fn configure(&self, _network: &NetworkConfig) -> Result<(), AgentError> {
        Ok(())
    }
    async fn reset(&self) -> Result<(), AgentError> {
        Ok(())
    }
    async fn remove(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Derive the effective network profile for a job: the Lighthouse 3G
/// override wins whenever the run is a Lighthouse pass without its own
/// throttle request.
pub fn effective_network(job: &crate::config::Job) -> NetworkConfig {
    if job.running_lighthouse && !job.lighthouse_throttle {
        NetworkConfig::LIGHTHOUSE_3G
    } else {
        job.network.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Job;
    use std::collections::HashMap;

    fn base_job() -> Job {
        Job {
            test_id: "t".into(),
            signature: "s".into(),
            work_server: "http://x/".into(),
            scheduler_job_id: None,
            runs: 1,
            first_view_only: true,
            warmup_runs: 0,
            viewport: Default::default(),
            timeout_seconds: 60,
            activity_timeout_ms: 2000,
            max_requests: None,
            stop_at_onload: false,
            video_enabled: false,
            tcpdump_enabled: false,
            keep_video: false,
            network: NetworkConfig {
                in_kbps: 5000,
                out_kbps: 1000,
                rtt_ms: 20,
                loss_pct: 0.0,
                shaper_queue_limit: 0,
            },
            cpu_throttle: 1.0,
            url: None,
            script: None,
            headers: HashMap::new(),
            cookies: Vec::new(),
            host_overrides: HashMap::new(),
            custom_metrics: HashMap::new(),
            extensions: Vec::new(),
            output: Default::default(),
            pubsub_retry_queue: None,
            pubsub_completed_queue: None,
            warmup_countdown: 0,
            state: Default::default(),
            success: false,
            error: None,
            raw_payload: String::new(),
            running_lighthouse: false,
            lighthouse_throttle: false,
            profile_data_url: None,
            crux_api_key: None,
            block_list: Vec::new(),
            dns_override: Vec::new(),
        }
    }

    #[test]
    fn lighthouse_overrides_network_unless_throttle_requested() {
        let mut job = base_job();
        job.running_lighthouse = true;
        let net = effective_network(&job);
        assert_eq!(net.rtt_ms, 150);

        job.lighthouse_throttle = true;
        let net = effective_network(&job);
        assert_eq!(net.rtt_ms, 20);
    }
}
