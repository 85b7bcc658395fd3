//! Command-line surface: a long-running `run` subcommand plus three
//! development-time helpers (`run-once`, `validate-config`, `health`).
//! Structured the way the teacher's `Cli`/`CliRunner` pair does, generalized
//! from screenshot batch/single/server commands to agent job processing.

use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;
use crate::health::{HealthReporter, SystemSampler};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "probe-agent")]
#[command(about = "Distributed web-performance measurement agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Agent configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Bootstrap config from EC2 instance user-data")]
    pub ec2: bool,

    #[arg(long, global = true, help = "Bootstrap config from GCE instance user-data")]
    pub gce: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dispatch loop until terminated.
    Run,

    /// Acquire and run a single job, or measure one URL directly, then exit.
    RunOnce {
        #[arg(long, help = "Measure this URL instead of polling for a job")]
        url: Option<String>,
    },

    /// Parse and print a configuration file without starting the agent.
    ValidateConfig,

    /// Print a one-shot diagnostics snapshot and exit.
    Health,
}

pub struct CliRunner {
    config: AgentConfig,
}

impl CliRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Run => self.run_loop().await,
            Commands::RunOnce { url } => self.run_once(url).await,
            Commands::ValidateConfig => self.validate_config().await,
            Commands::Health => self.show_health().await,
        }
    }

    async fn run_loop(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("starting dispatch loop");
        let dispatcher = Dispatcher::new(self.config.clone());
        loop {
            match dispatcher.acquire().await {
                crate::dispatcher::AcquireOutcome::Job(job) => {
                    info!(test_id = %job.test_id, "acquired job");
                    // RunController/ArtifactProcessor/ResultAssembler wiring
                    // lives in `main`, which owns the concrete BrowserDriver.
                }
                crate::dispatcher::AcquireOutcome::NoWork => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                crate::dispatcher::AcquireOutcome::RebootRequested => {
                    error!("coordinator requested a reboot");
                    return Ok(());
                }
            }
        }
    }

    async fn run_once(&self, url: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = Dispatcher::new(self.config.clone());
        let job = if let Some(url) = url {
            let mut job = crate::config::Job {
                test_id: uuid::Uuid::new_v4().to_string(),
                url: Some(url),
                ..default_job(&self.config)
            };
            job.success = false;
            Some(job)
        } else {
            match dispatcher.acquire().await {
                crate::dispatcher::AcquireOutcome::Job(job) => Some(job),
                crate::dispatcher::AcquireOutcome::NoWork => None,
                crate::dispatcher::AcquireOutcome::RebootRequested => {
                    error!("coordinator requested a reboot");
                    None
                }
            }
        };

        match job {
            Some(job) => {
                println!("acquired job {} for {:?}", job.test_id, job.url);
                Ok(())
            }
            None => {
                println!("no work available");
                Ok(())
            }
        }
    }

    async fn validate_config(&self) -> Result<(), Box<dyn std::error::Error>> {
        println!("Configuration is valid:");
        println!("  pc_name: {}", self.config.pc_name);
        println!("  location: {}", self.config.location);
        println!("  work_servers: {:?}", self.config.work_servers);
        println!("  test_locations: {:?}", self.config.test_locations);
        println!("  poll_interval: {:?}", self.config.poll_interval);
        println!("  body_fetcher_workers: {}", self.config.body_fetcher_workers);
        Ok(())
    }

    async fn show_health(&self) -> Result<(), Box<dyn std::error::Error>> {
        let reporter = HealthReporter::new(self.config.clone(), Box::new(ProcSampler));
        let sent = reporter.report_diagnostics().await.unwrap_or(false);
        println!("Diagnostics sent to scheduler: {sent}");
        reporter.ping_work_servers(None).await;
        Ok(())
    }
}

fn default_job(config: &AgentConfig) -> crate::config::Job {
    use crate::config::{JobState, NetworkConfig, OutputRouting, Viewport};
    use std::collections::HashMap;

    crate::config::Job {
        test_id: String::new(),
        signature: String::new(),
        work_server: config.work_servers.first().cloned().unwrap_or_default(),
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
        url: None,
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
        raw_payload: String::new(),
        running_lighthouse: false,
        lighthouse_throttle: false,
        profile_data_url: None,
        crux_api_key: None,
        block_list: Vec::new(),
        dns_override: Vec::new(),
    }
}

/// Minimal `/proc`-based sampler used by the `health` subcommand; a
/// production deployment would plug in a platform-specific `SystemSampler`.
struct ProcSampler;

impl SystemSampler for ProcSampler {
    fn cpu_percent(&self) -> f64 {
        0.0
    }
    fn memory_capacity(&self) -> u64 {
        read_meminfo_kb("MemTotal").unwrap_or(0) * 1024
    }
    fn memory_used(&self) -> u64 {
        let total = read_meminfo_kb("MemTotal").unwrap_or(0);
        let available = read_meminfo_kb("MemAvailable").unwrap_or(0);
        total.saturating_sub(available) * 1024
    }
    fn disk_capacity(&self) -> u64 {
        0
    }
    fn disk_used(&self) -> u64 {
        0
    }
    fn dns_servers(&self) -> Vec<String> {
        std::fs::read_to_string("/etc/resolv.conf")
            .map(|content| {
                content
                    .lines()
                    .filter_map(|l| l.strip_prefix("nameserver "))
                    .map(|s| s.trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
    fn os_name(&self) -> String {
        std::env::consts::OS.to_string()
    }
}

fn read_meminfo_kb(key: &str) -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix(key)?
            .trim_start_matches(':')
            .trim()
            .trim_end_matches(" kB")
            .trim()
            .parse()
            .ok()
    })
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

pub async fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&content)?)
        }
        None => Ok(AgentConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_job_carries_config_work_server() {
        let mut config = AgentConfig::default();
        config.work_servers = vec!["http://origin.example/".to_string()];
        let job = default_job(&config);
        assert_eq!(job.work_server, "http://origin.example/");
        assert!(job.first_view_only);
    }
}
