//! Configuration management and core data model.
//!
//! This module provides the agent's runtime configuration plus the job/task
//! data model shared by every other component: `AgentConfig` resolves how
//! the agent talks to coordinators and schedulers, while `Job`/`Task`/
//! `Command`/`CanonicalResult` describe a unit of work as it flows through
//! the dispatch → script-compile → run → package pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level agent configuration.
///
/// Resolved with precedence: built-in defaults < config file < CLI flags <
/// cloud instance metadata / scheduler push.
///
/// # Examples
///
/// ```rust
/// use probe_agent::AgentConfig;
///
/// let config = AgentConfig::default();
/// let config = AgentConfig {
///     pc_name: "agent-07".to_string(),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Coordinator origins to poll for work when no scheduler is configured.
    pub work_servers: Vec<String>,

    /// Test locations this agent services (one getwork/ping cycle per pair).
    pub test_locations: Vec<String>,

    /// Optional scheduler used instead of direct work-server polling.
    pub scheduler: Option<SchedulerConfig>,

    /// Machine identity reported to coordinators (`pc` query parameter).
    pub pc_name: String,

    /// Primary location identifier reported alongside `pc_name`.
    pub location: String,

    /// Shared API key sent with every coordinator request, if configured.
    pub key: Option<String>,

    /// Minimum delay between dispatcher acquire attempts (default: 5s).
    pub poll_interval: Duration,

    /// Number of BodyFetcher workers (bounded to 10 regardless of this value).
    pub body_fetcher_workers: usize,

    /// Persistent cache directory: extensions, browser chrome margins.
    pub persistent_dir: PathBuf,

    /// Ephemeral per-job working directory root.
    pub work_dir: PathBuf,

    /// How long a cached extension package is considered fresh (default: 7 days).
    pub extensions_cache_time: Duration,

    /// Minimum spacing between diagnostics snapshots (default: 60s).
    pub diagnostics_interval: Duration,

    /// License heartbeat endpoint (pinged once per process lifetime).
    pub license_endpoint: String,

    /// Optional CrUX API key for real-user-metrics supplementation.
    pub crux_api_key: Option<String>,

    /// Consecutive acquire failures before the agent escalates a reboot.
    pub reboot_failure_threshold: usize,

    /// Window over which `reboot_failure_threshold` failures must occur.
    pub reboot_failure_window: Duration,

    /// Basic auth credentials for coordinator requests, set from cloud
    /// instance user-data (`wpt_username`/`wpt_password`).
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,

    /// Whether coordinator TLS certificates must validate (`wpt_validcertificate`).
    pub validate_server_certificate: bool,

    /// Video capture frame rate (`wpt_fps`).
    pub fps: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_servers: Vec::new(),
            test_locations: vec!["default".to_string()],
            scheduler: None,
            pc_name: whoami_or_default(),
            location: "default".to_string(),
            key: None,
            poll_interval: Duration::from_secs(5),
            body_fetcher_workers: 10,
            persistent_dir: PathBuf::from("./agent.data"),
            work_dir: PathBuf::from("./agent.work"),
            extensions_cache_time: Duration::from_secs(7 * 24 * 3600),
            diagnostics_interval: Duration::from_secs(60),
            license_endpoint: "https://license.webpagetest.org/".to_string(),
            crux_api_key: None,
            reboot_failure_threshold: 3,
            reboot_failure_window: Duration::from_secs(30 * 60),
            auth_username: None,
            auth_password: None,
            validate_server_certificate: false,
            fps: 10,
        }
    }
}

fn whoami_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "agent".to_string())
}

/// Scheduler node authentication: a salted token is derived from
/// `(node, calendar month, salt)` — see `dispatcher::salted_token`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub url: String,
    pub salt: String,
    pub node: String,
}

/// A unit of work acquired from a coordinator or scheduler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub test_id: String,
    pub signature: String,
    pub work_server: String,
    pub scheduler_job_id: Option<String>,

    pub runs: u32,
    pub first_view_only: bool,
    pub warmup_runs: u32,

    pub viewport: Viewport,
    pub timeout_seconds: u32,
    pub activity_timeout_ms: u64,
    pub max_requests: Option<u32>,
    pub stop_at_onload: bool,
    pub video_enabled: bool,
    pub tcpdump_enabled: bool,
    pub keep_video: bool,

    pub network: NetworkConfig,
    pub cpu_throttle: f64,

    pub url: Option<String>,
    pub script: Option<String>,

    pub headers: HashMap<String, String>,
    pub cookies: Vec<String>,
    pub host_overrides: HashMap<String, String>,
    pub custom_metrics: HashMap<String, String>,

    pub extensions: Vec<String>,
    pub output: OutputRouting,
    pub pubsub_retry_queue: Option<String>,
    pub pubsub_completed_queue: Option<String>,

    /// Mutable countdown decremented once per warmup task produced. Not
    /// carried on the wire; `Dispatcher::acquire` seeds it from `warmup_runs`
    /// right after deserialization.
    #[serde(default)]
    pub warmup_countdown: u32,

    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<i32>,

    /// Raw payload as received, kept verbatim for requeue-on-shutdown. Not
    /// carried on the wire; `Dispatcher::acquire` fills it in from the body
    /// it just parsed.
    #[serde(default)]
    pub raw_payload: String,

    /// Only set when `running_lighthouse && !lighthouse_throttle`: overrides
    /// the effective network profile to the fixed Lighthouse 3G numbers.
    #[serde(default)]
    pub running_lighthouse: bool,
    #[serde(default)]
    pub lighthouse_throttle: bool,

    /// Separate upload endpoint for profiling telemetry, if the coordinator
    /// requested it.
    #[serde(default)]
    pub profile_data_url: Option<String>,

    /// Optional CrUX API key carried on the job, overriding the agent-level
    /// default for this one test.
    #[serde(default)]
    pub crux_api_key: Option<String>,

    /// `blockdomains`/`blockdomainsexcept` targets resolved at script-compile
    /// time (see `ScriptCompiler::apply_pre_command`); `!`-prefixed entries
    /// denote a `blockdomainsexcept` allow-list rather than a blocklist.
    #[serde(default)]
    pub block_list: Vec<String>,

    /// `setdns`/`setdnsname` resolutions from script compilation:
    /// `(hostname, ip)` pairs applied by the driver before navigation.
    #[serde(default)]
    pub dns_override: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    pub in_kbps: u32,
    pub out_kbps: u32,
    pub rtt_ms: u32,
    pub loss_pct: f64,
    pub shaper_queue_limit: u32,
}

impl NetworkConfig {
    /// Fixed Lighthouse 3G profile (1.6Mbps down / 750Kbps up / 150ms RTT),
    /// applied when a job runs Lighthouse without its own throttle override.
    pub const LIGHTHOUSE_3G: NetworkConfig = NetworkConfig {
        in_kbps: 1600,
        out_kbps: 750,
        rtt_ms: 150,
        loss_pct: 0.0,
        shaper_queue_limit: 0,
    };
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct JobState {
    pub run: u32,
    pub repeat_view: bool,
    pub done: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum OutputRouting {
    /// Deliver via `workdone.php` multipart upload (default).
    Server,
    /// Deliver as a blob to object storage instead of the coordinator.
    Blob { bucket: String, path: String },
}

impl Default for OutputRouting {
    fn default() -> Self {
        OutputRouting::Server
    }
}

/// Browser viewport requested for a job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// One run×view execution of a `Job`.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub run: u32,
    pub cached: bool,
    pub warmup: bool,
    pub work_dir: PathBuf,
    pub prefix: String,
    pub video_subdirectory: Option<String>,
    pub script: Vec<Command>,
    pub script_step_count: usize,
    pub block_list: Vec<String>,
    pub host_rules: Vec<(String, String)>,
    pub dns_override: Vec<(String, String)>,
    pub navigated: bool,
    pub combine_steps: bool,
    pub run_start: std::time::Instant,
    pub profile_data: HashMap<String, ProfileSample>,
    pub error: Option<i32>,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProfileSample {
    pub start_offset_s: f64,
    pub end_offset_s: f64,
    pub duration_s: f64,
}

/// A single script instruction. `record` commands close out a measurement
/// step; the rest mutate driver/job state without capturing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Command {
    pub verb: Verb,
    pub target: Option<String>,
    pub value: Option<String>,
    pub record: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Verb {
    Navigate,
    SetHeader,
    AddHeader,
    SetCookie,
    SetUserAgent,
    SetDns,
    SetDnsName,
    BlockDomains,
    BlockDomainsExcept,
    Block,
    OverrideHost,
    SetViewportSize,
    SetBrowserSize,
    SetDpr,
    SetTimeout,
    SetActivityTimeout,
    SetMinimumStepSeconds,
    SetAbm,
    LogData,
    CombineSteps,
    SetEventName,
    WaitFor,
    WaitInterval,
    Exec,
    Sleep,

    // Transient markers used only inside ScriptCompiler: every one of these
    // is rewritten into `Exec` before a Command ever reaches a Task's script,
    // so RunController and ArtifactProcessor never see them.
    ClickMarker,
    SetValueMarker,
    SubmitFormMarker,
    SetInnerTextMarker,
    SetInnerHtmlMarker,
    SelectValueMarker,
    SendClickMarker,
}

impl Verb {
    /// Commands that are fully applied at compile time and never emitted as
    /// runtime instructions (see ScriptCompiler §4.2).
    pub fn is_pre_applied(self) -> bool {
        matches!(
            self,
            Verb::SetTimeout
                | Verb::SetBrowserSize
                | Verb::SetViewportSize
                | Verb::BlockDomains
                | Verb::BlockDomainsExcept
                | Verb::SetDns
                | Verb::SetActivityTimeout
                | Verb::SetMinimumStepSeconds
                | Verb::SetAbm
                | Verb::CombineSteps
        )
    }
}

/// Canonical per-step measurement document produced by ArtifactProcessor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalResult {
    pub requests: Vec<Request>,
    pub page_data: PageData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub full_url: String,
    pub host: String,
    pub path: String,
    pub secure: bool,
    pub load_start: i64,
    pub ttfb_ms: i64,
    pub load_ms: i64,
    pub dns_start: i64,
    pub dns_end: i64,
    pub connect_start: i64,
    pub connect_end: i64,
    pub ssl_start: i64,
    pub ssl_end: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub object_size: u64,
    pub object_size_uncompressed: u64,
    pub request_headers: Vec<String>,
    pub response_headers: Vec<String>,
    pub status: u16,
    pub mime_type: String,
    pub is_base_page: bool,
    pub body_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageData {
    pub start_time: i64,
    pub ttfb: i64,
    pub load_time: i64,
    pub dom_content_loaded_event_start: i64,
    pub dom_content_loaded_event_end: i64,
    pub load_event_start: i64,
    pub load_event_end: i64,
    pub fully_loaded: i64,
    pub visual_complete: i64,
    pub visual_complete_85: i64,
    pub visual_complete_90: i64,
    pub visual_complete_95: i64,
    pub visual_complete_99: i64,
    pub speed_index: i64,
    pub render: i64,
    pub last_visual_change: i64,
    pub cumulative_layout_shift: f64,
    pub layout_shifts: Vec<LayoutShiftSample>,
    pub layout_shifts_before_paint: LayoutShiftsBeforePaint,
    pub largest_paints: Vec<LargestPaintSample>,
    pub element_timing: Vec<ElementTimingSample>,
    pub user_timing: Vec<UserTimingEntry>,
    pub user_timing_measures: Vec<UserTimingMeasure>,
    pub chrome_user_timing: HashMap<String, i64>,
    pub custom: Vec<String>,
    pub connections: u32,
    pub result: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutShiftSample {
    pub time: i64,
    pub score: f64,
    pub cumulative_score: f64,
    pub window_score: f64,
    pub shift_window_num: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutShiftsBeforePaint {
    pub count: u32,
    pub cumulative_score: f64,
    pub fraction_of_total: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LargestPaintSample {
    pub name: String,
    pub time: i64,
    pub size: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementTimingSample {
    pub name: String,
    pub time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTimingEntry {
    pub name: String,
    pub start_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTimingMeasure {
    pub name: String,
    pub start_time: i64,
    pub duration: i64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}
