//! Run controller: iterates a job's run×view state machine, drives a task
//! through its compiled script via `BrowserDriver`, and gates each recording
//! step on the load-idle predicate. Generalizes the teacher's semaphore-
//! gated retry loop (`screenshot_service.rs`) and pooled-resource lifecycle
//! (`browser_pool.rs`) to task driving instead of screenshot capture.

use crate::config::{Command, Job, JobState, ProfileSample, Task, Verb};
use crate::driver::{effective_network, BrowserDriver, TrafficShaper};
use crate::error::AgentError;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reason a load-idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Loaded,
    NavigationError,
    TimeBudgetExhausted,
    RequestOverflow,
    WaitForSatisfied,
}

pub struct RunController<D: BrowserDriver, S: TrafficShaper> {
    driver: D,
    shaper: S,
    work_dir: PathBuf,
    client: reqwest::Client,
}

impl<D: BrowserDriver, S: TrafficShaper> RunController<D, S> {
    pub fn new(driver: D, shaper: S, work_dir: PathBuf) -> Self {
        Self {
            driver,
            shaper,
            work_dir,
            client: reqwest::Client::new(),
        }
    }

    /// Advance the run×view state machine and produce the next task, or
    /// `None` once the job is fully driven. Mutates `job.state` and
    /// `job.warmup_countdown` per the transition rules.
    pub fn next_task(&self, job: &mut Job, test_run_count: u64) -> Option<Task> {
        if job.state.done {
            return None;
        }

        if job.state.run == 0 {
            job.state.run = 1;
        }

        let warmup = job.warmup_countdown > 0;
        let (run, warmup, advance_to) = if warmup {
            (job.state.run, true, Advance::DecrementWarmup)
        } else if !job.state.repeat_view && !job.first_view_only {
            (job.state.run, false, Advance::ToRepeatView)
        } else {
            (job.state.run, false, Advance::ToNextRun)
        };

        let cached_flag = !warmup && job.state.repeat_view;
        let prefix = if cached_flag {
            format!("{run}_Cached")
        } else {
            format!("{run}")
        };

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            run,
            cached: cached_flag,
            warmup,
            work_dir: self.work_dir.join(&prefix),
            prefix,
            video_subdirectory: None,
            script: Vec::new(),
            script_step_count: 1,
            block_list: job.block_list.clone(),
            host_rules: job.host_overrides.clone().into_iter().collect(),
            dns_override: job.dns_override.clone(),
            navigated: false,
            combine_steps: false,
            run_start: Instant::now(),
            profile_data: Default::default(),
            error: None,
            done: false,
        };

        match advance_to {
            Advance::DecrementWarmup => {
                job.warmup_countdown -= 1;
            }
            Advance::ToRepeatView => {
                job.state.repeat_view = true;
            }
            Advance::ToNextRun => {
                job.state.repeat_view = false;
                job.state.run += 1;
                if job.state.run > job.runs {
                    job.state.done = true;
                }
            }
        }

        let _ = test_run_count;
        Some(task)
    }

    /// Drive one task from `script` through to completion: prepare/launch,
    /// execute each command with the load-idle gate on recording commands,
    /// then tear down.
    pub async fn drive(&self, job: &Job, task: &mut Task) -> Result<(), AgentError> {
        let test_phase_start = task.run_start.elapsed().as_secs_f64();
        let network = effective_network(job);
        self.shaper.configure(&network).await?;

        self.driver.prepare(task).await?;
        self.driver.launch(task).await?;

        if job.crux_api_key.is_some() && task.run == 1 && !task.cached {
            self.fetch_crux_data(job, task).await;
        }

        let mut step: usize = 1;
        let commands = std::mem::take(&mut task.script);
        for command in &commands {
            self.driver.execute(task, command).await?;

            if command.record {
                self.driver.start_recording(task).await?;
                let outcome = self
                    .wait_for_idle(job, task, &command.verb)
                    .await;
                self.finish_step(task, outcome).await?;
                step += 1;
            }
        }
        task.script = commands;
        let _ = step;

        self.driver.stop(task).await?;
        task.done = true;

        let test_phase_end = task.run_start.elapsed().as_secs_f64();
        task.profile_data.insert(
            "test".to_string(),
            ProfileSample {
                start_offset_s: test_phase_start,
                end_offset_s: test_phase_end,
                duration_s: test_phase_end - test_phase_start,
            },
        );
        if job.profile_data_url.is_some() {
            self.post_profile_data(job, task).await;
        }

        Ok(())
    }

    /// Best-effort POST of `task.profile_data` to the job's configured
    /// upload URL. Diagnostic-only: never blocks or fails result delivery.
    async fn post_profile_data(&self, job: &Job, task: &Task) {
        let Some(url) = &job.profile_data_url else {
            return;
        };
        let result = self
            .client
            .post(url)
            .json(&task.profile_data)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        if let Err(err) = result {
            debug!(task_id = %task.id, %err, "profile data upload failed");
        }
    }

    /// One best-effort CrUX API lookup for the first measured run of a job.
    /// Writes a gzip-compressed `crux.json.gz` into the task's working
    /// directory when the response body is non-empty.
    async fn fetch_crux_data(&self, job: &Job, task: &Task) {
        let (Some(api_key), Some(url)) = (&job.crux_api_key, &job.url) else {
            return;
        };
        let form_factor = if job.viewport.mobile { "PHONE" } else { "DESKTOP" };
        let request_body = serde_json::json!({
            "url": url,
            "formFactor": form_factor,
        });

        let response = self
            .client
            .post(format!(
                "https://chromeuxreport.googleapis.com/v1/records:queryRecord?key={api_key}"
            ))
            .json(&request_body)
            .timeout(Duration::from_secs(15))
            .send()
            .await;

        let body = match response {
            Ok(r) => match r.bytes().await {
                Ok(b) => b,
                Err(err) => {
                    debug!(task_id = %task.id, %err, "CrUX response body read failed");
                    return;
                }
            },
            Err(err) => {
                debug!(task_id = %task.id, %err, "CrUX lookup failed");
                return;
            }
        };
        if body.is_empty() {
            return;
        }

        if let Err(err) = tokio::fs::create_dir_all(&task.work_dir).await {
            warn!(task_id = %task.id, %err, "failed to create task dir for CrUX output");
            return;
        }
        let path = task.work_dir.join("crux.json.gz");
        if let Err(err) = write_gzip(&path, &body).await {
            warn!(task_id = %task.id, %err, "failed to write crux.json.gz");
        }
    }

    async fn finish_step(
        &self,
        task: &Task,
        outcome: IdleOutcome,
    ) -> Result<(), AgentError> {
        self.driver.stop_capture(task).await?;
        self.driver.stop_recording(task).await?;
        self.driver.start_processing(task).await?;
        self.driver.wait_for_processing(task).await?;
        self.driver.step_complete(task).await?;
        if !matches!(outcome, IdleOutcome::Loaded | IdleOutcome::WaitForSatisfied) {
            debug!(task_id = %task.id, ?outcome, "step ended on a soft condition");
        }
        Ok(())
    }

    /// The five-condition, priority-ordered load-idle wait from §4.3.
    async fn wait_for_idle(&self, job: &Job, task: &Task, _command_verb: &Verb) -> IdleOutcome {
        let budget = Duration::from_secs(job.timeout_seconds as u64 * task.script_step_count as u64);
        let poll = Duration::from_millis(100);
        let activity_timeout = Duration::from_millis(job.activity_timeout_ms);

        loop {
            if task.run_start.elapsed() >= budget && !self.driver.has_load_event(task).await {
                return IdleOutcome::TimeBudgetExhausted;
            }

            if let Some(max_requests) = job.max_requests {
                if self.request_count_hint(task) > max_requests
                    && !self.driver.has_load_event(task).await
                {
                    return IdleOutcome::RequestOverflow;
                }
            }

            if self.driver.has_load_event(task).await {
                let idle_ms = self.driver.idle_ms(task).await;
                if idle_ms >= job.activity_timeout_ms && task.run_start.elapsed() >= Duration::from_millis(1000)
                {
                    return IdleOutcome::Loaded;
                }
            }

            tokio::time::sleep(poll).await;

            if task.run_start.elapsed() > budget + activity_timeout + Duration::from_secs(5) {
                warn!(task_id = %task.id, "load-idle wait exceeded hard ceiling, forcing completion");
                return IdleOutcome::TimeBudgetExhausted;
            }
        }
    }

    fn request_count_hint(&self, _task: &Task) -> u32 {
        // The concrete request count lives behind the BrowserDriver adapter;
        // this hook exists so a real driver can surface it without changing
        // the wait loop's structure.
        0
    }
}

enum Advance {
    DecrementWarmup,
    ToRepeatView,
    ToNextRun,
}

async fn write_gzip(path: &std::path::Path, body: &[u8]) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let path = path.to_path_buf();
    let body = body.to_vec();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&body)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

/// Tag `state` transitions purely in terms of counters, independent of any
/// driver — used by tests and by Dispatcher/Agent to predict the task
/// sequence a job will produce without running it.
pub fn predict_sequence(runs: u32, first_view_only: bool, warmup_runs: u32) -> Vec<(u32, bool, bool)> {
    let mut out = Vec::new();
    let mut state = JobState::default();
    let mut warmup_countdown = warmup_runs;
    state.run = 1;

    loop {
        if state.done {
            break;
        }
        let warmup = warmup_countdown > 0;
        if warmup {
            out.push((state.run, false, true));
            warmup_countdown -= 1;
            continue;
        }
        if !state.repeat_view && !first_view_only {
            out.push((state.run, false, false));
            state.repeat_view = true;
            continue;
        }
        out.push((state.run, state.repeat_view, false));
        state.repeat_view = false;
        state.run += 1;
        if state.run > runs {
            state.done = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_run_first_view_only() {
        let seq = predict_sequence(1, true, 0);
        assert_eq!(seq, vec![(1, false, false)]);
    }

    #[test]
    fn two_runs_with_repeat_view() {
        let seq = predict_sequence(2, false, 0);
        assert_eq!(
            seq,
            vec![(1, false, false), (1, true, false), (2, false, false), (2, true, false)]
        );
    }

    #[test]
    fn warmup_then_measured() {
        let seq = predict_sequence(1, true, 1);
        assert_eq!(seq, vec![(1, false, true), (1, false, false)]);
    }

    #[test]
    fn warmup_runs_two() {
        let seq = predict_sequence(1, true, 2);
        assert_eq!(seq, vec![(1, false, true), (1, false, true), (1, false, false)]);
    }

    #[test]
    fn next_task_carries_block_dns_and_host_rules_from_job() {
        use crate::config::{NetworkConfig, OutputRouting, Viewport};
        use crate::driver::{NullDriver, NullShaper};
        use std::collections::HashMap;

        let mut job = Job {
            test_id: "t".into(),
            signature: "s".into(),
            work_server: "http://x/".into(),
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
            url: Some("http://example.com/".to_string()),
            script: None,
            headers: HashMap::new(),
            cookies: Vec::new(),
            host_overrides: HashMap::from([("internal.example".to_string(), "10.0.0.9".to_string())]),
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
            block_list: vec!["ads.example.com".to_string()],
            dns_override: vec![("host.example.com".to_string(), "10.0.0.1".to_string())],
        };

        let controller = RunController::new(NullDriver, NullShaper, PathBuf::from("/tmp/probe-agent-test"));
        let task = controller.next_task(&mut job, 0).unwrap();
        assert_eq!(task.block_list, vec!["ads.example.com".to_string()]);
        assert_eq!(
            task.dns_override,
            vec![("host.example.com".to_string(), "10.0.0.1".to_string())]
        );
        assert_eq!(
            task.host_rules,
            vec![("internal.example".to_string(), "10.0.0.9".to_string())]
        );
    }
}
