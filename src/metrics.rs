//! Counters and gauges for the dispatch/run/upload pipeline, following the
//! teacher's noop-initialized `Metrics` struct so the agent runs correctly
//! even before a recorder is installed.

use metrics::{Counter, Gauge, Histogram};
use tracing::info;

pub struct Metrics {
    pub jobs_acquired: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub tasks_completed: Counter,
    pub task_duration: Histogram,
    pub uploads_succeeded: Counter,
    pub uploads_failed: Counter,
    pub bodies_fetched: Counter,
    pub bodies_failed: Counter,
    pub circuit_breaker_trips: Counter,
    pub reboot_escalations: Counter,
    pub active_tasks: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_acquired: Counter::noop(),
            jobs_completed: Counter::noop(),
            jobs_failed: Counter::noop(),
            tasks_completed: Counter::noop(),
            task_duration: Histogram::noop(),
            uploads_succeeded: Counter::noop(),
            uploads_failed: Counter::noop(),
            bodies_fetched: Counter::noop(),
            bodies_failed: Counter::noop(),
            circuit_breaker_trips: Counter::noop(),
            reboot_escalations: Counter::noop(),
            active_tasks: Gauge::noop(),
        }
    }

    pub fn record_job_acquired(&self) {
        self.jobs_acquired.increment(1);
    }

    pub fn record_job_outcome(&self, success: bool) {
        if success {
            self.jobs_completed.increment(1);
        } else {
            self.jobs_failed.increment(1);
        }
    }

    pub fn record_task(&self, duration: std::time::Duration) {
        self.tasks_completed.increment(1);
        self.task_duration.record(duration.as_secs_f64());
    }

    pub fn record_upload(&self, success: bool) {
        if success {
            self.uploads_succeeded.increment(1);
        } else {
            self.uploads_failed.increment(1);
        }
    }

    pub fn record_body_fetch(&self, success: bool) {
        if success {
            self.bodies_fetched.increment(1);
        } else {
            self.bodies_failed.increment(1);
        }
    }

    pub fn record_circuit_trip(&self) {
        self.circuit_breaker_trips.increment(1);
    }

    pub fn record_reboot_escalation(&self) {
        self.reboot_escalations.increment(1);
    }

    pub fn set_active_tasks(&self, count: usize) {
        self.active_tasks.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        metrics::set_boxed_recorder(Box::new(recorder))?;
        info!("Prometheus recorder installed, exporter listening on port {}", self.port);
        Ok(())
    }
}
