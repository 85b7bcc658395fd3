//! # probe-agent
//!
//! A distributed web-performance measurement agent: polls coordinators (or a
//! scheduler) for test jobs, drives a browser adapter through a compiled
//! test script, merges the resulting capture artifacts into a canonical
//! result, and ships it back as a zipped archive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use probe_agent::config::AgentConfig;
//! use probe_agent::dispatcher::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AgentConfig::default();
//!     let dispatcher = Dispatcher::new(config);
//!     let _ = dispatcher.acquire().await;
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! probe-agent run --config agent.toml
//! probe-agent run-once --url https://example.com
//! probe-agent validate-config --config agent.toml
//! probe-agent health --config agent.toml
//! ```

/// Job/task/command/result data model.
pub mod config;

/// Error taxonomy and the dispatcher's circuit breaker.
pub mod error;

/// Job acquisition: coordinator polling, scheduler auth, reboot escalation.
pub mod dispatcher;

/// Cloud instance metadata bootstrap: EC2/GCE user-data and identity fetch.
pub mod cloud;

/// Compiles script text into an ordered, typed command list.
pub mod script;

/// Capability traits for the browser adapter, traffic shaper, and host OS.
pub mod driver;

/// Drives a job's run x view state machine through a `BrowserDriver`.
pub mod run_controller;

/// Merges per-step capture artifacts into the canonical result document.
pub mod artifact_processor;

/// Bounded worker pool that backfills response bodies.
pub mod body_fetcher;

/// Archive assembly and result delivery.
pub mod result_assembler;

/// Diagnostics, liveness pings, license heartbeat, extension cache upkeep.
pub mod health;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

pub use config::*;
pub use error::*;
