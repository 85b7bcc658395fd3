use clap::Parser;
use probe_agent::cli::{load_config, setup_logging, Cli, CliRunner, Commands};
use probe_agent::cloud;
use probe_agent::config::{AgentConfig, CanonicalResult, Job};
use probe_agent::dispatcher::{AcquireOutcome, Dispatcher};
use probe_agent::driver::{NullDriver, NullHostOs, NullShaper};
use probe_agent::artifact_processor::ArtifactProcessor;
use probe_agent::metrics::Metrics;
use probe_agent::result_assembler::{ResultAssembler, StagedFile};
use probe_agent::run_controller::RunController;
use probe_agent::script::ScriptCompiler;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;
    info!("starting probe-agent v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(args.config.as_ref()).await?;
    if args.ec2 {
        let identity = cloud::load_from_ec2(&mut config, &NullHostOs).await;
        info!(?identity, "loaded EC2 instance metadata");
    } else if args.gce {
        let identity = cloud::load_from_gce(&mut config, &NullHostOs).await;
        info!(?identity, "loaded GCE instance metadata");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let result = match args.command {
        Commands::Run => run_agent_loop(config, shutdown_rx).await,
        other => CliRunner::new(config).run(other).await,
    };

    if let Err(e) = result {
        error!("agent exited with error: {e}");
        std::process::exit(1);
    }

    info!("probe-agent stopped");
    Ok(())
}

/// Owns the concrete `BrowserDriver`/`TrafficShaper` pair and drives the
/// acquire -> compile -> run -> process -> upload pipeline until a shutdown
/// signal arrives or the coordinator requests a reboot.
async fn run_agent_loop(
    config: AgentConfig,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Arc::new(Dispatcher::new(config.clone()));
    let metrics = Arc::new(Metrics::new());
    let assembler = ResultAssembler::new(config.work_servers.first().cloned().unwrap_or_default());
    let current_job: Arc<Mutex<Option<Job>>> = Arc::new(Mutex::new(None));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("received shutdown signal");
                if let Some(job) = current_job.lock().await.take() {
                    warn!(test_id = %job.test_id, "requeuing in-flight job");
                    dispatcher.requeue(&job).await;
                }
                return Ok(());
            }
            acquired = dispatcher.acquire() => {
                match acquired {
                    Ok(AcquireOutcome::Job(mut job)) => {
                        metrics.record_job_acquired();
                        *current_job.lock().await = Some(job.clone());

                        let started = std::time::Instant::now();
                        let outcome = process_job(&config, &assembler, &mut job).await;
                        metrics.record_task(started.elapsed());

                        match outcome {
                            Ok(()) => metrics.record_job_outcome(true),
                            Err(e) => {
                                error!(test_id = %job.test_id, error = %e, "job failed");
                                metrics.record_job_outcome(false);
                            }
                        }

                        *current_job.lock().await = None;
                    }
                    Ok(AcquireOutcome::NoWork) => {
                        tokio::time::sleep(config.poll_interval).await;
                    }
                    Ok(AcquireOutcome::RebootRequested) => {
                        warn!("coordinator requested reboot, stopping dispatch loop");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, "acquire failed");
                        tokio::time::sleep(config.poll_interval).await;
                    }
                }
            }
        }
    }
}

/// Compile the job's script, drive every task in its run x view sequence,
/// merge capture artifacts into a canonical result, and ship the assembled
/// archive back to the coordinator.
async fn process_job(
    config: &AgentConfig,
    assembler: &ResultAssembler,
    job: &mut Job,
) -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = config.work_dir.join(&job.test_id);
    tokio::fs::create_dir_all(&work_dir).await.ok();

    let (commands, step_count) = ScriptCompiler::compile(job);
    let controller = RunController::new(NullDriver, NullShaper, work_dir.clone());

    let mut final_result = CanonicalResult::default();
    let mut last_error = None;

    loop {
        let Some(mut task) = controller.next_task(job, 0) else {
            break;
        };
        task.script = commands.clone();
        task.script_step_count = step_count;

        if let Err(e) = controller.drive(job, &mut task).await {
            warn!(test_id = %job.test_id, run = task.run, error = %e, "task drive failed");
            last_error = Some(e);
            continue;
        }

        ArtifactProcessor::run(&mut final_result, None, None, None, None);
    }

    job.success = last_error.is_none();

    let zip_path = work_dir.join("result.zip");
    let result_json = work_dir.join("result.json");
    tokio::fs::write(&result_json, serde_json::to_vec(&final_result)?).await?;

    let staged = vec![StagedFile {
        path: result_json.clone(),
        archive_name: "result.json".to_string(),
    }];
    assembler.assemble_zip(&staged, &zip_path)?;

    assembler
        .finalize(job, &zip_path, job.success, 0, false, true, None, None, None)
        .await?;

    if let Some(e) = last_error {
        return Err(e.into());
    }
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        let _ = shutdown_tx.send(());
    })
}
