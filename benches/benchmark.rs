use criterion::{black_box, criterion_group, criterion_main, Criterion};
use probe_agent::artifact_processor::{ArtifactProcessor, TimedEvent};
use probe_agent::config::{CanonicalResult, Job};
use probe_agent::dispatcher::salted_token;
use probe_agent::script::ScriptCompiler;
use probe_agent::utils::{format_bytes, format_duration, sanitize_filename, validate_url};
use std::time::Duration;

fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_script_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("script_compile");
    configure_fast_group(&mut group);

    let script = "navigate\thttps://example.com\n\
                  setdnsname\texample.internal\t127.0.0.1\n\
                  exec\tdocument.title\n\
                  navigate\thttps://example.com/page2\n"
        .to_string();

    group.bench_function("compile", |b| {
        b.iter(|| {
            let mut job = Job {
                script: Some(script.clone()),
                ..default_job()
            };
            let result = ScriptCompiler::compile(&mut job);
            black_box(result);
        });
    });

    group.finish();
}

fn benchmark_artifact_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_merge");
    configure_fast_group(&mut group);

    let events: Vec<TimedEvent> = (0..50)
        .map(|i| TimedEvent {
            name: format!("mark-{i}"),
            entry_type: "mark".to_string(),
            start_time: (i * 37) as f64,
            duration: None,
        })
        .collect();

    group.bench_function("merge_user_timing", |b| {
        b.iter(|| {
            let mut result = CanonicalResult::default();
            ArtifactProcessor::run(&mut result, Some(&events), None, None, None);
            black_box(result);
        });
    });

    group.finish();
}

fn benchmark_salted_token(c: &mut Criterion) {
    let mut group = c.benchmark_group("salted_token");
    configure_fast_group(&mut group);

    group.bench_function("derive", |b| {
        b.iter(|| {
            let token = salted_token("AGENT-42", "s3cret", Some("202405"));
            black_box(token);
        });
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = ["https://example.com", "http://example.com/path", "invalid-url"];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = [Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes = [1024_usize, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                black_box(format_duration(*duration));
            }
        });
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                black_box(format_bytes(*size));
            }
        });
    });

    group.bench_function("sanitize_filename", |b| {
        b.iter(|| {
            black_box(sanitize_filename("results/run:1?.json"));
        });
    });

    group.finish();
}

fn default_job() -> Job {
    use probe_agent::config::{JobState, NetworkConfig, OutputRouting, Viewport};
    use std::collections::HashMap;

    Job {
        test_id: "bench".to_string(),
        signature: String::new(),
        work_server: String::new(),
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
        url: Some("https://example.com".to_string()),
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

criterion_group!(
    unit_benches,
    benchmark_script_compile,
    benchmark_artifact_merge,
    benchmark_salted_token,
    benchmark_url_validation,
    benchmark_format_utilities,
);
criterion_main!(unit_benches);
