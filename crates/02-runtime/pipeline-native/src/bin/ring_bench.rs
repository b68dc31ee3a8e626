//! Drives a loopback pipeline from many producer threads and reports throughput.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use cmd_ring::{RingConfig, DEFAULT_CAPACITY};
use pipeline_native::{LoopbackTransport, Pipeline, Reply};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Command ring pipelining benchmark")]
struct Args {
    /// Concurrent producer threads
    #[arg(long, default_value_t = 8)]
    producers: usize,

    /// Admissions issued by each producer
    #[arg(long, default_value_t = 10_000)]
    requests: usize,

    /// Commands per admission (1 uses single-command admission)
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Ring capacity (power of two)
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    init_tracing();

    let Args {
        producers,
        requests,
        batch,
        capacity,
        timeout_ms,
    } = Args::parse();
    if producers == 0 || requests == 0 || batch == 0 {
        bail!("--producers, --requests and --batch must all be at least 1");
    }
    let timeout = Duration::from_millis(timeout_ms);

    let transport = LoopbackTransport::spawn().context("failed to start loopback server")?;
    let pipeline = Pipeline::start(RingConfig::with_capacity(capacity), transport)
        .with_context(|| format!("failed to start pipeline with capacity {capacity}"))?;
    info!(producers, requests, batch, capacity, "starting benchmark");

    let started = Instant::now();
    let failures: usize = thread::scope(|scope| {
        let workers: Vec<_> = (0..producers)
            .map(|producer| {
                let pipeline = &pipeline;
                scope.spawn(move || run_producer(pipeline, producer, requests, batch, timeout))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or(requests))
            .sum()
    });
    let elapsed = started.elapsed();
    pipeline.shutdown();

    let admissions = producers * requests;
    let commands = admissions * batch;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        "{admissions} admissions ({commands} commands) in {elapsed:?}: {:.0} admissions/s, {:.0} commands/s",
        admissions as f64 / secs,
        commands as f64 / secs,
    );
    if failures > 0 {
        bail!("{failures} admissions failed");
    }
    Ok(())
}

fn run_producer(
    pipeline: &Pipeline,
    producer: usize,
    requests: usize,
    batch: usize,
    timeout: Duration,
) -> usize {
    let key = format!("bench:{producer}");
    let mut failures = 0;
    for i in 0..requests {
        let result = if batch == 1 {
            pipeline
                .do_one(vec!["SET".into(), key.clone(), i.to_string()], timeout)
                .map(|reply| reply == Reply::Ok)
        } else {
            let commands = (0..batch)
                .map(|_| vec!["INCR".into(), key.clone()])
                .collect();
            pipeline
                .do_batch(commands, timeout)
                .map(|replies| replies.iter().all(|reply| matches!(reply, Reply::Integer(_))))
        };
        match result {
            Ok(true) => {}
            Ok(false) => {
                warn!(producer, request = i, "unexpected reply");
                failures += 1;
            }
            Err(err) => {
                warn!(producer, request = i, %err, "request failed");
                failures += 1;
            }
        }
    }
    failures
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cmd_ring=warn"));

    // Ignore error if already set (e.g., during tests).
    let _ = fmt().with_env_filter(env_filter).try_init();
}
