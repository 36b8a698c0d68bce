//! Open-loop driver
//!
//! Runs the configured phases against the simulated executor and prints the
//! latency distribution.

use anyhow::Context;
use driver::logging::init_logging;
use driver::{run, RunConfig, SleepExecutor, StopSignal};
use std::path::Path;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => RunConfig::load(Path::new(path))?,
        None => RunConfig::default(),
    };
    config.validate()?;
    init_logging(config.level_filter()?, config.log_file.as_deref())
        .context("initialising logging")?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.trigger()).context("installing Ctrl-C handler")?;

    let service_time = Duration::from_micros(config.service_time_us);
    let jitter = Duration::from_micros(config.service_jitter_us);
    let kinds = config.transaction_kinds;
    let report = run(&config, &stop, |ctx| {
        SleepExecutor::new(ctx, service_time, jitter, kinds)
    })?;

    println!("\n=== Phases ===");
    for phase in &report.phases {
        println!(
            "Phase {}: {} tokens in {:.2}s (target {:.1} tps, achieved {:.1} tps), {} evicted, {} bursts (largest {}){}",
            phase.phase_id,
            phase.dispatched,
            phase.elapsed.as_secs_f64(),
            phase.rate,
            phase.achieved_rate(),
            phase.evicted,
            phase.bursts,
            phase.largest_burst,
            if phase.cancelled { " [cancelled]" } else { "" }
        );
    }

    println!("\n=== Workers ===");
    for worker in &report.workers {
        println!(
            "Worker {}: {} processed, {} failed, {} samples rejected, drift mean {:?} max {:?}",
            worker.worker_id,
            worker.processed,
            worker.failed,
            worker.rejected_samples,
            worker.drift.mean(),
            worker.drift.max
        );
    }

    let overall = &report.summary.overall;
    println!("\n=== Latency ===");
    println!("Samples: {}", overall.count);
    println!("Rejected samples: {}", report.rejected_samples());
    println!("Mean: {:.2} µs", overall.mean_us);
    println!("p50: {} µs", overall.p50_us);
    println!("p95: {} µs", overall.p95_us);
    println!("p99: {} µs", overall.p99_us);
    println!("Max: {} µs", overall.max_us);
    println!("Throughput: {:.2} tps", report.summary.throughput());
    for (kind, summary) in &report.summary.per_kind {
        println!(
            "  kind {}: {} samples, p50 {} µs, p99 {} µs",
            kind, summary.count, summary.p50_us, summary.p99_us
        );
    }

    println!("\n=== Clock ===");
    println!("Start: {}", report.clock_start);
    println!("End: {}", report.clock_end);
    println!("Sliding window offset: {} ms", report.sliding_window_offset);
    println!("Abandoned tokens: {}", report.abandoned);

    if let Some(path) = &config.summary_csv {
        report
            .write_summary_csv(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Summary written to {}", path.display());
    }

    Ok(())
}
