//! Wires the clock, queue, dispatcher and worker pool together for one run

use calibration::{AnchorStore, DensityParameters, FileAnchorStore, SimulatedClock};
use latency_record::RunSummary;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RunConfig;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::queue::BoundedQueue;
use crate::shutdown::StopSignal;
use crate::worker::{RequestExecutor, WorkerContext, WorkerPool, WorkerReport, WorkerSetup};
use crate::DriverError;

/// Outcome of a complete run
#[derive(Debug)]
pub struct RunReport {
    pub phases: Vec<DispatchReport>,
    pub workers: Vec<WorkerReport>,
    /// Tokens still queued when the run ended
    pub abandoned: usize,
    pub summary: RunSummary,
    pub clock_start: i64,
    pub clock_end: i64,
    pub sliding_window_offset: i64,
}

impl RunReport {
    pub fn dispatched(&self) -> u64 {
        self.phases.iter().map(|p| p.dispatched).sum()
    }

    pub fn evicted(&self) -> u64 {
        self.phases.iter().map(|p| p.evicted).sum()
    }

    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.workers.iter().map(|w| w.failed).sum()
    }

    /// Executed requests whose span the recorder refused
    pub fn rejected_samples(&self) -> u64 {
        self.workers.iter().map(|w| w.rejected_samples).sum()
    }

    pub fn cancelled(&self) -> bool {
        self.phases.iter().any(|p| p.cancelled)
    }

    /// Write one CSV row per transaction kind plus an `all` row.
    pub fn write_summary_csv(&self, path: &Path) -> Result<(), DriverError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.serialize(SummaryRow::new("all", &self.summary.overall))?;
        for (kind, summary) in &self.summary.per_kind {
            writer.serialize(SummaryRow::new(&kind.to_string(), summary))?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    kind: &'a str,
    count: usize,
    mean_us: f64,
    min_us: u32,
    p50_us: u32,
    p95_us: u32,
    p99_us: u32,
    max_us: u32,
}

impl<'a> SummaryRow<'a> {
    fn new(kind: &'a str, s: &latency_record::LatencySummary) -> Self {
        Self {
            kind,
            count: s.count,
            mean_us: s.mean_us,
            min_us: s.min_us,
            p50_us: s.p50_us,
            p95_us: s.p95_us,
            p99_us: s.p99_us,
            max_us: s.max_us,
        }
    }
}

/// Build the simulated clock: resumed from the anchor directory when one is
/// configured (failure is fatal), otherwise a fresh timeline starting now.
pub fn build_clock(config: &RunConfig) -> Result<SimulatedClock, DriverError> {
    let params = DensityParameters::new(config.clock_rate()).map_err(crate::ConfigError::from)?;
    let clock = match &config.clock.anchor_dir {
        Some(dir) => SimulatedClock::resume_from_store(
            &params,
            config.clock.warehouses,
            config.clock.hybrid,
            &FileAnchorStore::new(),
            dir,
        )?,
        None => {
            log::info!("no anchor directory configured; starting a fresh simulated timeline");
            SimulatedClock::for_population(&params, config.clock.warehouses)
        }
    };
    log::info!(
        "simulated clock at {} advancing {} ms per tick (density {:.3})",
        clock.start_timestamp(),
        clock.delta_ts(),
        params.density()
    );
    Ok(clock)
}

/// Run every configured phase, consuming tokens with executors built by
/// `make_executor`. Returns once the last phase completes or `stop` fires.
pub fn run<E, F>(config: &RunConfig, stop: &StopSignal, make_executor: F) -> Result<RunReport, DriverError>
where
    E: RequestExecutor + 'static,
    F: Fn(&WorkerContext) -> E,
{
    config.validate()?;
    let clock = Arc::new(build_clock(config)?);
    let mut dispatcher = Dispatcher::from_config(config)?;
    let queue = Arc::new(BoundedQueue::new(config.queue_capacity)?);

    let setup = WorkerSetup {
        queue: Arc::clone(&queue),
        stop: stop.clone(),
        rate: dispatcher.current_rate(),
        epoch: Instant::now(),
        clock: Arc::clone(&clock),
        seed: config.seed,
    };
    let pool = WorkerPool::spawn(config.workers, &setup, make_executor)?;
    log::info!(
        "{} workers consuming from a queue of {} tokens",
        pool.len(),
        queue.capacity()
    );

    let phases = dispatcher.run(&queue, stop);

    queue.close();
    let abandoned = queue.drain();
    let workers = pool.join()?;
    let summary = RunSummary::from_recorders(workers.iter().map(|w| &w.recorder));

    if let Some(dir) = &config.clock.write_anchors_to {
        FileAnchorStore::new().write(dir, clock.population_anchors())?;
    }

    let report = RunReport {
        phases,
        workers,
        abandoned,
        summary,
        clock_start: clock.start_timestamp(),
        clock_end: clock.current_value(),
        sliding_window_offset: clock.sliding_window_offset(),
    };
    log::info!(
        "run finished: {} dispatched, {} evicted, {} processed, {} failed, {} abandoned, {} samples rejected",
        report.dispatched(),
        report.evicted(),
        report.processed(),
        report.failed(),
        report.abandoned,
        report.rejected_samples()
    );
    Ok(report)
}
