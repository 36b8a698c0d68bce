//! Worker pool
//!
//! Workers take tokens off the shared queue, measure how long each token
//! waited, run the request through an executor and record the executed span.

use calibration::SimulatedClock;
use latency_record::LatencyRecorder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::dispatcher::{CurrentRate, WorkToken};
use crate::queue::{BoundedQueue, Pop};
use crate::shutdown::StopSignal;
use crate::DriverError;

/// Longest a worker blocks on an empty queue before re-checking the stop signal
pub const IDLE_WAIT: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
#[error("request failed: {0}")]
pub struct ExecError(pub String);

/// Runs the request a token stands for. Returns the transaction kind executed.
pub trait RequestExecutor: Send {
    fn execute(&mut self, token: &WorkToken) -> Result<u32, ExecError>;
}

/// What an executor factory gets to build one worker's executor
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: u32,
    pub clock: Arc<SimulatedClock>,
    pub seed: Option<u64>,
}

/// Completes every request immediately
#[derive(Debug, Default)]
pub struct NoopExecutor;

impl RequestExecutor for NoopExecutor {
    fn execute(&mut self, _token: &WorkToken) -> Result<u32, ExecError> {
        Ok(0)
    }
}

/// Simulated transaction: consumes one logical timestamp and holds the
/// worker for the configured service time.
#[derive(Debug)]
pub struct SleepExecutor {
    clock: Arc<SimulatedClock>,
    service_time: Duration,
    jitter: Duration,
    kinds: u32,
    rng: StdRng,
}

impl SleepExecutor {
    pub fn new(ctx: &WorkerContext, service_time: Duration, jitter: Duration, kinds: u32) -> Self {
        let rng = match ctx.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_mul(31).wrapping_add(u64::from(ctx.worker_id))),
            None => StdRng::from_entropy(),
        };
        Self {
            clock: Arc::clone(&ctx.clock),
            service_time,
            jitter,
            kinds: kinds.max(1),
            rng,
        }
    }
}

impl RequestExecutor for SleepExecutor {
    fn execute(&mut self, _token: &WorkToken) -> Result<u32, ExecError> {
        self.clock.tick();
        let kind = self.rng.gen_range(0..self.kinds);

        let mut service = self.service_time;
        if !self.jitter.is_zero() {
            let extra = self.rng.gen_range(0..=self.jitter.as_micros() as u64);
            service += Duration::from_micros(extra);
        }
        if !service.is_zero() {
            thread::sleep(service);
        }
        Ok(kind)
    }
}

/// Submission-to-pickup delay statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DriftStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DriftStats {
    pub fn observe(&mut self, drift: Duration) {
        self.count += 1;
        self.total += drift;
        self.max = self.max.max(drift);
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(nanos as u64)
    }
}

/// What one worker did during the run
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: u32,
    pub processed: u64,
    pub failed: u64,
    /// Completed requests whose span the recorder refused
    pub rejected_samples: u64,
    pub drift: DriftStats,
    pub recorder: LatencyRecorder,
}

struct Worker<E> {
    id: u32,
    queue: Arc<BoundedQueue<WorkToken>>,
    stop: StopSignal,
    rate: CurrentRate,
    epoch: Instant,
    executor: E,
}

impl<E: RequestExecutor> Worker<E> {
    fn micros_since_epoch(&self, t: Instant) -> i64 {
        t.saturating_duration_since(self.epoch).as_micros() as i64
    }

    fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport {
            worker_id: self.id,
            processed: 0,
            failed: 0,
            rejected_samples: 0,
            drift: DriftStats::default(),
            recorder: LatencyRecorder::new(0),
        };
        let mut window = DriftStats::default();

        while !self.stop.is_triggered() {
            let mut token = match self.queue.pop_timeout(IDLE_WAIT) {
                Pop::Item(token) => token,
                Pop::Empty => continue,
                Pop::Closed => break,
            };

            let drift = token.mark_pickup();
            report.drift.observe(drift);
            window.observe(drift);
            if window.count >= self.rate.report_every() {
                log::debug!(
                    "worker {}: drift over last {} tokens mean {:?}, max {:?}",
                    self.id,
                    window.count,
                    window.mean(),
                    window.max
                );
                window = DriftStats::default();
            }

            let start = Instant::now();
            match self.executor.execute(&token) {
                Ok(kind) => {
                    let end = Instant::now();
                    report.processed += 1;
                    if let Err(e) = report.recorder.record(
                        kind,
                        self.micros_since_epoch(start),
                        self.micros_since_epoch(end),
                        self.id,
                        token.phase_id(),
                    ) {
                        report.rejected_samples += 1;
                        log::warn!("worker {}: sample not recorded: {}", self.id, e);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("worker {}: {}", self.id, e);
                }
            }
        }

        log::debug!(
            "worker {}: exiting after {} requests ({} failed)",
            self.id,
            report.processed,
            report.failed
        );
        report
    }
}

/// Handles every worker in a pool shares
#[derive(Debug, Clone)]
pub struct WorkerSetup {
    pub queue: Arc<BoundedQueue<WorkToken>>,
    pub stop: StopSignal,
    pub rate: CurrentRate,
    /// Recorded times are microseconds since this instant
    pub epoch: Instant,
    pub clock: Arc<SimulatedClock>,
    pub seed: Option<u64>,
}

pub struct WorkerPool {
    handles: Vec<(u32, JoinHandle<WorkerReport>)>,
}

impl WorkerPool {
    /// Start `workers` threads consuming from the shared queue.
    pub fn spawn<E, F>(workers: usize, setup: &WorkerSetup, make_executor: F) -> Result<Self, DriverError>
    where
        E: RequestExecutor + 'static,
        F: Fn(&WorkerContext) -> E,
    {
        if workers == 0 {
            return Err(crate::config::ConfigError::NoWorkers.into());
        }

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers as u32 {
            let ctx = WorkerContext {
                worker_id: id,
                clock: Arc::clone(&setup.clock),
                seed: setup.seed,
            };
            let worker = Worker {
                id,
                queue: Arc::clone(&setup.queue),
                stop: setup.stop.clone(),
                rate: setup.rate.clone(),
                epoch: setup.epoch,
                executor: make_executor(&ctx),
            };
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker.run())
                .map_err(DriverError::Spawn)?;
            handles.push((id, handle));
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker. Call after closing the queue or stopping.
    pub fn join(self) -> Result<Vec<WorkerReport>, DriverError> {
        self.handles
            .into_iter()
            .map(|(id, handle)| handle.join().map_err(|_| DriverError::WorkerPanicked(id)))
            .collect()
    }
}
