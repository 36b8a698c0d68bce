//! Open-loop dispatcher
//!
//! Issues work tokens on a schedule derived from the target rate, regardless
//! of how quickly workers complete them. When a wake-up overshoots its
//! deadline, the missed arrivals are issued together in the next cycle so
//! the average rate still converges on the target.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{validate_rate, ArrivalDistribution, ConfigError, RateBasis, RunConfig};
use crate::queue::BoundedQueue;
use crate::shutdown::StopSignal;

const NANOS_PER_SEC: f64 = 1e9;

/// Unit of work handed from the dispatcher to a worker
#[derive(Debug, Clone)]
pub struct WorkToken {
    submitted: Instant,
    phase_id: u32,
    pickup: Option<Instant>,
}

impl WorkToken {
    pub fn new(phase_id: u32) -> Self {
        Self {
            submitted: Instant::now(),
            phase_id,
            pickup: None,
        }
    }

    pub fn submitted(&self) -> Instant {
        self.submitted
    }

    pub fn phase_id(&self) -> u32 {
        self.phase_id
    }

    pub fn pickup(&self) -> Option<Instant> {
        self.pickup
    }

    /// Stamp the pickup time (first call only) and return the drift.
    pub fn mark_pickup(&mut self) -> Duration {
        let pickup = *self.pickup.get_or_insert_with(Instant::now);
        pickup.saturating_duration_since(self.submitted)
    }

    /// Submission-to-pickup delay, once picked up
    pub fn drift(&self) -> Option<Duration> {
        self.pickup
            .map(|p| p.saturating_duration_since(self.submitted))
    }
}

/// One timed segment of the run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Phase {
    pub id: u32,
    pub rate: f64,
    pub duration: Duration,
}

impl Phase {
    pub fn new(id: u32, rate: f64, duration: Duration) -> Result<Self, ConfigError> {
        validate_rate(id, rate)?;
        if duration.is_zero() {
            return Err(ConfigError::InvalidDuration { phase: id, secs: 0.0 });
        }
        Ok(Self { id, rate, duration })
    }
}

/// Fixed interval for `rate` arrivals per second
pub fn regular_interval_ns(rate: f64) -> u64 {
    (NANOS_PER_SEC / rate).round() as u64
}

/// Draws inter-arrival intervals in nanoseconds
#[derive(Debug, Clone)]
pub struct IntervalSource {
    arrival: ArrivalDistribution,
    rate: f64,
    rng: StdRng,
}

impl IntervalSource {
    pub fn new(arrival: ArrivalDistribution, rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { arrival, rate, rng }
    }

    pub fn next_interval_ns(&mut self) -> u64 {
        match self.arrival {
            ArrivalDistribution::Regular => regular_interval_ns(self.rate),
            ArrivalDistribution::Poisson => {
                // Inverse CDF of the exponential distribution
                let u: f64 = self.rng.gen();
                let wait_s = -(1.0 - u).ln() / self.rate;
                (wait_s * NANOS_PER_SEC) as u64
            }
        }
    }
}

/// Intervals to accumulate after waking `overshoot_ns` past the deadline.
///
/// Returns `(tokens, advance_ns)`: the deadline moves forward by
/// `advance_ns`, which is strictly greater than the overshoot, and `tokens`
/// arrivals are due in the next cycle.
pub fn catch_up(overshoot_ns: u64, intervals: &mut IntervalSource) -> (usize, u64) {
    let mut tokens = 0;
    let mut advance_ns = 0u64;
    loop {
        advance_ns += intervals.next_interval_ns().max(1);
        tokens += 1;
        if advance_ns > overshoot_ns {
            return (tokens, advance_ns);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    WarmingUp,
    SteadyDispatch,
    PhaseComplete,
}

/// Rate the current phase is paced at, shared with the workers
#[derive(Debug, Clone, Default)]
pub struct CurrentRate(Arc<AtomicU64>);

impl CurrentRate {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Items between periodic diagnostics: one second's worth at the current rate
    pub fn report_every(&self) -> u64 {
        (self.get().ceil() as u64).max(1)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub phase_id: u32,
    /// Rate the phase was paced at
    pub rate: f64,
    pub dispatched: u64,
    pub evicted: u64,
    pub cycles: u64,
    /// Cycles that issued more than one token
    pub bursts: u64,
    pub largest_burst: usize,
    pub elapsed: Duration,
    pub final_state: DispatchState,
    pub cancelled: bool,
}

impl DispatchReport {
    fn new(phase_id: u32, rate: f64) -> Self {
        Self {
            phase_id,
            rate,
            dispatched: 0,
            evicted: 0,
            cycles: 0,
            bursts: 0,
            largest_burst: 0,
            elapsed: Duration::ZERO,
            final_state: DispatchState::WarmingUp,
            cancelled: false,
        }
    }

    pub fn achieved_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.dispatched as f64 / secs
    }
}

pub struct Dispatcher {
    phases: Vec<Phase>,
    arrival: ArrivalDistribution,
    rate_basis: RateBasis,
    seed: Option<u64>,
    state: DispatchState,
    current_rate: CurrentRate,
}

impl Dispatcher {
    pub fn new(
        phases: Vec<Phase>,
        arrival: ArrivalDistribution,
        rate_basis: RateBasis,
    ) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }
        let current_rate = CurrentRate::new();
        current_rate.set(phases[0].rate);
        Ok(Self {
            phases,
            arrival,
            rate_basis,
            seed: None,
            state: DispatchState::WarmingUp,
            current_rate,
        })
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        let phases = config
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let id = i as u32 + 1;
                Phase::new(id, p.rate, p.duration(id)?)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut dispatcher = Self::new(phases, config.arrival, config.rate_basis)?;
        dispatcher.seed = config.seed;
        Ok(dispatcher)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Handle the workers read their diagnostic cadence from
    pub fn current_rate(&self) -> CurrentRate {
        self.current_rate.clone()
    }

    /// Rate `phase` is actually paced at under the configured basis
    pub fn pacing_rate(&self, phase: &Phase) -> f64 {
        match self.rate_basis {
            RateBasis::Fixed => phase.rate,
            RateBasis::LowestOfPhases => self
                .phases
                .iter()
                .map(|p| p.rate)
                .fold(f64::INFINITY, f64::min),
        }
    }

    /// Run every phase in order. Stops early if `stop` fires.
    pub fn run(&mut self, queue: &BoundedQueue<WorkToken>, stop: &StopSignal) -> Vec<DispatchReport> {
        let mut reports = Vec::with_capacity(self.phases.len());
        for index in 0..self.phases.len() {
            let report = self.run_phase(index, queue, stop);
            let cancelled = report.cancelled;
            reports.push(report);
            if cancelled {
                break;
            }
        }
        reports
    }

    /// Run one phase to completion (or cancellation).
    pub fn run_phase(
        &mut self,
        index: usize,
        queue: &BoundedQueue<WorkToken>,
        stop: &StopSignal,
    ) -> DispatchReport {
        let phase = self.phases[index];
        let rate = self.pacing_rate(&phase);
        let seed = self.seed.map(|s| s.wrapping_add(u64::from(phase.id)));
        let mut intervals = IntervalSource::new(self.arrival, rate, seed);
        let mut report = DispatchReport::new(phase.id, rate);

        self.state = DispatchState::WarmingUp;
        self.current_rate.set(rate);
        log::info!(
            "phase {}: dispatching at {:.1} tps ({:?} arrivals) for {:?}",
            phase.id,
            rate,
            self.arrival,
            phase.duration
        );

        let start = Instant::now();
        let mut deadline = start + Duration::from_nanos(intervals.next_interval_ns());
        let mut reset = true;
        let mut next_to_add = 1usize;
        let diag_every = self.current_rate.report_every();

        loop {
            let evicted = queue.push_burst(next_to_add, reset, || WorkToken::new(phase.id));
            reset = false;
            self.state = DispatchState::SteadyDispatch;

            report.dispatched += next_to_add as u64;
            report.evicted += evicted as u64;
            report.cycles += 1;
            if next_to_add > 1 {
                report.bursts += 1;
            }
            report.largest_burst = report.largest_burst.max(next_to_add);
            if report.cycles % diag_every == 0 {
                log::debug!(
                    "phase {}: queue length {} after {} cycles ({} evicted)",
                    phase.id,
                    queue.len(),
                    report.cycles,
                    report.evicted
                );
            }

            let Some(now) = sleep_until(deadline, stop) else {
                report.cancelled = true;
                log::warn!("phase {}: cancelled after {} tokens", phase.id, report.dispatched);
                break;
            };

            let overshoot_ns = now.saturating_duration_since(deadline).as_nanos() as u64;
            let (tokens, advance_ns) = catch_up(overshoot_ns, &mut intervals);
            next_to_add = tokens;
            deadline += Duration::from_nanos(advance_ns);

            if now.duration_since(start) >= phase.duration {
                self.state = DispatchState::PhaseComplete;
                break;
            }
        }

        report.elapsed = start.elapsed();
        report.final_state = self.state;
        log::info!(
            "phase {}: {} tokens in {:.2}s ({:.1} tps achieved, {} evicted, {} bursts)",
            phase.id,
            report.dispatched,
            report.elapsed.as_secs_f64(),
            report.achieved_rate(),
            report.evicted,
            report.bursts
        );
        report
    }
}

/// Sleep until `deadline`, re-checking the clock after every wake-up.
/// Returns the wake-up instant, or `None` if `stop` fired first.
fn sleep_until(deadline: Instant, stop: &StopSignal) -> Option<Instant> {
    if stop.is_triggered() {
        return None;
    }
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Some(now);
        }
        if stop.wait_timeout(deadline - now) {
            return None;
        }
    }
}
