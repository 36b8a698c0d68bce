//! Simulated logical clock
//!
//! Timestamps written during population advance by a fixed step per row
//! instead of following the wall clock, which reproduces the timestamp
//! density the transactional workload would have produced. Analytical query
//! parameters drawn from the reference date range are mapped onto this
//! simulated timeline.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::anchor::{AnchorError, AnchorStore, Anchors};
use crate::{CalibrationError, DensityParameters};

/// Timestamped rows per warehouse during population:
/// 10 districts x 3000 customers x 2 rows
pub const TIMESTAMPS_PER_WAREHOUSE: i64 = 10 * 3000 * 2;

/// 1992-01-01T00:00:00Z in epoch milliseconds
pub const REFERENCE_START_MS: i64 = 694_224_000_000;

/// 1998-12-31T23:59:59Z in epoch milliseconds
pub const REFERENCE_END_MS: i64 = 915_148_799_000;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Date range the analytical query generator draws its parameters from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceRange {
    start_ms: i64,
    end_ms: i64,
}

impl ReferenceRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self, CalibrationError> {
        if start_ms >= end_ms {
            return Err(CalibrationError::EmptyReferenceRange { start_ms, end_ms });
        }
        Ok(Self { start_ms, end_ms })
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    /// Fraction of the range elapsed at `ts` (not clamped)
    fn fraction(&self, ts: i64) -> f64 {
        (ts - self.start_ms) as f64 / (self.end_ms - self.start_ms) as f64
    }
}

impl Default for ReferenceRange {
    fn default() -> Self {
        Self {
            start_ms: REFERENCE_START_MS,
            end_ms: REFERENCE_END_MS,
        }
    }
}

/// Which benchmark stage the clock was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Loading data; the clock starts at wall-clock now
    Populate,
    /// Running the workload from recovered anchors
    Execute { hybrid: bool },
}

/// Monotonic logical clock shared by handle between loaders and workers.
#[derive(Debug)]
pub struct SimulatedClock {
    value: AtomicI64,
    delta_ts: i64,
    warehouses: u32,
    start_time: i64,
    populate_start_time: i64,
    mode: ClockMode,
    reference: ReferenceRange,
}

impl SimulatedClock {
    /// Clock for the population phase, starting at wall-clock now.
    pub fn for_population(params: &DensityParameters, warehouses: u32) -> Self {
        Self::populating_from(params, warehouses, now_millis())
    }

    /// Population clock with an explicit start time (epoch ms).
    pub fn populating_from(params: &DensityParameters, warehouses: u32, start_ms: i64) -> Self {
        Self::build(
            params.delta_ts(),
            warehouses,
            start_ms,
            start_ms,
            ClockMode::Populate,
        )
    }

    /// Clock for the execute phase. The timeline continues from the last
    /// populated timestamp; the first populated timestamp anchors the
    /// reference mapping.
    pub fn resume(
        params: &DensityParameters,
        warehouses: u32,
        hybrid: bool,
        anchors: Anchors,
    ) -> Self {
        Self::build(
            params.delta_ts(),
            warehouses,
            anchors.last_load,
            anchors.start_load,
            ClockMode::Execute { hybrid },
        )
    }

    /// Execute-phase clock with anchors read from `store`. A missing or
    /// corrupt anchor is fatal: there is no safe default for the last
    /// populated timestamp.
    pub fn resume_from_store<S: AnchorStore + ?Sized>(
        params: &DensityParameters,
        warehouses: u32,
        hybrid: bool,
        store: &S,
        dir: &Path,
    ) -> Result<Self, AnchorError> {
        let anchors = store.read(dir)?;
        log::info!(
            "resuming simulated clock from {} (populated since {}, hybrid={})",
            anchors.last_load,
            anchors.start_load,
            hybrid
        );
        Ok(Self::resume(params, warehouses, hybrid, anchors))
    }

    fn build(
        delta_ts: i64,
        warehouses: u32,
        start_time: i64,
        populate_start_time: i64,
        mode: ClockMode,
    ) -> Self {
        Self {
            value: AtomicI64::new(start_time),
            delta_ts,
            warehouses,
            start_time,
            populate_start_time,
            mode,
            reference: ReferenceRange::default(),
        }
    }

    pub fn with_reference_range(mut self, reference: ReferenceRange) -> Self {
        self.reference = reference;
        self
    }

    /// Advance by one step and return the new timestamp.
    pub fn tick(&self) -> i64 {
        self.value.fetch_add(self.delta_ts, Ordering::SeqCst) + self.delta_ts
    }

    pub fn current_value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn start_timestamp(&self) -> i64 {
        self.start_time
    }

    pub fn populate_start_timestamp(&self) -> i64 {
        self.populate_start_time
    }

    pub fn delta_ts(&self) -> i64 {
        self.delta_ts
    }

    pub fn warehouses(&self) -> u32 {
        self.warehouses
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn reference_range(&self) -> ReferenceRange {
        self.reference
    }

    pub fn is_populating(&self) -> bool {
        self.mode == ClockMode::Populate
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self.mode, ClockMode::Execute { hybrid: true })
    }

    /// Last timestamp the population phase is expected to reach.
    pub fn final_populated_timestamp(&self) -> i64 {
        let rows = i64::from(self.warehouses) * TIMESTAMPS_PER_WAREHOUSE;
        self.start_time + self.delta_ts * rows
    }

    /// How far the execute phase has moved the window past the populated
    /// data. Zero unless running a hybrid workload.
    pub fn sliding_window_offset(&self) -> i64 {
        if self.is_hybrid() {
            self.current_value() - self.start_time
        } else {
            0
        }
    }

    /// Map a timestamp from the reference range onto the simulated timeline.
    ///
    /// The fraction of the reference range elapsed at `ts` is applied to the
    /// populated interval `[populate_start, start)`, so query selectivity is
    /// comparable across runs regardless of how long population took.
    pub fn map_reference_timestamp(&self, ts: i64) -> i64 {
        let populated_span = self.start_time - self.populate_start_time;
        let fraction = self.reference.fraction(ts);
        let offset =
            (self.sliding_window_offset() as f64 + fraction * populated_span as f64) as i64;
        offset + self.populate_start_time
    }

    /// End of the reference range shifted back by `days`.
    pub fn reference_end_minus_days(&self, days: u32) -> i64 {
        self.reference.end_ms - i64::from(days) * MS_PER_DAY
    }

    /// Anchors to persist once population finishes.
    pub fn population_anchors(&self) -> Anchors {
        Anchors {
            start_load: self.populate_start_time,
            last_load: self.current_value(),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn params() -> DensityParameters {
        DensityParameters::new(128.0).unwrap()
    }

    #[test]
    fn test_tick_advances_by_delta() {
        let clock = SimulatedClock::populating_from(&params(), 1, 1_000);
        assert_eq!(clock.current_value(), 1_000);
        assert_eq!(clock.tick(), 1_006);
        assert_eq!(clock.tick(), 1_012);
        assert_eq!(clock.current_value(), 1_012);
        assert_eq!(clock.start_timestamp(), 1_000);
    }

    #[test]
    fn test_concurrent_ticks_are_not_lost() {
        let clock = Arc::new(SimulatedClock::populating_from(&params(), 1, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        clock.tick();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(clock.current_value(), 8 * 1000 * 6);
    }

    #[test]
    fn test_final_populated_timestamp() {
        let clock = SimulatedClock::populating_from(&params(), 4, 5_000);
        assert_eq!(clock.final_populated_timestamp(), 5_000 + 6 * 4 * 60_000);
    }

    #[test]
    fn test_population_maps_reference_start_to_anchor() {
        let clock = SimulatedClock::populating_from(&params(), 2, 1_700_000_000_000);
        clock.tick();
        assert_eq!(
            clock.map_reference_timestamp(REFERENCE_START_MS),
            clock.populate_start_timestamp()
        );
        assert_eq!(clock.sliding_window_offset(), 0);
    }

    #[test]
    fn test_execute_mapping_spans_populated_interval() {
        let anchors = Anchors {
            start_load: 1_000_000,
            last_load: 2_000_000,
        };
        let clock = SimulatedClock::resume(&params(), 1, false, anchors);
        let range = clock.reference_range();

        assert_eq!(clock.map_reference_timestamp(range.start_ms()), 1_000_000);
        assert_eq!(clock.map_reference_timestamp(range.end_ms()), 2_000_000);

        let mid = range.start_ms() + (range.end_ms() - range.start_ms()) / 2;
        let mapped = clock.map_reference_timestamp(mid);
        assert!((mapped - 1_500_000).abs() <= 1);

        // Not hybrid: ticking does not move the window
        clock.tick();
        assert_eq!(clock.map_reference_timestamp(range.start_ms()), 1_000_000);
    }

    #[test]
    fn test_hybrid_window_slides_with_ticks() {
        let anchors = Anchors {
            start_load: 0,
            last_load: 10_000,
        };
        let clock = SimulatedClock::resume(&params(), 1, true, anchors);
        let before = clock.map_reference_timestamp(REFERENCE_START_MS);
        for _ in 0..10 {
            clock.tick();
        }
        assert_eq!(clock.sliding_window_offset(), 60);
        assert_eq!(clock.map_reference_timestamp(REFERENCE_START_MS), before + 60);
        assert!(clock.is_hybrid());
    }

    #[test]
    fn test_reference_end_minus_days() {
        let clock = SimulatedClock::populating_from(&params(), 1, 0);
        assert_eq!(
            clock.reference_end_minus_days(30),
            REFERENCE_END_MS - 30 * 86_400_000
        );
    }

    #[test]
    fn test_population_anchors_track_current_value() {
        let clock = SimulatedClock::populating_from(&params(), 1, 100);
        clock.tick();
        clock.tick();
        assert_eq!(
            clock.population_anchors(),
            Anchors {
                start_load: 100,
                last_load: 112
            }
        );
    }

    #[test]
    fn test_empty_reference_range_rejected() {
        assert!(ReferenceRange::new(10, 10).is_err());
        let range = ReferenceRange::new(0, 1_000).unwrap();
        let clock = SimulatedClock::resume(
            &params(),
            1,
            false,
            Anchors {
                start_load: 0,
                last_load: 100,
            },
        )
        .with_reference_range(range);
        assert_eq!(clock.map_reference_timestamp(500), 50);
    }
}
