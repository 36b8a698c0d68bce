//! Latency distribution summaries built from replayed samples

use crate::LatencyRecorder;
use serde::Serialize;
use std::collections::BTreeMap;

/// Distribution of latencies for a set of samples (µs)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_us: f64,
    pub min_us: u32,
    pub max_us: u32,
    pub p50_us: u32,
    pub p95_us: u32,
    pub p99_us: u32,
}

impl LatencySummary {
    /// Summarize unsorted latencies.
    pub fn from_latencies(mut latencies: Vec<u32>) -> Self {
        if latencies.is_empty() {
            return Self::empty();
        }
        latencies.sort_unstable();
        let sum: u64 = latencies.iter().map(|&l| u64::from(l)).sum();

        Self {
            count: latencies.len(),
            mean_us: sum as f64 / latencies.len() as f64,
            min_us: latencies[0],
            max_us: latencies[latencies.len() - 1],
            p50_us: percentile(&latencies, 0.50),
            p95_us: percentile(&latencies, 0.95),
            p99_us: percentile(&latencies, 0.99),
        }
    }

    pub fn empty() -> Self {
        Self {
            count: 0,
            mean_us: 0.0,
            min_us: 0,
            max_us: 0,
            p50_us: 0,
            p95_us: 0,
            p99_us: 0,
        }
    }
}

fn percentile(sorted: &[u32], p: f64) -> u32 {
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Overall and per-transaction-kind summaries across recorders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub overall: LatencySummary,
    pub per_kind: BTreeMap<u32, LatencySummary>,
    /// Start of the first sample to end of the last one (µs)
    pub span_us: i64,
}

impl RunSummary {
    pub fn from_recorders<'a, I>(recorders: I) -> Self
    where
        I: IntoIterator<Item = &'a LatencyRecorder>,
    {
        let mut all = Vec::new();
        let mut by_kind: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut first_start = i64::MAX;
        let mut last_end = i64::MIN;

        for recorder in recorders {
            for sample in recorder {
                all.push(sample.latency_us);
                by_kind.entry(sample.kind).or_default().push(sample.latency_us);
                first_start = first_start.min(sample.start_us);
                last_end = last_end.max(sample.end_us());
            }
        }

        let span_us = if all.is_empty() { 0 } else { last_end - first_start };
        Self {
            overall: LatencySummary::from_latencies(all),
            per_kind: by_kind
                .into_iter()
                .map(|(kind, latencies)| (kind, LatencySummary::from_latencies(latencies)))
                .collect(),
            span_us,
        }
    }

    /// Completed requests per second over the recorded span
    pub fn throughput(&self) -> f64 {
        if self.span_us <= 0 {
            return 0.0;
        }
        self.overall.count as f64 / (self.span_us as f64 / 1e6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let summary = LatencySummary::from_latencies((1..=100).rev().collect());
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_us, 1);
        assert_eq!(summary.max_us, 100);
        assert_eq!(summary.p50_us, 51);
        assert_eq!(summary.p95_us, 96);
        assert_eq!(summary.p99_us, 100);
        assert_eq!(summary.mean_us, 50.5);
    }

    #[test]
    fn test_empty() {
        assert_eq!(LatencySummary::from_latencies(Vec::new()), LatencySummary::empty());
        let run = RunSummary::from_recorders(std::iter::empty());
        assert_eq!(run.overall.count, 0);
        assert_eq!(run.throughput(), 0.0);
    }

    #[test]
    fn test_run_summary_across_recorders() {
        let mut a = LatencyRecorder::new(0);
        let mut b = LatencyRecorder::new(0);
        a.record(1, 0, 100, 0, 0).unwrap();
        a.record(2, 500_000, 500_300, 0, 0).unwrap();
        b.record(1, 250_000, 250_200, 1, 0).unwrap();
        b.record(1, 999_000, 1_000_000, 1, 0).unwrap();

        let run = RunSummary::from_recorders([&a, &b]);
        assert_eq!(run.overall.count, 4);
        assert_eq!(run.per_kind[&1].count, 3);
        assert_eq!(run.per_kind[&2].max_us, 300);
        assert_eq!(run.span_us, 1_000_000);
        assert_eq!(run.throughput(), 4.0);
    }
}
