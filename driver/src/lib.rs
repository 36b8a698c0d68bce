//! Open-loop Benchmark Driver
//!
//! Paces work tokens at a calibrated rate into a bounded queue, consumes them
//! with a worker pool and records the latency of every executed request.

use thiserror::Error;

pub mod config;
pub mod dispatcher;
pub mod logging;
pub mod queue;
pub mod runner;
pub mod shutdown;
pub mod worker;

pub use config::{ArrivalDistribution, ConfigError, PhaseConfig, RateBasis, RunConfig};
pub use dispatcher::{DispatchReport, DispatchState, Dispatcher, Phase, WorkToken};
pub use queue::BoundedQueue;
pub use runner::{run, RunReport};
pub use shutdown::StopSignal;
pub use worker::{
    ExecError, NoopExecutor, RequestExecutor, SleepExecutor, WorkerContext, WorkerPool,
    WorkerReport,
};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Anchor(#[from] calibration::AnchorError),
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker {0} panicked")]
    WorkerPanicked(u32),
    #[error("cannot write summary: {0}")]
    Summary(#[from] csv::Error),
}
