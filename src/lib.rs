//! review-load: staged load generation and SLA verification for the team / pull
//! request reviewer service.
//!
//! The harness follows the shape of K6-style tools: a population of virtual users
//! repeatedly runs a scenario iteration against the service, while a collector
//! records request latencies, failure rates and inline checks. When the stage plan
//! is over, a threshold gate turns the collected statistics into a pass/fail verdict.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: names the per-iteration action a virtual user repeats.
//! - [`Executor`]: responsible for actually running the scenario. The built-in
//!   [`StageExecutor`] ramps virtual users up and down following a list of [`Stage`]s.
//! - [`Metric`]: the smallest unit an iteration records, a duration or a boolean.
//! - [`Aggregate`]: a mergeable collector that folds `Metric`s into a compact
//!   intermediate representation.
//! - [`MetricsRegistry`]: declares metrics up front and hands out cheap recording
//!   handles; snapshots turn aggregates into [`Report`]s.
//! - [`ThresholdGate`]: evaluates `p(95)<300`-style expressions over snapshots.
//! - [`Reporter`]: consumes the final [`RunReport`] and sends it somewhere.
//! - [`LoadTest`]: glues everything together for the reviewer service.
//!
//! # Feature flags
//! - `internals`: enable access to the scheduler's internal (and unstable) building blocks
//!
//! # Where to start
//!
//! [`Config`] describes a load profile; [`LoadTest::new`] builds a run from it and
//! [`LoadTest::run`] returns the [`RunReport`] carrying the verdict.

/// Metric aggregators
pub mod aggregate;
/// HTTP contract of the service under test
pub mod client;
/// Metric declaration and recording
pub mod collector;
pub mod config;
/// Orchestrators that define how things will actually run
pub mod executor;
pub mod fixture;
/// Single metrics
pub mod metric;
pub mod random;
/// Reports and Reporters
pub mod report;
pub mod runner;
/// Per-iteration behavior
pub mod scenario;
pub mod threshold;

pub use aggregate::Aggregate;
pub use collector::MetricsRegistry;
pub use config::Config;
pub use executor::{Executor, Stage, StageExecutor};
pub use metric::Metric;
pub use report::{Report, Reporter, RunReport};
pub use runner::LoadTest;
pub use scenario::Scenario;
pub use threshold::ThresholdGate;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Metric(#[from] collector::MetricError),
    #[error(transparent)]
    Threshold(#[from] threshold::ThresholdError),
    #[error(transparent)]
    Transport(#[from] client::TransportError),
    #[error(transparent)]
    Executor(#[from] executor::ExecutorError),
    #[error(transparent)]
    Report(#[from] report::ReportError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
