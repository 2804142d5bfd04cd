//! Executor: orchestration of virtual users over time
//!
//! The `Executor` trait is the runtime that executes a `Scenario`. The built-in
//! [`StageExecutor`] ramps a pool of virtual users up and down following a list of
//! [`Stage`]s, each one a target concurrency reached by linear interpolation over
//! the stage's duration.
pub mod stage;
pub use stage::{ExecutorError, Phase, Stage, StageExecutor};

use crate::scenario::{Scenario, Vu};
use std::{future::Future, time::Duration};

/// What an executor reports back once every virtual user has retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Completed iterations across all virtual users.
    pub iterations: u64,
    /// Size of the virtual-user pool.
    pub vus_max: usize,
    pub elapsed: Duration,
    /// The stage plan was cut short by an abort signal.
    pub aborted: bool,
}

/// The runtime hook that executes a `Scenario`.
///
/// `Executor` defines the execution strategy for a scenario: how many iteration
/// loops run at once, when they start and when they stop. Iterations report their
/// own metrics, so an executor only accounts for iterations and time.
pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send,
{
    type Error;
    /// Execute the scenario until the executor's plan is over and every loop exited.
    fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
    ) -> impl Future<Output = Result<ExecutionSummary, Self::Error>> + Send;
}
