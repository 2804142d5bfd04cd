//! The `StageExecutor` and its components, providing a stage-based, closed-model
//! virtual-user scheduler.
//!
//! A list of [`Stage`]s describes how many virtual users (VUs) should be running
//! over time. Each `Stage` defines a target VU count and the duration over which
//! the governor interpolates from the previous stage's target to it.
//!
//! Target generation (governor task) is kept apart from work execution (worker
//! tasks), so the hot path in workers only calls the scenario's `action`.
//!
//! # High-level flow
//! 1. A pool of `vus_max` workers is spawned, `vus_max` being the largest target
//!    among all stages. Worker `id` is active while `id < target`.
//! 2. The governor walks the stages, publishing the interpolated target every
//!    `tick`, and the current [`Phase`] on a watch channel.
//! 3. Active workers run iterations back to back. A worker that falls outside the
//!    target finishes its current iteration first, then idles.
//! 4. After the last stage (or an abort signal) the target drops to zero and the
//!    workers are told to shut down. Shutdown is only observed between
//!    iterations, so no in-flight iteration is ever cancelled.
//!
//! # Mathematical behavior of the governor
//! For a stage ramping from `from` to `to` VUs over `duration`:
//!
//! ```text
//! t = min(elapsed / duration, 1)
//! target(t) = floor(from + (to - from) * t)
//! ```
//!
//! A zero-duration stage jumps to `to` immediately.
use serde::{Deserialize, Serialize};
use tokio::sync::watch::{self, Receiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{ExecutionSummary, Executor};
use crate::scenario::{Scenario, Vu};
use internals::*;

use futures::future::join_all;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// A stage defines a target VU count and how long to ramp to that target.
///
/// `Stage::new(Duration::from_secs(30), 5)` ramps to 5 VUs over 30s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
    /// Virtual users at the end of the stage.
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Where the executor is in its stage plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Index of the stage being ramped through.
    Ramping(usize),
    /// Stages are over; waiting for in-flight iterations.
    Draining,
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("stage plan is empty")]
    NoStages,
    #[error("stage governor failed: {0}")]
    Governor(#[from] tokio::task::JoinError),
}

/// Executor that ramps a pool of virtual users through a list of stages.
///
/// - A central governor task (`stage_governor_task`) recomputes the target VU count
///   every `tick` by linear interpolation between the previous stage's target and
///   the current one.
/// - `vus_max` worker tasks are spawned up front. Workers whose id is below the
///   current target iterate, the others idle.
/// - An optional `abort` receiver ends the stage plan early once it reads `true`.
///
/// # Tuning Knobs
///
/// - `tick`: Granularity of target updates, and how often idle workers look for
///   work. Smaller ticks follow the ramp more closely at the cost of wakeups.
#[derive(TypedBuilder)]
pub struct StageExecutor {
    /// The sequence of stages to execute.
    pub stages: Vec<Stage>,
    /// The granularity of the governor's tick.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// Ends the stage plan early once it carries `true`.
    #[builder(default, setter(strip_option))]
    pub abort: Option<Receiver<bool>>,
    #[builder(default = Arc::new(watch::channel(Phase::Idle).0), setter(skip))]
    phase: Arc<watch::Sender<Phase>>,
    #[builder(default, setter(skip))]
    target: Arc<AtomicUsize>,
}

impl StageExecutor {
    /// Size of the worker pool: the largest target among all stages.
    pub fn vus_max(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Sum of all stage durations.
    pub fn planned_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Follows the executor's phase transitions.
    pub fn phase(&self) -> Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Number of virtual users currently meant to be active.
    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }
}

impl<F, Fut> Executor<F, Fut> for StageExecutor
where
    Self: Send + Sync + Sized,
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Error = ExecutorError;
    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Result<ExecutionSummary, Self::Error> {
        if self.stages.is_empty() {
            return Err(ExecutorError::NoStages);
        }
        let vus_max = self.vus_max();
        let started = Instant::now();
        self.target.store(0, Ordering::Release);
        let (ctx, shutdown_tx) = ExecutionContext::new(self.target.clone());

        tracing::info!("Spawning {vus_max} virtual users...");
        let handles = spawn_workers(ctx.clone(), vus_max, self.tick, scenario.action.clone());

        tracing::info!("Running scenario: {}!", scenario.name);
        let governor = tokio::spawn(stage_governor_task(
            ctx,
            self.stages.clone(),
            self.tick,
            self.abort.clone(),
            self.phase.clone(),
        ));

        // The governor task ending means the stage plan is over
        let aborted = governor.await?;
        tracing::info!("Governor finished, draining virtual users...");
        // Every worker holds a receiver, so this can only fail with no workers at all
        let _ = shutdown_tx.send(true);

        let iterations: u64 = join_all(handles)
            .await
            .into_iter()
            .map(|res| match res {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Virtual user panicked with error: {e}");
                    0
                }
            })
            .sum();
        self.phase.send_replace(Phase::Done);

        tracing::info!(iterations, aborted, "Done running scenario: {}!", scenario.name);
        Ok(ExecutionSummary {
            iterations,
            vus_max,
            elapsed: started.elapsed(),
            aborted,
        })
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components for the `StageExecutor`.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;
    use tokio::sync::watch::{Sender, channel};

    /// Shared execution state for the governor and all worker tasks.
    #[derive(Clone)]
    pub struct ExecutionContext {
        /// Broadcasts the signal to stop all tasks.
        pub shutdown: Receiver<bool>,
        /// Number of virtual users that should be iterating right now.
        pub target: Arc<AtomicUsize>,
    }

    impl ExecutionContext {
        pub fn new(target: Arc<AtomicUsize>) -> (Self, Sender<bool>) {
            let (tx, rx) = channel(false);
            (
                Self {
                    shutdown: rx,
                    target,
                },
                tx,
            )
        }
    }

    /// Governor task that walks the stages and publishes the target VU count.
    ///
    /// Returns `true` when the plan was cut short by `abort`.
    pub async fn stage_governor_task(
        ctx: ExecutionContext,
        stages: Vec<Stage>,
        tick: Duration,
        abort: Option<Receiver<bool>>,
        phase: Arc<Sender<Phase>>,
    ) -> bool {
        let main_task = async {
            let mut from = 0;
            let j = stages.len();
            for (i, stage) in stages.into_iter().enumerate() {
                phase.send_replace(Phase::Ramping(i));
                tracing::info!(from, to = stage.target, "Starting stage: {}/{j}", i + 1);

                let stage_start = Instant::now();
                let stage_end = stage_start + stage.duration;
                let mut next_tick = stage_start;
                loop {
                    let elapsed = stage_start.elapsed();
                    if elapsed >= stage.duration {
                        break;
                    }
                    let target = calc_target_vus(elapsed, stage.duration, from, stage.target);
                    ctx.target.store(target, Ordering::Release);
                    next_tick += tick;
                    tokio::time::sleep_until(next_tick.min(stage_end)).await;
                }
                // The next stage starts from the exact target of this one
                ctx.target.store(stage.target, Ordering::Release);
                from = stage.target;
            }
        };

        let aborted = tokio::select! {
            _ = main_task => {
                tracing::debug!("Governor task finished all stages.");
                false
            }
            _ = abort_signal(abort) => {
                tracing::warn!("Abort requested, skipping the remaining stages.");
                true
            }
        };
        phase.send_replace(Phase::Draining);
        ctx.target.store(0, Ordering::Release);
        aborted
    }

    /// Resolves once `abort` carries `true`. Stays pending without a receiver or
    /// once its sender is gone.
    async fn abort_signal(abort: Option<Receiver<bool>>) {
        if let Some(mut rx) = abort {
            if rx.wait_for(|b| *b).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }

    /// Pure function computing the target VU count at `elapsed` into a stage.
    ///
    /// Linear interpolation between `from` and `to`, rounded down. A tiny epsilon
    /// keeps exact fractions such as `3 * (10s / 30s)` from landing just below an
    /// integer.
    pub fn calc_target_vus(elapsed: Duration, stage_duration: Duration, from: usize, to: usize) -> usize {
        if stage_duration.is_zero() {
            return to;
        }
        // Interpolation factor [0.0..1.0]
        let t = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).clamp(0.0, 1.0);
        let target = from as f64 + (to as f64 - from as f64) * t;
        let target = (target + 1e-9).floor();
        if target <= 0.0 { 0 } else { (target as usize).min(from.max(to)) }
    }

    /// Spawns `vus` Tokio tasks, each acting as one virtual user.
    ///
    /// Each worker iterates while its id is below the shared target and idles
    /// otherwise. It returns the number of iterations it completed.
    pub fn spawn_workers<F, Fut>(
        ctx: ExecutionContext,
        vus: usize,
        tick: Duration,
        action: F,
    ) -> Vec<JoinHandle<u64>>
    where
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        (0..vus)
            .map(|id| {
                let mut ctx = ctx.clone();
                let action = action.clone();
                tokio::spawn(async move {
                    let mut iteration = 0u64;
                    tracing::debug!("Virtual user {id} spawned.");

                    loop {
                        if *ctx.shutdown.borrow() {
                            break;
                        }
                        if id < ctx.target.load(Ordering::Acquire) {
                            // a panicking iteration ends only itself, the VU keeps its slot
                            if AssertUnwindSafe(action(Vu { id, iteration }))
                                .catch_unwind()
                                .await
                                .is_err()
                            {
                                tracing::error!("Virtual user {id} panicked in iteration {iteration}.");
                            }
                            iteration += 1;
                            tokio::task::yield_now().await;
                            continue;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(tick) => {}
                            _ = ctx.shutdown.wait_for(|b| *b) => break,
                        }
                    }

                    tracing::debug!("Virtual user {id} retired after {iteration} iterations.");
                    iteration
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn spawn_expected_number_of_workers() {
        let n = 10;
        let (ctx, shutdown) = ExecutionContext::new(Arc::new(AtomicUsize::new(0)));
        let workers = spawn_workers(ctx, n, ms(10), |_vu: Vu| async {});
        assert_eq!(workers.len(), n);

        shutdown.send(true).unwrap();
        for w in workers {
            assert_eq!(w.await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let executor = StageExecutor::builder().stages(vec![]).build();
        let scenario = Scenario::builder()
            .name("empty")
            .action(|_vu: Vu| async {})
            .build();
        assert!(matches!(
            scenario.run(&executor).await,
            Err(ExecutorError::NoStages)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_target() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let executor = StageExecutor::builder()
            .stages(vec![
                Stage::new(Duration::from_secs(1), 4),
                Stage::new(Duration::from_secs(1), 4),
                Stage::new(Duration::from_secs(1), 0),
            ])
            .build();

        let scenario = Scenario::builder()
            .name("peak")
            .action({
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move |_vu: Vu| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(ms(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
            .build();

        let summary = scenario.run(&executor).await.unwrap();

        assert_eq!(summary.vus_max, 4);
        assert!(!summary.aborted);
        assert!(summary.iterations > 0);
        let peak = peak.load(Ordering::SeqCst);
        assert!((2..=4).contains(&peak), "peak concurrency {peak}");
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert!(summary.elapsed >= Duration::from_secs(3));
        assert_eq!(*executor.phase().borrow(), Phase::Done);
        assert_eq!(executor.target(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_lets_in_flight_iterations_finish() {
        let started = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));

        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(Duration::ZERO, 1), Stage::new(ms(200), 1)])
            .build();

        let scenario = Scenario::builder()
            .name("drain")
            .action({
                let started = started.clone();
                let completed = completed.clone();
                move |_vu: Vu| {
                    let started = started.clone();
                    let completed = completed.clone();
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .build();

        let summary = scenario.run(&executor).await.unwrap();

        assert_eq!(summary.iterations, 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(summary.elapsed >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_skips_remaining_stages() {
        let (abort_tx, abort_rx) = watch::channel(false);
        let executor = StageExecutor::builder()
            .stages(vec![
                Stage::new(Duration::from_secs(10), 2),
                Stage::new(Duration::from_secs(10), 0),
            ])
            .abort(abort_rx)
            .build();

        let scenario = Scenario::builder()
            .name("abort")
            .action(|_vu: Vu| async { tokio::time::sleep(ms(100)).await })
            .build();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            abort_tx.send(true).unwrap();
            // keep the sender alive past the abort
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let summary = scenario.run(&executor).await.unwrap();
        assert!(summary.aborted);
        assert!(summary.elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_abort_sender_does_not_abort() {
        let (abort_tx, abort_rx) = watch::channel(false);
        drop(abort_tx);
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(ms(500), 1)])
            .abort(abort_rx)
            .build();
        let scenario = Scenario::builder()
            .name("no-abort")
            .action(|_vu: Vu| async { tokio::time::sleep(ms(10)).await })
            .build();

        let summary = scenario.run(&executor).await.unwrap();
        assert!(!summary.aborted);
        assert!(summary.elapsed >= ms(500));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_iteration_does_not_retire_the_vu() {
        let executor = StageExecutor::builder()
            .stages(vec![Stage::new(Duration::ZERO, 1), Stage::new(ms(500), 1)])
            .build();
        let scenario = Scenario::builder()
            .name("panic")
            .action(|vu: Vu| async move {
                if vu.iteration == 0 {
                    panic!("first iteration blows up");
                }
                tokio::time::sleep(ms(100)).await;
            })
            .build();

        let summary = scenario.run(&executor).await.unwrap();
        assert!(summary.iterations >= 4, "{summary:?}");
    }

    #[test]
    fn planned_duration_and_pool_size() {
        let executor = StageExecutor::builder()
            .stages(vec![
                Stage::new(Duration::from_secs(30), 2),
                Stage::new(Duration::from_secs(60), 5),
                Stage::new(Duration::from_secs(30), 5),
                Stage::new(Duration::from_secs(30), 0),
            ])
            .build();
        assert_eq!(executor.vus_max(), 5);
        assert_eq!(executor.planned_duration(), Duration::from_secs(150));
        assert_eq!(*executor.phase().borrow(), Phase::Idle);
    }

    mod calc_target_vus {
        use super::*;

        #[test]
        fn ramp_up() {
            let d = Duration::from_secs(10);
            for i in 0..10 {
                assert_eq!(calc_target_vus(Duration::from_secs(i), d, 0, 10), i as usize);
            }
            assert_eq!(calc_target_vus(ms(9_990), d, 0, 10), 9);
            assert_eq!(calc_target_vus(d, d, 0, 10), 10);
        }

        #[test]
        fn ramp_down_rounds_down() {
            let d = Duration::from_secs(10);
            assert_eq!(calc_target_vus(Duration::ZERO, d, 10, 0), 10);
            assert_eq!(calc_target_vus(ms(2_500), d, 10, 0), 7);
            assert_eq!(calc_target_vus(Duration::from_secs(5), d, 10, 0), 5);
            assert_eq!(calc_target_vus(d, d, 10, 0), 0);
        }

        #[test]
        fn hold_steady() {
            let d = Duration::from_secs(30);
            for i in 0..30 {
                assert_eq!(calc_target_vus(Duration::from_secs(i), d, 5, 5), 5);
            }
        }

        #[test]
        fn exact_fractions_land_on_the_integer() {
            let d = Duration::from_secs(30);
            assert_eq!(calc_target_vus(Duration::from_secs(10), d, 0, 3), 1);
            assert_eq!(calc_target_vus(Duration::from_secs(20), d, 0, 3), 2);
        }

        #[test]
        fn zero_duration_jumps_to_target() {
            assert_eq!(calc_target_vus(Duration::ZERO, Duration::ZERO, 0, 7), 7);
            assert_eq!(calc_target_vus(Duration::from_secs(3), Duration::ZERO, 7, 0), 0);
        }

        #[test]
        fn elapsed_over_duration_caps_at_target() {
            let d = Duration::from_secs(10);
            for i in 10..20 {
                assert_eq!(calc_target_vus(Duration::from_secs(i), d, 0, 4), 4);
            }
        }
    }
}
