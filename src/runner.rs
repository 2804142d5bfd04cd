//! Drives a whole load test: Setup, the staged run with its threshold monitor,
//! Teardown, and the final verdict.
use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    Result,
    client::{HttpServiceClient, ServiceClient},
    collector::MetricsRegistry,
    config::Config,
    executor::StageExecutor,
    fixture,
    random::StdRandom,
    report::RunReport,
    scenario::{
        Scenario, Vu,
        review::{ReviewMetrics, ReviewScenario},
    },
    threshold::ThresholdGate,
};

pub const SCENARIO_NAME: &str = "review_service";

/// A configured load test against one service instance.
pub struct LoadTest<C> {
    config: Config,
    client: Arc<C>,
    run_id: String,
    abort: Option<watch::Receiver<bool>>,
}

impl LoadTest<HttpServiceClient> {
    /// Talks HTTP to `config.base_url`.
    pub fn new(config: Config) -> Result<Self> {
        let client = HttpServiceClient::new(&config.base_url, config.http.timeout)?;
        Ok(Self::with_client(config, client))
    }
}

impl<C: ServiceClient> LoadTest<C> {
    pub fn with_client(config: Config, client: C) -> Self {
        Self {
            config,
            client: Arc::new(client),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            abort: None,
        }
    }

    /// Lets the caller cut the run short: once `abort` turns `true` the remaining
    /// stages are skipped and in-flight iterations finish. A dropped sender never
    /// aborts.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Suffix making this run's fixture names unique.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the test to completion and returns its report.
    ///
    /// Thresholds are validated against the declared metrics before any request is
    /// sent. Failing thresholds are part of the report, not an error.
    pub async fn run(&self) -> Result<RunReport> {
        let config = &self.config;

        let (registry, metrics, gate) = declare(config)?;
        let registry = Arc::new(registry);
        let gate = Arc::new(gate);

        tracing::info!(run_id = %self.run_id, "setting up");
        let fixtures = Arc::new(fixture::setup(self.client.as_ref(), &config.fixtures, &self.run_id).await);

        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);
        let (done_tx, done_rx) = watch::channel(false);

        let monitor = tokio::spawn(gate.clone().monitor(
            registry.clone(),
            config.threshold_eval_interval,
            abort_tx.clone(),
            done_rx.clone(),
        ));
        let external = self
            .abort
            .clone()
            .map(|requested| tokio::spawn(forward_abort(requested, abort_tx, done_rx)));

        let executor = StageExecutor::builder()
            .stages(config.stages.clone())
            .tick(config.tick)
            .abort(abort_rx)
            .build();

        let review = Arc::new(ReviewScenario::new(
            self.client.clone(),
            fixtures.clone(),
            metrics,
            config.scenario.clone(),
        ));
        let seed = config.seed;
        // No fixtures means nothing to do; back off instead of spinning
        let idle = config.tick;
        let scenario = Scenario::builder()
            .name(SCENARIO_NAME)
            .action(move |vu: Vu| {
                let review = review.clone();
                async move {
                    let mut rng = StdRandom::for_iteration(seed, vu.id, vu.iteration);
                    if !review.run_iteration(&mut rng).await {
                        tokio::time::sleep(idle).await;
                    }
                }
            })
            .build();

        let summary = scenario.run(&executor).await;
        done_tx.send_replace(true);
        let tasks = [("threshold monitor", Some(monitor)), ("abort listener", external)];
        for (task, handle) in tasks {
            let Some(handle) = handle else { continue };
            if let Err(e) = handle.await {
                tracing::error!("{task} task failed: {e}");
            }
        }
        let summary = summary?;

        let metrics = registry.snapshot_all();
        let verdict = gate.evaluate(&metrics);
        let report = RunReport {
            scenario: scenario.name.clone(),
            duration: summary.elapsed,
            iterations: summary.iterations,
            vus_max: summary.vus_max,
            aborted: summary.aborted,
            fixtures: fixtures.counts(),
            metrics,
            verdict,
        };
        fixture::teardown(&fixtures, &report);
        Ok(report)
    }
}

/// Declares the scenario's metrics and binds the configured thresholds to them.
fn declare(config: &Config) -> Result<(MetricsRegistry, ReviewMetrics, ThresholdGate)> {
    let mut registry = MetricsRegistry::new();
    let metrics = ReviewMetrics::declare(&mut registry, &config.scenario)?;
    let gate = ThresholdGate::new(config.thresholds()?, config.empty_metric, &registry)?;
    Ok((registry, metrics, gate))
}

/// Checks that every configured threshold targets a metric the scenario records,
/// with a statistic that metric provides. Returns the number of thresholds.
pub fn check_thresholds(config: &Config) -> Result<usize> {
    let (_, _, gate) = declare(config)?;
    Ok(gate.thresholds().len())
}

/// Relays a caller's abort request to the executor until the run is over.
async fn forward_abort(
    mut requested: watch::Receiver<bool>,
    abort: Arc<watch::Sender<bool>>,
    mut done: watch::Receiver<bool>,
) {
    tokio::select! {
        res = requested.wait_for(|a| *a) => {
            if res.is_ok() {
                tracing::warn!("abort requested, letting in-flight iterations finish");
                abort.send_replace(true);
            }
        }
        _ = done.wait_for(|d| *d) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, config::ThresholdSpec, threshold::ThresholdError};

    #[test]
    fn stock_thresholds_bind_to_scenario_metrics() {
        assert_eq!(check_thresholds(&Config::default()).unwrap(), 9);
    }

    #[test]
    fn thresholds_on_unrecorded_metrics_are_rejected() {
        let mut config = Config::default();
        config
            .thresholds
            .insert("login_duration".into(), vec![ThresholdSpec::Expression("p(95)<300".into())]);
        assert!(matches!(
            check_thresholds(&config),
            Err(Error::Threshold(ThresholdError::UnknownMetric(_)))
        ));
    }

    #[test]
    fn rate_statistics_on_trends_are_rejected() {
        let mut config = Config::default();
        config
            .thresholds
            .insert("reassign_duration".into(), vec![ThresholdSpec::Expression("rate<0.1".into())]);
        assert!(matches!(
            check_thresholds(&config),
            Err(Error::Threshold(ThresholdError::IncompatibleStatistic { .. }))
        ));
    }

    #[test]
    fn checks_are_addressable_by_name() {
        let mut config = Config::default();
        config.thresholds.insert(
            "checks{check:reassign status 200 or 409}".into(),
            vec![ThresholdSpec::Expression("rate>0.9".into())],
        );
        config
            .thresholds
            .insert("checks".into(), vec![ThresholdSpec::Expression("rate>0.95".into())]);
        assert_eq!(check_thresholds(&config).unwrap(), 11);
    }
}
