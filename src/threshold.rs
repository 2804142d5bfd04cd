//! Threshold gate.
//!
//! A threshold binds a metric to a comparison over one of its statistics, written the
//! way load tools usually spell them: `p(95)<300`, `rate<0.001`, `avg<=120ms`.
//! Trend bounds are milliseconds; an `s` suffix scales by 1000.
//!
//! The gate is a pure function over metric snapshots. The final verdict is the
//! conjunction of every threshold. A metric with no samples yields [`Outcome::NoData`]
//! (failing) or [`Outcome::Skipped`] (passing) depending on [`EmptyMetricPolicy`].
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    collector::MetricsRegistry,
    metric::{MetricKey, MetricKeyError, MetricKind},
    report::MetricReport,
};

#[derive(Debug, thiserror::Error)]
pub enum ThresholdError {
    #[error("invalid threshold expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },
    #[error("threshold on '{0}' references a metric that is not declared")]
    UnknownMetric(MetricKey),
    #[error("statistic '{statistic}' is not available on {kind} metric '{metric}'")]
    IncompatibleStatistic {
        metric: MetricKey,
        kind: MetricKind,
        statistic: Statistic,
    },
    #[error(transparent)]
    InvalidKey(#[from] MetricKeyError),
}

fn parse_error(expr: &str, reason: impl Into<String>) -> ThresholdError {
    ThresholdError::Parse {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Percentile(f64),
    Rate,
}

impl Statistic {
    fn supports(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Rate => matches!(self, Statistic::Rate | Statistic::Count),
            MetricKind::Trend => !matches!(self, Statistic::Rate),
        }
    }

    /// Reads the statistic out of a snapshot. `None` means there is no data yet.
    pub fn read(&self, report: &MetricReport) -> Option<f64> {
        match (self, report) {
            (Statistic::Count, r) => (r.count() > 0).then(|| r.count() as f64),
            (Statistic::Rate, MetricReport::Rate(r)) => r.rate,
            (Statistic::Avg, MetricReport::Trend(t)) => t.avg,
            (Statistic::Min, MetricReport::Trend(t)) => t.min,
            (Statistic::Max, MetricReport::Trend(t)) => t.max,
            (Statistic::Med, MetricReport::Trend(t)) => t.med,
            (Statistic::Percentile(p), MetricReport::Trend(t)) => t.percentile(*p),
            _ => None,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Avg => f.write_str("avg"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Med => f.write_str("med"),
            Statistic::Count => f.write_str("count"),
            Statistic::Percentile(p) => write!(f, "p({p})"),
            Statistic::Rate => f.write_str("rate"),
        }
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Statistic::Avg),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            "med" => Ok(Statistic::Med),
            "count" => Ok(Statistic::Count),
            "rate" => Ok(Statistic::Rate),
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown statistic '{s}'"))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile '{inner}'"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Ok(Statistic::Percentile(p))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// A parsed `<statistic> <op> <bound>` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub bound: f64,
    source: String,
}

impl Expression {
    /// Whether `observed` satisfies the expression.
    pub fn holds(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.bound)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

const OPERATORS: [(&str, Comparison); 6] = [
    ("<=", Comparison::Le),
    (">=", Comparison::Ge),
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    ("<", Comparison::Lt),
    (">", Comparison::Gt),
];

impl FromStr for Expression {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let at = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| parse_error(s, "missing comparison operator"))?;
        let (lhs, rest) = compact.split_at(at);
        let (op, rhs) = OPERATORS
            .iter()
            .find_map(|(token, cmp)| rest.strip_prefix(token).map(|rhs| (*cmp, rhs)))
            .ok_or_else(|| parse_error(s, "unknown comparison operator"))?;

        let statistic: Statistic = lhs.parse().map_err(|reason: String| parse_error(s, reason))?;
        let (number, scale) = if let Some(n) = rhs.strip_suffix("ms") {
            (n, 1.0)
        } else if let Some(n) = rhs.strip_suffix('s') {
            (n, 1000.0)
        } else {
            (rhs, 1.0)
        };
        let bound: f64 = number
            .parse()
            .map_err(|_| parse_error(s, format!("invalid bound '{rhs}'")))?;
        if !bound.is_finite() {
            return Err(parse_error(s, "bound must be finite"));
        }

        Ok(Expression {
            statistic,
            comparison: op,
            bound: bound * scale,
            source: compact,
        })
    }
}

/// A bound on one metric.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: MetricKey,
    pub expression: Expression,
    /// Stop the run as soon as this threshold fails during continuous evaluation.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ThresholdError> {
        Ok(Self {
            metric: metric.parse()?,
            expression: expression.parse()?,
            abort_on_fail: false,
        })
    }

    pub fn abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }
}

/// What to do with a threshold whose metric never received a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyMetricPolicy {
    /// The threshold does not pass.
    #[default]
    Fail,
    /// The threshold is left out of the verdict.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    NoData,
    Skipped,
}

impl Outcome {
    pub fn passing(&self) -> bool {
        matches!(self, Outcome::Pass | Outcome::Skipped)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: MetricKey,
    pub expression: String,
    pub observed: Option<f64>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub results: Vec<ThresholdResult>,
}

/// Evaluates declared thresholds against metric snapshots.
#[derive(Debug, Clone)]
pub struct ThresholdGate {
    thresholds: Vec<Threshold>,
    empty_metric: EmptyMetricPolicy,
}

impl ThresholdGate {
    /// Builds the gate, rejecting thresholds on undeclared metrics or on statistics the
    /// metric's kind cannot provide.
    pub fn new(
        thresholds: Vec<Threshold>,
        empty_metric: EmptyMetricPolicy,
        registry: &MetricsRegistry,
    ) -> Result<Self, ThresholdError> {
        for t in &thresholds {
            let kind = registry
                .kind(&t.metric)
                .ok_or_else(|| ThresholdError::UnknownMetric(t.metric.clone()))?;
            if !t.expression.statistic.supports(kind) {
                return Err(ThresholdError::IncompatibleStatistic {
                    metric: t.metric.clone(),
                    kind,
                    statistic: t.expression.statistic,
                });
            }
        }
        Ok(Self {
            thresholds,
            empty_metric,
        })
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    fn judge(&self, threshold: &Threshold, snapshot: Option<&MetricReport>) -> ThresholdResult {
        let observed = snapshot.and_then(|s| threshold.expression.statistic.read(s));
        let outcome = match observed {
            Some(v) if threshold.expression.holds(v) => Outcome::Pass,
            Some(_) => Outcome::Fail,
            None => match self.empty_metric {
                EmptyMetricPolicy::Fail => Outcome::NoData,
                EmptyMetricPolicy::Skip => Outcome::Skipped,
            },
        };
        ThresholdResult {
            metric: threshold.metric.clone(),
            expression: threshold.expression.to_string(),
            observed,
            outcome,
        }
    }

    /// Verdict over a set of snapshots. Never touches the metrics themselves.
    pub fn evaluate(&self, snapshots: &BTreeMap<MetricKey, MetricReport>) -> Verdict {
        let results: Vec<_> = self
            .thresholds
            .iter()
            .map(|t| self.judge(t, snapshots.get(&t.metric)))
            .collect();
        Verdict {
            passed: results.iter().all(|r| r.outcome.passing()),
            results,
        }
    }

    /// First `abort_on_fail` threshold that currently fails on actual data.
    ///
    /// Empty metrics never abort a run: early in a ramp most metrics have no samples.
    /// Each metric is snapshotted at most once per call.
    pub fn first_abort(&self, registry: &MetricsRegistry) -> Option<ThresholdResult> {
        let mut snapshots: BTreeMap<&MetricKey, Option<MetricReport>> = BTreeMap::new();
        self.thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .map(|t| {
                let snapshot = snapshots
                    .entry(&t.metric)
                    .or_insert_with(|| registry.snapshot(&t.metric).ok());
                self.judge(t, snapshot.as_ref())
            })
            .find(|r| r.outcome == Outcome::Fail)
    }

    /// Re-evaluates `abort_on_fail` thresholds every `interval` until `done` flips,
    /// signalling `abort` on the first failure.
    pub async fn monitor(
        self: Arc<Self>,
        registry: Arc<MetricsRegistry>,
        interval: Duration,
        abort: Arc<watch::Sender<bool>>,
        mut done: watch::Receiver<bool>,
    ) {
        if !self.thresholds.iter().any(|t| t.abort_on_fail) {
            tracing::debug!("no abort_on_fail thresholds, continuous evaluation disabled");
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = done.wait_for(|d| *d) => break,
            }
            if let Some(failed) = self.first_abort(&registry) {
                tracing::warn!(
                    metric = %failed.metric,
                    expression = %failed.expression,
                    observed = ?failed.observed,
                    "threshold crossed, aborting run"
                );
                abort.send_replace(true);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_snapshot(registry: &mut MetricsRegistry, key: &str, trues: u64, total: u64) {
        let rate = registry.rate(key).unwrap();
        for i in 0..total {
            rate.record(i < trues);
        }
    }

    #[test]
    fn parses_common_expressions() {
        let e: Expression = "p(95)<300".parse().unwrap();
        assert_eq!(e.statistic, Statistic::Percentile(95.0));
        assert_eq!(e.comparison, Comparison::Lt);
        assert_eq!(e.bound, 300.0);

        let e: Expression = "p(99.9) < 0.3s".parse().unwrap();
        assert_eq!(e.statistic, Statistic::Percentile(99.9));
        assert_eq!(e.bound, 300.0);

        let e: Expression = "rate<=0.001".parse().unwrap();
        assert_eq!(e.comparison, Comparison::Le);
        assert_eq!(e.statistic, Statistic::Rate);

        let e: Expression = "avg != 250ms".parse().unwrap();
        assert_eq!(e.comparison, Comparison::Ne);
        assert_eq!(e.bound, 250.0);
        assert_eq!(e.to_string(), "avg!=250ms");
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["p(95)", "p(101)<3", "p(x)<3", "median<3", "rate=0.1", "rate<abc", "<3"] {
            assert!(bad.parse::<Expression>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn rate_gate_passes_below_bound_and_fails_above() {
        let mut registry = MetricsRegistry::new();
        rate_snapshot(&mut registry, "ok", 1, 2000); // 0.0005
        rate_snapshot(&mut registry, "bad", 4, 2000); // 0.002

        let gate = ThresholdGate::new(
            vec![Threshold::parse("ok", "rate<0.001").unwrap()],
            EmptyMetricPolicy::Fail,
            &registry,
        )
        .unwrap();
        assert!(gate.evaluate(&registry.snapshot_all()).passed);

        let gate = ThresholdGate::new(
            vec![Threshold::parse("bad", "rate<0.001").unwrap()],
            EmptyMetricPolicy::Fail,
            &registry,
        )
        .unwrap();
        let verdict = gate.evaluate(&registry.snapshot_all());
        assert!(!verdict.passed);
        assert_eq!(verdict.results[0].outcome, Outcome::Fail);
        assert_eq!(verdict.results[0].observed, Some(0.002));
    }

    #[test]
    fn verdict_is_the_conjunction() {
        let mut registry = MetricsRegistry::new();
        let trend = registry.trend("latency").unwrap();
        (1..=100).for_each(|v| trend.record(v as f64));

        let gate = ThresholdGate::new(
            vec![
                Threshold::parse("latency", "p(95)<300").unwrap(),
                Threshold::parse("latency", "max<50").unwrap(),
            ],
            EmptyMetricPolicy::Fail,
            &registry,
        )
        .unwrap();
        let verdict = gate.evaluate(&registry.snapshot_all());
        assert!(!verdict.passed);
        assert_eq!(verdict.results[0].outcome, Outcome::Pass);
        assert_eq!(verdict.results[1].outcome, Outcome::Fail);
    }

    #[test]
    fn empty_metric_follows_policy() {
        let mut registry = MetricsRegistry::new();
        registry.trend("never").unwrap();
        let thresholds = vec![Threshold::parse("never", "p(95)<300").unwrap()];

        let strict =
            ThresholdGate::new(thresholds.clone(), EmptyMetricPolicy::Fail, &registry).unwrap();
        let verdict = strict.evaluate(&registry.snapshot_all());
        assert!(!verdict.passed);
        assert_eq!(verdict.results[0].outcome, Outcome::NoData);

        let lenient = ThresholdGate::new(thresholds, EmptyMetricPolicy::Skip, &registry).unwrap();
        let verdict = lenient.evaluate(&registry.snapshot_all());
        assert!(verdict.passed);
        assert_eq!(verdict.results[0].outcome, Outcome::Skipped);
    }

    #[test]
    fn declaration_errors_are_caught_up_front() {
        let mut registry = MetricsRegistry::new();
        registry.rate("failed").unwrap();

        let unknown = ThresholdGate::new(
            vec![Threshold::parse("missing", "rate<0.1").unwrap()],
            EmptyMetricPolicy::Fail,
            &registry,
        );
        assert!(matches!(unknown, Err(ThresholdError::UnknownMetric(_))));

        let wrong_stat = ThresholdGate::new(
            vec![Threshold::parse("failed", "p(95)<10").unwrap()],
            EmptyMetricPolicy::Fail,
            &registry,
        );
        assert!(matches!(
            wrong_stat,
            Err(ThresholdError::IncompatibleStatistic { .. })
        ));
    }

    #[test]
    fn only_failing_abort_thresholds_abort() {
        let mut registry = MetricsRegistry::new();
        rate_snapshot(&mut registry, "failed", 5, 10);
        registry.rate("empty").unwrap();

        let gate = ThresholdGate::new(
            vec![
                Threshold::parse("empty", "rate<0.1").unwrap().abort_on_fail(true),
                Threshold::parse("failed", "rate<0.1").unwrap(),
            ],
            EmptyMetricPolicy::Fail,
            &registry,
        )
        .unwrap();
        assert!(gate.first_abort(&registry).is_none());

        let gate = ThresholdGate::new(
            vec![Threshold::parse("failed", "rate<0.1").unwrap().abort_on_fail(true)],
            EmptyMetricPolicy::Fail,
            &registry,
        )
        .unwrap();
        let failed = gate.first_abort(&registry).unwrap();
        assert_eq!(failed.metric, MetricKey::new("failed"));
    }

    #[test]
    fn abort_thresholds_sharing_a_metric_are_all_judged() {
        let mut registry = MetricsRegistry::new();
        rate_snapshot(&mut registry, "failed", 3, 10);

        let gate = ThresholdGate::new(
            vec![
                Threshold::parse("failed", "rate<0.5").unwrap().abort_on_fail(true),
                Threshold::parse("failed", "rate<0.1").unwrap().abort_on_fail(true),
            ],
            EmptyMetricPolicy::Fail,
            &registry,
        )
        .unwrap();
        let failed = gate.first_abort(&registry).unwrap();
        assert_eq!(failed.expression, "rate<0.1");
        assert_eq!(failed.observed, Some(0.3));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_signals_abort() {
        let mut registry = MetricsRegistry::new();
        rate_snapshot(&mut registry, "failed", 1, 1);
        let registry = Arc::new(registry);
        let gate = Arc::new(
            ThresholdGate::new(
                vec![Threshold::parse("failed", "rate<0.5").unwrap().abort_on_fail(true)],
                EmptyMetricPolicy::Fail,
                &registry,
            )
            .unwrap(),
        );

        let (abort_tx, mut abort_rx) = watch::channel(false);
        let (_done_tx, done_rx) = watch::channel(false);
        let task = tokio::spawn(gate.monitor(
            registry,
            Duration::from_secs(2),
            Arc::new(abort_tx),
            done_rx,
        ));

        abort_rx.wait_for(|a| *a).await.unwrap();
        task.await.unwrap();
    }
}
