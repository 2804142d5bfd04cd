use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fmt::Debug, fmt::Write as _, future::Future, time::Duration};

use crate::{
    Aggregate,
    aggregate::{RateAggregate, TrendAggregate},
    metric::MetricKey,
    threshold::{Outcome, Verdict},
};

/// A [`Report`] is the processed form of an [`Aggregate`].
///
/// Reports derive the final statistics (averages, percentiles, ratios) from the
/// raw aggregate. They are plain data: no I/O, deterministic, serializable. A
/// [`Reporter`] takes care of presenting them.
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Statistics over a trend. All values are milliseconds; every statistic is
/// `None` while the trend has no samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendReport {
    pub count: usize,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub med: Option<f64>,
    pub max: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    #[serde(skip)]
    sorted: Vec<f64>,
}

impl TrendReport {
    /// Percentile by linear interpolation between the two closest ranks.
    ///
    /// For `n` sorted samples the rank of percentile `p` is `p / 100 * (n - 1)`;
    /// `p` is clamped to `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.sorted, p)
    }
}

fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let (lo, hi) = (sorted[lower], sorted[upper]);
    Some(lo + (hi - lo) * (rank - lower as f64))
}

impl From<TrendAggregate> for TrendReport {
    fn from(value: TrendAggregate) -> Self {
        let mut sorted = value.values;
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let avg = (count > 0).then(|| value.sum / count as f64);
        Self {
            count,
            avg,
            min: sorted.first().copied(),
            med: percentile(&sorted, 50.0),
            max: sorted.last().copied(),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            sorted,
        }
    }
}

impl Report<TrendAggregate> for TrendReport {}

/// Fraction of `true` outcomes. `rate` is `None` while nothing was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateReport {
    pub trues: u64,
    pub total: u64,
    pub rate: Option<f64>,
}

impl From<RateAggregate> for RateReport {
    fn from(value: RateAggregate) -> Self {
        Self {
            trues: value.trues,
            total: value.total,
            rate: (value.total > 0).then(|| value.trues as f64 / value.total as f64),
        }
    }
}

impl Report<RateAggregate> for RateReport {}

/// Snapshot of one metric, whichever its kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricReport {
    Trend(TrendReport),
    Rate(RateReport),
}

impl MetricReport {
    /// Number of samples folded into the metric so far.
    pub fn count(&self) -> u64 {
        match self {
            MetricReport::Trend(t) => t.count as u64,
            MetricReport::Rate(r) => r.total,
        }
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            MetricReport::Rate(r) => r.rate,
            MetricReport::Trend(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FixtureCounts {
    pub teams: usize,
    pub pull_requests: usize,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub iterations: u64,
    pub vus_max: usize,
    /// The run was cut short by an `abort_on_fail` threshold or an interrupt.
    pub aborted: bool,
    pub fixtures: FixtureCounts,
    pub metrics: BTreeMap<MetricKey, MetricReport>,
    pub verdict: Verdict,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to format report: {0}")]
    Fmt(#[from] std::fmt::Error),
}

/// A [`Reporter`] consumes a finished [`RunReport`] and performs side effects with
/// it: printing it, shipping it somewhere else.
///
/// # Example
/// ```rust
/// use review_load::report::{ReportError, Reporter, RunReport};
///
/// struct CountReporter;
///
/// impl Reporter for CountReporter {
///     async fn report(&self, report: &RunReport) -> Result<(), ReportError> {
///         println!("{} iterations", report.iterations);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, report: &RunReport) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Human-readable summary on stdout.
pub struct TextReporter;

impl Reporter for TextReporter {
    async fn report(&self, report: &RunReport) -> Result<(), ReportError> {
        println!("{}", render_text(report)?);
        Ok(())
    }
}

/// The whole report as pretty JSON on stdout.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    async fn report(&self, report: &RunReport) -> Result<(), ReportError> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}

fn fmt_ms(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}ms"),
        None => "-".to_string(),
    }
}

fn dotted(label: &str, width: usize) -> String {
    let dots = width.saturating_sub(label.len()).max(3);
    format!("{label} {}", ".".repeat(dots))
}

pub fn render_text(report: &RunReport) -> Result<String, ReportError> {
    let mut out = String::new();
    let width = report
        .metrics
        .keys()
        .map(|k| k.to_string().len())
        .max()
        .unwrap_or(0)
        + 2;

    writeln!(out)?;
    writeln!(
        out,
        "  scenario: {}  duration: {:.1}s  iterations: {}  vus_max: {}{}",
        report.scenario,
        report.duration.as_secs_f64(),
        report.iterations,
        report.vus_max,
        if report.aborted { "  (aborted)" } else { "" }
    )?;
    writeln!(
        out,
        "  fixtures: {} teams, {} pull requests",
        report.fixtures.teams, report.fixtures.pull_requests
    )?;
    writeln!(out)?;

    for (key, metric) in &report.metrics {
        let label = dotted(&key.to_string(), width);
        match metric {
            MetricReport::Trend(t) => writeln!(
                out,
                "  {label}: count={} avg={} min={} med={} max={} p(90)={} p(95)={}",
                t.count,
                fmt_ms(t.avg),
                fmt_ms(t.min),
                fmt_ms(t.med),
                fmt_ms(t.max),
                fmt_ms(t.p90),
                fmt_ms(t.p95),
            )?,
            MetricReport::Rate(r) => writeln!(
                out,
                "  {label}: {} {} / {}",
                r.rate
                    .map(|v| format!("{:.2}%", v * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
                r.trues,
                r.total
            )?,
        }
    }

    writeln!(out)?;
    if report.verdict.results.is_empty() {
        writeln!(out, "  no thresholds declared")?;
    }
    for result in &report.verdict.results {
        let mark = match result.outcome {
            Outcome::Pass => "✓",
            Outcome::Fail | Outcome::NoData => "✗",
            Outcome::Skipped => "-",
        };
        let observed = result
            .observed
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "no data".to_string());
        writeln!(
            out,
            "  {mark} {} {} (observed {observed})",
            result.metric, result.expression
        )?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "  verdict: {}",
        if report.verdict.passed { "PASSED" } else { "FAILED" }
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend(values: impl IntoIterator<Item = f64>) -> TrendReport {
        let mut agg = TrendAggregate::new();
        values.into_iter().for_each(|v| agg.consume(&v));
        agg.into()
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn percentiles_interpolate_between_ranks() {
        // 1..=100 in reverse order, sorting is the report's job
        let report = trend((1..=100).rev().map(f64::from));
        assert_eq!(report.count, 100);
        assert!(close(report.percentile(95.0), 95.05));
        assert!(close(report.p90, 90.1));
        assert!(close(report.med, 50.5));
        assert_eq!(report.min, Some(1.0));
        assert_eq!(report.max, Some(100.0));
        assert!(close(report.avg, 50.5));
    }

    #[test]
    fn tail_percentile_on_a_thousand_samples() {
        let report = trend((1..=1000).map(f64::from));
        assert!(close(report.percentile(99.9), 999.001));
        assert!(close(report.percentile(100.0), 1000.0));
        assert!(close(report.percentile(0.0), 1.0));
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let report = trend([42.0]);
        for p in [0.0, 50.0, 95.0, 99.9, 100.0] {
            assert_eq!(report.percentile(p), Some(42.0));
        }
    }

    #[test]
    fn percentiles_are_monotonic() {
        let report = trend([5.0, 1.0, 9.0, 3.0, 3.0, 250.0, 7.0]);
        let mut last = f64::MIN;
        for p in (0..=1000).map(|p| p as f64 / 10.0) {
            let v = report.percentile(p).unwrap();
            assert!(v >= last, "p({p}) = {v} went below {last}");
            last = v;
        }
    }

    #[test]
    fn empty_trend_has_no_statistics() {
        let report = trend([]);
        assert_eq!(report.count, 0);
        assert_eq!(report.avg, None);
        assert_eq!(report.percentile(95.0), None);
    }

    #[test]
    fn rate_is_true_fraction() {
        let mixes = [(0, 10, 0.0), (5, 10, 0.5), (10, 10, 1.0)];
        for (trues, total, expected) in mixes {
            let mut agg = RateAggregate::new();
            for i in 0..total {
                agg.consume(&(i < trues));
            }
            let report = RateReport::from(agg);
            assert_eq!(report.rate, Some(expected));
            assert_eq!(report.trues, trues);
            assert_eq!(report.total, total);
        }
        assert_eq!(RateReport::from(RateAggregate::new()).rate, None);
    }

    #[test]
    fn text_rendering_mentions_metrics_and_verdict() {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            MetricKey::new("create_team_duration"),
            MetricReport::Trend(trend([10.0, 20.0])),
        );
        let report = RunReport {
            scenario: "review".into(),
            duration: Duration::from_secs(3),
            iterations: 7,
            vus_max: 2,
            aborted: false,
            fixtures: FixtureCounts {
                teams: 1,
                pull_requests: 1,
            },
            metrics,
            verdict: Verdict {
                passed: true,
                results: vec![],
            },
        };
        let text = render_text(&report).unwrap();
        assert!(text.contains("create_team_duration"));
        assert!(text.contains("iterations: 7"));
        assert!(text.contains("verdict: PASSED"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration_ms"], 3000.0);
        assert_eq!(json["metrics"]["create_team_duration"]["type"], "trend");
    }
}
