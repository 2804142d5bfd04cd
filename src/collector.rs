//! Metrics collector.
//!
//! All metrics are declared on a [`MetricsRegistry`] before load starts. Declaring
//! hands back a cheap, clonable handle ([`Trend`], [`Rate`] or [`Check`]) that the
//! scenario keeps and records through; recording therefore can never fail with an
//! unknown name. Once declaration is over the registry is shared behind an `Arc`
//! and only read (snapshots) from then on.
//!
//! Rates are two atomic counters. Trends append to a mutex-guarded buffer that is
//! sealed into shared, immutable chunks of [`TREND_CHUNK`] samples. A snapshot
//! only clones the chunk handles and the open tail under the lock; copying and
//! sorting the samples happen outside it, so recording workers never wait on a
//! copy of the whole history.
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    aggregate::{Aggregate, RateAggregate, TrendAggregate},
    metric::{MetricKey, MetricKeyError, MetricKind},
    report::MetricReport,
};

/// Name of the rate that tracks every inline check.
pub const CHECKS: &str = "checks";

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("metric '{0}' was never declared")]
    Unknown(MetricKey),
    #[error("metric '{key}' is already declared as a {declared}, cannot redeclare it as a {requested}")]
    KindConflict {
        key: MetricKey,
        declared: MetricKind,
        requested: MetricKind,
    },
    #[error("invalid check name '{0}': ',', ':', '{{' and '}}' are reserved")]
    InvalidCheckName(String),
    #[error(transparent)]
    InvalidKey(#[from] MetricKeyError),
}

/// Samples per sealed trend chunk.
pub const TREND_CHUNK: usize = 4096;

#[derive(Debug, Default)]
struct TrendSamples {
    sealed: Vec<Arc<[f64]>>,
    open: Vec<f64>,
    sum: f64,
}

#[derive(Debug, Default)]
struct TrendCell {
    inner: Mutex<TrendSamples>,
}

impl TrendCell {
    fn consume(&self, value: f64) {
        let mut samples = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        samples.open.push(value);
        samples.sum += value;
        if samples.open.len() >= TREND_CHUNK {
            let full = std::mem::take(&mut samples.open);
            samples.sealed.push(full.into());
        }
    }

    fn aggregate(&self) -> TrendAggregate {
        let (sealed, open, sum) = {
            let samples = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            (samples.sealed.clone(), samples.open.clone(), samples.sum)
        };
        let mut aggregate = TrendAggregate::new();
        aggregate.values.reserve(sealed.len() * TREND_CHUNK + open.len());
        for chunk in &sealed {
            aggregate.values.extend_from_slice(chunk);
        }
        aggregate.values.extend(open);
        aggregate.sum = sum;
        aggregate
    }
}

#[derive(Debug, Default)]
struct RateCell {
    trues: AtomicU64,
    total: AtomicU64,
}

impl RateCell {
    fn consume(&self, value: bool) {
        // total is bumped first so a concurrent reader never sees trues > total
        self.total.fetch_add(1, Ordering::SeqCst);
        if value {
            self.trues.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn aggregate(&self) -> RateAggregate {
        let trues = self.trues.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        RateAggregate { trues, total }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Trend(Arc<TrendCell>),
    Rate(Arc<RateCell>),
}

impl Entry {
    fn kind(&self) -> MetricKind {
        match self {
            Entry::Trend(_) => MetricKind::Trend,
            Entry::Rate(_) => MetricKind::Rate,
        }
    }
}

/// Handle to a declared trend. Values are durations in milliseconds.
#[derive(Debug, Clone)]
pub struct Trend {
    cell: Arc<TrendCell>,
}

impl Trend {
    /// Records a value in milliseconds. Non-finite values are dropped.
    pub fn record(&self, millis: f64) {
        if millis.is_finite() {
            self.cell.consume(millis);
        }
    }

    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_secs_f64() * 1000.0);
    }
}

/// Handle to a declared rate.
#[derive(Debug, Clone)]
pub struct Rate {
    cell: Arc<RateCell>,
}

impl Rate {
    pub fn record(&self, value: bool) {
        self.cell.consume(value);
    }
}

/// An inline pass/fail assertion, reported per name and folded into [`CHECKS`].
///
/// Checks never gate the run by themselves; they only become part of the verdict
/// when a threshold references them.
#[derive(Debug, Clone)]
pub struct Check {
    name: Arc<str>,
    own: Rate,
    all: Rate,
}

impl Check {
    /// Records the outcome and returns it, so callers can chain on the result.
    pub fn check(&self, passed: bool) -> bool {
        self.own.record(passed);
        self.all.record(passed);
        if !passed {
            tracing::trace!(check = %self.name, "check failed");
        }
        passed
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Declares metrics and answers snapshot queries.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    entries: BTreeMap<MetricKey, Entry>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn declare(&mut self, key: MetricKey, kind: MetricKind) -> Result<Entry, MetricError> {
        if let Some(entry) = self.entries.get(&key) {
            if entry.kind() != kind {
                return Err(MetricError::KindConflict {
                    key,
                    declared: entry.kind(),
                    requested: kind,
                });
            }
            return Ok(entry.clone());
        }
        let entry = match kind {
            MetricKind::Trend => Entry::Trend(Arc::default()),
            MetricKind::Rate => Entry::Rate(Arc::default()),
        };
        tracing::trace!(metric = %key, %kind, "declared metric");
        self.entries.insert(key, entry.clone());
        Ok(entry)
    }

    /// Declares a trend, or returns the existing handle if it is already a trend.
    pub fn trend(&mut self, key: impl Into<MetricKey>) -> Result<Trend, MetricError> {
        let key = key.into();
        match self.declare(key.clone(), MetricKind::Trend)? {
            Entry::Trend(cell) => Ok(Trend { cell }),
            Entry::Rate(_) => Err(MetricError::KindConflict {
                key,
                declared: MetricKind::Rate,
                requested: MetricKind::Trend,
            }),
        }
    }

    /// Declares a rate, or returns the existing handle if it is already a rate.
    pub fn rate(&mut self, key: impl Into<MetricKey>) -> Result<Rate, MetricError> {
        let key = key.into();
        match self.declare(key.clone(), MetricKind::Rate)? {
            Entry::Rate(cell) => Ok(Rate { cell }),
            Entry::Trend(_) => Err(MetricError::KindConflict {
                key,
                declared: MetricKind::Trend,
                requested: MetricKind::Rate,
            }),
        }
    }

    /// Declares `checks{check:<name>}` together with the overall `checks` rate.
    pub fn check(&mut self, name: &str) -> Result<Check, MetricError> {
        if name.trim().is_empty() || name.contains([',', ':', '{', '}']) {
            return Err(MetricError::InvalidCheckName(name.to_string()));
        }
        let own = self.rate(MetricKey::new(CHECKS).tag("check", name))?;
        let all = self.rate(MetricKey::new(CHECKS))?;
        Ok(Check {
            name: Arc::from(name),
            own,
            all,
        })
    }

    pub fn kind(&self, key: &MetricKey) -> Option<MetricKind> {
        self.entries.get(key).map(Entry::kind)
    }

    pub fn keys(&self) -> impl Iterator<Item = &MetricKey> {
        self.entries.keys()
    }

    /// Current statistics of one metric, computed over everything recorded so far.
    pub fn snapshot(&self, key: &MetricKey) -> Result<MetricReport, MetricError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| MetricError::Unknown(key.clone()))?;
        Ok(Self::report(entry))
    }

    /// Statistics of every declared metric, ordered by key.
    pub fn snapshot_all(&self) -> BTreeMap<MetricKey, MetricReport> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), Self::report(entry)))
            .collect()
    }

    fn report(entry: &Entry) -> MetricReport {
        match entry {
            Entry::Trend(cell) => MetricReport::Trend(cell.aggregate().into()),
            Entry::Rate(cell) => MetricReport::Rate(cell.aggregate().into()),
        }
    }
}
