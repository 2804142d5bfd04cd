use crate::Metric;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// The `Aggregate` trait defines how raw [`Metric`] observations are folded into an
/// intermediate, mergeable representation that keeps what later analysis needs.
///
/// **Important:** aggregates do **not** compute final statistics such as averages or
/// percentiles. Those derived values belong in a [`crate::Report`], which is converted
/// from an aggregate. Aggregates only hold compact, mergeable raw data.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**. Observations arrive from many
///   virtual users at once and no cross-worker ordering is ever established, so the
///   order in which partial aggregates are combined must not affect the result.
/// - `consume` sits on the hot path of every iteration; keep it allocation-light.
///
/// # Example
/// ```rust
/// use review_load::Aggregate;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Count(u64);
///
/// impl Aggregate for Count {
///     type Metric = bool;
///
///     fn new() -> Self {
///         Count(0)
///     }
///
///     fn consume(&mut self, _: &bool) {
///         self.0 += 1;
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.0 += other.0;
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + Send + Sync + Debug + Clone,
{
    /// The observation type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple observations into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single observation into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Running distribution of durations in milliseconds.
///
/// Every value is retained (unsorted) so that the report stage can answer any
/// percentile exactly. Memory grows linearly with the sample count, which is
/// acceptable for runs measured in minutes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendAggregate {
    pub values: Vec<f64>,
    pub sum: f64,
}

impl Aggregate for TrendAggregate {
    type Metric = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.values.push(*metric);
        self.sum += *metric;
    }

    fn merge(&mut self, mut other: Self) {
        self.values.append(&mut other.values);
        self.sum += other.sum;
    }
}

impl TrendAggregate {
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

/// Running count of `true` outcomes against all outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateAggregate {
    pub trues: u64,
    pub total: u64,
}

impl Aggregate for RateAggregate {
    type Metric = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.trues += u64::from(*metric);
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }
}
