use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// A `Metric` is a single observation produced while a scenario iteration runs.
///
/// Observations are the most granular level of data the harness deals with. They are
/// folded into an [`crate::Aggregate`] the moment they are recorded and then discarded;
/// no raw sample needs to outlive its `record` call for rates, and trends keep only the
/// numeric value needed for percentile queries.
///
/// Two observation types exist:
/// - `f64`: a duration in milliseconds, recorded into a *trend*.
/// - `bool`: an outcome, recorded into a *rate* (for example "request failed").
///
/// ## Example
/// ```rust
/// use review_load::Metric;
///
/// fn accepts_metric<M: Metric>(_: M) {}
/// accepts_metric(12.5_f64);
/// accepts_metric(true);
/// ```
pub trait Metric
where
    Self: PartialOrd + PartialEq + Send + Sync + Clone,
{
}

impl Metric for f64 {}
impl Metric for bool {}

/// The kind of a declared metric. Fixed at declaration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Distribution of durations, supports percentile queries.
    Trend,
    /// Fraction of boolean samples that were `true`.
    Rate,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Trend => f.write_str("trend"),
            MetricKind::Rate => f.write_str("rate"),
        }
    }
}

/// Identity of a metric: a name plus an optional, ordered set of tags.
///
/// The textual form mirrors the one used in threshold declarations:
/// `http_req_failed{name:CreateTeam}`. Tag values may contain spaces but not
/// `,`, `:` or `}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    name: String,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricKeyError {
    #[error("metric name is empty in '{0}'")]
    EmptyName(String),
    #[error("metric name '{0}' contains invalid characters")]
    InvalidName(String),
    #[error("unterminated tag set in '{0}'")]
    UnterminatedTags(String),
    #[error("malformed tag '{tag}' in '{key}', expected key:value")]
    MalformedTag { key: String, tag: String },
}

impl MetricKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Adds a tag, replacing any previous value for the same tag name.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

fn valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl FromStr for MetricKey {
    type Err = MetricKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, rest) = match s.find('{') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(MetricKeyError::EmptyName(s.to_string()));
        }
        if !valid_name(name) {
            return Err(MetricKeyError::InvalidName(name.to_string()));
        }

        let mut key = MetricKey::new(name);
        let Some(rest) = rest else {
            return Ok(key);
        };
        let inner = rest
            .strip_suffix('}')
            .ok_or_else(|| MetricKeyError::UnterminatedTags(s.to_string()))?;

        for tag in inner.split(',').filter(|t| !t.trim().is_empty()) {
            let (k, v) = tag
                .split_once(':')
                .ok_or_else(|| MetricKeyError::MalformedTag {
                    key: s.to_string(),
                    tag: tag.to_string(),
                })?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                return Err(MetricKeyError::MalformedTag {
                    key: s.to_string(),
                    tag: tag.to_string(),
                });
            }
            key.tags.insert(k.to_string(), v.to_string());
        }
        Ok(key)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        f.write_str("}")
    }
}

impl Serialize for MetricKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MetricKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl From<&str> for MetricKey {
    /// Builds an untagged key. Use [`str::parse`] for the tagged textual form.
    fn from(name: &str) -> Self {
        MetricKey::new(name)
    }
}
