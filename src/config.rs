//! Load profile configuration.
//!
//! Every field has a default, so an empty file (or no file at all) reproduces the
//! stock profile: ramp to 2 VUs over 30s, to 5 over a minute, hold for 30s, ramp
//! down over 30s, against `http://localhost:8080`.
use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    executor::Stage,
    threshold::{EmptyMetricPolicy, Threshold, ThresholdError},
};

/// Environment variable overriding [`Config::base_url`].
pub const BASE_URL_ENV: &str = "BASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid threshold on '{metric}': {source}")]
    Threshold {
        metric: String,
        #[source]
        source: ThresholdError,
    },
}

/// Serde helper for human-readable durations: `250ms`, `30s`, `1m30s`, `2h`.
///
/// A bare integer is read as seconds.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("invalid duration '{0}', expected something like 250ms, 30s, 1m30s or 2h")]
    pub struct DurationError(pub String);

    pub fn parse(input: &str) -> Result<Duration, DurationError> {
        let err = || DurationError(input.to_string());
        let s = input.trim();
        if s.is_empty() {
            return Err(err());
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse().map(Duration::from_secs).map_err(|_| err());
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
            if digits == 0 {
                return Err(err());
            }
            let (number, tail) = rest.split_at(digits);
            let value: u64 = number.parse().map_err(|_| err())?;
            let unit_len = tail.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
            let (unit, tail) = tail.split_at(unit_len);
            let part = match unit {
                "ms" => Duration::from_millis(value),
                "s" => Duration::from_secs(value),
                "m" => Duration::from_secs(value.saturating_mul(60)),
                "h" => Duration::from_secs(value.saturating_mul(3600)),
                _ => return Err(err()),
            };
            total = total.saturating_add(part);
            rest = tail;
        }
        Ok(total)
    }

    /// Compact rendering that [`parse`] reads back.
    pub fn format(d: &Duration) -> String {
        let millis = d.as_millis();
        if millis % 1000 != 0 {
            return format!("{millis}ms");
        }
        let secs = d.as_secs();
        if secs == 0 {
            return "0s".to_string();
        }
        let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{h}h"));
        }
        if m > 0 {
            out.push_str(&format!("{m}m"));
        }
        if s > 0 {
            out.push_str(&format!("{s}s"));
        }
        out
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(s) => Ok(Duration::from_secs(s)),
            Raw::Text(t) => parse(&t).map_err(D::Error::custom),
        }
    }
}

/// One threshold as written in the file: a bare expression or one with options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl ThresholdSpec {
    fn parse(&self, metric: &str) -> Result<Threshold, ThresholdError> {
        match self {
            ThresholdSpec::Expression(e) => Threshold::parse(metric, e),
            ThresholdSpec::Detailed {
                threshold,
                abort_on_fail,
            } => Threshold::parse(metric, threshold).map(|t| t.abort_on_fail(*abort_on_fail)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixtureConfig {
    pub teams: usize,
    pub members_per_team: usize,
    /// Pull requests to open, round-robin across created teams. One per team if unset.
    pub pull_requests: Option<usize>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            teams: 20,
            members_per_team: 10,
            pull_requests: None,
        }
    }
}

/// Latency bounds of the inline checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckLatency {
    #[serde(with = "duration")]
    pub create_team: Duration,
    #[serde(with = "duration")]
    pub create_pr: Duration,
    #[serde(with = "duration")]
    pub reassign: Duration,
    #[serde(with = "duration")]
    pub deactivate: Duration,
}

impl Default for CheckLatency {
    fn default() -> Self {
        Self {
            create_team: Duration::from_millis(300),
            create_pr: Duration::from_millis(300),
            reassign: Duration::from_millis(300),
            deactivate: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Pause between the steps of an iteration.
    #[serde(with = "duration")]
    pub think_time: Duration,
    pub deactivate_probability: f64,
    /// Members deactivated at most, starting right after the team's first member.
    pub deactivate_span: usize,
    pub check_latency: CheckLatency,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            think_time: Duration::from_millis(100),
            deactivate_probability: 0.3,
            deactivate_span: 3,
            check_latency: CheckLatency::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub base_url: String,
    pub stages: Vec<Stage>,
    /// Threshold expressions per metric key, e.g. `http_req_failed{name:Reassign}`.
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,
    pub empty_metric: EmptyMetricPolicy,
    /// How often `abort_on_fail` thresholds are re-evaluated during the run.
    #[serde(with = "duration")]
    pub threshold_eval_interval: Duration,
    pub fixtures: FixtureConfig,
    pub scenario: ScenarioConfig,
    pub http: HttpConfig,
    /// Makes every virtual user's random choices reproducible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Scheduler granularity.
    #[serde(with = "duration")]
    pub tick: Duration,
}

fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(Duration::from_secs(30), 2),
        Stage::new(Duration::from_secs(60), 5),
        Stage::new(Duration::from_secs(30), 5),
        Stage::new(Duration::from_secs(30), 0),
    ]
}

fn default_thresholds() -> BTreeMap<String, Vec<ThresholdSpec>> {
    let table: [(&str, &[&str]); 8] = [
        ("http_req_duration", &["p(95)<300", "p(99.9)<300"]),
        ("http_req_failed{name:CreateTeam}", &["rate<0.001"]),
        ("http_req_failed{name:CreatePR}", &["rate<0.001"]),
        ("http_req_failed{name:Reassign}", &["rate<0.1"]),
        ("create_team_duration", &["p(95)<300"]),
        ("create_pr_duration", &["p(95)<300"]),
        ("reassign_duration", &["p(95)<300"]),
        ("deactivate_duration", &["p(95)<100"]),
    ];
    table
        .into_iter()
        .map(|(metric, exprs)| {
            let specs = exprs
                .iter()
                .map(|e| ThresholdSpec::Expression(e.to_string()))
                .collect();
            (metric.to_string(), specs)
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            stages: default_stages(),
            thresholds: default_thresholds(),
            empty_metric: EmptyMetricPolicy::default(),
            threshold_eval_interval: Duration::from_secs(2),
            fixtures: FixtureConfig::default(),
            scenario: ScenarioConfig::default(),
            http: HttpConfig::default(),
            seed: None,
            tick: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Defaults, or the given file, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Applies overrides read through `lookup`, typically the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(BASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            tracing::debug!(base_url = %url, "base url overridden from {BASE_URL_ENV}");
            self.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("at least one stage is required".into()));
        }
        if self.stages.iter().all(|s| s.target == 0) {
            return Err(ConfigError::Invalid(
                "every stage targets 0 virtual users".into(),
            ));
        }
        let p = self.scenario.deactivate_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::Invalid(format!(
                "scenario.deactivate_probability must be within [0, 1], got {p}"
            )));
        }
        if self.fixtures.members_per_team == 0 {
            return Err(ConfigError::Invalid(
                "fixtures.members_per_team must be at least 1".into(),
            ));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick must be positive".into()));
        }
        if self.threshold_eval_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "threshold_eval_interval must be positive".into(),
            ));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        self.thresholds().map(|_| ())
    }

    /// Parses every threshold expression, in metric key order.
    pub fn thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        let mut out = Vec::new();
        for (metric, specs) in &self.thresholds {
            for spec in specs {
                let threshold = spec.parse(metric).map_err(|source| ConfigError::Threshold {
                    metric: metric.clone(),
                    source,
                })?;
                out.push(threshold);
            }
        }
        Ok(out)
    }
}
