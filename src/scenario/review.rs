//! One iteration of a user of the team / pull request reviewer service.
//!
//! Each iteration picks a fixture team, creates a throwaway team, opens a pull
//! request for the picked team, reassigns a reviewer on a known pull request and,
//! now and then, deactivates part of the picked team. Steps are independent: a
//! failed request is recorded and only ends its own step.
use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    client::{
        DeactivateMembers, NewPullRequest, NewTeam, PullRequestEnvelope, Reassign, Reply,
        ServiceClient, TeamMember, TransportError,
    },
    collector::{Check, MetricError, MetricsRegistry, Rate, Trend},
    config::ScenarioConfig,
    fixture::{FixtureContext, FixtureTeam},
    metric::MetricKey,
    random::RandomSource,
};

pub const CREATE_TEAM_DURATION: &str = "create_team_duration";
pub const CREATE_PR_DURATION: &str = "create_pr_duration";
pub const REASSIGN_DURATION: &str = "reassign_duration";
pub const DEACTIVATE_DURATION: &str = "deactivate_duration";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";

/// HTTP operations issued by the scenario, used as the `name` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateTeam,
    CreatePr,
    GetPr,
    Reassign,
    Deactivate,
}

impl Operation {
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::CreateTeam => "CreateTeam",
            Operation::CreatePr => "CreatePR",
            Operation::GetPr => "GetPR",
            Operation::Reassign => "Reassign",
            Operation::Deactivate => "Deactivate",
        }
    }

    /// Whether a reply with `status` counts as a successful request.
    ///
    /// A reassign may legitimately conflict (no eligible candidate), and
    /// deactivation is only judged on latency.
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            Operation::CreateTeam | Operation::CreatePr => status == 201,
            Operation::GetPr => status == 200,
            Operation::Reassign => status == 200 || status == 409,
            Operation::Deactivate => true,
        }
    }
}

#[derive(Debug, Clone)]
struct RequestMetrics {
    duration: Trend,
    duration_tagged: Trend,
    failed: Rate,
    failed_tagged: Rate,
}

impl RequestMetrics {
    fn declare(registry: &mut MetricsRegistry, op: Operation) -> Result<Self, MetricError> {
        Ok(Self {
            duration: registry.trend(HTTP_REQ_DURATION)?,
            duration_tagged: registry.trend(MetricKey::new(HTTP_REQ_DURATION).tag("name", op.tag()))?,
            failed: registry.rate(HTTP_REQ_FAILED)?,
            failed_tagged: registry.rate(MetricKey::new(HTTP_REQ_FAILED).tag("name", op.tag()))?,
        })
    }

    fn observe(&self, elapsed: Duration, failed: bool) {
        self.duration.record_duration(elapsed);
        self.duration_tagged.record_duration(elapsed);
        self.failed.record(failed);
        self.failed_tagged.record(failed);
    }
}

/// Trend and inline checks of one logical step.
#[derive(Debug, Clone)]
struct StepMetrics {
    duration: Trend,
    status: Option<Check>,
    latency: Check,
    bound: Duration,
}

impl StepMetrics {
    fn declare(
        registry: &mut MetricsRegistry,
        trend: &str,
        status_check: Option<&str>,
        label: &str,
        bound: Duration,
    ) -> Result<Self, MetricError> {
        Ok(Self {
            duration: registry.trend(trend)?,
            status: status_check.map(|name| registry.check(name)).transpose()?,
            latency: registry.check(&format!("{label} duration < {}ms", bound.as_millis()))?,
            bound,
        })
    }

    fn observe(&self, elapsed: Duration, accepted: bool) {
        self.duration.record_duration(elapsed);
        if let Some(status) = &self.status {
            status.check(accepted);
        }
        self.latency.check(elapsed < self.bound);
    }
}

/// Every metric handle the scenario records into. Declared once, cloned freely.
#[derive(Debug, Clone)]
pub struct ReviewMetrics {
    create_team_request: RequestMetrics,
    create_pr_request: RequestMetrics,
    get_pr_request: RequestMetrics,
    reassign_request: RequestMetrics,
    deactivate_request: RequestMetrics,
    create_team: StepMetrics,
    create_pr: StepMetrics,
    reassign: StepMetrics,
    deactivate: StepMetrics,
}

impl ReviewMetrics {
    pub fn declare(
        registry: &mut MetricsRegistry,
        config: &ScenarioConfig,
    ) -> Result<Self, MetricError> {
        let bounds = &config.check_latency;
        Ok(Self {
            create_team_request: RequestMetrics::declare(registry, Operation::CreateTeam)?,
            create_pr_request: RequestMetrics::declare(registry, Operation::CreatePr)?,
            get_pr_request: RequestMetrics::declare(registry, Operation::GetPr)?,
            reassign_request: RequestMetrics::declare(registry, Operation::Reassign)?,
            deactivate_request: RequestMetrics::declare(registry, Operation::Deactivate)?,
            create_team: StepMetrics::declare(
                registry,
                CREATE_TEAM_DURATION,
                Some("create team status 201"),
                "create team",
                bounds.create_team,
            )?,
            create_pr: StepMetrics::declare(
                registry,
                CREATE_PR_DURATION,
                Some("create PR status 201"),
                "create PR",
                bounds.create_pr,
            )?,
            reassign: StepMetrics::declare(
                registry,
                REASSIGN_DURATION,
                Some("reassign status 200 or 409"),
                "reassign",
                bounds.reassign,
            )?,
            deactivate: StepMetrics::declare(
                registry,
                DEACTIVATE_DURATION,
                None,
                "deactivate",
                bounds.deactivate,
            )?,
        })
    }

    fn request(&self, op: Operation) -> &RequestMetrics {
        match op {
            Operation::CreateTeam => &self.create_team_request,
            Operation::CreatePr => &self.create_pr_request,
            Operation::GetPr => &self.get_pr_request,
            Operation::Reassign => &self.reassign_request,
            Operation::Deactivate => &self.deactivate_request,
        }
    }
}

/// Result of one instrumented HTTP exchange.
struct Exchange {
    reply: Option<Reply>,
    accepted: bool,
}

/// Members to deactivate: a contiguous run right after the author, at most `span` long.
///
/// The first member authors the team's pull requests and is never included.
pub fn deactivation_slice(users: &[String], span: usize) -> &[String] {
    let end = users.len().min(span.saturating_add(1));
    users.get(1..end).unwrap_or_default()
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// The iteration body, shared by every virtual user.
pub struct ReviewScenario<C> {
    client: Arc<C>,
    fixtures: Arc<FixtureContext>,
    metrics: ReviewMetrics,
    config: ScenarioConfig,
}

impl<C: ServiceClient> ReviewScenario<C> {
    pub fn new(
        client: Arc<C>,
        fixtures: Arc<FixtureContext>,
        metrics: ReviewMetrics,
        config: ScenarioConfig,
    ) -> Self {
        Self {
            client,
            fixtures,
            metrics,
            config,
        }
    }

    /// Runs one iteration. Returns `false` when there was nothing to work with.
    pub async fn run_iteration<R: RandomSource>(&self, rng: &mut R) -> bool {
        let teams = &self.fixtures.teams;
        if teams.is_empty() {
            return false;
        }
        let team = &teams[rng.pick(teams.len())];

        self.create_team().await;
        self.pause().await;

        self.create_pull_request(team).await;
        self.pause().await;

        let prs = &self.fixtures.prs;
        if !prs.is_empty() {
            let pr = &prs[rng.pick(prs.len())];
            self.reassign(&pr.pr_id).await;
            self.pause().await;
        }

        if rng.chance(self.config.deactivate_probability) {
            let user_ids = deactivation_slice(&team.users, self.config.deactivate_span);
            if !user_ids.is_empty() {
                self.deactivate(team, user_ids).await;
            }
        }

        self.pause().await;
        true
    }

    async fn pause(&self) {
        if !self.config.think_time.is_zero() {
            tokio::time::sleep(self.config.think_time).await;
        }
    }

    async fn send<Fut>(&self, op: Operation, request: Fut) -> Exchange
    where
        Fut: Future<Output = Result<Reply, TransportError>>,
    {
        let start = Instant::now();
        let outcome = request.await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(reply) => {
                let accepted = op.accepts(reply.status);
                self.metrics.request(op).observe(elapsed, !accepted);
                if !accepted {
                    tracing::debug!(
                        operation = op.tag(),
                        status = reply.status,
                        code = ?reply.error_code(),
                        "unexpected status"
                    );
                }
                Exchange {
                    reply: Some(reply),
                    accepted,
                }
            }
            Err(e) => {
                self.metrics.request(op).observe(elapsed, true);
                tracing::debug!(operation = op.tag(), "request failed: {e}");
                Exchange {
                    reply: None,
                    accepted: false,
                }
            }
        }
    }

    async fn create_team(&self) {
        let request = NewTeam {
            team_name: unique("test-team"),
            members: vec![
                TeamMember {
                    user_id: unique("u1"),
                    username: "User1".to_string(),
                    is_active: true,
                },
                TeamMember {
                    user_id: unique("u2"),
                    username: "User2".to_string(),
                    is_active: true,
                },
            ],
        };
        let start = Instant::now();
        let exchange = self
            .send(Operation::CreateTeam, self.client.create_team(&request))
            .await;
        self.metrics
            .create_team
            .observe(start.elapsed(), exchange.accepted);
    }

    async fn create_pull_request(&self, team: &FixtureTeam) {
        let Some(author) = team.users.first() else {
            return;
        };
        let request = NewPullRequest {
            pull_request_id: unique("test-pr"),
            pull_request_name: "Test PR".to_string(),
            author_id: author.clone(),
        };
        let start = Instant::now();
        let exchange = self
            .send(Operation::CreatePr, self.client.create_pull_request(&request))
            .await;
        self.metrics
            .create_pr
            .observe(start.elapsed(), exchange.accepted);
    }

    /// Looks the pull request up and replaces its first reviewer, if it has any.
    ///
    /// The recorded duration covers the lookup and the reassignment.
    async fn reassign(&self, pr_id: &str) {
        let start = Instant::now();
        let lookup = self
            .send(Operation::GetPr, self.client.get_pull_request(pr_id))
            .await;
        let Some(reply) = lookup.reply.filter(|_| lookup.accepted) else {
            return;
        };
        let envelope: PullRequestEnvelope = match serde_json::from_str(&reply.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(pr = pr_id, "unreadable pull request body: {e}");
                return;
            }
        };
        let Some(old_user_id) = envelope
            .pr
            .and_then(|pr| pr.assigned_reviewers.into_iter().next())
        else {
            return;
        };

        let request = Reassign {
            pull_request_id: pr_id.to_string(),
            old_user_id,
        };
        let exchange = self
            .send(Operation::Reassign, self.client.reassign_reviewer(&request))
            .await;
        self.metrics
            .reassign
            .observe(start.elapsed(), exchange.accepted);
    }

    async fn deactivate(&self, team: &FixtureTeam, user_ids: &[String]) {
        let request = DeactivateMembers {
            team_name: team.team_name.clone(),
            user_ids: user_ids.to_vec(),
        };
        let start = Instant::now();
        let exchange = self
            .send(Operation::Deactivate, self.client.deactivate_members(&request))
            .await;
        self.metrics
            .deactivate
            .observe(start.elapsed(), exchange.accepted);
    }
}
