//! Setup and teardown of the baseline data every iteration works against.
use serde::{Deserialize, Serialize};

use crate::{
    client::{NewPullRequest, NewTeam, ServiceClient, TeamMember},
    config::FixtureConfig,
    report::{FixtureCounts, RunReport},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureTeam {
    pub team_name: String,
    /// Member ids in creation order; the first one authors pull requests.
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePullRequest {
    pub pr_id: String,
    pub team: String,
}

/// Baseline data created once by [`setup`] and shared read-only by every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureContext {
    pub teams: Vec<FixtureTeam>,
    pub prs: Vec<FixturePullRequest>,
}

impl FixtureContext {
    pub fn counts(&self) -> FixtureCounts {
        FixtureCounts {
            teams: self.teams.len(),
            pull_requests: self.prs.len(),
        }
    }
}

/// Provisions teams and pull requests before any load is generated.
///
/// Runs sequentially. A team or pull request the service refuses (or that never
/// reaches it) is left out of the context instead of failing setup; an unreachable
/// service therefore yields an empty context and a warning.
pub async fn setup<C: ServiceClient>(
    client: &C,
    config: &FixtureConfig,
    run_id: &str,
) -> FixtureContext {
    tracing::info!(
        teams = config.teams,
        members_per_team = config.members_per_team,
        "provisioning fixtures"
    );
    let mut ctx = FixtureContext::default();
    let mut unreachable = 0usize;

    for t in 0..config.teams {
        let team_name = format!("load-team-{t}-{run_id}");
        let members: Vec<TeamMember> = (0..config.members_per_team)
            .map(|u| TeamMember {
                user_id: format!("user-{t}-{u}-{run_id}"),
                username: format!("User{t}-{u}"),
                is_active: true,
            })
            .collect();
        let request = NewTeam {
            team_name: team_name.clone(),
            members,
        };

        let outcome = client.create_team(&request).await;
        match outcome {
            Ok(reply) if reply.is_success() => ctx.teams.push(FixtureTeam {
                team_name,
                users: request.members.into_iter().map(|m| m.user_id).collect(),
            }),
            Ok(reply) => tracing::warn!(
                team = %team_name,
                status = reply.status,
                code = ?reply.error_code(),
                "fixture team rejected"
            ),
            Err(e) => {
                unreachable += 1;
                tracing::warn!(team = %team_name, "fixture team not created: {e}");
            }
        }
    }

    let authors: Vec<&FixtureTeam> = ctx.teams.iter().filter(|t| !t.users.is_empty()).collect();
    let pr_count = if authors.is_empty() {
        0
    } else {
        config.pull_requests.unwrap_or(authors.len())
    };
    let mut prs = Vec::with_capacity(pr_count);

    for i in 0..pr_count {
        let team = authors[i % authors.len()];
        let pr_id = format!("load-pr-{i}-{run_id}");
        let request = NewPullRequest {
            pull_request_id: pr_id.clone(),
            pull_request_name: format!("Load Test PR {i}"),
            author_id: team.users[0].clone(),
        };
        let outcome = client.create_pull_request(&request).await;
        match outcome {
            Ok(reply) if reply.is_success() => prs.push(FixturePullRequest {
                pr_id,
                team: team.team_name.clone(),
            }),
            Ok(reply) => tracing::warn!(
                pr = %pr_id,
                status = reply.status,
                code = ?reply.error_code(),
                "fixture pull request rejected"
            ),
            Err(e) => {
                unreachable += 1;
                tracing::warn!(pr = %pr_id, "fixture pull request not created: {e}");
            }
        }
    }
    ctx.prs = prs;

    if ctx.teams.is_empty() {
        tracing::warn!(
            transport_failures = unreachable,
            "no fixture teams were created, every iteration will be a no-op"
        );
    }
    tracing::info!(
        teams = ctx.teams.len(),
        pull_requests = ctx.prs.len(),
        "fixtures ready"
    );
    ctx
}

/// Runs once after the last virtual user retired. Created data is left in place.
pub fn teardown(ctx: &FixtureContext, report: &RunReport) {
    tracing::info!(
        teams = ctx.teams.len(),
        pull_requests = ctx.prs.len(),
        iterations = report.iterations,
        passed = report.verdict.passed,
        "load test finished"
    );
}
