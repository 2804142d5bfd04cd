//! HTTP contract of the team / pull request service.
//!
//! [`ServiceClient`] is the seam between the harness and the service under test:
//! the scenario and the fixture setup only ever talk to it, so tests can swap the
//! real [`HttpServiceClient`] for an in-memory double.
use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url '{0}'")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: String,
    pub username: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTeam {
    pub team_name: String,
    pub members: Vec<TeamMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub pull_request_id: String,
    pub pull_request_name: String,
    pub author_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassign {
    pub pull_request_id: String,
    pub old_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateMembers {
    pub team_name: String,
    pub user_ids: Vec<String>,
}

/// Body of `GET /pullRequest/get`. Only the fields the harness relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PullRequestEnvelope {
    pub pr: Option<PullRequestView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PullRequestView {
    #[serde(default)]
    pub pull_request_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assigned_reviewers: Vec<String>,
}

/// Error body the service returns with non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Status and raw body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error code from an `{"error": {"code": ..}}` body, if the body has one.
    pub fn error_code(&self) -> Option<String> {
        serde_json::from_str::<ErrorEnvelope>(&self.body)
            .ok()
            .map(|e| e.error.code)
    }
}

/// Operations the harness needs from the service.
///
/// A returned `Err` is a transport failure (connection refused, timeout). Any
/// HTTP status, including 4xx/5xx, is a successful exchange and comes back as a
/// [`Reply`] for the caller to judge.
pub trait ServiceClient: Send + Sync + 'static {
    fn create_team(
        &self,
        team: &NewTeam,
    ) -> impl Future<Output = Result<Reply, TransportError>> + Send;

    fn create_pull_request(
        &self,
        pr: &NewPullRequest,
    ) -> impl Future<Output = Result<Reply, TransportError>> + Send;

    fn get_pull_request(
        &self,
        pull_request_id: &str,
    ) -> impl Future<Output = Result<Reply, TransportError>> + Send;

    fn reassign_reviewer(
        &self,
        request: &Reassign,
    ) -> impl Future<Output = Result<Reply, TransportError>> + Send;

    fn deactivate_members(
        &self,
        request: &DeactivateMembers,
    ) -> impl Future<Output = Result<Reply, TransportError>> + Send;
}

/// [`ServiceClient`] over HTTP with a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TransportError::InvalidBaseUrl(base_url));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn finish(response: reqwest::Response) -> Result<Reply, TransportError> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(Reply { status, body })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<Reply, TransportError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::finish(response).await
    }
}

impl ServiceClient for HttpServiceClient {
    async fn create_team(&self, team: &NewTeam) -> Result<Reply, TransportError> {
        self.post("/team/add", team).await
    }

    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<Reply, TransportError> {
        self.post("/pullRequest/create", pr).await
    }

    async fn get_pull_request(&self, pull_request_id: &str) -> Result<Reply, TransportError> {
        let response = self
            .client
            .get(self.url("/pullRequest/get"))
            .query(&[("pull_request_id", pull_request_id)])
            .send()
            .await?;
        Self::finish(response).await
    }

    async fn reassign_reviewer(&self, request: &Reassign) -> Result<Reply, TransportError> {
        self.post("/pullRequest/reassign", request).await
    }

    async fn deactivate_members(
        &self,
        request: &DeactivateMembers,
    ) -> Result<Reply, TransportError> {
        self.post("/team/deactivateMembers", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_request_body_tolerates_missing_fields() {
        let env: PullRequestEnvelope =
            serde_json::from_str(r#"{"pr":{"pull_request_id":"p1"}}"#).unwrap();
        assert_eq!(env.pr.unwrap().assigned_reviewers, Vec::<String>::new());

        let env: PullRequestEnvelope = serde_json::from_str("{}").unwrap();
        assert!(env.pr.is_none());
    }

    #[test]
    fn error_code_is_read_from_error_body() {
        let reply = Reply::new(
            409,
            r#"{"error":{"code":"NO_CANDIDATE","message":"no active replacement"}}"#,
        );
        assert_eq!(reply.error_code().as_deref(), Some("NO_CANDIDATE"));
        assert!(!reply.is_success());
        assert_eq!(Reply::new(409, "nope").error_code(), None);
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(matches!(
            HttpServiceClient::new("localhost:8080", Duration::from_secs(1)),
            Err(TransportError::InvalidBaseUrl(_))
        ));
        let client = HttpServiceClient::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
