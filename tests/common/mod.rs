#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use review_load::{
    client::{
        DeactivateMembers, NewPullRequest, NewTeam, Reassign, Reply, ServiceClient,
        TransportError,
    },
    random::RandomSource,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateTeam(NewTeam),
    CreatePr(NewPullRequest),
    GetPr(String),
    Reassign(Reassign),
    Deactivate(DeactivateMembers),
}

/// In-memory service double that records every call.
#[derive(Debug)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    /// Reviewers reported by `GET /pullRequest/get`, per pull request id.
    pub reviewers: HashMap<String, Vec<String>>,
    pub create_team_status: u16,
    /// Team names refused with 400, in any phase.
    pub refused_teams: Vec<String>,
    pub reassign_status: u16,
    /// Team creation fails before any reply arrives.
    pub create_team_unreachable: bool,
    /// Raw body served by `GET /pullRequest/get` instead of the reviewers above.
    pub pr_body: Option<String>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reviewers: HashMap::new(),
            create_team_status: 201,
            refused_teams: Vec::new(),
            reassign_status: 200,
            create_team_unreachable: false,
            pr_body: None,
        }
    }
}

impl Recorder {
    pub fn with_reviewers(pr: &str, reviewers: &[&str]) -> Self {
        let mut recorder = Self::default();
        recorder.reviewers.insert(
            pr.to_string(),
            reviewers.iter().map(|r| r.to_string()).collect(),
        );
        recorder
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ServiceClient for Recorder {
    async fn create_team(&self, team: &NewTeam) -> Result<Reply, TransportError> {
        self.record(Call::CreateTeam(team.clone()));
        if self.create_team_unreachable {
            return Err(connect_error().await);
        }
        if self.refused_teams.contains(&team.team_name) {
            return Ok(Reply::new(
                400,
                r#"{"error":{"code":"TEAM_EXISTS","message":"team already exists"}}"#,
            ));
        }
        Ok(Reply::new(self.create_team_status, "{}"))
    }

    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<Reply, TransportError> {
        self.record(Call::CreatePr(pr.clone()));
        Ok(Reply::new(201, "{}"))
    }

    async fn get_pull_request(&self, pull_request_id: &str) -> Result<Reply, TransportError> {
        self.record(Call::GetPr(pull_request_id.to_string()));
        if let Some(body) = &self.pr_body {
            return Ok(Reply::new(200, body.clone()));
        }
        let reviewers = self
            .reviewers
            .get(pull_request_id)
            .cloned()
            .unwrap_or_default();
        let body = serde_json::json!({
            "pr": {
                "pull_request_id": pull_request_id,
                "status": "OPEN",
                "assigned_reviewers": reviewers,
            }
        });
        Ok(Reply::new(200, body.to_string()))
    }

    async fn reassign_reviewer(&self, request: &Reassign) -> Result<Reply, TransportError> {
        self.record(Call::Reassign(request.clone()));
        let body = if self.reassign_status == 409 {
            r#"{"error":{"code":"NO_CANDIDATE","message":"no active replacement candidate in team"}}"#
        } else {
            "{}"
        };
        Ok(Reply::new(self.reassign_status, body))
    }

    async fn deactivate_members(
        &self,
        request: &DeactivateMembers,
    ) -> Result<Reply, TransportError> {
        self.record(Call::Deactivate(request.clone()));
        Ok(Reply::new(200, "{}"))
    }
}

/// A genuine connection failure: nothing listens on the tcpmux port.
async fn connect_error() -> TransportError {
    let err = reqwest::Client::new()
        .get("http://127.0.0.1:1/")
        .send()
        .await
        .unwrap_err();
    TransportError::Request(err)
}

/// Random source replaying scripted answers; `0` and `false` once exhausted.
#[derive(Debug, Default)]
pub struct Scripted {
    picks: VecDeque<usize>,
    chances: VecDeque<bool>,
}

impl Scripted {
    pub fn new(picks: &[usize], chances: &[bool]) -> Self {
        Self {
            picks: picks.iter().copied().collect(),
            chances: chances.iter().copied().collect(),
        }
    }
}

impl RandomSource for Scripted {
    fn pick(&mut self, len: usize) -> usize {
        self.picks.pop_front().unwrap_or(0) % len
    }

    fn chance(&mut self, _p: f64) -> bool {
        self.chances.pop_front().unwrap_or(false)
    }
}
