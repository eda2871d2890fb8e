//! Shared fixtures and fakes for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::api::{ApiError, EntityService, IdentityVerifier};
use crate::auth::{CredentialBackend, CredentialError, CredentialPair, MemoryBackend, StoredSecret};
use crate::cache::{Mutation, MutationKind, Query};
use crate::models::{
    Connection, ConnectionAction, ConnectionRequest, ConnectionStats, ConnectionStatus, Identity,
    IdentityPatch, Page, Pagination, Project, ProjectDraft, ProjectStatus, Team, TeamDraft,
    UserSummary,
};

const PAGE_LIMIT: usize = 20;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn identity(username: &str) -> Identity {
    Identity {
        id: format!("u-{username}"),
        first_name: username.to_string(),
        last_name: "Tester".to_string(),
        username: username.to_string(),
        avatar: None,
        bio: None,
    }
}

pub fn pair() -> CredentialPair {
    CredentialPair::new("access-abcdefgh", "refresh-abcdefgh")
}

fn user(username: &str) -> UserSummary {
    UserSummary {
        id: format!("u-{username}"),
        username: username.to_string(),
        first_name: username.to_string(),
        last_name: "Tester".to_string(),
        avatar: None,
    }
}

/// A mutation of the given kind with every id it can carry filled in.
pub fn sample_mutation(kind: MutationKind) -> Mutation {
    let team_draft = TeamDraft {
        name: Some("Core".into()),
        description: None,
    };
    let project_draft = ProjectDraft {
        name: Some("Launch".into()),
        description: None,
        team_id: Some("t1".into()),
        status: Some(ProjectStatus::Active),
    };
    match kind {
        MutationKind::SendConnectionRequest => Mutation::SendConnectionRequest {
            user_id: "u2".into(),
        },
        MutationKind::RespondToConnectionRequest => Mutation::RespondToConnectionRequest {
            request_id: "r1".into(),
            action: ConnectionAction::Accept,
        },
        MutationKind::CancelConnectionRequest => Mutation::CancelConnectionRequest {
            request_id: "r1".into(),
        },
        MutationKind::RemoveConnection => Mutation::RemoveConnection {
            connection_id: "c1".into(),
        },
        MutationKind::CreateTeam => Mutation::CreateTeam { draft: team_draft },
        MutationKind::UpdateTeam => Mutation::UpdateTeam {
            team_id: "t1".into(),
            changes: team_draft,
        },
        MutationKind::DeleteTeam => Mutation::DeleteTeam { team_id: "t1".into() },
        MutationKind::JoinTeam => Mutation::JoinTeam { team_id: "t1".into() },
        MutationKind::LeaveTeam => Mutation::LeaveTeam { team_id: "t1".into() },
        MutationKind::CreateProject => Mutation::CreateProject {
            draft: project_draft,
        },
        MutationKind::UpdateProject => Mutation::UpdateProject {
            project_id: "p1".into(),
            changes: project_draft,
        },
        MutationKind::DeleteProject => Mutation::DeleteProject {
            project_id: "p1".into(),
            team_id: Some("t1".into()),
        },
        MutationKind::CreatePost => Mutation::CreatePost {
            content: "hello".into(),
        },
        MutationKind::DeletePost => Mutation::DeletePost { post_id: "po1".into() },
        MutationKind::LikePost => Mutation::LikePost { post_id: "po1".into() },
        MutationKind::CreateComment => Mutation::CreateComment {
            post_id: "po1".into(),
            content: "nice".into(),
        },
        MutationKind::DeleteComment => Mutation::DeleteComment {
            post_id: "po1".into(),
            comment_id: "cm1".into(),
        },
        MutationKind::UpdateProfile => Mutation::UpdateProfile {
            patch: IdentityPatch::bio("hi"),
        },
    }
}

/// In-memory credential backend whose writes to one name always fail.
#[derive(Clone, Default)]
pub struct FlakyBackend {
    inner: Arc<MemoryBackend>,
    failing: Option<String>,
}

impl FlakyBackend {
    pub fn failing_writes_to(name: &str) -> Self {
        Self {
            inner: Arc::new(MemoryBackend::new()),
            failing: Some(name.to_string()),
        }
    }

    /// Store a secret directly, bypassing the failing name.
    pub fn seed(&self, name: &str, value: &str) {
        self.inner
            .write(name, &StoredSecret::new(value, chrono::Duration::days(1)))
            .unwrap();
    }
}

impl CredentialBackend for FlakyBackend {
    fn write(&self, name: &str, secret: &StoredSecret) -> Result<(), CredentialError> {
        if self.failing.as_deref() == Some(name) {
            return Err(CredentialError::Unavailable(format!("{name} is not writable")));
        }
        self.inner.write(name, secret)
    }

    fn read(&self, name: &str) -> Result<Option<StoredSecret>, CredentialError> {
        self.inner.read(name)
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        self.inner.delete(name)
    }

    fn label(&self) -> &'static str {
        "flaky"
    }
}

/// Verifier that answers from a script, one entry per call.
///
/// An exhausted script answers `Unauthorized`.
#[derive(Default)]
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<Result<Identity, ApiError>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, identity: Identity) -> Self {
        lock(&self.script).push_back(Ok(identity));
        self
    }

    pub fn then_err(self, err: ApiError) -> Self {
        lock(&self.script).push_back(Err(err));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IdentityVerifier for ScriptedVerifier {
    async fn verify(&self, _access_token: &str) -> Result<Identity, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = lock(&self.script).pop_front();
        next.unwrap_or(Err(ApiError::Unauthorized))
    }
}

#[derive(Default)]
struct Platform {
    connections: Vec<Connection>,
    pending: Vec<ConnectionRequest>,
    teams: Vec<Team>,
    projects: Vec<Project>,
}

/// In-memory stand-in for the platform's entity endpoints.
///
/// Reads can be held at a gate to observe request sharing, and the next
/// mutation can be made to fail.
pub struct FakeBackend {
    platform: Mutex<Platform>,
    reads: Mutex<HashMap<Query, usize>>,
    next_failure: Mutex<Option<ApiError>>,
    held: watch::Sender<bool>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            platform: Mutex::new(Platform::default()),
            reads: Mutex::new(HashMap::new()),
            next_failure: Mutex::new(None),
            held: watch::Sender::new(false),
        }
    }

    pub fn add_connection(&self, id: &str, username: &str) {
        lock(&self.platform).connections.push(Connection {
            id: id.to_string(),
            user: user(username),
            status: ConnectionStatus::Accepted,
            connected_at: Some(Utc::now()),
        });
    }

    pub fn add_pending_request(&self, id: &str, from: &str) {
        lock(&self.platform).pending.push(ConnectionRequest {
            id: id.to_string(),
            from: user(from),
            to: user("me"),
            created_at: Utc::now(),
        });
    }

    pub fn add_team(&self, id: &str, name: &str) {
        lock(&self.platform).teams.push(Team {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            owner_id: "u-me".to_string(),
            member_count: 1,
            project_count: 0,
        });
    }

    pub fn add_project(&self, id: &str, team_id: Option<&str>) {
        lock(&self.platform).projects.push(Project {
            id: id.to_string(),
            name: format!("Project {id}"),
            description: None,
            team_id: team_id.map(str::to_string),
            status: ProjectStatus::Active,
        });
    }

    pub fn hold_reads(&self) {
        self.held.send_replace(true);
    }

    pub fn release_reads(&self) {
        self.held.send_replace(false);
    }

    pub fn read_count(&self, query: &Query) -> usize {
        lock(&self.reads).get(query).copied().unwrap_or(0)
    }

    pub fn fail_next_mutation(&self, err: ApiError) {
        *lock(&self.next_failure) = Some(err);
    }

    fn answer(&self, query: &Query) -> Result<Value, ApiError> {
        let platform = lock(&self.platform);
        match query {
            Query::Connections { status, page } => {
                let items: Vec<_> = platform
                    .connections
                    .iter()
                    .filter(|c| c.status == *status)
                    .cloned()
                    .collect();
                paged(items, *page)
            }
            Query::PendingRequests { page } => paged(platform.pending.clone(), *page),
            Query::SentRequests { page } | Query::Feed { page } => {
                paged(Vec::<Value>::new(), *page)
            }
            Query::ConnectionStats => to_json(&ConnectionStats {
                connections: platform.connections.len() as u64,
                pending_requests: platform.pending.len() as u64,
                sent_requests: 0,
            }),
            Query::Teams { page } => paged(platform.teams.clone(), *page),
            Query::Team { id } => platform
                .teams
                .iter()
                .find(|t| &t.id == id)
                .map_or_else(|| Err(ApiError::NotFound(id.clone())), to_json),
            Query::TeamMembers { page, .. } | Query::Comments { page, .. } => {
                paged(Vec::<Value>::new(), *page)
            }
            Query::Projects { team_id, page } => {
                let items: Vec<_> = platform
                    .projects
                    .iter()
                    .filter(|p| team_id.is_none() || p.team_id == *team_id)
                    .cloned()
                    .collect();
                paged(items, *page)
            }
            Query::Project { id } => platform
                .projects
                .iter()
                .find(|p| &p.id == id)
                .map_or_else(|| Err(ApiError::NotFound(id.clone())), to_json),
            Query::Post { id } => Err(ApiError::NotFound(id.clone())),
            Query::UserProfile { username } => to_json(&identity(username)),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

fn paged<T: Serialize>(all: Vec<T>, page: u32) -> Result<Value, ApiError> {
    let total = all.len();
    let start = (page.max(1) as usize - 1) * PAGE_LIMIT;
    let items: Vec<T> = all.into_iter().skip(start).take(PAGE_LIMIT).collect();
    to_json(&Page {
        items,
        pagination: Pagination {
            page,
            limit: PAGE_LIMIT as u32,
            total: total as u64,
            total_pages: total.div_ceil(PAGE_LIMIT) as u32,
        },
    })
}

impl EntityService for FakeBackend {
    async fn read(&self, query: &Query) -> Result<Value, ApiError> {
        *lock(&self.reads).entry(query.clone()).or_default() += 1;
        let mut gate = self.held.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = gate.wait_for(|held| !*held).await;
        self.answer(query)
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Value, ApiError> {
        if let Some(err) = lock(&self.next_failure).take() {
            return Err(err);
        }
        let mut platform = lock(&self.platform);
        match mutation {
            Mutation::RespondToConnectionRequest { request_id, action } => {
                let index = platform
                    .pending
                    .iter()
                    .position(|r| &r.id == request_id)
                    .ok_or_else(|| ApiError::NotFound(request_id.clone()))?;
                let request = platform.pending.remove(index);
                if *action == ConnectionAction::Accept {
                    platform.connections.push(Connection {
                        id: format!("c-{request_id}"),
                        user: request.from,
                        status: ConnectionStatus::Accepted,
                        connected_at: Some(Utc::now()),
                    });
                }
                Ok(json!({ "status": action.as_str() }))
            }
            Mutation::DeleteProject { project_id, .. } => {
                platform.projects.retain(|p| &p.id != project_id);
                Ok(Value::Null)
            }
            Mutation::DeleteTeam { team_id } => {
                platform.teams.retain(|t| &t.id != team_id);
                Ok(Value::Null)
            }
            Mutation::UpdateProfile { patch } => to_json(patch),
            _ => Ok(Value::Null),
        }
    }
}

/// Accepts the [`pair`] access token as `ada`.
impl IdentityVerifier for FakeBackend {
    async fn verify(&self, access_token: &str) -> Result<Identity, ApiError> {
        if access_token == pair().access_token {
            Ok(identity("ada"))
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}
