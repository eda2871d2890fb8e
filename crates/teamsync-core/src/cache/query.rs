//! Every read the platform performs, and the cache key each one lives under.

use std::time::Duration;

use crate::models::ConnectionStatus;

use super::keys::{CacheKey, Scope};

// Domain and operation vocabulary shared by queries, scopes and the
// invalidation table.
pub const CONNECTIONS: &str = "connections";
pub const CONNECTION_REQUESTS: &str = "connection-requests";
pub const CONNECTION_STATS: &str = "connection-stats";
pub const TEAMS: &str = "teams";
pub const PROJECTS: &str = "projects";
pub const POSTS: &str = "posts";
pub const COMMENTS: &str = "comments";
pub const USERS: &str = "users";

pub const LIST: &str = "list";
pub const DETAIL: &str = "detail";
pub const MEMBERS: &str = "members";
pub const PENDING: &str = "pending";
pub const SENT: &str = "sent";
pub const FEED: &str = "feed";
pub const BY_POST: &str = "by-post";
pub const PROFILE: &str = "profile";

/// Feeds change quickly; keep them fresh for a short time only.
const FEED_STALE_SECS: u64 = 15;

/// Aggregates are cheap to recompute but noisy to refetch on every render.
const STATS_STALE_SECS: u64 = 60;

/// Profiles rarely change outside of an explicit profile update.
const PROFILE_STALE_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    Connections { status: ConnectionStatus, page: u32 },
    PendingRequests { page: u32 },
    SentRequests { page: u32 },
    ConnectionStats,
    Teams { page: u32 },
    Team { id: String },
    TeamMembers { team_id: String, page: u32 },
    Projects { team_id: Option<String>, page: u32 },
    Project { id: String },
    Feed { page: u32 },
    Post { id: String },
    Comments { post_id: String, page: u32 },
    UserProfile { username: String },
}

impl Query {
    /// Deterministic cache key: domain, operation, then parameters in order.
    pub fn key(&self) -> CacheKey {
        match self {
            Query::Connections { status, page } => CacheKey::new(CONNECTIONS, LIST)
                .param("status", status.as_str())
                .param("page", *page),
            Query::PendingRequests { page } => {
                CacheKey::new(CONNECTION_REQUESTS, PENDING).param("page", *page)
            }
            Query::SentRequests { page } => {
                CacheKey::new(CONNECTION_REQUESTS, SENT).param("page", *page)
            }
            Query::ConnectionStats => CacheKey::domain(CONNECTION_STATS),
            Query::Teams { page } => CacheKey::new(TEAMS, LIST).param("page", *page),
            Query::Team { id } => CacheKey::new(TEAMS, DETAIL).id(id.as_str()),
            Query::TeamMembers { team_id, page } => CacheKey::new(TEAMS, MEMBERS)
                .id(team_id.as_str())
                .param("page", *page),
            Query::Projects { team_id, page } => CacheKey::new(PROJECTS, LIST)
                .param("team", team_id.as_deref())
                .param("page", *page),
            Query::Project { id } => CacheKey::new(PROJECTS, DETAIL).id(id.as_str()),
            Query::Feed { page } => CacheKey::new(POSTS, FEED).param("page", *page),
            Query::Post { id } => CacheKey::new(POSTS, DETAIL).id(id.as_str()),
            Query::Comments { post_id, page } => CacheKey::new(COMMENTS, BY_POST)
                .id(post_id.as_str())
                .param("page", *page),
            Query::UserProfile { username } => {
                CacheKey::new(USERS, PROFILE).id(username.as_str())
            }
        }
    }

    /// Per-domain freshness override; `None` uses the configured default.
    pub fn stale_time(&self) -> Option<Duration> {
        match self {
            Query::Feed { .. } | Query::Comments { .. } => {
                Some(Duration::from_secs(FEED_STALE_SECS))
            }
            Query::ConnectionStats => Some(Duration::from_secs(STATS_STALE_SECS)),
            Query::UserProfile { .. } => Some(Duration::from_secs(PROFILE_STALE_SECS)),
            _ => None,
        }
    }
}

// Named scopes used by the invalidation table and by consumers that want to
// refresh a whole area explicitly.

pub fn connections_scope() -> Scope {
    Scope::of(&[CONNECTIONS])
}

pub fn pending_requests_scope() -> Scope {
    Scope::of(&[CONNECTION_REQUESTS, PENDING])
}

pub fn sent_requests_scope() -> Scope {
    Scope::of(&[CONNECTION_REQUESTS, SENT])
}

pub fn connection_stats_scope() -> Scope {
    Scope::of(&[CONNECTION_STATS])
}
