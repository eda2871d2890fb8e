//! Mutations and the scopes each one invalidates.
//!
//! [`INVALIDATION_MAP`] is the single source of truth for read-after-write
//! consistency: every [`MutationKind`] has exactly one entry, and the cache
//! only applies cross-cutting writes through [`plan`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ConnectionAction, IdentityPatch, ProjectDraft, TeamDraft};

use super::keys::Scope;
use super::query::{
    BY_POST, COMMENTS, CONNECTIONS, CONNECTION_REQUESTS, CONNECTION_STATS, DETAIL, FEED, LIST,
    MEMBERS, PENDING, POSTS, PROJECTS, SENT, TEAMS, USERS,
};

/// A write against the platform, with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Mutation {
    SendConnectionRequest { user_id: String },
    RespondToConnectionRequest { request_id: String, action: ConnectionAction },
    CancelConnectionRequest { request_id: String },
    RemoveConnection { connection_id: String },
    CreateTeam { draft: TeamDraft },
    UpdateTeam { team_id: String, changes: TeamDraft },
    DeleteTeam { team_id: String },
    JoinTeam { team_id: String },
    LeaveTeam { team_id: String },
    CreateProject { draft: ProjectDraft },
    UpdateProject { project_id: String, changes: ProjectDraft },
    DeleteProject { project_id: String, team_id: Option<String> },
    CreatePost { content: String },
    DeletePost { post_id: String },
    LikePost { post_id: String },
    CreateComment { post_id: String, content: String },
    DeleteComment { post_id: String, comment_id: String },
    UpdateProfile { patch: IdentityPatch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    SendConnectionRequest,
    RespondToConnectionRequest,
    CancelConnectionRequest,
    RemoveConnection,
    CreateTeam,
    UpdateTeam,
    DeleteTeam,
    JoinTeam,
    LeaveTeam,
    CreateProject,
    UpdateProject,
    DeleteProject,
    CreatePost,
    DeletePost,
    LikePost,
    CreateComment,
    DeleteComment,
    UpdateProfile,
}

impl MutationKind {
    pub const ALL: [MutationKind; 18] = [
        MutationKind::SendConnectionRequest,
        MutationKind::RespondToConnectionRequest,
        MutationKind::CancelConnectionRequest,
        MutationKind::RemoveConnection,
        MutationKind::CreateTeam,
        MutationKind::UpdateTeam,
        MutationKind::DeleteTeam,
        MutationKind::JoinTeam,
        MutationKind::LeaveTeam,
        MutationKind::CreateProject,
        MutationKind::UpdateProject,
        MutationKind::DeleteProject,
        MutationKind::CreatePost,
        MutationKind::DeletePost,
        MutationKind::LikePost,
        MutationKind::CreateComment,
        MutationKind::DeleteComment,
        MutationKind::UpdateProfile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::SendConnectionRequest => "send-connection-request",
            MutationKind::RespondToConnectionRequest => "respond-to-connection-request",
            MutationKind::CancelConnectionRequest => "cancel-connection-request",
            MutationKind::RemoveConnection => "remove-connection",
            MutationKind::CreateTeam => "create-team",
            MutationKind::UpdateTeam => "update-team",
            MutationKind::DeleteTeam => "delete-team",
            MutationKind::JoinTeam => "join-team",
            MutationKind::LeaveTeam => "leave-team",
            MutationKind::CreateProject => "create-project",
            MutationKind::UpdateProject => "update-project",
            MutationKind::DeleteProject => "delete-project",
            MutationKind::CreatePost => "create-post",
            MutationKind::DeletePost => "delete-post",
            MutationKind::LikePost => "like-post",
            MutationKind::CreateComment => "create-comment",
            MutationKind::DeleteComment => "delete-comment",
            MutationKind::UpdateProfile => "update-profile",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::SendConnectionRequest { .. } => MutationKind::SendConnectionRequest,
            Mutation::RespondToConnectionRequest { .. } => MutationKind::RespondToConnectionRequest,
            Mutation::CancelConnectionRequest { .. } => MutationKind::CancelConnectionRequest,
            Mutation::RemoveConnection { .. } => MutationKind::RemoveConnection,
            Mutation::CreateTeam { .. } => MutationKind::CreateTeam,
            Mutation::UpdateTeam { .. } => MutationKind::UpdateTeam,
            Mutation::DeleteTeam { .. } => MutationKind::DeleteTeam,
            Mutation::JoinTeam { .. } => MutationKind::JoinTeam,
            Mutation::LeaveTeam { .. } => MutationKind::LeaveTeam,
            Mutation::CreateProject { .. } => MutationKind::CreateProject,
            Mutation::UpdateProject { .. } => MutationKind::UpdateProject,
            Mutation::DeleteProject { .. } => MutationKind::DeleteProject,
            Mutation::CreatePost { .. } => MutationKind::CreatePost,
            Mutation::DeletePost { .. } => MutationKind::DeletePost,
            Mutation::LikePost { .. } => MutationKind::LikePost,
            Mutation::CreateComment { .. } => MutationKind::CreateComment,
            Mutation::DeleteComment { .. } => MutationKind::DeleteComment,
            Mutation::UpdateProfile { .. } => MutationKind::UpdateProfile,
        }
    }

    /// Id of the entity the mutation acts on, when it names one.
    pub fn target(&self) -> Option<&str> {
        let id = match self {
            Mutation::SendConnectionRequest { user_id } => user_id,
            Mutation::RespondToConnectionRequest { request_id, .. }
            | Mutation::CancelConnectionRequest { request_id } => request_id,
            Mutation::RemoveConnection { connection_id } => connection_id,
            Mutation::UpdateTeam { team_id, .. }
            | Mutation::DeleteTeam { team_id }
            | Mutation::JoinTeam { team_id }
            | Mutation::LeaveTeam { team_id } => team_id,
            Mutation::UpdateProject { project_id, .. }
            | Mutation::DeleteProject { project_id, .. } => project_id,
            Mutation::DeletePost { post_id } | Mutation::LikePost { post_id } => post_id,
            Mutation::DeleteComment { comment_id, .. } => comment_id,
            Mutation::CreateTeam { .. }
            | Mutation::CreateProject { .. }
            | Mutation::CreatePost { .. }
            | Mutation::CreateComment { .. }
            | Mutation::UpdateProfile { .. } => return None,
        };
        Some(id.as_str())
    }

    /// Id of the entity that owns the target (team of a project, post of a comment).
    pub fn parent(&self) -> Option<&str> {
        match self {
            Mutation::CreateProject { draft } => draft.team_id.as_deref(),
            Mutation::UpdateProject { changes, .. } => changes.team_id.as_deref(),
            Mutation::DeleteProject { team_id, .. } => team_id.as_deref(),
            Mutation::CreateComment { post_id, .. } | Mutation::DeleteComment { post_id, .. } => {
                Some(post_id.as_str())
            }
            _ => None,
        }
    }
}

/// Where an effect applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePath {
    /// A fixed prefix.
    Prefix(&'static [&'static str]),
    /// The prefix narrowed to the mutation's target id.
    Target(&'static [&'static str]),
    /// The prefix narrowed to the mutation's parent id.
    Parent(&'static [&'static str]),
}

/// What happens to matching entries when the mutation succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Mark stale; refetch if observed.
    Invalidate(ScopePath),
    /// Drop outright; the entity no longer exists.
    Remove(ScopePath),
}

/// Resolved effect ready to apply to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Stale(Scope),
    Remove(Scope),
}

impl Invalidation {
    pub fn scope(&self) -> &Scope {
        match self {
            Invalidation::Stale(scope) | Invalidation::Remove(scope) => scope,
        }
    }
}

use Effect::{Invalidate, Remove};
use ScopePath::{Parent, Prefix, Target};

const PENDING_REQUESTS: ScopePath = Prefix(&[CONNECTION_REQUESTS, PENDING]);
const SENT_REQUESTS: ScopePath = Prefix(&[CONNECTION_REQUESTS, SENT]);
const ALL_CONNECTIONS: ScopePath = Prefix(&[CONNECTIONS]);
const STATS: ScopePath = Prefix(&[CONNECTION_STATS]);
const ALL_USERS: ScopePath = Prefix(&[USERS]);
const TEAM_LISTS: ScopePath = Prefix(&[TEAMS, LIST]);
const TEAM_MEMBERS: ScopePath = Prefix(&[TEAMS, MEMBERS]);
const PROJECT_LISTS: ScopePath = Prefix(&[PROJECTS, LIST]);
const FEEDS: ScopePath = Prefix(&[POSTS, FEED]);
const ALL_POSTS: ScopePath = Prefix(&[POSTS]);
const ALL_COMMENTS: ScopePath = Prefix(&[COMMENTS]);

/// Mutation kind to the scopes it invalidates or removes on success.
pub const INVALIDATION_MAP: &[(MutationKind, &[Effect])] = &[
    (
        MutationKind::SendConnectionRequest,
        &[Invalidate(SENT_REQUESTS), Invalidate(STATS), Invalidate(ALL_USERS)],
    ),
    (
        MutationKind::RespondToConnectionRequest,
        &[Invalidate(PENDING_REQUESTS), Invalidate(ALL_CONNECTIONS), Invalidate(STATS)],
    ),
    (
        MutationKind::CancelConnectionRequest,
        &[Invalidate(SENT_REQUESTS), Invalidate(STATS), Invalidate(ALL_USERS)],
    ),
    (
        MutationKind::RemoveConnection,
        &[Invalidate(ALL_CONNECTIONS), Invalidate(STATS), Invalidate(ALL_USERS)],
    ),
    (MutationKind::CreateTeam, &[Invalidate(TEAM_LISTS)]),
    (
        MutationKind::UpdateTeam,
        &[Invalidate(Target(&[TEAMS, DETAIL])), Invalidate(TEAM_LISTS)],
    ),
    (
        MutationKind::DeleteTeam,
        &[
            Remove(Target(&[TEAMS, DETAIL])),
            Remove(Target(&[TEAMS, MEMBERS])),
            Invalidate(TEAM_LISTS),
            Invalidate(PROJECT_LISTS),
        ],
    ),
    (
        MutationKind::JoinTeam,
        &[
            Invalidate(Target(&[TEAMS, DETAIL])),
            Invalidate(Target(&[TEAMS, MEMBERS])),
            Invalidate(TEAM_LISTS),
        ],
    ),
    (
        MutationKind::LeaveTeam,
        &[
            Invalidate(Target(&[TEAMS, DETAIL])),
            Invalidate(Target(&[TEAMS, MEMBERS])),
            Invalidate(TEAM_LISTS),
        ],
    ),
    (
        MutationKind::CreateProject,
        &[Invalidate(PROJECT_LISTS), Invalidate(Parent(&[TEAMS, DETAIL]))],
    ),
    (
        MutationKind::UpdateProject,
        &[Invalidate(Target(&[PROJECTS, DETAIL])), Invalidate(PROJECT_LISTS)],
    ),
    (
        MutationKind::DeleteProject,
        &[
            Remove(Target(&[PROJECTS, DETAIL])),
            Invalidate(PROJECT_LISTS),
            Invalidate(Parent(&[TEAMS, DETAIL])),
        ],
    ),
    (MutationKind::CreatePost, &[Invalidate(FEEDS)]),
    (
        MutationKind::DeletePost,
        &[
            Remove(Target(&[POSTS, DETAIL])),
            Remove(Target(&[COMMENTS, BY_POST])),
            Invalidate(FEEDS),
        ],
    ),
    (
        MutationKind::LikePost,
        &[Invalidate(Target(&[POSTS, DETAIL])), Invalidate(FEEDS)],
    ),
    (
        MutationKind::CreateComment,
        &[
            Invalidate(Parent(&[COMMENTS, BY_POST])),
            Invalidate(Parent(&[POSTS, DETAIL])),
            Invalidate(FEEDS),
        ],
    ),
    (
        MutationKind::DeleteComment,
        &[
            Invalidate(Parent(&[COMMENTS, BY_POST])),
            Invalidate(Parent(&[POSTS, DETAIL])),
            Invalidate(FEEDS),
        ],
    ),
    (
        MutationKind::UpdateProfile,
        &[
            Invalidate(ALL_USERS),
            Invalidate(ALL_POSTS),
            Invalidate(ALL_COMMENTS),
            Invalidate(ALL_CONNECTIONS),
            Invalidate(TEAM_MEMBERS),
        ],
    ),
];

/// Declared effects for a mutation kind.
pub fn effects(kind: MutationKind) -> &'static [Effect] {
    INVALIDATION_MAP
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, effects)| *effects)
        .unwrap_or(&[])
}

/// Resolve the declared effects of `mutation` into concrete scopes.
///
/// A targeted effect whose id the payload does not carry is skipped: there is
/// no specific entity to refresh.
pub fn plan(mutation: &Mutation) -> Vec<Invalidation> {
    let kind = mutation.kind();
    effects(kind)
        .iter()
        .filter_map(|effect| {
            let (path, remove) = match effect {
                Invalidate(path) => (path, false),
                Remove(path) => (path, true),
            };
            let scope = match *path {
                Prefix(prefix) => Some(Scope::of(prefix)),
                Target(prefix) => mutation.target().map(|id| Scope::of(prefix).id(id)),
                Parent(prefix) => mutation.parent().map(|id| Scope::of(prefix).id(id)),
            };
            if scope.is_none() {
                debug!(mutation = %kind, ?path, "Skipping targeted invalidation without id");
            }
            scope.map(|scope| {
                if remove {
                    Invalidation::Remove(scope)
                } else {
                    Invalidation::Stale(scope)
                }
            })
        })
        .collect()
}
