//! Data models for server-derived entities.
//!
//! This module contains the data structures exchanged with the platform API:
//!
//! - `Identity`, `IdentityPatch`, `UserSummary`: the signed-in user and people references
//! - `Connection`, `ConnectionRequest`, `ConnectionStats`: the connection graph
//! - `Team`, `TeamMember`: teams and their membership
//! - `Project`: team or personal projects
//! - `Post`, `Comment`: the activity feed
//! - `Page`, `Pagination`: list envelopes

pub mod connection;
pub mod identity;
pub mod page;
pub mod post;
pub mod project;
pub mod team;

pub use connection::{
    Connection, ConnectionAction, ConnectionRequest, ConnectionStats, ConnectionStatus,
};
pub use identity::{Identity, IdentityPatch, UserSummary};
pub use page::{Page, Pagination};
pub use post::{Comment, Post};
pub use project::{Project, ProjectDraft, ProjectStatus};
pub use team::{Team, TeamDraft, TeamMember, TeamRole};
