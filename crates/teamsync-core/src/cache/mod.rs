//! Client-side cache of server-derived entities.
//!
//! Reads are addressed by hierarchical [`CacheKey`]s built from a [`Query`].
//! Writes go through [`QueryClient::mutate`], which applies the scopes listed
//! for that mutation in [`INVALIDATION_MAP`] once the server acknowledges it.
//!
//! - `keys`: key and scope construction
//! - `query`: the read vocabulary and per-domain stale times
//! - `invalidation`: mutations and their invalidation table
//! - `store`: entries, request dedup, stale-while-revalidate, lineage
//! - `client`: service-backed reads and mutations

pub mod client;
pub mod error;
pub mod invalidation;
pub mod keys;
pub mod query;
pub mod store;

pub use client::QueryClient;
pub use error::{MutationError, QueryError};
pub use invalidation::{plan, Invalidation, Mutation, MutationKind, INVALIDATION_MAP};
pub use keys::{CacheKey, ParamValue, Scope, Segment};
pub use query::Query;
pub use store::{
    FetchOptions, FetchResult, FetchStatus, Fetcher, QueryCache, QueryObserver, QueryState,
};
