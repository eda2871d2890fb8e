use std::future::Future;

use serde_json::Value;

use crate::cache::{Mutation, Query};
use crate::models::Identity;

use super::ApiError;

/// Checks a stored access token against the platform.
///
/// Succeeds with the identity the token belongs to; fails with
/// [`ApiError::Unauthorized`] or [`ApiError::VerificationRejected`] when the
/// token is not accepted, or with a transport error.
pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<Identity, ApiError>> + Send;
}

/// Network side of the entity domains (connections, teams, projects, posts,
/// comments, users).
///
/// Reads return the raw JSON page or entity; the cache stores it as-is.
/// A successful `mutate` is the trigger point for that mutation's
/// invalidation entry.
pub trait EntityService: Send + Sync + 'static {
    fn read(&self, query: &Query) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn mutate(&self, mutation: &Mutation) -> impl Future<Output = Result<Value, ApiError>> + Send;
}
