use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::EntityService;

use super::error::{MutationError, QueryError};
use super::invalidation::{plan, Mutation};
use super::query::Query;
use super::store::{FetchOptions, FetchResult, Fetcher, QueryCache, QueryObserver};

/// Entry point for consumers: typed reads through the cache, observers, and
/// mutations that apply their declared invalidations.
pub struct QueryClient<S> {
    cache: QueryCache,
    service: Arc<S>,
}

impl<S: EntityService> QueryClient<S> {
    pub fn new(service: Arc<S>, default_stale_time: Duration) -> Self {
        Self {
            cache: QueryCache::new(default_stale_time),
            service,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    fn fetcher(&self, query: &Query) -> Fetcher {
        let service = Arc::clone(&self.service);
        let query = query.clone();
        Arc::new(move || {
            let service = Arc::clone(&service);
            let query = query.clone();
            async move { service.read(&query).await }.boxed()
        })
    }

    fn options(query: &Query, force: bool) -> FetchOptions {
        FetchOptions {
            stale_time: query.stale_time(),
            force,
        }
    }

    pub async fn fetch(&self, query: &Query) -> FetchResult {
        self.cache
            .fetch(&query.key(), Self::options(query, false), self.fetcher(query))
            .await
    }

    /// Read and decode into a model type.
    pub async fn fetch_as<T: DeserializeOwned>(&self, query: &Query) -> Result<T, QueryError> {
        let value = self.fetch(query).await?;
        Ok(T::deserialize(value.as_ref())?)
    }

    /// Bypass freshness and wait for the network.
    pub async fn refetch(&self, query: &Query) -> FetchResult {
        self.cache
            .fetch(&query.key(), Self::options(query, true), self.fetcher(query))
            .await
    }

    pub fn observe(&self, query: &Query) -> QueryObserver {
        self.cache
            .observe(&query.key(), Self::options(query, false), self.fetcher(query))
    }

    /// Perform `mutation` and, once the server acknowledges it, apply its
    /// invalidation plan. On failure the cache is left exactly as it was.
    pub async fn mutate(&self, mutation: &Mutation) -> Result<Value, MutationError> {
        let kind = mutation.kind();
        match self.service.mutate(mutation).await {
            Ok(value) => {
                let plan = plan(mutation);
                debug!(mutation = %kind, scopes = plan.len(), "Mutation applied, invalidating");
                self.cache.apply(&plan);
                Ok(value)
            }
            Err(e) => {
                warn!(mutation = %kind, error = %e, "Mutation failed");
                Err(MutationError::new(kind, e))
            }
        }
    }
}
