//! HTTP client for the platform REST API.
//!
//! `ApiClient` implements both service seams: [`IdentityVerifier`] for boot
//! reconciliation and [`EntityService`] for the cache. Reads and writes are
//! mapped to routes by [`read_route`] and [`mutation_route`]; the access
//! token is taken from the credential store on every request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::{CredentialPair, CredentialStore};
use crate::cache::{Mutation, Query};
use crate::models::Identity;

use super::{ApiError, EntityService, IdentityVerifier};

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Method, path segments, query and body of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub method: Method,
    pub segments: Vec<String>,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl Route {
    fn new(method: Method, segments: &[&str]) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    fn get(segments: &[&str]) -> Self {
        Self::new(Method::GET, segments)
    }

    fn page(mut self, page: u32) -> Self {
        self.query.push(("page", page.to_string()));
        self
    }

    fn query(mut self, name: &'static str, value: &str) -> Self {
        self.query.push((name, value.to_string()));
        self
    }

    fn body(mut self, body: impl Serialize) -> Self {
        // Serializing plain data structs cannot fail.
        self.body = serde_json::to_value(body).ok();
        self
    }

    /// Absolute URL under `base`. Segments are percent-encoded, so ids can
    /// never escape their position in the path.
    pub fn url(&self, base: &Url) -> Result<Url, ApiError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ApiError::InvalidResponse(format!("Base URL cannot have a path: {}", base))
            })?
            .pop_if_empty()
            .extend(&self.segments);
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }
}

/// Route for a read.
pub fn read_route(query: &Query) -> Route {
    match query {
        Query::Connections { status, page } => Route::get(&["connections"])
            .query("status", status.as_str())
            .page(*page),
        Query::PendingRequests { page } => {
            Route::get(&["connections", "requests", "pending"]).page(*page)
        }
        Query::SentRequests { page } => {
            Route::get(&["connections", "requests", "sent"]).page(*page)
        }
        Query::ConnectionStats => Route::get(&["connections", "stats"]),
        Query::Teams { page } => Route::get(&["teams"]).page(*page),
        Query::Team { id } => Route::get(&["teams", id.as_str()]),
        Query::TeamMembers { team_id, page } => {
            Route::get(&["teams", team_id.as_str(), "members"]).page(*page)
        }
        Query::Projects { team_id, page } => {
            let route = Route::get(&["projects"]);
            match team_id {
                Some(team_id) => route.query("teamId", team_id),
                None => route,
            }
            .page(*page)
        }
        Query::Project { id } => Route::get(&["projects", id.as_str()]),
        Query::Feed { page } => Route::get(&["posts", "feed"]).page(*page),
        Query::Post { id } => Route::get(&["posts", id.as_str()]),
        Query::Comments { post_id, page } => {
            Route::get(&["posts", post_id.as_str(), "comments"]).page(*page)
        }
        Query::UserProfile { username } => Route::get(&["users", username.as_str()]),
    }
}

/// Route for a write.
pub fn mutation_route(mutation: &Mutation) -> Route {
    use Method as M;
    match mutation {
        Mutation::SendConnectionRequest { user_id } => {
            Route::new(M::POST, &["connections", "requests"]).body(json!({ "userId": user_id }))
        }
        Mutation::RespondToConnectionRequest { request_id, action } => {
            Route::new(M::PUT, &["connections", "requests", request_id.as_str()])
                .body(json!({ "action": action }))
        }
        Mutation::CancelConnectionRequest { request_id } => {
            Route::new(M::DELETE, &["connections", "requests", request_id.as_str()])
        }
        Mutation::RemoveConnection { connection_id } => {
            Route::new(M::DELETE, &["connections", connection_id.as_str()])
        }
        Mutation::CreateTeam { draft } => Route::new(M::POST, &["teams"]).body(draft),
        Mutation::UpdateTeam { team_id, changes } => {
            Route::new(M::PUT, &["teams", team_id.as_str()]).body(changes)
        }
        Mutation::DeleteTeam { team_id } => Route::new(M::DELETE, &["teams", team_id.as_str()]),
        Mutation::JoinTeam { team_id } => Route::new(M::POST, &["teams", team_id.as_str(), "join"]),
        Mutation::LeaveTeam { team_id } => {
            Route::new(M::POST, &["teams", team_id.as_str(), "leave"])
        }
        Mutation::CreateProject { draft } => Route::new(M::POST, &["projects"]).body(draft),
        Mutation::UpdateProject { project_id, changes } => {
            Route::new(M::PUT, &["projects", project_id.as_str()]).body(changes)
        }
        Mutation::DeleteProject { project_id, .. } => {
            Route::new(M::DELETE, &["projects", project_id.as_str()])
        }
        Mutation::CreatePost { content } => {
            Route::new(M::POST, &["posts"]).body(json!({ "content": content }))
        }
        Mutation::DeletePost { post_id } => Route::new(M::DELETE, &["posts", post_id.as_str()]),
        Mutation::LikePost { post_id } => Route::new(M::POST, &["posts", post_id.as_str(), "like"]),
        Mutation::CreateComment { post_id, content } => {
            Route::new(M::POST, &["posts", post_id.as_str(), "comments"])
                .body(json!({ "content": content }))
        }
        Mutation::DeleteComment { post_id, comment_id } => {
            Route::new(M::DELETE, &["posts", post_id.as_str(), "comments", comment_id.as_str()])
        }
        Mutation::UpdateProfile { patch } => Route::new(M::PUT, &["users", "profile"]).body(patch),
    }
}

/// Strip the `{success, data}` envelope. A body with `success: false` is a
/// rejected request even when the status was 2xx.
fn unwrap_envelope(value: Value) -> Result<Value, ApiError> {
    match value {
        Value::Object(mut fields) => {
            if fields.get("success").and_then(Value::as_bool) == Some(false) {
                return Err(ApiError::BadRequest(Value::Object(fields).to_string()));
            }
            match fields.remove("data") {
                Some(data) => Ok(data),
                None => Ok(Value::Object(fields)),
            }
        }
        other => Ok(other),
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default)]
    user: Option<Identity>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user: Identity,
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

fn parse_verification(value: Value) -> Result<Identity, ApiError> {
    let body = value.to_string();
    let response: VerifyResponse = serde_json::from_value(value)
        .map_err(|e| ApiError::InvalidResponse(format!("Malformed verification response: {}", e)))?;
    match (response.success, response.user) {
        (true, Some(user)) => Ok(user),
        (true, None) => Err(ApiError::InvalidResponse(
            "Verification succeeded without a user".to_string(),
        )),
        (false, _) => {
            debug!(message = ?response.message, "Verification rejected");
            Err(ApiError::VerificationRejected(body))
        }
    }
}

/// API client for the platform.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    credentials: Arc<CredentialStore>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        credentials: Arc<CredentialStore>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid API base URL: {}", base_url))?;
        Ok(Self {
            client,
            base_url,
            credentials,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff (doubles on every retry).
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn stored_token(&self) -> Result<String, ApiError> {
        match self.credentials.access_token() {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(ApiError::Unauthorized),
            Err(e) => {
                warn!(error = %e, "Could not read access token");
                Err(ApiError::Unauthorized)
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send(&self, route: &Route, token: Option<&str>) -> Result<Value, ApiError> {
        let url = route.url(&self.base_url)?;
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut request = self.client.request(route.method.clone(), url.clone());
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(ref body) = route.body {
                request = request.json(body);
            }
            debug!(method = %route.method, url = %url, "Sending request");
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    if text.trim().is_empty() {
                        return Ok(Value::Null);
                    }
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!(
                            "Failed to parse JSON from {}: {}",
                            url, e
                        ))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        url = %url,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Exchange email and password for an identity and a credential pair.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(Identity, CredentialPair), ApiError> {
        let route = Route::new(Method::POST, &["auth", "login"])
            .body(json!({ "email": email, "password": password }));
        let value = unwrap_envelope(self.send(&route, None).await?)?;
        let login: LoginResponse = serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed login response: {}", e)))?;
        Ok((
            login.user,
            CredentialPair::new(login.access_token, login.refresh_token),
        ))
    }
}

impl IdentityVerifier for ApiClient {
    async fn verify(&self, access_token: &str) -> Result<Identity, ApiError> {
        let route = Route::get(&["auth", "me"]);
        let value = self.send(&route, Some(access_token)).await?;
        parse_verification(value)
    }
}

impl EntityService for ApiClient {
    async fn read(&self, query: &Query) -> Result<Value, ApiError> {
        let token = self.stored_token()?;
        let value = self.send(&read_route(query), Some(&token)).await?;
        unwrap_envelope(value)
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Value, ApiError> {
        let token = self.stored_token()?;
        let value = self.send(&mutation_route(mutation), Some(&token)).await?;
        unwrap_envelope(value)
    }
}
