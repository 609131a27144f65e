use crate::config::UpstreamConfig;
use crate::errors::ApiError;
use crate::models::{
    AccessLevel, MemberItem, ResourceKind, ResourceRef, SettingsPatch, UserProfile, Visibility,
};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

/// Per-call upstream credentials, borrowed out of the session store for the
/// duration of one call chain. The token is deliberately kept out of `Debug`.
#[derive(Clone)]
pub struct Auth {
    pub base_url: String,
    pub token: String,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Auth {
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| self.base_url.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CallOpts {
    /// Permits retrying POST. GET/HEAD/PUT/DELETE are always retried.
    pub idempotent: bool,
    /// Stretches the per-call deadline for archive-sized transfers.
    pub long_call: bool,
}

impl CallOpts {
    pub fn idempotent() -> Self {
        CallOpts {
            idempotent: true,
            long_call: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Captured subset: pagination counters and rate-limit hints.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl UpstreamResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::Internal(format!("upstream body decode: {}", e)))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

const CAPTURED_HEADERS: &[&str] = &[
    "x-total",
    "x-total-pages",
    "x-next-page",
    "x-page",
    "x-per-page",
    "retry-after",
];

fn capture_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let n = name.as_str();
            CAPTURED_HEADERS.contains(&n) || n.starts_with("ratelimit-") || n.starts_with("x-ratelimit-")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Retrying HTTP client in front of the upstream GitLab REST API. Every call
/// passes through the rate limiter; 429 and 5xx are retried with exponential
/// backoff and jitter, other 4xx are returned to the caller untouched.
pub struct UpstreamClient {
    http: Client,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    call_timeout: Duration,
    long_call_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(UpstreamClient {
            http,
            limiter,
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            long_call_timeout: Duration::from_secs(config.long_call_timeout_secs),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.backoff_cap);
        // +/- 25% jitter to decorrelate workers
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        exp.mul_f64(jitter)
    }

    /// Issue `method path_and_query` (relative to `{base_url}/api/v4`) and
    /// return the final response. Retries happen inside; the returned status
    /// can still be any non-retryable 4xx, which the caller maps.
    pub async fn call(
        &self,
        auth: &Auth,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
        opts: CallOpts,
    ) -> Result<UpstreamResponse, ApiError> {
        let deadline = if opts.long_call {
            self.long_call_timeout
        } else {
            self.call_timeout
        };

        match timeout(deadline, self.call_inner(auth, method, path_and_query, body, opts)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(format!(
                "deadline of {}s elapsed for {}",
                deadline.as_secs(),
                path_and_query
            ))),
        }
    }

    async fn call_inner(
        &self,
        auth: &Auth,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
        opts: CallOpts,
    ) -> Result<UpstreamResponse, ApiError> {
        let url = format!(
            "{}/api/v4{}",
            auth.base_url.trim_end_matches('/'),
            path_and_query
        );
        let host = auth.host();
        let may_retry = method != Method::POST || opts.idempotent;

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire(&host).await;

            let started = Instant::now();
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&auth.token);
            if let Some(b) = body {
                request = request.json(b);
            }

            let outcome = request.send().await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    let retry_after = retry_after_secs(response.headers());
                    self.limiter
                        .observe(&host, status.as_u16(), retry_after)
                        .await;

                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && may_retry && attempt < self.max_retries {
                        let wait = match retry_after {
                            Some(secs) => Duration::from_secs(secs),
                            None => self.backoff(attempt),
                        };
                        log::warn!(
                            "upstream_retry host={} path={} status={} attempt={} wait_ms={}",
                            host,
                            path_and_query,
                            status.as_u16(),
                            attempt + 1,
                            wait.as_millis()
                        );
                        attempt += 1;
                        sleep(wait).await;
                        continue;
                    }

                    if retryable {
                        return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                            ApiError::RateLimited {
                                retry_after_secs: retry_after,
                            }
                        } else {
                            ApiError::UpstreamUnavailable(format!(
                                "upstream returned {} for {}",
                                status.as_u16(),
                                path_and_query
                            ))
                        });
                    }

                    let headers = capture_headers(response.headers());
                    let bytes = response.bytes().await.map_err(ApiError::from)?;
                    return Ok(UpstreamResponse {
                        status: status.as_u16(),
                        headers,
                        body: bytes.to_vec(),
                        elapsed,
                    });
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect();
                    if transient && may_retry && attempt < self.max_retries {
                        let wait = self.backoff(attempt);
                        log::warn!(
                            "upstream_retry host={} path={} transport_error attempt={} wait_ms={}",
                            host,
                            path_and_query,
                            attempt + 1,
                            wait.as_millis()
                        );
                        attempt += 1;
                        sleep(wait).await;
                        continue;
                    }
                    return Err(if transient {
                        ApiError::UpstreamUnavailable(err.to_string())
                    } else {
                        ApiError::from(err)
                    });
                }
            }
        }
    }
}

// ============================================================================
// Typed GitLab surface
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct GroupRef {
    pub id: u64,
    pub full_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRef {
    pub id: u64,
    pub path_with_namespace: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub path: String,
    pub parent_id: Option<u64>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub path: String,
    pub namespace_id: Option<u64>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
    pub default_branch: Option<String>,
    pub initialize_with_readme: bool,
}

/// A resource reference with its upstream id already resolved.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTarget {
    pub kind: ResourceKind,
    pub id: u64,
}

impl ResolvedTarget {
    fn base_path(&self) -> String {
        match self.kind {
            ResourceKind::Group => format!("/groups/{}", self.id),
            ResourceKind::Project => format!("/projects/{}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsOutcome {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

fn encode_path(full_path: &str) -> String {
    full_path.replace('/', "%2F")
}

/// Decode an error body from the upstream into a message fragment.
fn upstream_message(resp: &UpstreamResponse) -> String {
    resp.json::<Value>()
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| format!("status {}", resp.status))
}

/// Map a non-success upstream response onto the error taxonomy.
fn reject(resp: &UpstreamResponse, what: &str) -> ApiError {
    let msg = format!("{}: {}", what, upstream_message(resp));
    match resp.status {
        401 => ApiError::BadCredentials(msg),
        403 => ApiError::Forbidden(msg),
        404 => ApiError::NotFound(msg),
        409 => ApiError::Conflict(msg),
        400 | 422 => ApiError::Validation(msg),
        _ => ApiError::Internal(msg),
    }
}

/// Everything the engines need from the upstream, behind a trait so the bulk
/// engine and migration worker can be driven against a mock in tests.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    async fn current_user(&self, auth: &Auth) -> Result<UserProfile, ApiError>;

    async fn find_group(&self, auth: &Auth, full_path: &str)
        -> Result<Option<GroupRef>, ApiError>;
    async fn group_by_id(&self, auth: &Auth, id: u64) -> Result<GroupRef, ApiError>;
    async fn create_group(&self, auth: &Auth, group: &NewGroup) -> Result<GroupRef, ApiError>;

    async fn find_project(
        &self,
        auth: &Auth,
        full_path: &str,
    ) -> Result<Option<ProjectRef>, ApiError>;
    async fn create_project(
        &self,
        auth: &Auth,
        project: &NewProject,
    ) -> Result<ProjectRef, ApiError>;

    async fn apply_settings(
        &self,
        auth: &Auth,
        target: ResolvedTarget,
        patch: &SettingsPatch,
    ) -> Result<SettingsOutcome, ApiError>;

    async fn delete_resource(
        &self,
        auth: &Auth,
        target: ResolvedTarget,
    ) -> Result<DeleteOutcome, ApiError>;

    async fn upsert_member(
        &self,
        auth: &Auth,
        target: ResolvedTarget,
        member: &MemberItem,
    ) -> Result<SettingsOutcome, ApiError>;

    /// Raw pass-through for the gateway proxy.
    async fn forward(
        &self,
        auth: &Auth,
        method: Method,
        path_and_query: &str,
        body: Option<Value>,
        long_call: bool,
    ) -> Result<UpstreamResponse, ApiError>;

    /// Resolve a by-id-or-path reference to a concrete upstream id.
    async fn resolve_target(
        &self,
        auth: &Auth,
        r: &ResourceRef,
    ) -> Result<ResolvedTarget, ApiError> {
        if let Some(id) = r.id {
            return Ok(ResolvedTarget { kind: r.kind, id });
        }
        let full_path = r.full_path.as_deref().ok_or_else(|| {
            ApiError::Validation("resource reference needs an id or a full_path".into())
        })?;
        let id = match r.kind {
            ResourceKind::Group => self
                .find_group(auth, full_path)
                .await?
                .map(|g| g.id)
                .ok_or_else(|| ApiError::NotFound(format!("group {}", full_path)))?,
            ResourceKind::Project => self
                .find_project(auth, full_path)
                .await?
                .map(|p| p.id)
                .ok_or_else(|| ApiError::NotFound(format!("project {}", full_path)))?,
        };
        Ok(ResolvedTarget { kind: r.kind, id })
    }
}

/// Production implementation over the retrying client.
pub struct GitLabClient {
    upstream: Arc<UpstreamClient>,
}

impl GitLabClient {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        GitLabClient { upstream }
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        auth: &Auth,
        path: &str,
        what: &str,
    ) -> Result<Option<T>, ApiError> {
        let resp = self
            .upstream
            .call(auth, Method::GET, path, None, CallOpts::idempotent())
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(reject(&resp, what));
        }
        resp.json().map(Some)
    }

    async fn put_json(
        &self,
        auth: &Auth,
        path: &str,
        body: Value,
        what: &str,
    ) -> Result<(), ApiError> {
        let resp = self
            .upstream
            .call(auth, Method::PUT, path, Some(&body), CallOpts::idempotent())
            .await?;
        if !resp.is_success() {
            return Err(reject(&resp, what));
        }
        Ok(())
    }

    async fn post_json(
        &self,
        auth: &Auth,
        path: &str,
        body: Value,
        idempotent: bool,
        what: &str,
    ) -> Result<UpstreamResponse, ApiError> {
        let opts = CallOpts {
            idempotent,
            long_call: false,
        };
        let resp = self
            .upstream
            .call(auth, Method::POST, path, Some(&body), opts)
            .await?;
        if !resp.is_success() {
            return Err(reject(&resp, what));
        }
        Ok(resp)
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn current_user(&self, auth: &Auth) -> Result<UserProfile, ApiError> {
        let resp = self
            .upstream
            .call(auth, Method::GET, "/user", None, CallOpts::idempotent())
            .await?;
        if !resp.is_success() {
            return Err(match resp.status {
                401 | 403 => ApiError::BadCredentials("token validation failed".into()),
                _ => reject(&resp, "user lookup"),
            });
        }
        resp.json()
    }

    async fn find_group(
        &self,
        auth: &Auth,
        full_path: &str,
    ) -> Result<Option<GroupRef>, ApiError> {
        self.get_optional(
            auth,
            &format!("/groups/{}", encode_path(full_path)),
            "group lookup",
        )
        .await
    }

    async fn group_by_id(&self, auth: &Auth, id: u64) -> Result<GroupRef, ApiError> {
        let resp = self
            .upstream
            .call(
                auth,
                Method::GET,
                &format!("/groups/{}", id),
                None,
                CallOpts::idempotent(),
            )
            .await?;
        if !resp.is_success() {
            return Err(reject(&resp, "group lookup"));
        }
        resp.json()
    }

    async fn create_group(&self, auth: &Auth, group: &NewGroup) -> Result<GroupRef, ApiError> {
        let mut body = json!({
            "name": group.name,
            "path": group.path,
        });
        if let Some(parent) = group.parent_id {
            body["parent_id"] = json!(parent);
        }
        if let Some(ref description) = group.description {
            body["description"] = json!(description);
        }
        if let Some(visibility) = group.visibility {
            body["visibility"] = json!(visibility.as_str());
        }
        // The engine looked the natural key up first, so this POST is an
        // idempotent upsert and safe to retry.
        let resp = self
            .post_json(auth, "/groups", body, true, "group create")
            .await?;
        resp.json()
    }

    async fn find_project(
        &self,
        auth: &Auth,
        full_path: &str,
    ) -> Result<Option<ProjectRef>, ApiError> {
        self.get_optional(
            auth,
            &format!("/projects/{}", encode_path(full_path)),
            "project lookup",
        )
        .await
    }

    async fn create_project(
        &self,
        auth: &Auth,
        project: &NewProject,
    ) -> Result<ProjectRef, ApiError> {
        let mut body = json!({
            "name": project.name,
            "path": project.path,
            "initialize_with_readme": project.initialize_with_readme,
        });
        if let Some(ns) = project.namespace_id {
            body["namespace_id"] = json!(ns);
        }
        if let Some(ref description) = project.description {
            body["description"] = json!(description);
        }
        if let Some(visibility) = project.visibility {
            body["visibility"] = json!(visibility.as_str());
        }
        if let Some(ref branch) = project.default_branch {
            body["default_branch"] = json!(branch);
        }
        let resp = self
            .post_json(auth, "/projects", body, true, "project create")
            .await?;
        resp.json()
    }

    async fn apply_settings(
        &self,
        auth: &Auth,
        target: ResolvedTarget,
        patch: &SettingsPatch,
    ) -> Result<SettingsOutcome, ApiError> {
        let base = target.base_path();
        match patch {
            SettingsPatch::Visibility { visibility } => {
                let current: Value = self
                    .get_optional(auth, &base, "settings target")
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("settings target {}", base)))?;
                if current.get("visibility").and_then(|v| v.as_str())
                    == Some(visibility.as_str())
                {
                    return Ok(SettingsOutcome::Skipped);
                }
                self.put_json(
                    auth,
                    &base,
                    json!({ "visibility": visibility.as_str() }),
                    "visibility update",
                )
                .await?;
                Ok(SettingsOutcome::Updated)
            }
            SettingsPatch::ProtectedBranch {
                name,
                push_access_level,
                merge_access_level,
                allow_force_push,
            } => {
                let path = format!("{}/protected_branches/{}", base, encode_path(name));
                let current: Option<Value> =
                    self.get_optional(auth, &path, "protected branch").await?;
                match current {
                    Some(existing) => {
                        let level = |v: &Value, field: &str| {
                            v.get(field)
                                .and_then(|a| a.as_array())
                                .and_then(|a| a.first())
                                .and_then(|e| e.get("access_level"))
                                .and_then(|l| l.as_u64())
                        };
                        let same = level(&existing, "push_access_levels")
                            == Some(push_access_level.as_gitlab() as u64)
                            && level(&existing, "merge_access_levels")
                                == Some(merge_access_level.as_gitlab() as u64)
                            && existing.get("allow_force_push").and_then(|v| v.as_bool())
                                == Some(*allow_force_push);
                        if same {
                            return Ok(SettingsOutcome::Skipped);
                        }
                        // Idempotent in-place update, never delete-and-recreate.
                        let resp = self
                            .upstream
                            .call(
                                auth,
                                Method::PATCH,
                                &path,
                                Some(&json!({
                                    "allow_force_push": allow_force_push,
                                    "allowed_to_push": [{ "access_level": push_access_level.as_gitlab() }],
                                    "allowed_to_merge": [{ "access_level": merge_access_level.as_gitlab() }],
                                })),
                                CallOpts::idempotent(),
                            )
                            .await?;
                        if !resp.is_success() {
                            return Err(reject(&resp, "protected branch update"));
                        }
                        Ok(SettingsOutcome::Updated)
                    }
                    None => {
                        let body = json!({
                            "name": name,
                            "push_access_level": push_access_level.as_gitlab(),
                            "merge_access_level": merge_access_level.as_gitlab(),
                            "allow_force_push": allow_force_push,
                        });
                        self.post_json(
                            auth,
                            &format!("{}/protected_branches", base),
                            body,
                            true,
                            "protect branch",
                        )
                        .await?;
                        Ok(SettingsOutcome::Created)
                    }
                }
            }
            SettingsPatch::PushRules {
                commit_message_regex,
                branch_name_regex,
                member_check,
                prevent_secrets,
                max_file_size,
            } => {
                let path = format!("{}/push_rule", base);
                let mut body = json!({
                    "member_check": member_check,
                    "prevent_secrets": prevent_secrets,
                });
                if let Some(re) = commit_message_regex {
                    body["commit_message_regex"] = json!(re);
                }
                if let Some(re) = branch_name_regex {
                    body["branch_name_regex"] = json!(re);
                }
                if let Some(size) = max_file_size {
                    body["max_file_size"] = json!(size);
                }
                let current: Option<Value> = self.get_optional(auth, &path, "push rule").await?;
                match current.filter(|v| !v.is_null()) {
                    Some(existing) => {
                        let same = body
                            .as_object()
                            .map(|fields| {
                                fields.iter().all(|(k, v)| existing.get(k) == Some(v))
                            })
                            .unwrap_or(false);
                        if same {
                            return Ok(SettingsOutcome::Skipped);
                        }
                        self.put_json(auth, &path, body, "push rule update").await?;
                        Ok(SettingsOutcome::Updated)
                    }
                    None => {
                        self.post_json(auth, &path, body, true, "push rule create")
                            .await?;
                        Ok(SettingsOutcome::Created)
                    }
                }
            }
            SettingsPatch::Topics { topics } => {
                let current: Value = self
                    .get_optional(auth, &base, "settings target")
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("settings target {}", base)))?;
                let existing: Vec<String> = current
                    .get("topics")
                    .and_then(|t| serde_json::from_value(t.clone()).ok())
                    .unwrap_or_default();
                let mut want = topics.clone();
                let mut have = existing;
                want.sort();
                have.sort();
                if want == have {
                    return Ok(SettingsOutcome::Skipped);
                }
                self.put_json(auth, &base, json!({ "topics": topics }), "topics update")
                    .await?;
                Ok(SettingsOutcome::Updated)
            }
            SettingsPatch::Project { settings } => {
                self.put_json(
                    auth,
                    &base,
                    Value::Object(settings.clone()),
                    "project settings update",
                )
                .await?;
                Ok(SettingsOutcome::Updated)
            }
            SettingsPatch::CiVariable {
                key,
                value,
                protected,
                masked,
            } => {
                let path = format!("{}/variables/{}", base, encode_path(key));
                let current: Option<Value> = self.get_optional(auth, &path, "variable").await?;
                let body = json!({
                    "key": key,
                    "value": value,
                    "protected": protected,
                    "masked": masked,
                });
                match current {
                    Some(existing) => {
                        let same = existing.get("value").and_then(|v| v.as_str())
                            == Some(value.as_str())
                            && existing.get("protected").and_then(|v| v.as_bool())
                                == Some(*protected)
                            && existing.get("masked").and_then(|v| v.as_bool()) == Some(*masked);
                        if same {
                            return Ok(SettingsOutcome::Skipped);
                        }
                        self.put_json(auth, &path, body, "variable update").await?;
                        Ok(SettingsOutcome::Updated)
                    }
                    None => {
                        self.post_json(
                            auth,
                            &format!("{}/variables", base),
                            body,
                            true,
                            "variable create",
                        )
                        .await?;
                        Ok(SettingsOutcome::Created)
                    }
                }
            }
        }
    }

    async fn delete_resource(
        &self,
        auth: &Auth,
        target: ResolvedTarget,
    ) -> Result<DeleteOutcome, ApiError> {
        let resp = self
            .upstream
            .call(
                auth,
                Method::DELETE,
                &target.base_path(),
                None,
                CallOpts::idempotent(),
            )
            .await?;
        match resp.status {
            200 | 202 | 204 => Ok(DeleteOutcome::Deleted),
            404 => Ok(DeleteOutcome::AlreadyGone),
            _ => Err(reject(&resp, "delete")),
        }
    }

    async fn upsert_member(
        &self,
        auth: &Auth,
        target: ResolvedTarget,
        member: &MemberItem,
    ) -> Result<SettingsOutcome, ApiError> {
        // Resolve username/email to a user id first.
        let query = if member.user.contains('@') {
            format!("/users?search={}", member.user)
        } else {
            format!("/users?username={}", member.user)
        };
        let resp = self
            .upstream
            .call(auth, Method::GET, &query, None, CallOpts::idempotent())
            .await?;
        if !resp.is_success() {
            return Err(reject(&resp, "user lookup"));
        }
        let users: Vec<Value> = resp.json()?;
        let user_id = users
            .first()
            .and_then(|u| u.get("id"))
            .and_then(|id| id.as_u64())
            .ok_or_else(|| ApiError::NotFound(format!("user {}", member.user)))?;

        let member_path = format!("{}/members/{}", target.base_path(), user_id);
        let current: Option<Value> = self.get_optional(auth, &member_path, "member").await?;
        match current {
            Some(existing) => {
                let level = existing
                    .get("access_level")
                    .and_then(|l| l.as_u64())
                    .and_then(|l| AccessLevel::from_gitlab(l as u8));
                if level == Some(member.access_level) {
                    return Ok(SettingsOutcome::Skipped);
                }
                let mut body = json!({ "access_level": member.access_level.as_gitlab() });
                if let Some(ref expires) = member.expires_at {
                    body["expires_at"] = json!(expires);
                }
                self.put_json(auth, &member_path, body, "member update")
                    .await?;
                Ok(SettingsOutcome::Updated)
            }
            None => {
                let mut body = json!({
                    "user_id": user_id,
                    "access_level": member.access_level.as_gitlab(),
                });
                if let Some(ref expires) = member.expires_at {
                    body["expires_at"] = json!(expires);
                }
                self.post_json(
                    auth,
                    &format!("{}/members", target.base_path()),
                    body,
                    true,
                    "member add",
                )
                .await?;
                Ok(SettingsOutcome::Created)
            }
        }
    }

    async fn forward(
        &self,
        auth: &Auth,
        method: Method,
        path_and_query: &str,
        body: Option<Value>,
        long_call: bool,
    ) -> Result<UpstreamResponse, ApiError> {
        let opts = CallOpts {
            // The proxy cannot know whether an arbitrary POST is safe.
            idempotent: method != Method::POST,
            long_call,
        };
        self.upstream
            .call(auth, method, path_and_query, body.as_ref(), opts)
            .await
    }
}
