use crate::app_state::AppState;
use crate::errors::ApiError;
use crate::migration;
use crate::models::{
    BulkMigrationParams, BulkPlan, DeletePlan, GroupNode, ImportPlan, JobKind, JobState,
    MembersPlan, MigrationParams, ResourceKind, SettingsPlan, valid_path_segment,
};
use crate::registry::{JobFilter, JobParams};
use crate::session::SessionInfo;
use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

pub const SESSION_COOKIE: &str = "gitfleet_session";

/// Resolve the caller's session from the cookie, refresh its TTL, and apply
/// the coarse per-session request window. Handlers stay thin: they call this
/// first and map the error straight to a status code.
pub async fn require_session(
    req: &HttpRequest,
    state: &AppState,
) -> Result<SessionInfo, ApiError> {
    let cookie = req
        .cookie(SESSION_COOKIE)
        .ok_or_else(|| ApiError::BadCredentials("missing session cookie".into()))?;
    state.sessions.touch(cookie.value()).await
}

fn session_cookie(id: String) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, id)
        .path("/")
        .secure(true)
        .http_only(true)
        .same_site(SameSite::Strict)
        .finish()
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub base_url: String,
    pub token: String,
}

pub async fn login(
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let base_url = if body.base_url.is_empty() {
        state.settings.upstream.default_base_url.clone()
    } else {
        body.base_url
    };

    let (session_id, user) = state.sessions.create(base_url, body.token).await?;
    Ok(HttpResponse::Ok()
        .cookie(session_cookie(session_id))
        .json(json!({ "user": user })))
}

pub async fn logout(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if let Some(cookie) = req.cookie(SESSION_COOKIE) {
        state.sessions.revoke(cookie.value()).await;
    }
    let mut expired = session_cookie(String::new());
    expired.set_max_age(CookieDuration::ZERO);
    Ok(HttpResponse::NoContent().cookie(expired).finish())
}

pub async fn session_probe(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let info = match req.cookie(SESSION_COOKIE) {
        Some(cookie) => state.sessions.get(cookie.value()).await,
        None => None,
    };
    match info {
        Some(session) => Ok(HttpResponse::Ok().json(json!({
            "authenticated": true,
            "user": session.user,
            "base_url": session.base_url,
        }))),
        None => Ok(HttpResponse::Ok().json(json!({
            "authenticated": false,
            "user": Value::Null,
            "base_url": state.settings.upstream.default_base_url,
        }))),
    }
}

// ============================================================================
// GitLab proxy
// ============================================================================

/// `/api/gitlab/{tail}`: forward to the session's upstream with the held
/// token. Pagination headers come back verbatim; upstream 4xx passes
/// through; 5xx and 429 were already retried by the client underneath.
pub async fn proxy_gitlab(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| ApiError::Validation("unsupported method".into()))?;
    let tail = path.into_inner();
    let mut path_and_query = format!("/{}", tail);
    if let Some(query) = req.uri().query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let body_json: Option<Value> = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|e| ApiError::Validation(format!("request body is not JSON: {}", e)))?,
        )
    };

    // Repository archive downloads get the stretched deadline.
    let long_call = tail.contains("/archive");

    let api = state.api.clone();
    let upstream = state
        .sessions
        .with_token(&session.id, move |auth| async move {
            api.forward(&auth, method, &path_and_query, body_json, long_call)
                .await
        })
        .await?;

    let status =
        StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &upstream.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    Ok(builder
        .content_type("application/json")
        .body(upstream.body))
}

// ============================================================================
// Bulk operations
// ============================================================================

fn check_plan_size(state: &AppState, total: usize) -> Result<(), ApiError> {
    if total == 0 {
        return Err(ApiError::Validation("plan has no items".into()));
    }
    if total > state.settings.jobs.max_plan_items {
        return Err(ApiError::Validation(format!(
            "plan has {} items, limit is {}",
            total, state.settings.jobs.max_plan_items
        )));
    }
    Ok(())
}

fn validate_tree(nodes: &[GroupNode]) -> Result<usize, ApiError> {
    let mut count = 0;
    for node in nodes {
        if !valid_path_segment(&node.path) {
            return Err(ApiError::Validation(format!(
                "invalid group path segment: {:?}",
                node.path
            )));
        }
        if node.name.trim().is_empty() {
            return Err(ApiError::Validation(format!(
                "group {} has an empty name",
                node.path
            )));
        }
        count += 1;
        for project in &node.projects {
            if !valid_path_segment(&project.path) {
                return Err(ApiError::Validation(format!(
                    "invalid project path segment: {:?}",
                    project.path
                )));
            }
            count += 1;
        }
        count += validate_tree(&node.subgroups)?;
    }
    Ok(count)
}

async fn submit_bulk(
    state: &AppState,
    session: &SessionInfo,
    kind: JobKind,
    total: usize,
    plan: BulkPlan,
) -> HttpResponse {
    let (job_id, cancel) = state
        .registry
        .create(kind, &session.id, total, Some(JobParams::Bulk(plan.clone())))
        .await;
    state
        .bulk
        .spawn(job_id.clone(), session.id.clone(), cancel, plan);
    HttpResponse::Accepted().json(json!({ "jobId": job_id }))
}

pub async fn bulk_import(
    req: HttpRequest,
    body: web::Json<ImportPlan>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let plan = body.into_inner();

    let total = validate_tree(&plan.tree)?;
    check_plan_size(&state, total)?;

    Ok(submit_bulk(
        &state,
        &session,
        JobKind::BulkImport,
        total,
        BulkPlan::Import(plan),
    )
    .await)
}

pub async fn bulk_settings(
    req: HttpRequest,
    scope: web::Path<String>,
    body: web::Json<SettingsPlan>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let scope = scope.into_inner();
    let plan = body.into_inner();

    check_plan_size(&state, plan.items.len())?;
    for item in &plan.items {
        if item.patch.scope() != scope {
            return Err(ApiError::Validation(format!(
                "patch kind {} does not match scope {}",
                item.patch.scope(),
                scope
            )));
        }
        // Project-only patches cannot target groups.
        if item.target.kind == ResourceKind::Group
            && matches!(item.patch.scope(), "protected-branches" | "push-rules" | "topics" | "project")
        {
            return Err(ApiError::Validation(format!(
                "{} patches only apply to projects",
                item.patch.scope()
            )));
        }
        if item.target.id.is_none() && item.target.full_path.is_none() {
            return Err(ApiError::Validation(
                "settings target needs an id or a full_path".into(),
            ));
        }
    }

    Ok(submit_bulk(
        &state,
        &session,
        JobKind::BulkSettings,
        plan.items.len(),
        BulkPlan::Settings(plan),
    )
    .await)
}

pub async fn bulk_delete(
    req: HttpRequest,
    body: web::Json<DeletePlan>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let plan = body.into_inner();

    // Destructive; refuse without the explicit flag, before any job exists.
    if !plan.confirm {
        return Err(ApiError::Validation(
            "bulk delete requires confirm: true".into(),
        ));
    }
    check_plan_size(&state, plan.items.len())?;
    for target in &plan.items {
        if target.id.is_none() && target.full_path.is_none() {
            return Err(ApiError::Validation(
                "delete target needs an id or a full_path".into(),
            ));
        }
    }

    Ok(submit_bulk(
        &state,
        &session,
        JobKind::BulkDelete,
        plan.items.len(),
        BulkPlan::Delete(plan),
    )
    .await)
}

pub async fn bulk_members(
    req: HttpRequest,
    body: web::Json<MembersPlan>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let plan = body.into_inner();

    check_plan_size(&state, plan.items.len())?;
    for item in &plan.items {
        if item.user.trim().is_empty() {
            return Err(ApiError::Validation("member user must not be empty".into()));
        }
        if item.target.id.is_none() && item.target.full_path.is_none() {
            return Err(ApiError::Validation(
                "member target needs an id or a full_path".into(),
            ));
        }
    }

    Ok(submit_bulk(
        &state,
        &session,
        JobKind::BulkMembers,
        plan.items.len(),
        BulkPlan::Members(plan),
    )
    .await)
}

// ============================================================================
// SVN migration
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SvnProbeRequest {
    pub svn_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

pub async fn svn_connection_test(
    req: HttpRequest,
    body: web::Json<SvnProbeRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_session(&req, &state).await?;
    let probe = body.into_inner();
    let info = migration::svn_info(
        &probe.svn_url,
        probe.username.as_deref(),
        probe.password.as_deref(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(info))
}

pub async fn svn_users_extract(
    req: HttpRequest,
    body: web::Json<SvnProbeRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_session(&req, &state).await?;
    let probe = body.into_inner();
    let users = migration::svn_extract_users(
        &probe.svn_url,
        probe.username.as_deref(),
        probe.password.as_deref(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(json!({ "users": users })))
}

fn validate_migration(params: &MigrationParams) -> Result<(), ApiError> {
    if params.svn_url.trim().is_empty() {
        return Err(ApiError::Validation("svn_url is required".into()));
    }
    if !valid_path_segment(&params.project_path) {
        return Err(ApiError::Validation(format!(
            "invalid project path segment: {:?}",
            params.project_path
        )));
    }
    if params.project_name.trim().is_empty() {
        return Err(ApiError::Validation("project_name is required".into()));
    }
    Ok(())
}

pub async fn migration_preview(
    req: HttpRequest,
    body: web::Json<MigrationParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let params = body.into_inner();
    validate_migration(&params)?;
    let preview = state.migrations.preview(&session.id, &params).await?;
    Ok(HttpResponse::Ok().json(preview))
}

pub async fn migration_start(
    req: HttpRequest,
    body: web::Json<MigrationParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let params = body.into_inner();
    validate_migration(&params)?;

    let (job_id, cancel) = state
        .registry
        .create(
            JobKind::SvnMigration,
            &session.id,
            0,
            Some(JobParams::Migration(Box::new(params.clone()))),
        )
        .await;
    // `incremental` doubles as the reuse-existing-project flag on start.
    let resume = params.options.incremental;
    state.migrations.spawn(
        job_id.clone(),
        session.id.clone(),
        cancel,
        params,
        resume,
    );
    Ok(HttpResponse::Accepted().json(json!({ "jobId": job_id })))
}

pub async fn migration_bulk(
    req: HttpRequest,
    body: web::Json<BulkMigrationParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let params = body.into_inner();
    if params.migrations.is_empty() {
        return Err(ApiError::Validation("no migrations in request".into()));
    }
    for m in &params.migrations {
        validate_migration(m)?;
    }

    let total = params.migrations.len();
    let (job_id, cancel) = state
        .registry
        .create(
            JobKind::BulkSvnMigration,
            &session.id,
            total,
            Some(JobParams::BulkMigration(params.migrations.clone())),
        )
        .await;
    state.migrations.spawn_bulk(
        job_id.clone(),
        session.id.clone(),
        cancel,
        params.migrations,
    );
    Ok(HttpResponse::Accepted().json(json!({ "jobId": job_id })))
}

pub async fn migration_sync(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let prior_id = path.into_inner();

    let prior = state
        .registry
        .get(&prior_id)
        .await
        .filter(|j| j.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", prior_id)))?;
    if !matches!(prior.kind, JobKind::SvnMigration | JobKind::SvnSync) {
        return Err(ApiError::Validation(format!(
            "job {} is not a migration",
            prior_id
        )));
    }
    if !prior.state.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "job {} is still {:?}",
            prior_id, prior.state
        )));
    }
    let params = match state.registry.params(&prior_id).await {
        Some(JobParams::Migration(params)) => *params,
        _ => {
            return Err(ApiError::NotFound(format!(
                "parameters for job {} are gone",
                prior_id
            )))
        }
    };

    let (job_id, cancel) = state
        .registry
        .create(
            JobKind::SvnSync,
            &session.id,
            0,
            Some(JobParams::Migration(Box::new(params.clone()))),
        )
        .await;
    state
        .migrations
        .spawn(job_id.clone(), session.id.clone(), cancel, params, true);
    Ok(HttpResponse::Accepted().json(json!({ "jobId": job_id })))
}

pub async fn migration_cancel(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let job_id = path.into_inner();
    state
        .registry
        .get(&job_id)
        .await
        .filter(|j| j.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    state.registry.cancel(&job_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct AuthorsRequest {
    pub authors: HashMap<String, String>,
}

pub async fn migration_authors(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<AuthorsRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let job_id = path.into_inner();
    state
        .registry
        .get(&job_id)
        .await
        .filter(|j| j.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    state
        .migrations
        .supply_authors(&job_id, body.into_inner().authors)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub state: Option<JobState>,
}

pub async fn get_job(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let job_id = path.into_inner();
    let job = state
        .registry
        .get(&job_id)
        .await
        .filter(|j| j.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    Ok(HttpResponse::Ok().json(job))
}

pub async fn list_jobs(
    req: HttpRequest,
    query: web::Query<JobQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let filter = JobFilter {
        kind: query.kind,
        state: query.state,
    };
    let jobs = state.registry.list(&session.id, &filter).await;
    Ok(HttpResponse::Ok().json(jobs))
}

pub async fn cancel_job(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session = require_session(&req, &state).await?;
    let job_id = path.into_inner();
    state
        .registry
        .get(&job_id)
        .await
        .filter(|j| j.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    let observed = state.registry.cancel(&job_id).await?;
    Ok(HttpResponse::Accepted().json(json!({ "state": observed })))
}

// ============================================================================
// Health
// ============================================================================

pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "Gitfleet Server",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.count().await,
        "active_jobs": state.registry.active_count().await,
        "topics": state.bus.topic_count().await,
        "preserved_workspaces": state.migrations.preserved_count().await,
    })))
}
