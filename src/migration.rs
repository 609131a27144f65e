use crate::config::Settings;
use crate::errors::ApiError;
use crate::models::{
    ItemAction, JobItem, JobKind, JobState, LogLevel, MigrationParams, SvnInfo, SvnLayout,
};
use crate::registry::{JobParams, JobRegistry};
use crate::session::SessionStore;
use crate::upstream::{GitLabApi, NewProject};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::{sleep, timeout};

const ANCHOR_FILE: &str = ".gitfleet-anchor.json";
const AUTHORS_FILE: &str = "authors.txt";
const REPO_DIR: &str = "repo";

/// Stages run strictly in this order; each completes before the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStage {
    Validate,
    ExtractAuthors,
    Provision,
    Clone,
    RewritePush,
    Verify,
    Cleanup,
}

const STAGE_ORDER: [MigrationStage; 7] = [
    MigrationStage::Validate,
    MigrationStage::ExtractAuthors,
    MigrationStage::Provision,
    MigrationStage::Clone,
    MigrationStage::RewritePush,
    MigrationStage::Verify,
    MigrationStage::Cleanup,
];

/// Resume anchor persisted inside the workspace so a later sync can pick up
/// after a crash, not just within one process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevisionAnchor {
    revision: u64,
    stage: MigrationStage,
    svn_url: String,
    updated_at: DateTime<Utc>,
}

/// Gate a paused job waits on until the client supplies missing authors.
struct AuthorGate {
    notify: Notify,
    supplied: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationPreview {
    pub target_full_path: String,
    pub trunk: String,
    pub branches: Option<String>,
    pub tags: Option<String>,
    pub head_revision: u64,
    pub authors_known: Vec<String>,
    pub authors_missing: Vec<String>,
}

struct RunCtx {
    job_id: String,
    session_id: String,
    cancel: Arc<AtomicBool>,
    params: MigrationParams,
    resume: bool,
    workspace: PathBuf,
    target_full_path: String,
    head_revision: u64,
    current_revision: u64,
}

impl RunCtx {
    fn repo_dir(&self) -> PathBuf {
        self.workspace.join(REPO_DIR)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Runs SVN-to-Git migrations in a dedicated pool, separate from the bulk
/// workers. A single migration is internally single-threaded; the git-svn
/// bridge state is not reentrant.
pub struct MigrationEngine {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionStore>,
    api: Arc<dyn GitLabApi>,
    pool: Arc<Semaphore>,
    workspace_root: PathBuf,
    deadline: Duration,
    log_ring: usize,
    gates: Mutex<HashMap<String, Arc<AuthorGate>>>,
    /// target project full path -> preserved workspace of a failed or kept run.
    preserved: Mutex<HashMap<String, PathBuf>>,
}

impl MigrationEngine {
    pub fn new(
        settings: &Settings,
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionStore>,
        api: Arc<dyn GitLabApi>,
    ) -> Self {
        MigrationEngine {
            registry,
            sessions,
            api,
            pool: Arc::new(Semaphore::new(settings.pools.migration_workers.max(1))),
            workspace_root: settings.workspace_root(),
            deadline: Duration::from_secs(settings.jobs.migration_deadline_secs),
            log_ring: settings.migration.log_ring.max(16),
            gates: Mutex::new(HashMap::new()),
            preserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(
        self: &Arc<Self>,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        params: MigrationParams,
        resume: bool,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(job_id, session_id, cancel, params, resume).await;
        });
    }

    /// A bulk migration is a parent job whose items are independent child
    /// migration jobs, each with its own topic.
    pub fn spawn_bulk(
        self: &Arc<Self>,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        migrations: Vec<MigrationParams>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .run_bulk(job_id, session_id, cancel, migrations)
                .await;
        });
    }

    async fn run_bulk(
        &self,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        migrations: Vec<MigrationParams>,
    ) {
        self.registry.mark_running(&job_id).await;

        let mut children = Vec::new();
        for params in migrations {
            let source = params.project_path.clone();
            let (child_id, child_cancel) = self
                .registry
                .create(
                    JobKind::SvnMigration,
                    &session_id,
                    0,
                    Some(JobParams::Migration(Box::new(params.clone()))),
                )
                .await;
            children.push((source, child_id, child_cancel, params));
        }

        for (source, child_id, child_cancel, params) in children {
            if cancel.load(Ordering::Relaxed) {
                let _ = self.registry.cancel(&child_id).await;
                self.registry
                    .record_item(&job_id, JobItem::cancelled(source), None)
                    .await;
                continue;
            }
            let state = self
                .run_one(
                    child_id.clone(),
                    session_id.clone(),
                    child_cancel,
                    params,
                    false,
                )
                .await;
            let item = match state {
                JobState::Succeeded => JobItem::ok(source.clone(), ItemAction::Created, None),
                JobState::Cancelled => JobItem::cancelled(source.clone()),
                _ => JobItem::failed(
                    source.clone(),
                    "migration-failed",
                    format!("child job {} ended {:?}", child_id, state),
                    1,
                ),
            };
            self.registry
                .record_item(&job_id, item, Some(source))
                .await;
        }
        self.registry.finish(&job_id, None).await;
    }

    async fn run(
        &self,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        params: MigrationParams,
        resume: bool,
    ) {
        let _ = self
            .run_one(job_id, session_id, cancel, params, resume)
            .await;
    }

    /// Drive one migration job to a terminal state and return it.
    async fn run_one(
        &self,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        params: MigrationParams,
        resume: bool,
    ) -> JobState {
        let permit = match self.pool.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return JobState::Failed,
        };

        if cancel.load(Ordering::Relaxed) {
            drop(permit);
            return self.registry.get(&job_id).await.map(|j| j.state).unwrap_or(JobState::Cancelled);
        }
        self.registry.mark_running(&job_id).await;

        let mut ctx = RunCtx {
            job_id: job_id.clone(),
            session_id,
            cancel,
            params,
            resume,
            workspace: PathBuf::new(),
            target_full_path: String::new(),
            head_revision: 0,
            current_revision: 0,
        };

        let outcome = match timeout(self.deadline, self.run_stages(&mut ctx)).await {
            Ok(result) => result,
            Err(_) => {
                ctx.cancel.store(true, Ordering::Relaxed);
                Err(ApiError::Deadline)
            }
        };

        drop(permit);
        self.gates.lock().await.remove(&job_id);

        match outcome {
            Ok(()) => {
                self.registry.finish(&job_id, None).await;
            }
            Err(e) => {
                // Failed and cancelled runs keep their workspace so a later
                // sync can resume from the last anchored revision.
                if !ctx.workspace.as_os_str().is_empty() && ctx.workspace.exists() {
                    self.preserve(&ctx).await;
                }
                let err = if matches!(e, ApiError::Cancelled) {
                    None
                } else {
                    Some(e)
                };
                self.registry.finish(&job_id, err).await;
            }
        }
        self.registry
            .get(&job_id)
            .await
            .map(|j| j.state)
            .unwrap_or(JobState::Failed)
    }

    async fn run_stages(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        preflight_tools().await?;

        // Work out where the project will land; needed for workspace reuse.
        ctx.target_full_path = self.resolve_target_path(ctx).await?;

        let mut start_stage = MigrationStage::Validate;
        if ctx.resume {
            if let Some((dir, anchor)) = self.recover_workspace(ctx).await {
                ctx.workspace = dir;
                ctx.current_revision = anchor.revision;
                start_stage = anchor.stage;
                self.log(ctx, LogLevel::Info, format!(
                    "resuming at stage {:?} from revision {}",
                    start_stage, anchor.revision
                ))
                .await;
            } else {
                self.log(
                    ctx,
                    LogLevel::Warn,
                    "workspace missing or corrupt; restarting from the beginning".to_string(),
                )
                .await;
            }
        }
        if ctx.workspace.as_os_str().is_empty() {
            ctx.workspace = create_workspace(&self.workspace_root)?;
            ctx.current_revision = 0;
            start_stage = MigrationStage::Validate;
        }

        for stage in STAGE_ORDER {
            // Validate always runs: it primes the svn auth cache the bridge
            // relies on and refreshes the head revision for progress totals.
            if stage != MigrationStage::Validate && stage < start_stage {
                continue;
            }
            if ctx.cancelled() {
                return Err(ApiError::Cancelled);
            }
            self.log(ctx, LogLevel::Info, format!("stage {:?} started", stage))
                .await;
            self.write_anchor(ctx, stage);

            match stage {
                MigrationStage::Validate => self.stage_validate(ctx).await?,
                MigrationStage::ExtractAuthors => self.stage_authors(ctx).await?,
                MigrationStage::Provision => self.stage_provision(ctx).await?,
                MigrationStage::Clone => self.stage_clone(ctx).await?,
                MigrationStage::RewritePush => self.stage_rewrite_push(ctx).await?,
                MigrationStage::Verify => self.stage_verify(ctx).await?,
                MigrationStage::Cleanup => self.stage_cleanup(ctx).await?,
            }
        }
        Ok(())
    }

    async fn resolve_target_path(&self, ctx: &RunCtx) -> Result<String, ApiError> {
        let session = self
            .sessions
            .get(&ctx.session_id)
            .await
            .ok_or_else(|| ApiError::BadCredentials("session expired or revoked".into()))?;
        match ctx.params.target_namespace_id {
            Some(id) => {
                let api = self.api.clone();
                let group = self
                    .sessions
                    .with_token(&ctx.session_id, move |auth| async move {
                        api.group_by_id(&auth, id).await
                    })
                    .await?;
                Ok(format!("{}/{}", group.full_path, ctx.params.project_path))
            }
            None => Ok(format!(
                "{}/{}",
                session.user.username, ctx.params.project_path
            )),
        }
    }

    async fn recover_workspace(&self, ctx: &RunCtx) -> Option<(PathBuf, RevisionAnchor)> {
        let dir = {
            let preserved = self.preserved.lock().await;
            preserved.get(&ctx.target_full_path).cloned()
        }?;
        let anchor: RevisionAnchor =
            serde_json::from_str(&std::fs::read_to_string(dir.join(ANCHOR_FILE)).ok()?).ok()?;
        if anchor.svn_url != ctx.params.svn_url {
            return None;
        }
        // The bridge metadata must have survived for a fetch to make sense.
        if !dir.join(REPO_DIR).join(".git").exists()
            && anchor.stage > MigrationStage::Provision
        {
            return None;
        }
        Some((dir, anchor))
    }

    async fn preserve(&self, ctx: &RunCtx) {
        self.write_anchor_revision(ctx);
        let mut preserved = self.preserved.lock().await;
        preserved.insert(ctx.target_full_path.clone(), ctx.workspace.clone());
        log::info!(
            "migration_workspace_preserved job_id={} path={}",
            ctx.job_id,
            ctx.workspace.display()
        );
    }

    fn write_anchor(&self, ctx: &RunCtx, stage: MigrationStage) {
        let anchor = RevisionAnchor {
            revision: ctx.current_revision,
            stage,
            svn_url: ctx.params.svn_url.clone(),
            updated_at: Utc::now(),
        };
        if let Ok(body) = serde_json::to_string_pretty(&anchor) {
            let _ = std::fs::write(ctx.workspace.join(ANCHOR_FILE), body);
        }
    }

    fn write_anchor_revision(&self, ctx: &RunCtx) {
        let path = ctx.workspace.join(ANCHOR_FILE);
        let stage = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<RevisionAnchor>(&s).ok())
            .map(|a| a.stage)
            .unwrap_or(MigrationStage::Clone);
        self.write_anchor(ctx, stage);
    }

    async fn log(&self, ctx: &RunCtx, level: LogLevel, message: String) {
        self.registry.log(&ctx.job_id, level, message).await;
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn stage_validate(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        let info = svn_info(
            &ctx.params.svn_url,
            ctx.params.username.as_deref(),
            ctx.params.password.as_deref(),
        )
        .await?;
        ctx.head_revision = info.revision;
        self.registry
            .set_progress(
                &ctx.job_id,
                ctx.current_revision as usize,
                info.revision as usize,
                None,
            )
            .await;

        // Probe the layout so a bad trunk path fails here, not mid-clone.
        let trunk = match &ctx.params.layout {
            SvnLayout::Standard => "trunk".to_string(),
            SvnLayout::Custom { trunk, .. } => trunk.clone(),
        };
        let probe_url = format!("{}/{}", ctx.params.svn_url.trim_end_matches('/'), trunk);
        let output = svn_command(
            &["ls", "--depth", "empty", &probe_url],
            ctx.params.username.as_deref(),
            ctx.params.password.as_deref(),
            false,
        )
        .await?;
        if !output.status_success {
            return Err(ApiError::SvnLayout(format!(
                "trunk path {} not readable: {}",
                trunk, output.stderr_tail
            )));
        }
        Ok(())
    }

    async fn stage_authors(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        let authors_path = ctx.workspace.join(AUTHORS_FILE);
        if ctx.resume && authors_path.exists() && ctx.params.authors.is_empty() {
            return Ok(()); // kept from the previous run
        }

        let committers = svn_extract_users(
            &ctx.params.svn_url,
            ctx.params.username.as_deref(),
            ctx.params.password.as_deref(),
        )
        .await?;

        let mut missing: Vec<String> = committers
            .iter()
            .filter(|c| !ctx.params.authors.contains_key(*c))
            .cloned()
            .collect();
        missing.sort();

        if !missing.is_empty() {
            let gate = Arc::new(AuthorGate {
                notify: Notify::new(),
                supplied: Mutex::new(HashMap::new()),
            });
            self.gates
                .lock()
                .await
                .insert(ctx.job_id.clone(), gate.clone());

            self.registry.needs_authors(&ctx.job_id, missing.clone()).await;
            self.registry.mark_paused(&ctx.job_id).await;
            self.log(
                ctx,
                LogLevel::Warn,
                format!("waiting for {} author mappings", missing.len()),
            )
            .await;

            loop {
                if ctx.cancelled() {
                    return Err(ApiError::Cancelled);
                }
                {
                    let supplied = gate.supplied.lock().await;
                    for (user, ident) in supplied.iter() {
                        ctx.params.authors.insert(user.clone(), ident.clone());
                    }
                }
                missing.retain(|c| !ctx.params.authors.contains_key(c));
                if missing.is_empty() {
                    break;
                }
                let _ = timeout(Duration::from_millis(500), gate.notify.notified()).await;
            }
            self.registry.mark_running(&ctx.job_id).await;
        }

        let mut lines: Vec<String> = committers
            .iter()
            .filter_map(|c| {
                ctx.params
                    .authors
                    .get(c)
                    .map(|ident| format!("{} = {}", c, ident))
            })
            .collect();
        lines.sort();
        std::fs::write(&authors_path, lines.join("\n") + "\n")?;
        Ok(())
    }

    async fn stage_provision(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        let api = self.api.clone();
        let params = ctx.params.clone();
        let full_path = ctx.target_full_path.clone();
        let resume = ctx.resume;

        let project = self
            .sessions
            .with_token(&ctx.session_id, move |auth| async move {
                let new_project = NewProject {
                    name: params.project_name.clone(),
                    path: params.project_path.clone(),
                    namespace_id: params.target_namespace_id,
                    description: None,
                    visibility: None,
                    default_branch: None,
                    initialize_with_readme: false,
                };
                match api.create_project(&auth, &new_project).await {
                    Ok(p) => Ok(p),
                    Err(ApiError::Conflict(msg)) => {
                        if resume {
                            // Reuse the project provisioned by the failed run.
                            api.find_project(&auth, &full_path).await?.ok_or_else(|| {
                                ApiError::Conflict(format!(
                                    "project {} exists but is not visible",
                                    full_path
                                ))
                            })
                        } else {
                            Err(ApiError::Conflict(msg))
                        }
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        self.log(
            ctx,
            LogLevel::Info,
            format!("provisioned project {} (id {})", project.path_with_namespace, project.id),
        )
        .await;
        Ok(())
    }

    async fn stage_clone(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        let repo = ctx.repo_dir();
        let fresh = !repo.join(".git").exists();

        if fresh {
            std::fs::create_dir_all(&repo)?;
            let mut init = vec![
                "svn".to_string(),
                "init".to_string(),
                ctx.params.svn_url.clone(),
                "--prefix=origin/".to_string(),
            ];
            match &ctx.params.layout {
                SvnLayout::Standard => init.push("--stdlayout".to_string()),
                SvnLayout::Custom {
                    trunk,
                    branches,
                    tags,
                } => {
                    init.push(format!("--trunk={}", trunk));
                    if let Some(b) = branches {
                        init.push(format!("--branches={}", b));
                    }
                    if let Some(t) = tags {
                        init.push(format!("--tags={}", t));
                    }
                }
            }
            if let Some(ref user) = ctx.params.username {
                init.push(format!("--username={}", user));
            }
            let output = git_in(&repo, &init, &ctx.cancel, |_| {}).await?;
            if !output.status_success {
                return Err(ApiError::SvnUnavailable(format!(
                    "git svn init failed: {}",
                    output.stderr_tail
                )));
            }

            let authors = ctx.workspace.join(AUTHORS_FILE);
            if authors.exists() {
                let set = git_in(
                    &repo,
                    &[
                        "config".to_string(),
                        "svn.authorsfile".to_string(),
                        authors.display().to_string(),
                    ],
                    &ctx.cancel,
                    |_| {},
                )
                .await?;
                if !set.status_success {
                    return Err(ApiError::Internal(format!(
                        "git config failed: {}",
                        set.stderr_tail
                    )));
                }
            }
        }

        // Initial clone and resume fetch are the same operation; git-svn
        // continues from its own metadata.
        let revision_re = Regex::new(r"^r(\d+) = ").expect("static regex");
        let registry = self.registry.clone();
        let job_id = ctx.job_id.clone();
        let head = ctx.head_revision as usize;
        let last_seen = Arc::new(AtomicU64::new(ctx.current_revision));
        let anchor_path = ctx.workspace.join(ANCHOR_FILE);
        let svn_url = ctx.params.svn_url.clone();

        let keep = self.log_ring;
        let output = git_in_capped(&repo, &["svn".to_string(), "fetch".to_string()], &ctx.cancel, keep, {
            let last_seen = last_seen.clone();
            move |line| {
                if let Some(caps) = revision_re.captures(line) {
                    if let Ok(rev) = caps[1].parse::<u64>() {
                        last_seen.store(rev, Ordering::Relaxed);
                        let registry = registry.clone();
                        let job_id = job_id.clone();
                        // Progress at every revision boundary.
                        tokio::spawn(async move {
                            registry
                                .set_progress(&job_id, rev as usize, head, Some(format!("r{}", rev)))
                                .await;
                        });
                        // Refresh the on-disk anchor occasionally so a crash
                        // mid-fetch still leaves a usable resume point.
                        if rev % 100 == 0 {
                            let anchor = RevisionAnchor {
                                revision: rev,
                                stage: MigrationStage::Clone,
                                svn_url: svn_url.clone(),
                                updated_at: Utc::now(),
                            };
                            if let Ok(body) = serde_json::to_string_pretty(&anchor) {
                                let _ = std::fs::write(&anchor_path, body);
                            }
                        }
                    }
                }
            }
        })
        .await?;

        ctx.current_revision = last_seen
            .load(Ordering::Relaxed)
            .max(parse_last_fetched(&repo).await.unwrap_or(0));

        if output.cancelled {
            return Err(ApiError::Cancelled);
        }
        if !output.status_success {
            let tail = output.stderr_tail.to_lowercase();
            return Err(if tail.contains("authentication") || tail.contains("authorization") {
                ApiError::SvnAuth
            } else {
                ApiError::SvnUnavailable(format!("git svn fetch failed: {}", output.stderr_tail))
            });
        }

        self.registry
            .set_progress(
                &ctx.job_id,
                ctx.head_revision as usize,
                ctx.head_revision as usize,
                None,
            )
            .await;
        ctx.current_revision = ctx.head_revision;
        Ok(())
    }

    async fn stage_rewrite_push(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        let repo = ctx.repo_dir();

        let refs = git_in(
            &repo,
            &[
                "for-each-ref".to_string(),
                "--format=%(refname)".to_string(),
                "refs/remotes/origin".to_string(),
            ],
            &ctx.cancel,
            |_| {},
        )
        .await?;
        if !refs.status_success {
            return Err(ApiError::Internal(format!(
                "ref enumeration failed: {}",
                refs.stderr_tail
            )));
        }

        let include = compile_patterns(&ctx.params.options.branch_include);
        let exclude = compile_patterns(&ctx.params.options.branch_exclude);

        for line in refs.stdout_lines {
            let refname = line.trim();
            let Some(short) = refname.strip_prefix("refs/remotes/origin/") else {
                continue;
            };
            if ctx.cancelled() {
                return Err(ApiError::Cancelled);
            }

            let (args, label): (Vec<String>, String) = if short == "trunk" {
                (
                    vec![
                        "branch".to_string(),
                        "--force".to_string(),
                        "main".to_string(),
                        refname.to_string(),
                    ],
                    "main".to_string(),
                )
            } else if let Some(tag) = short.strip_prefix("tags/") {
                if !pattern_allows(tag, &include, &exclude) {
                    continue;
                }
                (
                    vec![
                        "tag".to_string(),
                        "--force".to_string(),
                        tag.to_string(),
                        refname.to_string(),
                    ],
                    format!("tags/{}", tag),
                )
            } else {
                if !pattern_allows(short, &include, &exclude) {
                    continue;
                }
                (
                    vec![
                        "branch".to_string(),
                        "--force".to_string(),
                        short.to_string(),
                        refname.to_string(),
                    ],
                    short.to_string(),
                )
            };

            let out = git_in(&repo, &args, &ctx.cancel, |_| {}).await?;
            if !out.status_success {
                return Err(ApiError::Internal(format!(
                    "ref rewrite for {} failed: {}",
                    label, out.stderr_tail
                )));
            }
        }

        // Push with the token spliced into the URL for this one call; the
        // remote is never stored in the workspace config.
        let full_path = ctx.target_full_path.clone();
        let cancel = ctx.cancel.clone();
        let repo_for_push = repo.clone();
        let output = self
            .sessions
            .with_token(&ctx.session_id, move |auth| async move {
                let push_url = push_url_with_token(&auth.base_url, &auth.token, &full_path);
                git_in(
                    &repo_for_push,
                    &[
                        "push".to_string(),
                        "--mirror".to_string(),
                        push_url,
                    ],
                    &cancel,
                    |_| {},
                )
                .await
            })
            .await?;

        if output.cancelled {
            return Err(ApiError::Cancelled);
        }
        if !output.status_success {
            return Err(ApiError::UpstreamUnavailable(format!(
                "push failed: {}",
                redact(&output.stderr_tail)
            )));
        }
        self.log(ctx, LogLevel::Info, "mirror push complete".to_string())
            .await;
        Ok(())
    }

    async fn stage_verify(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        let repo = ctx.repo_dir();

        let local = git_in(
            &repo,
            &[
                "for-each-ref".to_string(),
                "--format=%(refname)".to_string(),
                "refs/heads".to_string(),
                "refs/tags".to_string(),
            ],
            &ctx.cancel,
            |_| {},
        )
        .await?;
        let local_refs: HashSet<String> = local
            .stdout_lines
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let head = git_in(
            &repo,
            &["rev-parse".to_string(), "main".to_string()],
            &ctx.cancel,
            |_| {},
        )
        .await?;
        let local_head = head
            .stdout_lines
            .first()
            .map(|l| l.trim().to_string())
            .unwrap_or_default();

        let full_path = ctx.target_full_path.clone();
        let cancel = ctx.cancel.clone();
        let repo_for_ls = repo.clone();
        let remote = self
            .sessions
            .with_token(&ctx.session_id, move |auth| async move {
                let url = push_url_with_token(&auth.base_url, &auth.token, &full_path);
                git_in(
                    &repo_for_ls,
                    &["ls-remote".to_string(), url],
                    &cancel,
                    |_| {},
                )
                .await
            })
            .await?;
        if !remote.status_success {
            return Err(ApiError::UpstreamUnavailable(format!(
                "ls-remote failed: {}",
                redact(&remote.stderr_tail)
            )));
        }

        let mut remote_refs = HashSet::new();
        let mut remote_head = String::new();
        for line in &remote.stdout_lines {
            let mut parts = line.split_whitespace();
            let (Some(sha), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            if name == "HEAD" {
                remote_head = sha.to_string();
            } else if name.starts_with("refs/heads/") || name.starts_with("refs/tags/") {
                remote_refs.insert(name.to_string());
            }
        }

        if remote_refs.len() != local_refs.len() {
            return Err(ApiError::MigrationMismatch(format!(
                "ref count differs: local {} vs remote {}",
                local_refs.len(),
                remote_refs.len()
            )));
        }
        if !local_head.is_empty() && !remote_head.is_empty() && local_head != remote_head {
            return Err(ApiError::MigrationMismatch(format!(
                "HEAD differs: local {} vs remote {}",
                local_head, remote_head
            )));
        }
        Ok(())
    }

    async fn stage_cleanup(&self, ctx: &mut RunCtx) -> Result<(), ApiError> {
        if ctx.params.options.keep_temp {
            self.preserve(ctx).await;
            return Ok(());
        }
        std::fs::remove_dir_all(&ctx.workspace)?;
        self.preserved.lock().await.remove(&ctx.target_full_path);
        self.log(ctx, LogLevel::Info, "workspace removed".to_string())
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handler-facing helpers
    // ------------------------------------------------------------------

    /// Merge author mappings into a job paused on `needs-authors`.
    pub async fn supply_authors(
        &self,
        job_id: &str,
        authors: HashMap<String, String>,
    ) -> Result<(), ApiError> {
        let gates = self.gates.lock().await;
        let gate = gates
            .get(job_id)
            .ok_or_else(|| ApiError::Conflict(format!("job {} is not waiting for authors", job_id)))?;
        {
            let mut supplied = gate.supplied.lock().await;
            supplied.extend(authors);
        }
        gate.notify.notify_waiters();
        Ok(())
    }

    /// Dry-run: probe the repository and report what a migration would do.
    pub async fn preview(
        &self,
        session_id: &str,
        params: &MigrationParams,
    ) -> Result<MigrationPreview, ApiError> {
        preflight_tools().await?;

        let info = svn_info(
            &params.svn_url,
            params.username.as_deref(),
            params.password.as_deref(),
        )
        .await?;
        let committers = svn_extract_users(
            &params.svn_url,
            params.username.as_deref(),
            params.password.as_deref(),
        )
        .await?;

        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| ApiError::BadCredentials("session expired or revoked".into()))?;
        let target_full_path = match params.target_namespace_id {
            Some(id) => {
                let api = self.api.clone();
                let group = self
                    .sessions
                    .with_token(session_id, move |auth| async move {
                        api.group_by_id(&auth, id).await
                    })
                    .await?;
                format!("{}/{}", group.full_path, params.project_path)
            }
            None => format!("{}/{}", session.user.username, params.project_path),
        };

        let (trunk, branches, tags) = match &params.layout {
            SvnLayout::Standard => (
                "trunk".to_string(),
                Some("branches".to_string()),
                Some("tags".to_string()),
            ),
            SvnLayout::Custom {
                trunk,
                branches,
                tags,
            } => (trunk.clone(), branches.clone(), tags.clone()),
        };

        let mut known = Vec::new();
        let mut missing = Vec::new();
        for c in committers {
            if params.authors.contains_key(&c) {
                known.push(c);
            } else {
                missing.push(c);
            }
        }
        known.sort();
        missing.sort();

        Ok(MigrationPreview {
            target_full_path,
            trunk,
            branches,
            tags,
            head_revision: info.revision,
            authors_known: known,
            authors_missing: missing,
        })
    }

    pub async fn preserved_count(&self) -> usize {
        self.preserved.lock().await.len()
    }
}

// ============================================================================
// Subprocess plumbing
// ============================================================================

struct BridgeOutput {
    status_success: bool,
    cancelled: bool,
    stdout_lines: Vec<String>,
    stderr_tail: String,
}

/// Both bridge tools must be on PATH before any stage runs.
async fn preflight_tools() -> Result<(), ApiError> {
    for tool in ["svn", "git"] {
        let spawned = Command::new(tool)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match spawned {
            Ok(status) if status.success() => {}
            Ok(_) => return Err(ApiError::ToolMissing(tool.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiError::ToolMissing(tool.to_string()))
            }
            Err(e) => return Err(ApiError::Internal(e.to_string())),
        }
    }
    Ok(())
}

fn create_workspace(root: &Path) -> Result<PathBuf, ApiError> {
    std::fs::create_dir_all(root)?;
    let dir = tempfile::Builder::new()
        .prefix("gitfleet-mig-")
        .tempdir_in(root)
        .map_err(|e| ApiError::Internal(format!("workspace create: {}", e)))?
        .into_path();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

/// Run a subprocess with piped output, observing the cancellation flag.
/// Stdout lines stream through `on_line`; only the last `keep_lines` are
/// retained (a full git-svn fetch emits one line per revision), and stderr
/// keeps a bounded tail for error reporting.
async fn run_bridge(
    mut cmd: Command,
    cancel: &AtomicBool,
    keep_lines: usize,
    mut on_line: impl FnMut(&str),
) -> Result<BridgeOutput, ApiError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::ToolMissing("bridge executable".to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        ApiError::Internal("bridge stdout not captured".to_string())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        ApiError::Internal("bridge stderr not captured".to_string())
    })?;

    let stderr_task = tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() >= 40 {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    });

    let mut stdout_lines: VecDeque<String> = VecDeque::new();
    let mut reader = BufReader::new(stdout).lines();
    let mut was_cancelled = false;

    loop {
        tokio::select! {
            line = reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        if stdout_lines.len() >= keep_lines {
                            stdout_lines.pop_front();
                        }
                        stdout_lines.push_back(line);
                        // Steady output would starve the timer branch, so the
                        // flag is checked at the revision boundary too.
                        if cancel.load(Ordering::Relaxed) {
                            let _ = child.start_kill();
                            was_cancelled = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            _ = sleep(Duration::from_millis(500)) => {
                if cancel.load(Ordering::Relaxed) {
                    // Signal the bridge and wait for it to exit.
                    let _ = child.start_kill();
                    was_cancelled = true;
                    break;
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let stderr_tail = stderr_task.await.unwrap_or_default();

    Ok(BridgeOutput {
        status_success: status.success() && !was_cancelled,
        cancelled: was_cancelled,
        stdout_lines: stdout_lines.into_iter().collect(),
        stderr_tail,
    })
}

const KEEP_ALL_LINES: usize = usize::MAX;

async fn git_in_capped(
    repo: &Path,
    args: &[String],
    cancel: &Arc<AtomicBool>,
    keep_lines: usize,
    on_line: impl FnMut(&str),
) -> Result<BridgeOutput, ApiError> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo);
    run_bridge(cmd, cancel, keep_lines, on_line).await
}

async fn git_in(
    repo: &Path,
    args: &[String],
    cancel: &Arc<AtomicBool>,
    on_line: impl FnMut(&str),
) -> Result<BridgeOutput, ApiError> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo);
    run_bridge(cmd, cancel, KEEP_ALL_LINES, on_line).await
}

struct SvnOutput {
    status_success: bool,
    stdout: String,
    stderr_tail: String,
}

async fn svn_command(
    args: &[&str],
    username: Option<&str>,
    password: Option<&str>,
    no_cache: bool,
) -> Result<SvnOutput, ApiError> {
    let mut cmd = Command::new("svn");
    cmd.args(args).arg("--non-interactive");
    if no_cache {
        cmd.arg("--no-auth-cache");
    }
    if let Some(user) = username {
        cmd.arg("--username").arg(user);
    }
    if let Some(pass) = password {
        cmd.arg("--password").arg(pass);
    }

    let never = AtomicBool::new(false);
    let output = run_bridge(cmd, &never, KEEP_ALL_LINES, |_| {})
        .await
        .map_err(|e| match e {
        ApiError::ToolMissing(_) => ApiError::ToolMissing("svn".to_string()),
        other => other,
    })?;

    Ok(SvnOutput {
        status_success: output.status_success,
        stdout: output.stdout_lines.join("\n"),
        stderr_tail: output.stderr_tail,
    })
}

fn classify_svn_failure(stderr: &str) -> ApiError {
    let lower = stderr.to_lowercase();
    if lower.contains("e170001")
        || lower.contains("authentication failed")
        || lower.contains("authorization failed")
    {
        ApiError::SvnAuth
    } else {
        ApiError::SvnUnavailable(stderr.trim().to_string())
    }
}

/// `svn info --xml` against a remote URL. Also primes the svn auth cache so
/// the git-svn bridge can reuse the credentials.
pub async fn svn_info(
    url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<SvnInfo, ApiError> {
    let output = svn_command(&["info", "--xml", url], username, password, false).await?;
    if !output.status_success {
        return Err(classify_svn_failure(&output.stderr_tail));
    }

    let root_re = Regex::new(r"<root>([^<]+)</root>").expect("static regex");
    let uuid_re = Regex::new(r"<uuid>([^<]+)</uuid>").expect("static regex");
    let rev_re = Regex::new(r#"<entry[^>]*revision="(\d+)""#).expect("static regex");

    let repository_root = root_re
        .captures(&output.stdout)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ApiError::SvnUnavailable("svn info output had no root".into()))?;
    let repository_uuid = uuid_re
        .captures(&output.stdout)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    let revision = rev_re
        .captures(&output.stdout)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);

    Ok(SvnInfo {
        repository_root,
        repository_uuid,
        revision,
    })
}

/// Unique committer usernames from `svn log --xml --quiet`.
pub async fn svn_extract_users(
    url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<Vec<String>, ApiError> {
    let output = svn_command(&["log", "--xml", "--quiet", url], username, password, false).await?;
    if !output.status_success {
        return Err(classify_svn_failure(&output.stderr_tail));
    }

    let author_re = Regex::new(r"<author>([^<]+)</author>").expect("static regex");
    let mut seen = HashSet::new();
    let mut users = Vec::new();
    for caps in author_re.captures_iter(&output.stdout) {
        let author = caps[1].to_string();
        if seen.insert(author.clone()) {
            users.push(author);
        }
    }
    users.sort();
    Ok(users)
}

/// Highest revision git-svn has recorded locally.
async fn parse_last_fetched(repo: &Path) -> Option<u64> {
    let never = Arc::new(AtomicBool::new(false));
    let out = git_in(
        repo,
        &[
            "svn".to_string(),
            "info".to_string(),
        ],
        &never,
        |_| {},
    )
    .await
    .ok()?;
    let re = Regex::new(r"(?m)^Revision: (\d+)").ok()?;
    re.captures(&out.stdout_lines.join("\n"))
        .and_then(|c| c[1].parse().ok())
}

fn push_url_with_token(base_url: &str, token: &str, full_path: &str) -> String {
    let stripped = base_url
        .trim_end_matches('/')
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let scheme = if base_url.starts_with("http://") {
        "http"
    } else {
        "https"
    };
    format!("{}://oauth2:{}@{}/{}.git", scheme, token, stripped, full_path)
}

/// Strip credentials that a failing git command may echo back in its URL.
fn redact(message: &str) -> String {
    let re = Regex::new(r"//[^/@\s]+@").expect("static regex");
    re.replace_all(message, "//<redacted>@").to_string()
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            let escaped = regex::escape(p).replace(r"\*", ".*");
            Regex::new(&format!("^{}$", escaped)).ok()
        })
        .collect()
}

fn pattern_allows(name: &str, include: &[Regex], exclude: &[Regex]) -> bool {
    if !include.is_empty() && !include.iter().any(|re| re.is_match(name)) {
        return false;
    }
    !exclude.iter().any(|re| re.is_match(name))
}
