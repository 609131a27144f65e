use crate::config::Settings;
use crate::errors::ApiError;
use crate::models::{
    BulkPlan, ErrorPolicy, GroupNode, ItemAction, JobItem, MemberItem, ProjectNode, ResourceRef,
    SettingsPatch, Visibility,
};
use crate::registry::JobRegistry;
use crate::session::SessionStore;
use crate::upstream::{DeleteOutcome, GitLabApi, NewGroup, NewProject, SettingsOutcome};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

/// One schedulable unit of a bulk plan.
#[derive(Debug, Clone)]
struct BulkTask {
    index: usize,
    depth: usize,
    /// Natural key / human identifier; doubles as the job item source.
    source: String,
    attempts: u32,
    /// Natural path of the group whose id must be known first, if any.
    parent_key: Option<String>,
    op: TaskOp,
}

#[derive(Debug, Clone)]
enum TaskOp {
    CreateGroup {
        name: String,
        path: String,
        description: Option<String>,
        visibility: Option<Visibility>,
    },
    CreateProject {
        node: ProjectNode,
    },
    ApplySettings {
        target: ResourceRef,
        patch: SettingsPatch,
    },
    Delete {
        target: ResourceRef,
    },
    Member {
        item: MemberItem,
    },
}

/// Scheduler state shared by the workers of one job.
struct RunState {
    ready: VecDeque<BulkTask>,
    /// parent natural path -> tasks waiting for that group's id.
    blocked: HashMap<String, Vec<BulkTask>>,
    resolved: HashMap<String, u64>,
    in_flight: usize,
    /// Tripped by stop-on-first-error.
    stop: bool,
}

impl RunState {
    fn blocked_is_empty(&self) -> bool {
        self.blocked.values().all(|v| v.is_empty())
    }

    fn drain_remaining(&mut self) -> Vec<BulkTask> {
        let mut drained: Vec<BulkTask> = self.ready.drain(..).collect();
        for (_, tasks) in self.blocked.iter_mut() {
            drained.append(tasks);
        }
        drained.sort_by_key(|t| t.index);
        drained
    }
}

/// Executes bulk plans against the upstream with bounded concurrency,
/// natural-key upsert semantics, and per-item reporting through the
/// registry.
pub struct BulkEngine {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionStore>,
    api: Arc<dyn GitLabApi>,
    workers: usize,
    api_delay: Duration,
    deadline: Duration,
    max_attempts: u32,
}

impl BulkEngine {
    pub fn new(
        settings: &Settings,
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionStore>,
        api: Arc<dyn GitLabApi>,
    ) -> Self {
        BulkEngine {
            registry,
            sessions,
            api,
            workers: settings.pools.bulk_workers.max(1),
            api_delay: Duration::from_millis(settings.upstream.api_delay_ms),
            deadline: Duration::from_secs(settings.jobs.bulk_deadline_secs),
            max_attempts: settings.upstream.max_retries.max(1),
        }
    }

    /// Hand a validated plan to the engine; returns immediately.
    pub fn spawn(
        self: &Arc<Self>,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        plan: BulkPlan,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(job_id, session_id, cancel, plan).await;
        });
    }

    async fn run(
        &self,
        job_id: String,
        session_id: String,
        cancel: Arc<AtomicBool>,
        plan: BulkPlan,
    ) {
        if cancel.load(Ordering::Relaxed) {
            return; // cancelled while pending; registry already settled it
        }
        self.registry.mark_running(&job_id).await;

        let policy = plan.error_policy();
        let (tasks, resolved) = match self.prepare(&session_id, plan).await {
            Ok(prepared) => prepared,
            Err(e) => {
                log::warn!("bulk_prepare_failed job_id={} error={}", job_id, e);
                self.registry.finish(&job_id, Some(e)).await;
                return;
            }
        };
        self.registry.set_total(&job_id, tasks.len()).await;

        let mut state = RunState {
            ready: VecDeque::new(),
            blocked: HashMap::new(),
            resolved,
            in_flight: 0,
            stop: false,
        };
        for task in tasks {
            match &task.parent_key {
                Some(key) if !state.resolved.contains_key(key) => {
                    state.blocked.entry(key.clone()).or_default().push(task);
                }
                _ => state.ready.push_back(task),
            }
        }

        let state = Arc::new(Mutex::new(state));
        let notify = Arc::new(Notify::new());

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let ctx = WorkerCtx {
                job_id: job_id.clone(),
                session_id: session_id.clone(),
                cancel: cancel.clone(),
                state: state.clone(),
                notify: notify.clone(),
                policy,
            };
            workers.spawn(worker_loop(
                ctx,
                self.registry.clone(),
                self.sessions.clone(),
                self.api.clone(),
                self.api_delay,
                self.max_attempts,
            ));
        }

        let drained = timeout(self.deadline, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => self.registry.finish(&job_id, None).await,
            Err(_) => {
                // Deadline blown: stop the workers cooperatively, then hard.
                cancel.store(true, Ordering::Relaxed);
                notify.notify_waiters();
                let _ = timeout(Duration::from_secs(5), async {
                    while workers.join_next().await.is_some() {}
                })
                .await;
                workers.abort_all();
                self.registry.finish(&job_id, Some(ApiError::Deadline)).await;
            }
        }
    }

    /// Flatten the plan into tasks and seed the resolved-parent map. For
    /// import plans rooted at an existing group this costs one upstream
    /// lookup to learn the root's natural path.
    async fn prepare(
        &self,
        session_id: &str,
        plan: BulkPlan,
    ) -> Result<(Vec<BulkTask>, HashMap<String, u64>), ApiError> {
        let mut tasks = Vec::new();
        let mut resolved = HashMap::new();

        match plan {
            BulkPlan::Import(import) => {
                let root_prefix = match import.parent_id {
                    Some(id) => {
                        let api = self.api.clone();
                        let root = self
                            .sessions
                            .with_token(session_id, move |auth| async move {
                                api.group_by_id(&auth, id).await
                            })
                            .await?;
                        resolved.insert(root.full_path.clone(), root.id);
                        Some(root.full_path)
                    }
                    None => None,
                };
                let mut index = 0;
                for node in &import.tree {
                    flatten_group(node, root_prefix.as_deref(), 0, &mut index, &mut tasks);
                }
            }
            BulkPlan::Settings(settings) => {
                for (index, item) in settings.items.into_iter().enumerate() {
                    tasks.push(BulkTask {
                        index,
                        depth: 0,
                        source: item.target.describe(),
                        attempts: 0,
                        parent_key: None,
                        op: TaskOp::ApplySettings {
                            target: item.target,
                            patch: item.patch,
                        },
                    });
                }
            }
            BulkPlan::Delete(delete) => {
                for (index, target) in delete.items.into_iter().enumerate() {
                    tasks.push(BulkTask {
                        index,
                        depth: 0,
                        source: target.describe(),
                        attempts: 0,
                        parent_key: None,
                        op: TaskOp::Delete { target },
                    });
                }
            }
            BulkPlan::Members(members) => {
                for (index, item) in members.items.into_iter().enumerate() {
                    tasks.push(BulkTask {
                        index,
                        depth: 0,
                        source: format!("{}:{}", item.target.describe(), item.user),
                        attempts: 0,
                        parent_key: None,
                        op: TaskOp::Member { item },
                    });
                }
            }
        }

        // Parents first, submission order within a level.
        tasks.sort_by_key(|t| (t.depth, t.index));
        Ok((tasks, resolved))
    }
}

fn flatten_group(
    node: &GroupNode,
    parent_path: Option<&str>,
    depth: usize,
    index: &mut usize,
    out: &mut Vec<BulkTask>,
) {
    let full_path = match parent_path {
        Some(prefix) => format!("{}/{}", prefix, node.path),
        None => node.path.clone(),
    };

    out.push(BulkTask {
        index: *index,
        depth,
        source: full_path.clone(),
        attempts: 0,
        parent_key: parent_path.map(|p| p.to_string()),
        op: TaskOp::CreateGroup {
            name: node.name.clone(),
            path: node.path.clone(),
            description: node.description.clone(),
            visibility: node.visibility,
        },
    });
    *index += 1;

    for project in &node.projects {
        out.push(BulkTask {
            index: *index,
            depth: depth + 1,
            source: format!("{}/{}", full_path, project.path),
            attempts: 0,
            parent_key: Some(full_path.clone()),
            op: TaskOp::CreateProject {
                node: project.clone(),
            },
        });
        *index += 1;
    }

    for sub in &node.subgroups {
        flatten_group(sub, Some(&full_path), depth + 1, index, out);
    }
}

struct WorkerCtx {
    job_id: String,
    session_id: String,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<RunState>>,
    notify: Arc<Notify>,
    policy: ErrorPolicy,
}

enum Step {
    Run(BulkTask, Option<u64>),
    /// Remaining tasks swept out of the scheduler, reported as cancelled.
    DrainCancelled(Vec<BulkTask>),
    /// Tasks whose parent can no longer be resolved by anyone.
    DrainOrphans(Vec<BulkTask>),
    Wait,
    Done,
}

async fn worker_loop(
    ctx: WorkerCtx,
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionStore>,
    api: Arc<dyn GitLabApi>,
    api_delay: Duration,
    max_attempts: u32,
) {
    loop {
        // Cancellation and stop are observed here, between items.
        let step = {
            let mut st = ctx.state.lock().await;

            if ctx.cancel.load(Ordering::Relaxed) || st.stop {
                let drained = st.drain_remaining();
                if drained.is_empty() {
                    if st.in_flight == 0 {
                        Step::Done
                    } else {
                        // Someone else's item is still settling; wait it out.
                        Step::Wait
                    }
                } else {
                    Step::DrainCancelled(drained)
                }
            } else {
                match st.ready.pop_front() {
                    Some(task) => {
                        st.in_flight += 1;
                        let parent_id = task
                            .parent_key
                            .as_ref()
                            .and_then(|k| st.resolved.get(k))
                            .copied();
                        Step::Run(task, parent_id)
                    }
                    None if st.in_flight == 0 && st.blocked_is_empty() => Step::Done,
                    None if st.in_flight == 0 => {
                        // Nothing queued and nothing running: these blocked
                        // tasks can never have their parent resolved.
                        Step::DrainOrphans(st.drain_remaining())
                    }
                    None => Step::Wait,
                }
            }
        };

        match step {
            Step::Done => break,
            Step::Wait => {
                // Woken on completions; the timeout guards lost wakeups.
                let _ = timeout(Duration::from_millis(100), ctx.notify.notified()).await;
            }
            Step::DrainCancelled(tasks) => {
                for task in tasks {
                    registry
                        .record_item(&ctx.job_id, JobItem::cancelled(task.source), None)
                        .await;
                }
            }
            Step::DrainOrphans(tasks) => {
                for task in tasks {
                    let parent = task.parent_key.clone().unwrap_or_default();
                    registry
                        .record_item(
                            &ctx.job_id,
                            JobItem::failed(
                                task.source,
                                "parent-missing",
                                format!("parent {} was not created", parent),
                                0,
                            ),
                            None,
                        )
                        .await;
                }
            }
            Step::Run(task, parent_id) => {
                let outcome = execute_task(&ctx, &sessions, &api, &task, parent_id).await;
                settle_task(&ctx, &registry, task, outcome, max_attempts).await;
                ctx.notify.notify_waiters();

                // Courtesy pause between successive calls; the token bucket
                // still governs the hard rate.
                if !api_delay.is_zero() {
                    sleep(api_delay).await;
                }
            }
        }
    }
    ctx.notify.notify_waiters();
}

async fn execute_task(
    ctx: &WorkerCtx,
    sessions: &Arc<SessionStore>,
    api: &Arc<dyn GitLabApi>,
    task: &BulkTask,
    parent_id: Option<u64>,
) -> Result<(ItemAction, Option<u64>), ApiError> {
    let api = api.clone();
    let op = task.op.clone();
    let source = task.source.clone();

    sessions
        .with_token(&ctx.session_id, move |auth| async move {
            match op {
                TaskOp::CreateGroup {
                    name,
                    path,
                    description,
                    visibility,
                } => {
                    // Natural-key upsert: lookup first, create on miss.
                    if let Some(existing) = api.find_group(&auth, &source).await? {
                        return Ok((ItemAction::SkippedExisting, Some(existing.id)));
                    }
                    let group = NewGroup {
                        name,
                        path,
                        parent_id,
                        description,
                        visibility,
                    };
                    match api.create_group(&auth, &group).await {
                        Ok(created) => Ok((ItemAction::Created, Some(created.id))),
                        // Lost the race to an identical create; treat as existing.
                        Err(ApiError::Conflict(_)) => match api.find_group(&auth, &source).await? {
                            Some(existing) => Ok((ItemAction::SkippedExisting, Some(existing.id))),
                            None => Err(ApiError::Conflict(format!(
                                "group {} conflicted but is not visible",
                                source
                            ))),
                        },
                        Err(e) => Err(e),
                    }
                }
                TaskOp::CreateProject { node } => {
                    if let Some(existing) = api.find_project(&auth, &source).await? {
                        return Ok((ItemAction::SkippedExisting, Some(existing.id)));
                    }
                    let project = NewProject {
                        name: node.name,
                        path: node.path,
                        namespace_id: parent_id,
                        description: node.description,
                        visibility: node.visibility,
                        default_branch: node.default_branch,
                        initialize_with_readme: node.initialize_with_readme,
                    };
                    match api.create_project(&auth, &project).await {
                        Ok(created) => Ok((ItemAction::Created, Some(created.id))),
                        Err(ApiError::Conflict(_)) => {
                            match api.find_project(&auth, &source).await? {
                                Some(existing) => {
                                    Ok((ItemAction::SkippedExisting, Some(existing.id)))
                                }
                                None => Err(ApiError::Conflict(format!(
                                    "project {} conflicted but is not visible",
                                    source
                                ))),
                            }
                        }
                        Err(e) => Err(e),
                    }
                }
                TaskOp::ApplySettings { target, patch } => {
                    let resolved = api.resolve_target(&auth, &target).await?;
                    let outcome = api.apply_settings(&auth, resolved, &patch).await?;
                    Ok((settings_action(outcome), Some(resolved.id)))
                }
                TaskOp::Delete { target } => {
                    let resolved = match api.resolve_target(&auth, &target).await {
                        Ok(r) => r,
                        // Nothing to delete; idempotent success.
                        Err(ApiError::NotFound(_)) => {
                            return Ok((ItemAction::SkippedExisting, None))
                        }
                        Err(e) => return Err(e),
                    };
                    match api.delete_resource(&auth, resolved).await? {
                        DeleteOutcome::Deleted => Ok((ItemAction::Deleted, Some(resolved.id))),
                        DeleteOutcome::AlreadyGone => {
                            Ok((ItemAction::SkippedExisting, Some(resolved.id)))
                        }
                    }
                }
                TaskOp::Member { item } => {
                    let resolved = api.resolve_target(&auth, &item.target).await?;
                    let outcome = api.upsert_member(&auth, resolved, &item).await?;
                    Ok((settings_action(outcome), Some(resolved.id)))
                }
            }
        })
        .await
}

fn settings_action(outcome: SettingsOutcome) -> ItemAction {
    match outcome {
        SettingsOutcome::Created => ItemAction::Created,
        SettingsOutcome::Updated => ItemAction::Updated,
        SettingsOutcome::Skipped => ItemAction::SkippedExisting,
    }
}

async fn settle_task(
    ctx: &WorkerCtx,
    registry: &Arc<JobRegistry>,
    mut task: BulkTask,
    outcome: Result<(ItemAction, Option<u64>), ApiError>,
    max_attempts: u32,
) {
    match outcome {
        Ok((action, resource_id)) => {
            let is_group = matches!(task.op, TaskOp::CreateGroup { .. });
            {
                let mut st = ctx.state.lock().await;
                st.in_flight -= 1;
                if is_group {
                    if let Some(id) = resource_id {
                        st.resolved.insert(task.source.clone(), id);
                    }
                    let unblocked = st.blocked.remove(&task.source).unwrap_or_default();
                    for child in unblocked {
                        st.ready.push_back(child);
                    }
                }
            }
            let mut item = JobItem::ok(task.source.clone(), action, resource_id);
            item.attempts = task.attempts + 1;
            registry
                .record_item(&ctx.job_id, item, Some(task.source))
                .await;
        }
        Err(e) if e.is_retryable() && task.attempts + 1 < max_attempts => {
            log::warn!(
                "bulk_item_retry job_id={} source={} attempt={} error={}",
                ctx.job_id,
                task.source,
                task.attempts + 1,
                e
            );
            let mut st = ctx.state.lock().await;
            st.in_flight -= 1;
            task.attempts += 1;
            st.ready.push_back(task);
        }
        Err(e) => {
            let attempts = task.attempts + 1;
            let is_group = matches!(task.op, TaskOp::CreateGroup { .. });

            // Fail descendants without touching the upstream, then honor the
            // error policy.
            let (descendants, stopped) = {
                let mut st = ctx.state.lock().await;
                st.in_flight -= 1;
                let mut descendants = Vec::new();
                if is_group {
                    collect_descendants(&mut st, &task.source, &mut descendants);
                }
                if ctx.policy == ErrorPolicy::StopOnFirstError {
                    st.stop = true;
                }
                (descendants, st.stop)
            };

            registry
                .record_item(
                    &ctx.job_id,
                    JobItem::failed(task.source.clone(), e.kind(), e.to_string(), attempts),
                    Some(task.source.clone()),
                )
                .await;
            for child in descendants {
                registry
                    .record_item(
                        &ctx.job_id,
                        JobItem::failed(
                            child.source,
                            "parent-missing",
                            format!("parent {} was not created", task.source),
                            0,
                        ),
                        None,
                    )
                    .await;
            }
            if stopped {
                log::warn!(
                    "bulk_stop_on_first_error job_id={} source={}",
                    ctx.job_id,
                    task.source
                );
            }
        }
    }
}

/// Pull every task transitively blocked on `key` out of the scheduler.
fn collect_descendants(st: &mut RunState, key: &str, out: &mut Vec<BulkTask>) {
    let children = st.blocked.remove(key).unwrap_or_default();
    for child in children {
        let child_key = child.source.clone();
        let is_group = matches!(child.op, TaskOp::CreateGroup { .. });
        out.push(child);
        if is_group {
            collect_descendants(st, &child_key, out);
        }
    }
}
