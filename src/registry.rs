use crate::config::JobConfig;
use crate::errors::ApiError;
use crate::models::{
    BulkPlan, BusEvent, ErrorInfo, ItemAction, Job, JobItem, JobKind, JobState, LogLevel,
    MigrationParams,
};
use crate::progress::ProgressBus;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Kind-specific parameters kept alongside the job, never serialized to
/// clients (migration params carry SVN credentials).
#[derive(Debug, Clone)]
pub enum JobParams {
    Bulk(BulkPlan),
    Migration(Box<MigrationParams>),
    BulkMigration(Vec<MigrationParams>),
}

struct JobRecord {
    job: Job,
    cancel: Arc<AtomicBool>,
    params: Option<JobParams>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    /// Session -> job ids. Kept outside the job so revocation stays O(1)
    /// and jobs never back-reference their session.
    by_session: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub state: Option<JobState>,
}

/// Sole mutator of job state. Engines report through `record_item` and
/// `finish`; every mutation that matters to clients is mirrored onto the
/// progress bus under the job's topic.
pub struct JobRegistry {
    inner: RwLock<Inner>,
    bus: Arc<ProgressBus>,
    job_grace: ChronoDuration,
    result_ring: usize,
}

pub fn topic_for(job_id: &str) -> String {
    format!("job:{}", job_id)
}

impl JobRegistry {
    pub fn new(config: &JobConfig, bus: Arc<ProgressBus>) -> Self {
        JobRegistry {
            inner: RwLock::new(Inner::default()),
            bus,
            job_grace: ChronoDuration::seconds(config.job_grace_secs as i64),
            result_ring: config.result_ring.max(1),
        }
    }

    /// Allocate a pending job. The returned flag is the job's cancellation
    /// signal; engines observe it at every suspension point.
    pub async fn create(
        &self,
        kind: JobKind,
        session_id: &str,
        total: usize,
        params: Option<JobParams>,
    ) -> (String, Arc<AtomicBool>) {
        let mut job = Job::new(kind, session_id.to_string());
        job.total = total;
        let id = job.id.clone();
        let cancel = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner.write().await;
        inner
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .push(id.clone());
        inner.jobs.insert(
            id.clone(),
            JobRecord {
                job,
                cancel: cancel.clone(),
                params,
            },
        );
        log::info!(
            "job_created job_id={} kind={:?} total={} session_id={}",
            id,
            kind,
            total,
            session_id
        );
        (id, cancel)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let inner = self.inner.read().await;
        inner.jobs.get(job_id).map(|r| r.job.clone())
    }

    pub async fn params(&self, job_id: &str) -> Option<JobParams> {
        let inner = self.inner.read().await;
        inner.jobs.get(job_id).and_then(|r| r.params.clone())
    }

    pub async fn cancel_flag(&self, job_id: &str) -> Option<Arc<AtomicBool>> {
        let inner = self.inner.read().await;
        inner.jobs.get(job_id).map(|r| r.cancel.clone())
    }

    pub async fn list(&self, session_id: &str, filter: &JobFilter) -> Vec<Job> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.jobs.get(id))
                    .map(|r| r.job.clone())
                    .filter(|j| filter.kind.map_or(true, |k| j.kind == k))
                    .filter(|j| filter.state.map_or(true, |s| j.state == s))
                    .collect()
            })
            .unwrap_or_default();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Raise the cancellation signal. Pending jobs terminal-state
    /// immediately; running jobs transition to `cancelling` and settle when
    /// their engine observes the flag.
    pub async fn cancel(&self, job_id: &str) -> Result<JobState, ApiError> {
        let event = {
            let mut inner = self.inner.write().await;
            let record = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;

            if record.job.state.is_terminal() {
                return Ok(record.job.state);
            }
            record.cancel.store(true, Ordering::Relaxed);

            if record.job.state == JobState::Pending {
                record.job.state = JobState::Cancelled;
                record.job.ended_at = Some(Utc::now());
                BusEvent::Terminal {
                    job_id: job_id.to_string(),
                    state: JobState::Cancelled,
                    summary: record.job.summary(),
                    ts: Utc::now(),
                }
            } else {
                record.job.state = JobState::Cancelling;
                BusEvent::State {
                    job_id: job_id.to_string(),
                    state: JobState::Cancelling,
                    ts: Utc::now(),
                }
            }
        };

        let topic = topic_for(job_id);
        let terminal = matches!(event, BusEvent::Terminal { .. });
        self.bus.publish(&topic, event).await;
        if terminal {
            self.bus.close(&topic).await;
        }
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(job_id).map(|r| r.job.state).unwrap_or(JobState::Cancelled))
    }

    pub async fn set_total(&self, job_id: &str, total: usize) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.jobs.get_mut(job_id) {
            if !record.job.state.is_terminal() {
                record.job.total = total;
            }
        }
    }

    async fn transition(&self, job_id: &str, state: JobState) {
        let changed = {
            let mut inner = self.inner.write().await;
            match inner.jobs.get_mut(job_id) {
                Some(record) if !record.job.state.is_terminal() => {
                    if state == JobState::Running && record.job.started_at.is_none() {
                        record.job.started_at = Some(Utc::now());
                    }
                    record.job.state = state;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.bus
                .publish(
                    &topic_for(job_id),
                    BusEvent::State {
                        job_id: job_id.to_string(),
                        state,
                        ts: Utc::now(),
                    },
                )
                .await;
        }
    }

    pub async fn mark_running(&self, job_id: &str) {
        self.transition(job_id, JobState::Running).await;
    }

    pub async fn mark_paused(&self, job_id: &str) {
        self.transition(job_id, JobState::Paused).await;
    }

    /// Record one finished item: counters update atomically with the result
    /// ring, then a progress event goes out on the job's topic.
    pub async fn record_item(&self, job_id: &str, item: JobItem, current: Option<String>) {
        let progress = {
            let mut inner = self.inner.write().await;
            let record = match inner.jobs.get_mut(job_id) {
                Some(r) if !r.job.state.is_terminal() => r,
                _ => return,
            };
            match item.action {
                ItemAction::Created
                | ItemAction::Updated
                | ItemAction::SkippedExisting
                | ItemAction::Deleted => record.job.completed += 1,
                ItemAction::Failed => record.job.failed += 1,
                ItemAction::Cancelled => record.job.cancelled += 1,
            }
            if record.job.items.len() >= self.result_ring {
                record.job.items.pop_front();
                record.job.items_dropped += 1;
            }
            record.job.items.push_back(item);
            BusEvent::Progress {
                job_id: job_id.to_string(),
                completed: record.job.completed,
                failed: record.job.failed,
                total: record.job.total,
                current_item: current,
                ts: Utc::now(),
            }
        };
        self.bus.publish(&topic_for(job_id), progress).await;
    }

    /// Revision-style progress for migrations: sets the counters directly
    /// instead of accumulating per-item results.
    pub async fn set_progress(
        &self,
        job_id: &str,
        completed: usize,
        total: usize,
        current: Option<String>,
    ) {
        let progress = {
            let mut inner = self.inner.write().await;
            let record = match inner.jobs.get_mut(job_id) {
                Some(r) if !r.job.state.is_terminal() => r,
                _ => return,
            };
            record.job.total = total.max(completed);
            record.job.completed = completed;
            BusEvent::Progress {
                job_id: job_id.to_string(),
                completed,
                failed: record.job.failed,
                total: record.job.total,
                current_item: current,
                ts: Utc::now(),
            }
        };
        self.bus.publish(&topic_for(job_id), progress).await;
    }

    pub async fn log(&self, job_id: &str, level: LogLevel, message: String) {
        self.bus
            .publish(
                &topic_for(job_id),
                BusEvent::Log {
                    job_id: job_id.to_string(),
                    level,
                    message,
                    ts: Utc::now(),
                },
            )
            .await;
    }

    pub async fn needs_authors(&self, job_id: &str, missing: Vec<String>) {
        self.bus
            .publish(
                &topic_for(job_id),
                BusEvent::NeedsAuthors {
                    job_id: job_id.to_string(),
                    missing,
                    ts: Utc::now(),
                },
            )
            .await;
    }

    /// Settle a job into its terminal state. An explicit error wins; the
    /// cancellation flag turns into `cancelled`; otherwise the item counters
    /// decide between `succeeded` and `failed`.
    pub async fn finish(&self, job_id: &str, error: Option<ApiError>) {
        let (state, summary) = {
            let mut inner = self.inner.write().await;
            let record = match inner.jobs.get_mut(job_id) {
                Some(r) if !r.job.state.is_terminal() => r,
                _ => return,
            };

            // An explicit non-cancel error (e.g. a blown job deadline) wins
            // over the cancellation flag it may itself have raised.
            let state = if matches!(error, Some(ApiError::Cancelled)) {
                JobState::Cancelled
            } else if let Some(ref e) = error {
                record.job.error = Some(ErrorInfo {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                JobState::Failed
            } else if record.cancel.load(Ordering::Relaxed) {
                JobState::Cancelled
            } else if record.job.failed > 0 {
                record.job.error = Some(ErrorInfo {
                    kind: "items-failed".to_string(),
                    message: format!("{} of {} items failed", record.job.failed, record.job.total),
                });
                JobState::Failed
            } else {
                JobState::Succeeded
            };

            record.job.state = state;
            record.job.ended_at = Some(Utc::now());
            (state, record.job.summary())
        };

        log::info!(
            "job_finished job_id={} state={:?} completed={} failed={} cancelled={}",
            job_id,
            state,
            summary.completed,
            summary.failed,
            summary.cancelled
        );
        let topic = topic_for(job_id);
        self.bus
            .publish(
                &topic,
                BusEvent::State {
                    job_id: job_id.to_string(),
                    state,
                    ts: Utc::now(),
                },
            )
            .await;
        self.bus
            .publish(
                &topic,
                BusEvent::Terminal {
                    job_id: job_id.to_string(),
                    state,
                    summary,
                    ts: Utc::now(),
                },
            )
            .await;
        self.bus.close(&topic).await;
    }

    /// Shutdown path: raise cancel on everything still live.
    pub async fn cancel_all(&self) -> usize {
        let inner = self.inner.read().await;
        let mut signalled = 0;
        for record in inner.jobs.values() {
            if !record.job.state.is_terminal() {
                record.cancel.store(true, Ordering::Relaxed);
                signalled += 1;
            }
        }
        signalled
    }

    pub async fn active_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .jobs
            .values()
            .filter(|r| !r.job.state.is_terminal())
            .count()
    }

    /// Drop terminal jobs past the grace period, and their session index
    /// entries with them.
    pub async fn reap(&self) -> usize {
        let now = Utc::now();
        let grace = self.job_grace;
        let mut inner = self.inner.write().await;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, r| match (r.job.state.is_terminal(), r.job.ended_at) {
            (true, Some(ended)) => now - ended < grace,
            _ => true,
        });
        let reaped = before - inner.jobs.len();
        if reaped > 0 {
            let live: Vec<String> = inner.jobs.keys().cloned().collect();
            inner.by_session.retain(|_, ids| {
                ids.retain(|id| live.contains(id));
                !ids.is_empty()
            });
            log::info!("job_reap reaped={} remaining={}", reaped, inner.jobs.len());
        }
        reaped
    }
}
