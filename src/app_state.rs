use crate::bulk::BulkEngine;
use crate::config::Settings;
use crate::migration::MigrationEngine;
use crate::progress::ProgressBus;
use crate::rate_limit::RateLimiter;
use crate::registry::JobRegistry;
use crate::session::SessionStore;
use crate::upstream::GitLabApi;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub limiter: Arc<RateLimiter>,
    pub api: Arc<dyn GitLabApi>,
    pub sessions: Arc<SessionStore>,
    pub bus: Arc<ProgressBus>,
    pub registry: Arc<JobRegistry>,
    pub bulk: Arc<BulkEngine>,
    pub migrations: Arc<MigrationEngine>,
}
