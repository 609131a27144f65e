use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

// ============================================================================
// Job lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    BulkImport,
    BulkSettings,
    BulkDelete,
    BulkMembers,
    SvnMigration,
    SvnSync,
    BulkSvnMigration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states are absorbing: no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Action recorded for a single item of a bulk plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemAction {
    Created,
    Updated,
    SkippedExisting,
    Deleted,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    /// Source identifier from the request (natural path, variable key, ...).
    pub source: String,
    pub action: ItemAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl JobItem {
    pub fn ok(source: impl Into<String>, action: ItemAction, resource_id: Option<u64>) -> Self {
        JobItem {
            source: source.into(),
            action,
            resource_id,
            error_kind: None,
            error: None,
            attempts: 1,
        }
    }

    pub fn failed(source: impl Into<String>, kind: &str, message: String, attempts: u32) -> Self {
        JobItem {
            source: source.into(),
            action: ItemAction::Failed,
            resource_id: None,
            error_kind: Some(kind.to_string()),
            error: Some(message),
            attempts,
        }
    }

    pub fn cancelled(source: impl Into<String>) -> Self {
        JobItem {
            source: source.into(),
            action: ItemAction::Cancelled,
            resource_id: None,
            error_kind: None,
            error: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

/// A tracked job. Kind-specific parameters live outside this document (they
/// may carry credentials); everything here is safe to serialize to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub session_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Bounded ring: oldest results roll off for very long jobs.
    pub items: VecDeque<JobItem>,
    pub items_dropped: u64,
}

impl Job {
    pub fn new(kind: JobKind, session_id: String) -> Self {
        Job {
            id: Uuid::new_v4().to_string(),
            kind,
            session_id,
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            error: None,
            items: VecDeque::new(),
            items_dropped: 0,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

// ============================================================================
// Bulk plans
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Internal,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Internal => "internal",
            Visibility::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    #[default]
    Continue,
    StopOnFirstError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPlan {
    #[serde(default)]
    pub parent_id: Option<u64>,
    pub tree: Vec<GroupNode>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupNode {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub subgroups: Vec<GroupNode>,
    #[serde(default)]
    pub projects: Vec<ProjectNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectNode {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub initialize_with_readme: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Group,
    Project,
}

/// Reference to an upstream resource by id or natural key (full path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_path: Option<String>,
}

impl ResourceRef {
    /// Human identifier used as the job item source.
    pub fn describe(&self) -> String {
        match (&self.full_path, self.id) {
            (Some(p), _) => p.clone(),
            (None, Some(id)) => format!("{:?}#{}", self.kind, id).to_lowercase(),
            (None, None) => "<unspecified>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl AccessLevel {
    /// Numeric level as the upstream REST API encodes it.
    pub fn as_gitlab(&self) -> u8 {
        match self {
            AccessLevel::Guest => 10,
            AccessLevel::Reporter => 20,
            AccessLevel::Developer => 30,
            AccessLevel::Maintainer => 40,
            AccessLevel::Owner => 50,
        }
    }

    pub fn from_gitlab(level: u8) -> Option<Self> {
        match level {
            10 => Some(AccessLevel::Guest),
            20 => Some(AccessLevel::Reporter),
            30 => Some(AccessLevel::Developer),
            40 => Some(AccessLevel::Maintainer),
            50 => Some(AccessLevel::Owner),
            _ => None,
        }
    }
}

/// One settings mutation. Tagged by `kind` so submission-time validation can
/// be exhaustive and later stages assume well-formed input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SettingsPatch {
    Visibility {
        visibility: Visibility,
    },
    ProtectedBranch {
        name: String,
        push_access_level: AccessLevel,
        merge_access_level: AccessLevel,
        #[serde(default)]
        allow_force_push: bool,
    },
    PushRules {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_message_regex: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name_regex: Option<String>,
        #[serde(default)]
        member_check: bool,
        #[serde(default)]
        prevent_secrets: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_file_size: Option<u64>,
    },
    Topics {
        topics: Vec<String>,
    },
    /// Generic project settings forwarded verbatim to the project PUT.
    Project {
        settings: serde_json::Map<String, serde_json::Value>,
    },
    CiVariable {
        key: String,
        value: String,
        #[serde(default)]
        protected: bool,
        #[serde(default)]
        masked: bool,
    },
}

impl SettingsPatch {
    pub fn scope(&self) -> &'static str {
        match self {
            SettingsPatch::Visibility { .. } => "visibility",
            SettingsPatch::ProtectedBranch { .. } => "protected-branches",
            SettingsPatch::PushRules { .. } => "push-rules",
            SettingsPatch::Topics { .. } => "topics",
            SettingsPatch::Project { .. } => "project",
            SettingsPatch::CiVariable { .. } => "ci-variables",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsItem {
    pub target: ResourceRef,
    pub patch: SettingsPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsPlan {
    pub items: Vec<SettingsItem>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePlan {
    pub items: Vec<ResourceRef>,
    /// Refused without explicit confirmation.
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberItem {
    pub target: ResourceRef,
    /// Username or email; resolved to a user id before the upsert.
    pub user: String,
    pub access_level: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersPlan {
    pub items: Vec<MemberItem>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// Union of bulk plan shapes, held by the registry for the job's lifetime.
#[derive(Debug, Clone)]
pub enum BulkPlan {
    Import(ImportPlan),
    Settings(SettingsPlan),
    Delete(DeletePlan),
    Members(MembersPlan),
}

impl BulkPlan {
    pub fn error_policy(&self) -> ErrorPolicy {
        match self {
            BulkPlan::Import(p) => p.error_policy,
            BulkPlan::Settings(p) => p.error_policy,
            BulkPlan::Delete(p) => p.error_policy,
            BulkPlan::Members(p) => p.error_policy,
        }
    }
}

// ============================================================================
// SVN migration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SvnLayout {
    Standard,
    Custom {
        trunk: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branches: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<String>,
    },
}

impl Default for SvnLayout {
    fn default() -> Self {
        SvnLayout::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationOptions {
    /// Fetch only new revisions on sync instead of a fresh clone.
    #[serde(default)]
    pub incremental: bool,
    /// Preserve the workspace after success.
    #[serde(default)]
    pub keep_temp: bool,
    #[serde(default)]
    pub branch_include: Vec<String>,
    #[serde(default)]
    pub branch_exclude: Vec<String>,
}

/// Parameters of a migration job. Credentials stay in process memory: the
/// whole struct is never serialized into job state or bus events, and the
/// password is kept out of `Debug`.
#[derive(Clone, Deserialize)]
pub struct MigrationParams {
    pub svn_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub target_namespace_id: Option<u64>,
    pub project_name: String,
    pub project_path: String,
    #[serde(default)]
    pub layout: SvnLayout,
    /// svn username -> "Display Name <email>"
    #[serde(default)]
    pub authors: HashMap<String, String>,
    #[serde(default)]
    pub options: MigrationOptions,
}

impl std::fmt::Debug for MigrationParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationParams")
            .field("svn_url", &self.svn_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("target_namespace_id", &self.target_namespace_id)
            .field("project_name", &self.project_name)
            .field("project_path", &self.project_path)
            .field("layout", &self.layout)
            .field("authors", &self.authors.len())
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkMigrationParams {
    pub migrations: Vec<MigrationParams>,
}

/// Result of `svn info` against a remote repository.
#[derive(Debug, Clone, Serialize)]
pub struct SvnInfo {
    #[serde(rename = "repositoryRoot")]
    pub repository_root: String,
    #[serde(rename = "repositoryUUID")]
    pub repository_uuid: String,
    pub revision: u64,
}

// ============================================================================
// Progress bus events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Events carried on the progress bus and relayed over the duplex channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusEvent {
    Progress {
        job_id: String,
        completed: usize,
        failed: usize,
        total: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_item: Option<String>,
        ts: DateTime<Utc>,
    },
    Log {
        job_id: String,
        level: LogLevel,
        message: String,
        ts: DateTime<Utc>,
    },
    State {
        job_id: String,
        state: JobState,
        ts: DateTime<Utc>,
    },
    NeedsAuthors {
        job_id: String,
        missing: Vec<String>,
        ts: DateTime<Utc>,
    },
    /// Emitted to one slow subscriber whose live queue overflowed.
    Lag {
        job_id: String,
        dropped: u64,
        ts: DateTime<Utc>,
    },
    /// Synthetic marker for events that rolled off the topic ring.
    Dropped {
        job_id: String,
        dropped: u64,
        ts: DateTime<Utc>,
    },
    Terminal {
        job_id: String,
        state: JobState,
        summary: JobSummary,
        ts: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn job_id(&self) -> &str {
        match self {
            BusEvent::Progress { job_id, .. }
            | BusEvent::Log { job_id, .. }
            | BusEvent::State { job_id, .. }
            | BusEvent::NeedsAuthors { job_id, .. }
            | BusEvent::Lag { job_id, .. }
            | BusEvent::Dropped { job_id, .. }
            | BusEvent::Terminal { job_id, .. } => job_id,
        }
    }
}

// ============================================================================
// Upstream profile
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
}

/// Path segment charset accepted for group/project paths, checked once at
/// submission so later stages assume well-formed input.
pub fn valid_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
