use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use GitfleetServer::errors::ApiError;
use GitfleetServer::models::{
    JobState, MemberItem, SettingsPatch, UserProfile,
};
use GitfleetServer::registry::JobRegistry;
use GitfleetServer::upstream::{
    Auth, DeleteOutcome, GitLabApi, GroupRef, NewGroup, NewProject, ProjectRef, ResolvedTarget,
    SettingsOutcome, UpstreamResponse,
};

pub const GOOD_TOKEN: &str = "good-token";

/// In-memory stand-in for the upstream GitLab API. Records every call so
/// tests can assert on call order and absence.
pub struct MockGitLab {
    pub delay: Duration,
    pub state: Mutex<MockState>,
}

#[derive(Default)]
pub struct MockState {
    next_id: u64,
    pub groups: HashMap<String, u64>,
    pub projects: HashMap<String, u64>,
    pub visibility: HashMap<u64, String>,
    pub members: HashMap<(u64, String), u8>,
    pub calls: Vec<String>,
    /// natural path -> error kind to inject ("forbidden", "unavailable", "conflict")
    pub fail: HashMap<String, String>,
}

impl MockState {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn injected(&self, path: &str) -> Option<ApiError> {
        self.fail.get(path).map(|kind| match kind.as_str() {
            "forbidden" => ApiError::Forbidden(format!("injected for {}", path)),
            "unavailable" => ApiError::UpstreamUnavailable(format!("injected for {}", path)),
            "conflict" => ApiError::Conflict(format!("injected for {}", path)),
            other => ApiError::Internal(format!("unknown injection {}", other)),
        })
    }
}

impl MockGitLab {
    pub fn new() -> Self {
        MockGitLab {
            delay: Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        MockGitLab {
            delay,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_index(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn seed_project(&self, path: &str, visibility: &str) -> u64 {
        let mut st = self.state.lock().unwrap();
        let id = st.alloc();
        st.projects.insert(path.to_string(), id);
        st.visibility.insert(id, visibility.to_string());
        id
    }

    pub fn seed_member(&self, project_id: u64, user: &str, level: u8) {
        let mut st = self.state.lock().unwrap();
        st.members.insert((project_id, user.to_string()), level);
    }

    pub fn inject_failure(&self, path: &str, kind: &str) {
        let mut st = self.state.lock().unwrap();
        st.fail.insert(path.to_string(), kind.to_string());
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl GitLabApi for MockGitLab {
    async fn current_user(&self, auth: &Auth) -> Result<UserProfile, ApiError> {
        self.pause().await;
        if auth.token != GOOD_TOKEN {
            return Err(ApiError::BadCredentials("token validation failed".into()));
        }
        Ok(UserProfile {
            id: 1,
            username: "tester".to_string(),
            name: "Test User".to_string(),
            avatar_url: None,
            web_url: None,
        })
    }

    async fn find_group(
        &self,
        _auth: &Auth,
        full_path: &str,
    ) -> Result<Option<GroupRef>, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("find_group:{}", full_path));
        if let Some(err) = st.injected(full_path) {
            return Err(err);
        }
        Ok(st.groups.get(full_path).map(|&id| GroupRef {
            id,
            full_path: full_path.to_string(),
        }))
    }

    async fn group_by_id(&self, _auth: &Auth, id: u64) -> Result<GroupRef, ApiError> {
        self.pause().await;
        let st = self.state.lock().unwrap();
        st.groups
            .iter()
            .find(|(_, &gid)| gid == id)
            .map(|(path, &gid)| GroupRef {
                id: gid,
                full_path: path.clone(),
            })
            .ok_or_else(|| ApiError::NotFound(format!("group {}", id)))
    }

    async fn create_group(&self, _auth: &Auth, group: &NewGroup) -> Result<GroupRef, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        let full_path = match group.parent_id {
            Some(pid) => {
                let parent = st
                    .groups
                    .iter()
                    .find(|(_, &gid)| gid == pid)
                    .map(|(path, _)| path.clone())
                    .ok_or_else(|| ApiError::NotFound(format!("parent group {}", pid)))?;
                format!("{}/{}", parent, group.path)
            }
            None => group.path.clone(),
        };
        st.calls.push(format!("create_group:{}", full_path));
        if let Some(err) = st.injected(&full_path) {
            return Err(err);
        }
        if st.groups.contains_key(&full_path) {
            return Err(ApiError::Conflict(format!("group {} exists", full_path)));
        }
        let id = st.alloc();
        st.groups.insert(full_path.clone(), id);
        Ok(GroupRef { id, full_path })
    }

    async fn find_project(
        &self,
        _auth: &Auth,
        full_path: &str,
    ) -> Result<Option<ProjectRef>, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("find_project:{}", full_path));
        if let Some(err) = st.injected(full_path) {
            return Err(err);
        }
        Ok(st.projects.get(full_path).map(|&id| ProjectRef {
            id,
            path_with_namespace: full_path.to_string(),
            default_branch: None,
            web_url: None,
        }))
    }

    async fn create_project(
        &self,
        _auth: &Auth,
        project: &NewProject,
    ) -> Result<ProjectRef, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        let full_path = match project.namespace_id {
            Some(nid) => {
                let parent = st
                    .groups
                    .iter()
                    .find(|(_, &gid)| gid == nid)
                    .map(|(path, _)| path.clone())
                    .ok_or_else(|| ApiError::NotFound(format!("namespace {}", nid)))?;
                format!("{}/{}", parent, project.path)
            }
            None => format!("tester/{}", project.path),
        };
        st.calls.push(format!("create_project:{}", full_path));
        if let Some(err) = st.injected(&full_path) {
            return Err(err);
        }
        if st.projects.contains_key(&full_path) {
            return Err(ApiError::Conflict(format!("project {} exists", full_path)));
        }
        let id = st.alloc();
        st.projects.insert(full_path.clone(), id);
        Ok(ProjectRef {
            id,
            path_with_namespace: full_path,
            default_branch: None,
            web_url: None,
        })
    }

    async fn apply_settings(
        &self,
        _auth: &Auth,
        target: ResolvedTarget,
        patch: &SettingsPatch,
    ) -> Result<SettingsOutcome, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("apply_settings:{}", target.id));
        match patch {
            SettingsPatch::Visibility { visibility } => {
                let current = st
                    .visibility
                    .get(&target.id)
                    .cloned()
                    .unwrap_or_else(|| "private".to_string());
                if current == visibility.as_str() {
                    Ok(SettingsOutcome::Skipped)
                } else {
                    st.visibility
                        .insert(target.id, visibility.as_str().to_string());
                    Ok(SettingsOutcome::Updated)
                }
            }
            _ => Ok(SettingsOutcome::Updated),
        }
    }

    async fn delete_resource(
        &self,
        _auth: &Auth,
        target: ResolvedTarget,
    ) -> Result<DeleteOutcome, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("delete:{}", target.id));
        let path = st
            .projects
            .iter()
            .chain(st.groups.iter())
            .find(|(_, &id)| id == target.id)
            .map(|(path, _)| path.clone());
        match path {
            Some(path) => {
                st.projects.remove(&path);
                st.groups.remove(&path);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::AlreadyGone),
        }
    }

    async fn upsert_member(
        &self,
        _auth: &Auth,
        target: ResolvedTarget,
        member: &MemberItem,
    ) -> Result<SettingsOutcome, ApiError> {
        self.pause().await;
        let mut st = self.state.lock().unwrap();
        st.calls
            .push(format!("upsert_member:{}:{}", target.id, member.user));
        let key = (target.id, member.user.clone());
        let want = member.access_level.as_gitlab();
        match st.members.get(&key) {
            Some(&level) if level == want => Ok(SettingsOutcome::Skipped),
            Some(_) => {
                st.members.insert(key, want);
                Ok(SettingsOutcome::Updated)
            }
            None => {
                st.members.insert(key, want);
                Ok(SettingsOutcome::Created)
            }
        }
    }

    async fn forward(
        &self,
        _auth: &Auth,
        _method: reqwest::Method,
        _path_and_query: &str,
        _body: Option<Value>,
        _long_call: bool,
    ) -> Result<UpstreamResponse, ApiError> {
        Err(ApiError::Internal("forward is not mocked".into()))
    }
}

/// Poll a job until it settles or the timeout elapses.
pub async fn wait_terminal(registry: &JobRegistry, job_id: &str) -> JobState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(job) = registry.get(job_id).await {
            if job.state.is_terminal() {
                return job.state;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} did not settle in time",
            job_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
