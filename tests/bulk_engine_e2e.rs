mod common;

use common::{wait_terminal, MockGitLab, GOOD_TOKEN};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use GitfleetServer::bulk::BulkEngine;
use GitfleetServer::config::Settings;
use GitfleetServer::models::{
    BulkPlan, DeletePlan, ImportPlan, ItemAction, JobKind, JobState, MembersPlan, SettingsPlan,
};
use GitfleetServer::progress::ProgressBus;
use GitfleetServer::registry::JobRegistry;
use GitfleetServer::session::SessionStore;
use GitfleetServer::upstream::GitLabApi;

struct Harness {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionStore>,
    engine: Arc<BulkEngine>,
    mock: Arc<MockGitLab>,
    session_id: String,
}

async fn harness(workers: usize, mock: MockGitLab) -> Harness {
    let mut settings = Settings::default();
    settings.pools.bulk_workers = workers;
    settings.upstream.api_delay_ms = 0;

    let mock = Arc::new(mock);
    let api: Arc<dyn GitLabApi> = mock.clone();
    let bus = Arc::new(ProgressBus::new(&settings.jobs));
    let registry = Arc::new(JobRegistry::new(&settings.jobs, bus));
    let sessions = Arc::new(SessionStore::new(&settings.session, api.clone()));
    let engine = Arc::new(BulkEngine::new(
        &settings,
        registry.clone(),
        sessions.clone(),
        api,
    ));

    let (session_id, _user) = sessions
        .create("https://gitlab.example.com".to_string(), GOOD_TOKEN.to_string())
        .await
        .expect("session create");

    Harness {
        registry,
        sessions,
        engine,
        mock,
        session_id,
    }
}

async fn submit(h: &Harness, kind: JobKind, total: usize, plan: BulkPlan) -> String {
    let (job_id, cancel) = h.registry.create(kind, &h.session_id, total, None).await;
    h.engine
        .spawn(job_id.clone(), h.session_id.clone(), cancel, plan);
    job_id
}

fn two_level_tree() -> ImportPlan {
    serde_json::from_value(json!({
        "tree": [{
            "name": "Demo Root",
            "path": "demo-root",
            "projects": [
                { "name": "frontend", "path": "fe" },
                { "name": "backend", "path": "be" }
            ]
        }]
    }))
    .expect("plan shape")
}

#[tokio::test]
async fn two_level_import_creates_parents_first() {
    let h = harness(1, MockGitLab::new()).await;

    let job_id = submit(&h, JobKind::BulkImport, 3, BulkPlan::Import(two_level_tree())).await;
    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Succeeded);

    let job = h.registry.get(&job_id).await.unwrap();
    assert_eq!(job.total, 3);
    assert_eq!(job.completed, 3);
    assert!(job
        .items
        .iter()
        .all(|i| i.action == ItemAction::Created));

    // Natural paths landed where the plan said.
    {
        let st = h.mock.state.lock().unwrap();
        assert!(st.groups.contains_key("demo-root"));
        assert!(st.projects.contains_key("demo-root/fe"));
        assert!(st.projects.contains_key("demo-root/be"));
    }

    // Parent strictly before children, children in submission order.
    let root = h.mock.call_index("create_group:demo-root").unwrap();
    let fe = h.mock.call_index("create_project:demo-root/fe").unwrap();
    let be = h.mock.call_index("create_project:demo-root/be").unwrap();
    assert!(root < fe);
    assert!(fe < be);
}

#[tokio::test]
async fn rerunning_an_import_is_idempotent() {
    let h = harness(2, MockGitLab::new()).await;

    let first = submit(&h, JobKind::BulkImport, 3, BulkPlan::Import(two_level_tree())).await;
    assert_eq!(wait_terminal(&h.registry, &first).await, JobState::Succeeded);
    let creates_after_first = h
        .mock
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_"))
        .count();

    let second = submit(&h, JobKind::BulkImport, 3, BulkPlan::Import(two_level_tree())).await;
    assert_eq!(wait_terminal(&h.registry, &second).await, JobState::Succeeded);

    let job = h.registry.get(&second).await.unwrap();
    assert_eq!(job.completed, 3);
    assert!(job
        .items
        .iter()
        .all(|i| i.action == ItemAction::SkippedExisting));

    // Zero net changes: no further create calls happened.
    let creates_after_second = h
        .mock
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_"))
        .count();
    assert_eq!(creates_after_first, creates_after_second);
}

#[tokio::test]
async fn failed_parent_fails_descendants_without_upstream_calls() {
    let mock = MockGitLab::new();
    mock.inject_failure("bad-root", "forbidden");
    let h = harness(2, mock).await;

    let plan: ImportPlan = serde_json::from_value(json!({
        "tree": [{
            "name": "Bad Root",
            "path": "bad-root",
            "subgroups": [{
                "name": "Frontend",
                "path": "fe",
                "projects": [{ "name": "app", "path": "app" }]
            }]
        }]
    }))
    .unwrap();

    let job_id = submit(&h, JobKind::BulkImport, 3, BulkPlan::Import(plan)).await;
    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Failed);

    let job = h.registry.get(&job_id).await.unwrap();
    assert_eq!(job.failed, 3);

    let by_source = |source: &str| {
        job.items
            .iter()
            .find(|i| i.source == source)
            .unwrap_or_else(|| panic!("missing item {}", source))
            .clone()
    };
    assert_eq!(by_source("bad-root").error_kind.as_deref(), Some("forbidden"));
    assert_eq!(
        by_source("bad-root/fe").error_kind.as_deref(),
        Some("parent-missing")
    );
    assert_eq!(
        by_source("bad-root/fe/app").error_kind.as_deref(),
        Some("parent-missing")
    );

    // Descendants were condemned without touching the upstream.
    assert!(h.mock.call_index("find_group:bad-root/fe").is_none());
    assert!(h.mock.call_index("find_project:bad-root/fe/app").is_none());
}

#[tokio::test]
async fn stop_on_first_error_cancels_the_rest() {
    let mock = MockGitLab::new();
    for p in ["p1", "p2", "p4", "p5"] {
        mock.seed_project(p, "public");
    }
    mock.inject_failure("p3", "forbidden");
    let h = harness(1, mock).await;

    let plan: SettingsPlan = serde_json::from_value(json!({
        "error_policy": "stop-on-first-error",
        "items": (1..=5).map(|n| json!({
            "target": { "kind": "project", "full_path": format!("p{}", n) },
            "patch": { "kind": "visibility", "visibility": "private" }
        })).collect::<Vec<_>>()
    }))
    .unwrap();

    let job_id = submit(&h, JobKind::BulkSettings, 5, BulkPlan::Settings(plan)).await;
    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Failed);

    let job = h.registry.get(&job_id).await.unwrap();
    let action_of = |source: &str| {
        job.items
            .iter()
            .find(|i| i.source == source)
            .map(|i| i.action)
            .unwrap_or_else(|| panic!("missing item {}", source))
    };
    assert_eq!(action_of("p1"), ItemAction::Updated);
    assert_eq!(action_of("p2"), ItemAction::Updated);
    assert_eq!(action_of("p3"), ItemAction::Failed);
    assert_eq!(action_of("p4"), ItemAction::Cancelled);
    assert_eq!(action_of("p5"), ItemAction::Cancelled);

    // Items after the failure were never attempted.
    assert!(h.mock.call_index("find_project:p4").is_none());
    assert!(h.mock.call_index("find_project:p5").is_none());
}

#[tokio::test]
async fn settings_second_run_is_a_noop() {
    let mock = MockGitLab::new();
    for p in ["p1", "p2"] {
        mock.seed_project(p, "public");
    }
    let h = harness(2, mock).await;

    let plan = || -> SettingsPlan {
        serde_json::from_value(json!({
            "items": [
                { "target": { "kind": "project", "full_path": "p1" },
                  "patch": { "kind": "visibility", "visibility": "private" } },
                { "target": { "kind": "project", "full_path": "p2" },
                  "patch": { "kind": "visibility", "visibility": "private" } }
            ]
        }))
        .unwrap()
    };

    let first = submit(&h, JobKind::BulkSettings, 2, BulkPlan::Settings(plan())).await;
    assert_eq!(wait_terminal(&h.registry, &first).await, JobState::Succeeded);
    let job = h.registry.get(&first).await.unwrap();
    assert!(job.items.iter().all(|i| i.action == ItemAction::Updated));

    let second = submit(&h, JobKind::BulkSettings, 2, BulkPlan::Settings(plan())).await;
    assert_eq!(wait_terminal(&h.registry, &second).await, JobState::Succeeded);
    let job = h.registry.get(&second).await.unwrap();
    assert!(job
        .items
        .iter()
        .all(|i| i.action == ItemAction::SkippedExisting));
}

#[tokio::test]
async fn cancel_mid_stream_reports_unrun_items_cancelled() {
    let mock = MockGitLab::with_delay(Duration::from_millis(40));
    let h = harness(1, mock).await;

    let tree: Vec<_> = (0..12)
        .map(|n| json!({ "name": format!("Group {}", n), "path": format!("g{:02}", n) }))
        .collect();
    let plan: ImportPlan = serde_json::from_value(json!({ "tree": tree })).unwrap();

    let job_id = submit(&h, JobKind::BulkImport, 12, BulkPlan::Import(plan)).await;

    // Let a few items land, then pull the plug.
    loop {
        let job = h.registry.get(&job_id).await.unwrap();
        if job.completed >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.registry.cancel(&job_id).await.unwrap();

    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Cancelled);
    let job = h.registry.get(&job_id).await.unwrap();
    assert!(job.completed >= 3);
    assert!(job.completed < 12, "cancel had no effect");
    assert!(job.cancelled > 0);
    assert_eq!(job.completed + job.failed + job.cancelled, 12);
}

#[tokio::test]
async fn delete_is_idempotent_about_missing_targets() {
    let mock = MockGitLab::new();
    mock.seed_project("doomed", "private");
    let h = harness(1, mock).await;

    let plan: DeletePlan = serde_json::from_value(json!({
        "confirm": true,
        "items": [
            { "kind": "project", "full_path": "doomed" },
            { "kind": "project", "full_path": "ghost" }
        ]
    }))
    .unwrap();

    let job_id = submit(&h, JobKind::BulkDelete, 2, BulkPlan::Delete(plan)).await;
    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Succeeded);

    let job = h.registry.get(&job_id).await.unwrap();
    let action_of = |source: &str| {
        job.items
            .iter()
            .find(|i| i.source == source)
            .map(|i| i.action)
            .unwrap()
    };
    assert_eq!(action_of("doomed"), ItemAction::Deleted);
    assert_eq!(action_of("ghost"), ItemAction::SkippedExisting);
    assert!(!h.mock.state.lock().unwrap().projects.contains_key("doomed"));
}

#[tokio::test]
async fn members_upsert_reports_created_updated_skipped() {
    let mock = MockGitLab::new();
    let project_id = mock.seed_project("team-proj", "private");
    mock.seed_member(project_id, "bob", 30);
    mock.seed_member(project_id, "carol", 20);
    let h = harness(1, mock).await;

    let plan: MembersPlan = serde_json::from_value(json!({
        "items": [
            { "target": { "kind": "project", "full_path": "team-proj" },
              "user": "alice", "access_level": "developer" },
            { "target": { "kind": "project", "full_path": "team-proj" },
              "user": "bob", "access_level": "developer" },
            { "target": { "kind": "project", "full_path": "team-proj" },
              "user": "carol", "access_level": "developer" }
        ]
    }))
    .unwrap();

    let job_id = submit(&h, JobKind::BulkMembers, 3, BulkPlan::Members(plan)).await;
    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Succeeded);

    let job = h.registry.get(&job_id).await.unwrap();
    let action_of = |user: &str| {
        job.items
            .iter()
            .find(|i| i.source.ends_with(&format!(":{}", user)))
            .map(|i| i.action)
            .unwrap()
    };
    assert_eq!(action_of("alice"), ItemAction::Created);
    assert_eq!(action_of("bob"), ItemAction::SkippedExisting);
    assert_eq!(action_of("carol"), ItemAction::Updated);
}

#[tokio::test]
async fn revoked_session_fails_in_flight_items() {
    let mock = MockGitLab::with_delay(Duration::from_millis(30));
    let h = harness(1, mock).await;

    let tree: Vec<_> = (0..8)
        .map(|n| json!({ "name": format!("Group {}", n), "path": format!("r{:02}", n) }))
        .collect();
    let plan: ImportPlan = serde_json::from_value(json!({ "tree": tree })).unwrap();

    let job_id = submit(&h, JobKind::BulkImport, 8, BulkPlan::Import(plan)).await;

    loop {
        let job = h.registry.get(&job_id).await.unwrap();
        if job.completed >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.sessions.revoke(&h.session_id).await;

    assert_eq!(wait_terminal(&h.registry, &job_id).await, JobState::Failed);
    let job = h.registry.get(&job_id).await.unwrap();
    assert!(job.completed >= 2);
    assert!(job
        .items
        .iter()
        .any(|i| i.error_kind.as_deref() == Some("bad-credentials")));
}
