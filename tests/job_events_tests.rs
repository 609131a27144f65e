use GitfleetServer::config::Settings;
use GitfleetServer::models::{BusEvent, ItemAction, JobItem, JobKind, JobState};
use GitfleetServer::progress::ProgressBus;
use GitfleetServer::registry::{topic_for, JobRegistry};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<ProgressBus>, JobRegistry) {
    let settings = Settings::default();
    let bus = Arc::new(ProgressBus::new(&settings.jobs));
    let registry = JobRegistry::new(&settings.jobs, bus.clone());
    (bus, registry)
}

async fn drain_until_terminal(
    rx: &mut tokio::sync::mpsc::Receiver<BusEvent>,
) -> Vec<BusEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("channel closed before terminal");
        let terminal = matches!(event, BusEvent::Terminal { .. });
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn live_subscriber_sees_the_full_lifecycle_in_order() {
    let (bus, registry) = setup();
    let (job_id, _cancel) = registry.create(JobKind::BulkImport, "s1", 2, None).await;

    let (snapshot, mut rx) = bus.subscribe(&topic_for(&job_id)).await;
    assert!(snapshot.is_empty());

    registry.mark_running(&job_id).await;
    registry
        .record_item(&job_id, JobItem::ok("a", ItemAction::Created, Some(1)), Some("a".into()))
        .await;
    registry
        .record_item(&job_id, JobItem::ok("b", ItemAction::Created, Some(2)), Some("b".into()))
        .await;
    registry.finish(&job_id, None).await;

    let events = drain_until_terminal(&mut rx).await;

    // Strict per-topic ordering: running, two progress ticks, terminal state.
    match &events[0] {
        BusEvent::State { state, .. } => assert_eq!(*state, JobState::Running),
        other => panic!("expected running state first, got {:?}", other),
    }
    let progress: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            BusEvent::Progress {
                completed, total, ..
            } => Some((*completed, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 2), (2, 2)]);

    match events.last().unwrap() {
        BusEvent::Terminal { state, summary, .. } => {
            assert_eq!(*state, JobState::Succeeded);
            assert_eq!(summary.completed, 2);
        }
        other => panic!("expected terminal last, got {:?}", other),
    }
}

#[tokio::test]
async fn late_subscriber_replays_history_through_the_ring() {
    let (bus, registry) = setup();
    let (job_id, _cancel) = registry.create(JobKind::BulkSettings, "s1", 1, None).await;

    registry.mark_running(&job_id).await;
    registry
        .record_item(&job_id, JobItem::ok("x", ItemAction::Updated, None), None)
        .await;
    registry.finish(&job_id, None).await;

    // Topic closed but inside the grace window: history must still be there.
    let (snapshot, _rx) = bus.subscribe(&topic_for(&job_id)).await;
    assert!(snapshot.len() >= 3);
    assert!(snapshot
        .iter()
        .any(|e| matches!(e, BusEvent::Terminal { state, .. } if *state == JobState::Succeeded)));
}

#[tokio::test]
async fn cancelling_a_running_job_emits_cancelling_then_terminal() {
    let (bus, registry) = setup();
    let (job_id, cancel) = registry.create(JobKind::BulkDelete, "s1", 3, None).await;

    let (_snapshot, mut rx) = bus.subscribe(&topic_for(&job_id)).await;

    registry.mark_running(&job_id).await;
    let observed = registry.cancel(&job_id).await.unwrap();
    assert_eq!(observed, JobState::Cancelling);
    assert!(cancel.load(std::sync::atomic::Ordering::Relaxed));

    // The engine notices the flag and settles the job.
    registry
        .record_item(&job_id, JobItem::cancelled("a"), None)
        .await;
    registry.finish(&job_id, None).await;

    let events = drain_until_terminal(&mut rx).await;
    let states: Vec<JobState> = events
        .iter()
        .filter_map(|e| match e {
            BusEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![JobState::Running, JobState::Cancelling, JobState::Cancelled]
    );
    match events.last().unwrap() {
        BusEvent::Terminal { state, .. } => assert_eq!(*state, JobState::Cancelled),
        other => panic!("expected terminal last, got {:?}", other),
    }
}
