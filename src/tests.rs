#[cfg(test)]
mod tests {
    use crate::config::{JobConfig, RateLimitConfig};
    use crate::errors::ApiError;
    use crate::models::{
        valid_path_segment, BusEvent, ItemAction, JobItem, JobKind, JobState,
    };
    use crate::progress::ProgressBus;
    use crate::rate_limit::RateLimiter;
    use crate::registry::JobRegistry;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn job_config() -> JobConfig {
        JobConfig {
            job_grace_secs: 3600,
            topic_grace_secs: 300,
            ring_capacity: 128,
            subscriber_capacity: 64,
            result_ring: 10_000,
            max_plan_items: 10_000,
            bulk_deadline_secs: 1800,
            migration_deadline_secs: 7200,
            drain_secs: 15,
        }
    }

    // ------------------------------------------------------------------
    // Rate limiter
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_rate_limiter_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            capacity: 3.0,
            refill_per_sec: 1.0,
        });

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("gitlab.example.com").await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_when_bucket_empty() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            capacity: 2.0,
            refill_per_sec: 20.0,
        });

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("gitlab.example.com").await;
        }
        // Third grant needs one refill at 20/sec: about 50ms.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_rate_limiter_tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            capacity: 2.0,
            refill_per_sec: 1000.0,
        });
        limiter.acquire("host").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tokens = limiter.tokens("host").await.unwrap();
        assert!(tokens <= 2.0, "tokens {} exceeded capacity", tokens);
    }

    #[tokio::test]
    async fn test_rate_limiter_defers_after_429() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            capacity: 10.0,
            refill_per_sec: 100.0,
        });
        limiter.acquire("host").await;
        limiter.observe("host", 429, Some(1)).await;

        let start = Instant::now();
        limiter.acquire("host").await;
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "acquisition was not deferred past the reset window"
        );
    }

    #[tokio::test]
    async fn test_rate_limiter_ignores_5xx() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            capacity: 5.0,
            refill_per_sec: 5.0,
        });
        limiter.acquire("host").await;
        limiter.observe("host", 502, None).await;

        let start = Instant::now();
        limiter.acquire("host").await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    // ------------------------------------------------------------------
    // Progress bus
    // ------------------------------------------------------------------

    fn log_event(n: usize) -> BusEvent {
        BusEvent::Log {
            job_id: "j1".to_string(),
            level: crate::models::LogLevel::Info,
            message: format!("line {}", n),
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_bus_snapshot_then_live() {
        let bus = ProgressBus::new(&job_config());
        bus.publish("job:j1", log_event(1)).await;
        bus.publish("job:j1", log_event(2)).await;

        let (snapshot, mut rx) = bus.subscribe("job:j1").await;
        assert_eq!(snapshot.len(), 2);

        bus.publish("job:j1", log_event(3)).await;
        let live = rx.recv().await.unwrap();
        match live {
            BusEvent::Log { message, .. } => assert_eq!(message, "line 3"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bus_ring_overflow_emits_dropped_marker() {
        let mut config = job_config();
        config.ring_capacity = 128;
        let bus = ProgressBus::new(&config);

        for n in 0..200 {
            bus.publish("job:j1", log_event(n)).await;
        }

        let (snapshot, _rx) = bus.subscribe("job:j1").await;
        // 128 retained plus one synthetic marker for the 72 that rolled off.
        assert_eq!(snapshot.len(), 129);
        match &snapshot[0] {
            BusEvent::Dropped { dropped, .. } => assert_eq!(*dropped, 72),
            other => panic!("expected dropped marker, got {:?}", other),
        }
        match &snapshot[1] {
            BusEvent::Log { message, .. } => assert_eq!(message, "line 72"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bus_slow_subscriber_gets_lag_marker() {
        let mut config = job_config();
        config.subscriber_capacity = 4;
        let bus = ProgressBus::new(&config);

        let (_snapshot, mut rx) = bus.subscribe("job:j1").await;
        // Queue holds 4; the next two publishes overflow for this subscriber.
        for n in 0..6 {
            bus.publish("job:j1", log_event(n)).await;
        }
        // Drain the queue, then publish again: the lag marker must lead.
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }
        bus.publish("job:j1", log_event(99)).await;

        match rx.recv().await.unwrap() {
            BusEvent::Lag { dropped, .. } => assert_eq!(dropped, 2),
            other => panic!("expected lag marker, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            BusEvent::Log { message, .. } => assert_eq!(message, "line 99"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bus_topic_grace_reaping() {
        let mut config = job_config();
        config.topic_grace_secs = 0;
        let bus = ProgressBus::new(&config);

        bus.publish("job:j1", log_event(1)).await;
        bus.publish("job:j2", log_event(1)).await;
        bus.close("job:j1").await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.reap().await, 1);
        assert_eq!(bus.topic_count().await, 1);
    }

    // ------------------------------------------------------------------
    // Job registry
    // ------------------------------------------------------------------

    fn registry() -> (Arc<ProgressBus>, JobRegistry) {
        let bus = Arc::new(ProgressBus::new(&job_config()));
        let registry = JobRegistry::new(&job_config(), bus.clone());
        (bus, registry)
    }

    #[tokio::test]
    async fn test_registry_lifecycle_succeeded() {
        let (_bus, registry) = registry();
        let (job_id, _cancel) = registry.create(JobKind::BulkImport, "s1", 2, None).await;

        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.started_at.is_none());

        registry.mark_running(&job_id).await;
        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
        assert!(job.ended_at.is_none());

        registry
            .record_item(&job_id, JobItem::ok("a", ItemAction::Created, Some(1)), None)
            .await;
        registry
            .record_item(
                &job_id,
                JobItem::ok("b", ItemAction::SkippedExisting, Some(2)),
                None,
            )
            .await;
        registry.finish(&job_id, None).await;

        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.completed, 2);
        assert_eq!(job.failed, 0);
        assert!(job.ended_at.is_some());
        assert_eq!(job.items.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_failed_item_fails_job() {
        let (_bus, registry) = registry();
        let (job_id, _cancel) = registry.create(JobKind::BulkSettings, "s1", 2, None).await;
        registry.mark_running(&job_id).await;
        registry
            .record_item(&job_id, JobItem::ok("a", ItemAction::Updated, Some(1)), None)
            .await;
        registry
            .record_item(
                &job_id,
                JobItem::failed("b", "forbidden", "no access".to_string(), 1),
                None,
            )
            .await;
        registry.finish(&job_id, None).await;

        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.completed, 1);
        assert_eq!(job.failed, 1);
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn test_registry_cancel_pending_is_terminal() {
        let (_bus, registry) = registry();
        let (job_id, cancel) = registry.create(JobKind::BulkDelete, "s1", 5, None).await;

        let observed = registry.cancel(&job_id).await.unwrap();
        assert_eq!(observed, JobState::Cancelled);
        assert!(cancel.load(std::sync::atomic::Ordering::Relaxed));

        // Terminal states are absorbing.
        registry.mark_running(&job_id).await;
        registry
            .record_item(&job_id, JobItem::ok("a", ItemAction::Created, None), None)
            .await;
        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.completed, 0);
        assert!(job.items.is_empty());
    }

    #[tokio::test]
    async fn test_registry_counters_never_exceed_total() {
        let (_bus, registry) = registry();
        let (job_id, _cancel) = registry.create(JobKind::BulkImport, "s1", 3, None).await;
        registry.mark_running(&job_id).await;
        for source in ["a", "b", "c"] {
            registry
                .record_item(&job_id, JobItem::ok(source, ItemAction::Created, None), None)
                .await;
        }
        registry.finish(&job_id, None).await;

        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.completed + job.failed + job.cancelled, job.total);
        assert_eq!(job.items.len() as u64 + job.items_dropped, job.total as u64);
    }

    #[tokio::test]
    async fn test_registry_deadline_error_beats_cancel_flag() {
        let (_bus, registry) = registry();
        let (job_id, cancel) = registry.create(JobKind::SvnMigration, "s1", 0, None).await;
        registry.mark_running(&job_id).await;
        cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        registry.finish(&job_id, Some(ApiError::Deadline)).await;

        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.unwrap().kind, "deadline");
    }

    #[tokio::test]
    async fn test_registry_list_by_session_newest_first() {
        let (_bus, registry) = registry();
        let (first, _) = registry.create(JobKind::BulkImport, "s1", 1, None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (second, _) = registry.create(JobKind::BulkDelete, "s1", 1, None).await;
        registry.create(JobKind::BulkImport, "s2", 1, None).await;

        let jobs = registry.list("s1", &Default::default()).await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second);
        assert_eq!(jobs[1].id, first);
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    #[test]
    fn test_valid_path_segment() {
        assert!(valid_path_segment("demo-root"));
        assert!(valid_path_segment("a.b_c-d1"));
        assert!(!valid_path_segment(""));
        assert!(!valid_path_segment("has space"));
        assert!(!valid_path_segment("nested/path"));
        assert!(!valid_path_segment("percent%2f"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(!JobState::Cancelling.is_terminal());
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(ApiError::BadCredentials("x".into()).http_status().as_u16(), 401);
        assert_eq!(
            ApiError::RateLimited {
                retry_after_secs: None
            }
            .http_status()
            .as_u16(),
            429
        );
        assert_eq!(ApiError::Cancelled.http_status().as_u16(), 499);
        assert_eq!(ApiError::Deadline.http_status().as_u16(), 504);
        assert!(ApiError::RateLimited {
            retry_after_secs: None
        }
        .is_retryable());
        assert!(!ApiError::Forbidden("x".into()).is_retryable());
    }
}
