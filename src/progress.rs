use crate::config::JobConfig;
use crate::models::BusEvent;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

struct TopicSubscriber {
    tx: mpsc::Sender<BusEvent>,
    /// Live events dropped for this subscriber since its last lag marker.
    lagged: u64,
}

struct Topic {
    ring: VecDeque<BusEvent>,
    /// Events that rolled off the ring since the topic was created.
    dropped: u64,
    subscribers: Vec<TopicSubscriber>,
    closed_at: Option<Instant>,
}

impl Topic {
    fn new() -> Self {
        Topic {
            ring: VecDeque::new(),
            dropped: 0,
            subscribers: Vec::new(),
            closed_at: None,
        }
    }
}

fn job_id_of(topic: &str) -> String {
    topic.strip_prefix("job:").unwrap_or(topic).to_string()
}

/// Single-writer, multi-subscriber topic bus. Each topic keeps a bounded
/// ring so late subscribers see recent history, and each subscriber gets a
/// bounded live queue so one slow client cannot stall the publisher.
pub struct ProgressBus {
    topics: RwLock<HashMap<String, Topic>>,
    ring_capacity: usize,
    subscriber_capacity: usize,
    topic_grace: Duration,
}

impl ProgressBus {
    pub fn new(config: &JobConfig) -> Self {
        ProgressBus {
            topics: RwLock::new(HashMap::new()),
            ring_capacity: config.ring_capacity.max(1),
            subscriber_capacity: config.subscriber_capacity.max(1),
            topic_grace: Duration::from_secs(config.topic_grace_secs),
        }
    }

    /// Non-blocking publish. Ring overflow drops the oldest event; a live
    /// queue overflow drops the event for that subscriber only and emits a
    /// lag marker once the queue has room again.
    pub async fn publish(&self, topic: &str, event: BusEvent) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);

        if entry.ring.len() >= self.ring_capacity {
            entry.ring.pop_front();
            entry.dropped += 1;
        }
        entry.ring.push_back(event.clone());

        let job_id = job_id_of(topic);
        entry.subscribers.retain_mut(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if sub.lagged > 0 {
                let marker = BusEvent::Lag {
                    job_id: job_id.clone(),
                    dropped: sub.lagged,
                    ts: Utc::now(),
                };
                if sub.tx.try_send(marker).is_ok() {
                    sub.lagged = 0;
                } else {
                    sub.lagged += 1;
                    return true;
                }
            }
            if sub.tx.try_send(event.clone()).is_err() {
                sub.lagged += 1;
            }
            true
        });
    }

    /// Atomically returns the topic's retained history and a live channel
    /// that receives every subsequent publish, in order.
    pub async fn subscribe(&self, topic: &str) -> (Vec<BusEvent>, mpsc::Receiver<BusEvent>) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);

        let mut snapshot = Vec::with_capacity(entry.ring.len() + 1);
        if entry.dropped > 0 {
            snapshot.push(BusEvent::Dropped {
                job_id: job_id_of(topic),
                dropped: entry.dropped,
                ts: Utc::now(),
            });
        }
        snapshot.extend(entry.ring.iter().cloned());

        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        entry.subscribers.push(TopicSubscriber { tx, lagged: 0 });
        (snapshot, rx)
    }

    /// Mark the topic closed; it is retained for the grace period so late
    /// subscribers can still observe the terminal events.
    pub async fn close(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            entry.closed_at = Some(Instant::now());
        }
    }

    /// Remove closed topics past the grace period. Returns how many.
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let grace = self.topic_grace;
        let mut topics = self.topics.write().await;
        let before = topics.len();
        topics.retain(|_, t| match t.closed_at {
            Some(closed) => now.duration_since(closed) < grace,
            None => true,
        });
        before - topics.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}
