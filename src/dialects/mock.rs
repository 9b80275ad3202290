// In-memory mock dialect
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dialect::{Consumer, Dialect, Producer, Subscription, SubscriptionId};
use crate::message::{Message, Resolution};
use crate::topic::Topic;
use crate::{CourierError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// Sentinel for "no redelivery bound".
const UNBOUNDED: u64 = u64::MAX;

/// In-memory fan-out transport.
///
/// Every publish is copied to each subscription of the topic and delivered
/// through a bounded channel of capacity one. A per-subscription worker
/// awaits the marker resolution of each delivery and redelivers on `Nack`
/// with exponential backoff, so the transport behaves like a
/// single-partition, ordered, at-least-once log.
pub struct MockDialect {
    consumer: Arc<MockConsumer>,
    producer: Arc<MockProducer>,
    retry_on_panic: bool,
}

impl MockDialect {
    pub fn new() -> Self {
        let consumer = Arc::new(MockConsumer {
            subscriptions: DashMap::new(),
            workers: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            max_retries: AtomicU64::new(UNBOUNDED),
        });

        let producer = Arc::new(MockProducer {
            consumer: Arc::clone(&consumer),
            offsets: DashMap::new(),
        });

        Self {
            consumer,
            producer,
            retry_on_panic: false,
        }
    }

    /// Bounds the number of redeliveries attempted per subscription before a
    /// message is dropped. Unbounded by default.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        self.consumer
            .max_retries
            .store(u64::from(max_retries), Ordering::SeqCst);
        self
    }

    pub fn with_retry_on_panic(mut self, retry: bool) -> Self {
        self.retry_on_panic = retry;
        self
    }
}

impl Default for MockDialect {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialect for MockDialect {
    async fn open(&self, _topics: &[Topic]) -> Result<()> {
        Ok(())
    }

    fn consumer(&self) -> Arc<dyn Consumer> {
        Arc::clone(&self.consumer) as Arc<dyn Consumer>
    }

    fn producer(&self) -> Arc<dyn Producer> {
        Arc::clone(&self.producer) as Arc<dyn Producer>
    }

    fn healthy(&self) -> bool {
        !self.consumer.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.consumer.close().await;
        Ok(())
    }

    fn retry_on_panic(&self) -> bool {
        self.retry_on_panic
    }
}

struct MockSubscription {
    id: SubscriptionId,
    jobs: mpsc::Sender<Message>,
}

pub struct MockConsumer {
    // Topic name -> subscriptions receiving its messages.
    subscriptions: DashMap<String, Vec<Arc<MockSubscription>>>,
    workers: DashMap<SubscriptionId, JoinHandle<()>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    max_retries: AtomicU64,
}

impl MockConsumer {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.clear();

        let ids: Vec<SubscriptionId> = self.workers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, worker)) = self.workers.remove(&id) {
                if tokio::time::timeout(Duration::from_secs(5), worker)
                    .await
                    .is_err()
                {
                    warn!(
                        target: "courier::mock",
                        subscription = id,
                        "delivery worker did not quiesce in time"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    async fn subscribe(&self, topics: &[Topic]) -> Result<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (marker_tx, marker_rx) = mpsc::channel(1);

        let subscription = Arc::new(MockSubscription { id, jobs: jobs_tx });
        for topic in topics {
            self.subscriptions
                .entry(topic.name.clone())
                .or_default()
                .push(Arc::clone(&subscription));
        }

        let max_retries = match self.max_retries.load(Ordering::SeqCst) {
            UNBOUNDED => None,
            bounded => Some(bounded as u32),
        };

        self.workers.insert(
            id,
            tokio::spawn(deliver(id, max_retries, jobs_rx, inbound_tx, marker_rx)),
        );

        Ok(Subscription {
            id,
            inbound: inbound_rx,
            marker: marker_tx,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        for mut entry in self.subscriptions.iter_mut() {
            entry
                .value_mut()
                .retain(|subscription| subscription.id != id);
        }
        self.workers.remove(&id);
        Ok(())
    }
}

pub struct MockProducer {
    consumer: Arc<MockConsumer>,
    // Topic name -> next offset, shared by all subscriptions of the topic.
    offsets: DashMap<String, AtomicI64>,
}

#[async_trait]
impl Producer for MockProducer {
    async fn publish(&self, mut message: Message) -> Result<()> {
        if self.consumer.closed.load(Ordering::SeqCst) {
            return Err(CourierError::Closed);
        }

        message.timestamp = Utc::now();
        message.partition = 0;
        message.offset = self
            .offsets
            .entry(message.topic.name.clone())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let subscriptions = self
            .consumer
            .subscriptions
            .get(&message.topic.name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        debug!(
            target: "courier::mock",
            topic = %message.topic.name,
            id = %message.id,
            subscriptions = subscriptions.len(),
            "publishing message"
        );

        for subscription in subscriptions {
            if subscription.jobs.send(message.clone()).await.is_err() {
                // Subscription torn down between lookup and delivery.
                continue;
            }
        }

        Ok(())
    }
}

// Per-subscription delivery worker. Serializes deliveries so markers are
// observed in delivery order, which stands in for partition ordering.
async fn deliver(
    id: SubscriptionId,
    max_retries: Option<u32>,
    mut jobs: mpsc::Receiver<Message>,
    inbound: mpsc::Sender<Message>,
    mut marker: mpsc::Receiver<Resolution>,
) {
    while let Some(message) = jobs.recv().await {
        let mut attempt: u32 = 0;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut delivery = message.clone();
            delivery.retries = attempt;
            if inbound.send(delivery).await.is_err() {
                return;
            }

            match marker.recv().await {
                None => return,
                Some(Resolution::Ack) => break,
                Some(Resolution::Nack) => {
                    attempt += 1;
                    if let Some(max_retries) = max_retries {
                        if attempt > max_retries {
                            warn!(
                                target: "courier::mock",
                                subscription = id,
                                message = %message.id,
                                attempts = attempt,
                                "delivery attempts exhausted, dropping message"
                            );
                            break;
                        }
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = cmp::min(backoff * 2, MAX_BACKOFF);
                }
            }
        }
    }
}
