// Dialect contract: the interface a transport implements
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{Message, Resolution};
use crate::topic::Topic;
use crate::Result;

/// Identifier of a consumer subscription.
pub type SubscriptionId = u64;

/// An open subscription handed to the dispatcher.
///
/// `inbound` yields delivered messages. For every delivery exactly one
/// [`Resolution`] must be written to `marker`: `Ack` commits the offset,
/// `Nack` resets it to the delivered message so the transport redelivers.
/// Marker receipts for messages of the same partition are processed in
/// delivery order.
pub struct Subscription {
    pub id: SubscriptionId,
    pub inbound: mpsc::Receiver<Message>,
    pub marker: mpsc::Sender<Resolution>,
}

/// Consumer half of a dialect.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Opens a subscription covering the given topics.
    async fn subscribe(&self, topics: &[Topic]) -> Result<Subscription>;

    /// Closes the subscription with the given id.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// Producer half of a dialect.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes a message to its topic. Returns once the transport has
    /// accepted the record or failed. Safe to call concurrently.
    async fn publish(&self, message: Message) -> Result<()>;
}

/// A pluggable transport.
///
/// Implementations own their consumer and producer; `close` must be
/// idempotent and must not return until in-flight work has quiesced.
#[async_trait]
pub trait Dialect: Send + Sync {
    /// Signals that topic assignments are complete; the transport may now
    /// connect.
    async fn open(&self, topics: &[Topic]) -> Result<()>;

    fn consumer(&self) -> Arc<dyn Consumer>;

    fn producer(&self) -> Arc<dyn Producer>;

    fn healthy(&self) -> bool;

    async fn close(&self) -> Result<()>;

    /// Whether an uncaught handler failure should be treated as a `Nack`
    /// (redeliver) instead of an acknowledged server failure.
    fn retry_on_panic(&self) -> bool {
        false
    }
}
