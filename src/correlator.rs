// Correlator: matches inbound events to outstanding sync commands
use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::message::Message;
use crate::{CourierError, Result};

/// Waiter table keyed by the parent message id.
///
/// The dispatcher consults the table for every inbound event in addition to
/// the static handler registry; a match never auto-acks the event, the
/// receiver of the sink is responsible for resolving it.
#[derive(Default)]
pub(crate) struct Correlator {
    waiters: DashMap<String, Waiter>,
}

struct Waiter {
    sink: mpsc::Sender<Message>,
    remaining: usize,
}

impl Correlator {
    /// Registers a waiter for events whose parent id equals `parent`. The
    /// sink is closed once `expecting` events arrived, an end-of-stream
    /// event was observed, or the waiter was cancelled.
    pub(crate) fn await_events(
        self: Arc<Self>,
        parent: &str,
        expecting: usize,
        timeout: Duration,
    ) -> EventSink {
        let expecting = cmp::max(expecting, 1);
        let (sink, receiver) = mpsc::channel(expecting);

        self.waiters.insert(
            parent.to_string(),
            Waiter {
                sink,
                remaining: expecting,
            },
        );

        EventSink {
            receiver,
            deadline: (timeout > Duration::ZERO).then(|| Instant::now() + timeout),
            parent: parent.to_string(),
            correlator: self,
        }
    }

    /// Routes an inbound event to its waiter, if any. Returns whether a
    /// waiter matched.
    pub(crate) fn complete(&self, message: &Message) -> bool {
        let Some(parent) = message.context.parent_id() else {
            return false;
        };

        let Some(mut entry) = self.waiters.get_mut(parent) else {
            return false;
        };

        // The sink is bounded to the number of expected events, so a full or
        // closed channel only happens after cancellation.
        let _ = entry.sink.try_send(message.clone());
        entry.remaining = entry.remaining.saturating_sub(1);
        let exhausted = entry.remaining == 0 || message.eos;
        drop(entry);

        if exhausted {
            debug!(target: "courier::correlator", parent_id = parent, "waiter completed");
            self.waiters.remove(parent);
        }

        true
    }

    pub(crate) fn cancel(&self, parent: &str) {
        self.waiters.remove(parent);
    }
}

/// Receiving side of an event await.
///
/// Dropping the sink cancels the underlying waiter.
pub struct EventSink {
    receiver: mpsc::Receiver<Message>,
    deadline: Option<Instant>,
    parent: String,
    correlator: Arc<Correlator>,
}

impl EventSink {
    /// Receives the next correlated event. `Ok(None)` marks the end of the
    /// stream; a lapsed deadline yields [`CourierError::Timeout`] carrying
    /// the parent id.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.deadline {
            None => Ok(self.receiver.recv().await),
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                    Ok(message) => Ok(message),
                    Err(_) => Err(CourierError::Timeout {
                        parent: self.parent.clone(),
                    }),
                }
            }
        }
    }

    /// Removes the waiter; buffered events remain readable.
    pub fn cancel(self) {}
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.correlator.cancel(&self.parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn event_with_parent(parent: &str) -> Message {
        let mut message = Message::new(MessageKind::Event, "done", 1, Vec::new());
        message.context.set_parent_id(parent);
        message
    }

    #[tokio::test]
    async fn completes_a_single_expected_event() {
        let correlator = Arc::new(Correlator::default());
        let mut sink = Arc::clone(&correlator).await_events("p1", 1, Duration::from_secs(1));

        assert!(correlator.complete(&event_with_parent("p1")));
        let received = sink.recv().await.expect("recv").expect("event");
        assert_eq!(received.context.parent_id(), Some("p1"));

        // Waiter is removed once exhausted.
        assert!(!correlator.complete(&event_with_parent("p1")));
    }

    #[tokio::test]
    async fn events_without_matching_parent_are_ignored() {
        let correlator = Arc::new(Correlator::default());
        let _sink = Arc::clone(&correlator).await_events("p1", 1, Duration::from_secs(1));

        assert!(!correlator.complete(&event_with_parent("other")));
        assert!(!correlator.complete(&Message::event("done", 1, Vec::new())));
    }

    #[tokio::test]
    async fn eos_closes_the_sink_before_the_expected_count() {
        let correlator = Arc::new(Correlator::default());
        let mut sink = Arc::clone(&correlator).await_events("p1", 3, Duration::from_secs(1));

        let mut message = event_with_parent("p1");
        message.eos = true;
        assert!(correlator.complete(&message));

        assert!(sink.recv().await.expect("recv").is_some());
        assert!(sink.recv().await.expect("recv").is_none());
    }

    #[tokio::test]
    async fn deadline_yields_a_timeout_error() {
        let correlator = Arc::new(Correlator::default());
        let mut sink = Arc::clone(&correlator).await_events("p1", 1, Duration::from_millis(20));

        match sink.recv().await {
            Err(CourierError::Timeout { parent }) => assert_eq!(parent, "p1"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_timeout_disables_the_deadline() {
        let correlator = Arc::new(Correlator::default());
        let mut sink = Arc::clone(&correlator).await_events("p1", 1, Duration::ZERO);

        let delayed = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            delayed.complete(&event_with_parent("p1"));
        });

        assert!(sink.recv().await.expect("recv").is_some());
    }

    #[tokio::test]
    async fn dropping_the_sink_cancels_the_waiter() {
        let correlator = Arc::new(Correlator::default());
        let sink = Arc::clone(&correlator).await_events("p1", 1, Duration::from_secs(1));
        drop(sink);

        assert!(!correlator.complete(&event_with_parent("p1")));
    }
}
