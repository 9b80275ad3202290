// Message data model and acknowledgement protocol
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::topic::Topic;
use crate::Result;

/// Distinguishes command messages (requests for work) from event messages
/// (facts describing work that happened).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    #[default]
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// HTTP-style status code carried on every message.
///
/// 2xx marks success, 4xx a client failure and 5xx a server failure. The
/// zero value is valid on the wire and is the default for freshly produced
/// messages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);

    /// Whether the code marks a client (4xx) or server (5xx) failure.
    pub fn is_failure(self) -> bool {
        self.0 >= 400
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolution of a delivered message as reported on the subscription marker
/// channel. `Ack` commits the offset, `Nack` resets it so the transport
/// redelivers the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Ack,
    Nack,
}

/// Single-shot acknowledgement slot shared between the dispatcher and every
/// handler clone of a message.
///
/// The first `Nack` wins over any `Ack`; once the dispatcher has read the
/// slot the resolution is final and later calls are ignored.
#[derive(Debug)]
pub(crate) struct AckState {
    slot: watch::Sender<Option<Resolution>>,
}

impl Default for AckState {
    fn default() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }
}

impl AckState {
    pub(crate) fn resolve(&self, resolution: Resolution) {
        self.slot.send_modify(|slot| match (*slot, resolution) {
            (None, _) => *slot = Some(resolution),
            (Some(Resolution::Ack), Resolution::Nack) => *slot = Some(Resolution::Nack),
            _ => {}
        });
    }

    pub(crate) fn current(&self) -> Option<Resolution> {
        *self.slot.borrow()
    }

    /// Waits until the slot is resolved or the deadline elapses. `None` is
    /// returned only when the deadline fired with the slot still empty.
    pub(crate) async fn wait(&self, deadline: Option<Instant>) -> Option<Resolution> {
        let mut changes = self.slot.subscribe();
        let resolved = changes.wait_for(|slot| slot.is_some());
        match deadline {
            None => resolved.await.ok().and_then(|slot| *slot),
            Some(deadline) => tokio::time::timeout_at(deadline, resolved)
                .await
                .ok()
                .and_then(|result| result.ok())
                .and_then(|slot| *slot),
        }
    }
}

/// Ambient metadata travelling with a message: the parent relation, user
/// headers and opaque carrier slots attached by middleware.
///
/// Carriers are keyed by type; an attachment made on an inbound message is
/// visible to its handlers and is copied onto every message those handlers
/// emit through a [`Writer`](crate::Writer).
#[derive(Clone, Default)]
pub struct Context {
    parent_id: Option<String>,
    parent_timestamp: Option<DateTime<Utc>>,
    headers: HashMap<String, Vec<String>>,
    carriers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    /// ID of the message that caused this message to be produced.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn set_parent_id(&mut self, parent: impl Into<String>) {
        self.parent_id = Some(parent.into());
    }

    /// Transport timestamp of the parent message.
    pub fn parent_timestamp(&self) -> Option<DateTime<Utc>> {
        self.parent_timestamp
    }

    pub fn set_parent_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.parent_timestamp = Some(timestamp);
    }

    /// All user headers.
    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.headers
    }

    /// Values of a single user header.
    pub fn header(&self, key: &str) -> Option<&[String]> {
        self.headers.get(key).map(|values| values.as_slice())
    }

    pub fn set_header(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.headers.insert(key.into(), values);
    }

    /// Attaches a typed carrier value, replacing any previous attachment of
    /// the same type.
    pub fn attach<T: Any + Send + Sync>(&mut self, value: T) {
        self.carriers.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Reads back a typed carrier attachment.
    pub fn carrier<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.carriers
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Context for a derived message: headers and carriers are inherited,
    /// the parent relation is rebuilt by the caller.
    pub(crate) fn derived(&self) -> Context {
        Context {
            parent_id: None,
            parent_timestamp: None,
            headers: self.headers.clone(),
            carriers: self.carriers.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("parent_id", &self.parent_id)
            .field("parent_timestamp", &self.parent_timestamp)
            .field("headers", &self.headers)
            .field("carriers", &self.carriers.len())
            .finish()
    }
}

/// The unit of work moved across a dialect.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique identifier, assigned at construction.
    pub id: String,
    /// Short name of the semantic operation, e.g. `"Available"`.
    pub action: String,
    /// Schema version of the payload.
    pub version: u8,
    /// HTTP-style status code.
    pub status: StatusCode,
    pub kind: MessageKind,
    /// Partitioning key; defaults to the message id when left empty.
    pub key: Vec<u8>,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
    /// Topic the message came from or goes to.
    pub topic: Topic,
    /// Transport-assigned event time.
    pub timestamp: DateTime<Utc>,
    /// End-of-stream flag marking the final event of a multi-response reply.
    pub eos: bool,
    pub context: Context,
    /// Number of redeliveries observed by the transport.
    pub retries: u32,
    pub offset: i64,
    pub partition: i32,
    pub(crate) ack: Arc<AckState>,
}

impl Message {
    /// Constructs a message with a fresh random id and now-timestamp.
    pub fn new(kind: MessageKind, action: impl Into<String>, version: u8, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            version,
            status: StatusCode::default(),
            kind,
            key: Vec::new(),
            data,
            topic: Topic::default(),
            timestamp: Utc::now(),
            eos: false,
            context: Context::default(),
            retries: 0,
            offset: 0,
            partition: 0,
            ack: Arc::new(AckState::default()),
        }
    }

    /// Constructs a command message.
    pub fn command(action: impl Into<String>, version: u8, data: Vec<u8>) -> Self {
        Self::new(MessageKind::Command, action, version, data)
    }

    /// Constructs an event message.
    pub fn event(action: impl Into<String>, version: u8, data: Vec<u8>) -> Self {
        Self::new(MessageKind::Event, action, version, data)
    }

    /// Constructs a command message carrying a JSON-encoded payload.
    pub fn command_json<T: Serialize>(
        action: impl Into<String>,
        version: u8,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::command(action, version, serde_json::to_vec(payload)?))
    }

    /// Constructs an event message carrying a JSON-encoded payload.
    pub fn event_json<T: Serialize>(
        action: impl Into<String>,
        version: u8,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::event(action, version, serde_json::to_vec(payload)?))
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Sets the partitioning key.
    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    /// Marks the message as fully processed. The dispatcher commits the
    /// offset of the underlying delivery.
    pub fn ack(&self) {
        self.ack.resolve(Resolution::Ack);
    }

    /// Marks the message as failed. The dispatcher resets the offset and the
    /// transport redelivers the message.
    pub fn nack(&self) {
        self.ack.resolve(Resolution::Nack);
    }

    /// Installs a fresh acknowledgement slot; the dispatcher owns the only
    /// receiver of the returned state.
    pub(crate) fn reset_ack(&mut self) -> Arc<AckState> {
        self.ack = Arc::new(AckState::default());
        Arc::clone(&self.ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ack_state_is_single_shot() {
        let state = AckState::default();
        state.resolve(Resolution::Ack);
        state.resolve(Resolution::Ack);
        assert_eq!(state.current(), Some(Resolution::Ack));
    }

    #[tokio::test]
    async fn first_nack_wins_over_ack() {
        let state = AckState::default();
        state.resolve(Resolution::Ack);
        state.resolve(Resolution::Nack);
        assert_eq!(state.current(), Some(Resolution::Nack));

        let state = AckState::default();
        state.resolve(Resolution::Nack);
        state.resolve(Resolution::Ack);
        assert_eq!(state.current(), Some(Resolution::Nack));
    }

    #[tokio::test]
    async fn wait_observes_resolution_from_clone() {
        let mut message = Message::command("unit", 1, Vec::new());
        let state = message.reset_ack();
        let clone = message.clone();

        let waiter = tokio::spawn(async move { state.wait(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        clone.ack();

        let resolution = waiter.await.expect("join");
        assert_eq!(resolution, Some(Resolution::Ack));
    }

    #[tokio::test]
    async fn wait_returns_none_on_deadline() {
        let state = AckState::default();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(state.wait(Some(deadline)).await, None);
    }

    #[test]
    fn context_carriers_are_type_keyed() {
        #[derive(Debug, PartialEq)]
        struct Span(u64);

        let mut context = Context::default();
        context.attach(Span(7));
        assert_eq!(context.carrier::<Span>().expect("carrier").0, 7);
        assert!(context.carrier::<String>().is_none());

        let derived = context.derived();
        assert_eq!(derived.carrier::<Span>().expect("inherited").0, 7);
        assert!(derived.parent_id().is_none());
    }

    #[test]
    fn fresh_messages_have_unique_ids() {
        let first = Message::command("unit", 1, Vec::new());
        let second = Message::command("unit", 1, Vec::new());
        assert!(!first.id.is_empty());
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn json_payloads_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Stock {
            item: String,
            amount: u32,
        }

        let stock = Stock {
            item: "crate".to_string(),
            amount: 3,
        };
        let message = Message::command_json("Available", 1, &stock).expect("encode");
        assert_eq!(message.kind, MessageKind::Command);

        let decoded: Stock = message.json().expect("decode");
        assert_eq!(decoded, stock);
    }

    #[test]
    fn malformed_json_payloads_surface_a_serialization_error() {
        let message = Message::event("bad", 1, b"not json".to_vec());
        let error = message.json::<u32>().expect_err("malformed payload");
        assert!(matches!(error, crate::CourierError::Serialization(_)));
    }
}
