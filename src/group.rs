// Group: a set of topics bound to one dialect
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::correlator::{Correlator, EventSink};
use crate::dialect::Dialect;
use crate::message::{Message, MessageKind};
use crate::middleware::Pipeline;
use crate::topic::Topic;
use crate::writer::Writer;
use crate::{CourierError, Result};

/// Default period a group waits for command responses and handler
/// resolutions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_IDLE: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Callback processing a single message.
///
/// A handler must resolve the message exactly once: either through the
/// writer (`event` and `error` acknowledge implicitly) or by calling
/// `message.ack()`/`message.nack()` directly. An unresolved message is
/// acknowledged with a warning once the group timeout lapses.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, message: Message, writer: Writer);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message, Writer) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn process(&self, message: Message, writer: Writer) {
        (self)(message, writer).await;
    }
}

struct RegisteredHandler {
    id: u64,
    handler: Arc<dyn Handler>,
}

/// Insertion-ordered handler registry keyed by `(kind, action)`.
#[derive(Default)]
pub(crate) struct Registry {
    entries: DashMap<(MessageKind, String), Vec<RegisteredHandler>>,
    next_id: AtomicU64,
}

impl Registry {
    fn register(&self, kind: MessageKind, action: &str, handler: Arc<dyn Handler>) -> u64 {
        let mut entry = self
            .entries
            .entry((kind, action.to_string()))
            .or_default();

        if let Some(existing) = entry
            .iter()
            .find(|registered| same_handler(&registered.handler, &handler))
        {
            return existing.id;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entry.push(RegisteredHandler { id, handler });
        id
    }

    fn deregister(&self, kind: MessageKind, action: &str, id: u64) {
        if let Some(mut entry) = self.entries.get_mut(&(kind, action.to_string())) {
            entry.retain(|registered| registered.id != id);
        }
    }

    pub(crate) fn lookup(&self, kind: MessageKind, action: &str) -> Vec<Arc<dyn Handler>> {
        self.entries
            .get(&(kind, action.to_string()))
            .map(|entry| {
                entry
                    .iter()
                    .map(|registered| Arc::clone(&registered.handler))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

pub(crate) struct GroupInner {
    topics: Vec<Topic>,
    dialect: Arc<dyn Dialect>,
    timeout_nanos: AtomicU64,
    registry: Registry,
    correlator: Arc<Correlator>,
    pipeline: std::sync::OnceLock<Arc<Pipeline>>,
    state: AtomicU8,
}

/// A logically related set of topics sharing one dialect, one handler
/// registry and one sync timeout. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    pub fn new(dialect: Arc<dyn Dialect>, topics: Vec<Topic>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                topics,
                dialect,
                timeout_nanos: AtomicU64::new(DEFAULT_TIMEOUT.as_nanos() as u64),
                registry: Registry::default(),
                correlator: Arc::new(Correlator::default()),
                pipeline: std::sync::OnceLock::new(),
                state: AtomicU8::new(STATE_IDLE),
            }),
        }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.inner.topics
    }

    /// The sync-command and handler-resolution timeout. Zero disables the
    /// deadline entirely.
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.inner.timeout_nanos.load(Ordering::SeqCst))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_nanos
            .store(timeout.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Registers a handler for `(kind, action)`. Returns a closure removing
    /// the registration again.
    pub fn handle_func<H>(
        &self,
        kind: MessageKind,
        action: &str,
        handler: H,
    ) -> impl FnOnce() + Send + 'static
    where
        H: Handler + 'static,
    {
        self.handle(kind, action, Arc::new(handler))
    }

    /// Registers a shared handler. Registration is idempotent per handler
    /// identity: registering the same `Arc` twice keeps a single entry.
    pub fn handle(
        &self,
        kind: MessageKind,
        action: &str,
        handler: Arc<dyn Handler>,
    ) -> impl FnOnce() + Send + 'static {
        let id = self.inner.registry.register(kind, action, handler);
        debug!(
            target: "courier::group",
            kind = %kind,
            action,
            handler = id,
            "registered handler"
        );

        let group = self.clone();
        let action = action.to_string();
        move || group.inner.registry.deregister(kind, &action, id)
    }

    /// Publishes a command to every produce-mode command topic of the group
    /// without awaiting a response. A failure on any topic aborts the
    /// remaining publishes and is returned; there is no rollback.
    pub async fn async_command(&self, command: &mut Message) -> Result<()> {
        let produced = self.produce(command.clone(), MessageKind::Command).await?;
        *command = produced;
        Ok(())
    }

    /// Publishes a command and blocks until the correlated response event
    /// arrives or the group timeout lapses.
    ///
    /// The returned event is live: resolving it with `ack()`/`nack()`
    /// commits or resets the underlying event subscription.
    pub async fn sync_command(&self, command: &mut Message) -> Result<Message> {
        let mut sink = self.await_events(&command.id, 1);
        self.async_command(command).await?;

        match sink.recv().await? {
            Some(event) => Ok(event),
            None => Err(CourierError::Timeout {
                parent: command.id.clone(),
            }),
        }
    }

    /// Registers a waiter for events carrying the given parent id. Honors
    /// the group timeout; `expecting` bounds the sink buffer.
    pub fn await_events(&self, parent: &str, expecting: usize) -> EventSink {
        Arc::clone(&self.inner.correlator).await_events(parent, expecting, self.timeout())
    }

    /// Publishes an event to every produce-mode event topic of the group.
    pub async fn produce_event(&self, event: Message) -> Result<Message> {
        self.produce(event, MessageKind::Event).await
    }

    /// Publishes a command to every produce-mode command topic of the group.
    pub async fn produce_command(&self, command: Message) -> Result<Message> {
        self.produce(command, MessageKind::Command).await
    }

    async fn produce(&self, mut message: Message, kind: MessageKind) -> Result<Message> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(CourierError::Closed);
        }

        message.kind = kind;
        if message.key.is_empty() {
            message.key = message.id.clone().into_bytes();
        }

        if let Some(pipeline) = self.inner.pipeline.get() {
            pipeline.before_publish(&mut message).await;
        }

        let producer = self.inner.dialect.producer();
        let mut result = Ok(());
        for topic in self
            .inner
            .topics
            .iter()
            .filter(|topic| topic.produce() && topic.kind == kind)
        {
            let mut outbound = message.clone();
            outbound.topic = topic.clone();
            if let Err(error) = producer.publish(outbound).await {
                result = Err(error);
                break;
            }
        }

        if let Some(pipeline) = self.inner.pipeline.get() {
            pipeline.after_publish(&message, result.as_ref().err()).await;
        }

        result.map(|_| message)
    }

    pub(crate) fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.inner.dialect
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    pub(crate) fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.inner.pipeline.get()
    }

    pub(crate) fn attach_pipeline(&self, pipeline: Arc<Pipeline>) {
        let _ = self.inner.pipeline.set(pipeline);
    }

    pub(crate) fn mark_open(&self) {
        self.inner.state.store(STATE_OPEN, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
    }
}
