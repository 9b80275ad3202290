// Client: top-level owner of groups and dialect lifecycle
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::dialect::Dialect;
use crate::dispatcher;
use crate::group::Group;
use crate::middleware::{Middleware, Pipeline};
use crate::topic::Topic;
use crate::{CourierError, Result};

/// Period close waits for in-flight handlers before forcing shutdown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Owns one or more groups, wires the middleware pipeline in and runs the
/// dispatcher.
///
/// ```no_run
/// use std::sync::Arc;
/// use courier::{Client, Group, Message, MessageKind, MockDialect, Mode, Topic, Writer};
///
/// # async fn example() -> courier::Result<()> {
/// let dialect = Arc::new(MockDialect::new());
/// let group = Group::new(
///     dialect,
///     vec![
///         Topic::new("commands", MessageKind::Command, Mode::CONSUME | Mode::PRODUCE),
///         Topic::new("events", MessageKind::Event, Mode::CONSUME | Mode::PRODUCE),
///     ],
/// );
///
/// let client = Client::new(vec![group.clone()]).await?;
/// group.handle_func(
///     MessageKind::Command,
///     "Available",
///     |_message: Message, writer: Writer| async move {
///         let _ = writer.event("Created", 1, Vec::new(), Vec::new()).await;
///     },
/// );
///
/// let mut command = Message::command("Available", 1, Vec::new());
/// let event = group.sync_command(&mut command).await?;
/// event.ack();
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    groups: Vec<Group>,
    dialects: Vec<Arc<dyn Dialect>>,
    pipeline: Arc<Pipeline>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    grace: Duration,
}

impl Client {
    /// Computes the topic union per dialect, opens every dialect and boots
    /// the dispatcher.
    pub async fn new(groups: Vec<Group>) -> Result<Client> {
        if groups.is_empty() {
            return Err(CourierError::Config(
                "a client requires at least one group".to_string(),
            ));
        }

        let pipeline = Arc::new(Pipeline::default());

        // Union of topics per dialect; groups may share one dialect.
        let mut dialects: Vec<(Arc<dyn Dialect>, Vec<Topic>)> = Vec::new();
        for group in &groups {
            let dialect = Arc::clone(group.dialect());
            let entry = dialects
                .iter_mut()
                .find(|(existing, _)| same_dialect(existing, &dialect));
            match entry {
                Some((_, topics)) => {
                    for topic in group.topics() {
                        if !topics.contains(topic) {
                            topics.push(topic.clone());
                        }
                    }
                }
                None => dialects.push((dialect, group.topics().to_vec())),
            }
        }

        for (dialect, topics) in &dialects {
            dialect.open(topics).await?;
        }

        for group in &groups {
            group.attach_pipeline(Arc::clone(&pipeline));
            group.mark_open();
        }

        let (shutdown, signal) = watch::channel(false);
        let mut loops = Vec::new();
        for group in &groups {
            loops.extend(dispatcher::start(group.clone(), signal.clone()).await?);
        }

        info!(
            target: "courier::client",
            groups = groups.len(),
            dialects = dialects.len(),
            "client started"
        );

        Ok(Client {
            groups,
            dialects: dialects.into_iter().map(|(dialect, _)| dialect).collect(),
            pipeline,
            loops: Mutex::new(loops),
            shutdown,
            closed: AtomicBool::new(false),
            grace: DEFAULT_GRACE,
        })
    }

    /// Appends a middleware to the pipeline. Hooks run in registration
    /// order.
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        self.pipeline.append(Arc::new(middleware));
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Whether every dialect reports itself healthy.
    pub fn healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.dialects.iter().all(|dialect| dialect.healthy())
    }

    /// Orderly shutdown: stop accepting new deliveries, drain in-flight
    /// handlers within the grace period, close the dialects and run the
    /// `on_close` hooks. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(target: "courier::client", "closing client");
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self
                .loops
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            loops.drain(..).collect()
        };

        let deadline = Instant::now() + self.grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(
                    target: "courier::client",
                    "delivery loop exceeded the grace period, aborting"
                );
                handle.abort();
            }
        }

        for group in &self.groups {
            group.mark_closed();
        }

        for dialect in &self.dialects {
            dialect.close().await?;
        }

        self.pipeline.on_close().await;
        info!(target: "courier::client", "client closed");
        Ok(())
    }
}

fn same_dialect(a: &Arc<dyn Dialect>, b: &Arc<dyn Dialect>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
