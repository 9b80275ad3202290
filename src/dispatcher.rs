// Dispatcher: demultiplexes inbound messages to handlers
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dialect::Subscription;
use crate::group::Group;
use crate::message::{Message, MessageKind, Resolution, StatusCode};
use crate::writer::Writer;
use crate::{CourierError, Result};

/// Boots one delivery loop per consume-mode topic of the group.
///
/// Each loop owns its subscription: the next message of a partition is not
/// read before the marker of the previous one is written, which serializes
/// handler invocations per partition while keeping topics independent.
pub(crate) async fn start(
    group: Group,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    let retry_on_panic = group.dialect().retry_on_panic();
    let consumer = group.dialect().consumer();

    let mut loops = Vec::new();
    for topic in group.topics().iter().filter(|topic| topic.consume()) {
        let subscription = consumer.subscribe(std::slice::from_ref(topic)).await?;
        debug!(
            target: "courier::dispatcher",
            topic = %topic.name,
            subscription = subscription.id,
            "subscribed"
        );
        loops.push(tokio::spawn(delivery_loop(
            group.clone(),
            retry_on_panic,
            subscription,
            shutdown.clone(),
        )));
    }

    Ok(loops)
}

async fn delivery_loop(
    group: Group,
    retry_on_panic: bool,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            inbound = subscription.inbound.recv() => match inbound {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let resolution = dispatch(&group, retry_on_panic, message).await;
        if subscription.marker.send(resolution).await.is_err() {
            break;
        }
    }

    debug!(
        target: "courier::dispatcher",
        subscription = subscription.id,
        "delivery loop stopped"
    );
}

async fn dispatch(group: &Group, retry_on_panic: bool, mut message: Message) -> Resolution {
    let ack = message.reset_ack();
    let timeout = group.timeout();
    let deadline = (timeout > Duration::ZERO).then(|| Instant::now() + timeout);

    if let Some(pipeline) = group.pipeline() {
        if let Err(error) = pipeline.before_consume(&mut message).await {
            warn!(
                target: "courier::dispatcher",
                id = %message.id,
                action = %message.action,
                error = %error,
                "before-consume hook rejected message"
            );
            pipeline.after_consume(&message, Some(&error)).await;
            return Resolution::Nack;
        }
    }

    let handlers = group.registry().lookup(message.topic.kind, &message.action);
    let awaited =
        message.topic.kind == MessageKind::Event && group.correlator().complete(&message);

    if handlers.is_empty() && !awaited {
        let resolution = unroutable(group, &message).await;
        if let Some(pipeline) = group.pipeline() {
            pipeline.after_consume(&message, None).await;
        }
        return resolution;
    }

    let mut tasks = JoinSet::new();
    for handler in handlers {
        let handler_message = message.clone();
        let writer = Writer::new(group.clone(), message.clone());
        tasks.spawn(async move { handler.process(handler_message, writer).await });
    }

    let mut panicked = false;
    let mut timed_out = false;
    loop {
        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            },
            None => tasks.join_next().await,
        };

        match joined {
            None => break,
            Some(Ok(())) => {}
            Some(Err(error)) => {
                if error.is_panic() {
                    panicked = true;
                }
            }
        }
    }

    if timed_out {
        tasks.abort_all();
        let resolution = match ack.current() {
            Some(resolution) => resolution,
            None => {
                warn!(
                    target: "courier::dispatcher",
                    id = %message.id,
                    action = %message.action,
                    "handlers did not resolve the message before the deadline, acknowledging"
                );
                Resolution::Ack
            }
        };
        if let Some(pipeline) = group.pipeline() {
            pipeline.after_consume(&message, None).await;
        }
        return resolution;
    }

    if panicked {
        let error = CourierError::Handler("handler panicked".to_string());
        let resolution = if retry_on_panic || ack.current() == Some(Resolution::Nack) {
            Resolution::Nack
        } else {
            message.status = StatusCode::INTERNAL_ERROR;
            let writer = Writer::new(group.clone(), message.clone());
            if let Err(produce_error) = writer
                .error(
                    &message.action,
                    StatusCode::INTERNAL_ERROR,
                    b"handler panicked".to_vec(),
                )
                .await
            {
                debug!(
                    target: "courier::dispatcher",
                    id = %message.id,
                    error = %produce_error,
                    "best-effort failure event was not produced"
                );
            }
            Resolution::Ack
        };

        warn!(
            target: "courier::dispatcher",
            id = %message.id,
            action = %message.action,
            redeliver = matches!(resolution, Resolution::Nack),
            "handler panicked"
        );
        if let Some(pipeline) = group.pipeline() {
            pipeline.after_consume(&message, Some(&error)).await;
        }
        return resolution;
    }

    // Handlers returned; await the acknowledgement. A sync caller holding a
    // correlated clone may still resolve the message after this point.
    let resolution = if let Some(deadline) = deadline {
        match ack.wait(Some(deadline)).await {
            Some(resolution) => resolution,
            None => {
                warn!(
                    target: "courier::dispatcher",
                    id = %message.id,
                    action = %message.action,
                    "message was not resolved before the deadline, acknowledging"
                );
                Resolution::Ack
            }
        }
    } else if awaited || ack.current().is_some() {
        ack.wait(None).await.unwrap_or(Resolution::Ack)
    } else {
        warn!(
            target: "courier::dispatcher",
            id = %message.id,
            action = %message.action,
            "handlers completed without resolving the message, acknowledging"
        );
        Resolution::Ack
    };

    if let Some(pipeline) = group.pipeline() {
        pipeline.after_consume(&message, None).await;
    }
    resolution
}

// Dispatch-miss policy: commands answer with a 404 failure event on the
// paired events topic, events are acknowledged and dropped.
async fn unroutable(group: &Group, message: &Message) -> Resolution {
    match message.topic.kind {
        MessageKind::Command => {
            warn!(
                target: "courier::dispatcher",
                id = %message.id,
                action = %message.action,
                "no handler registered for command"
            );
            let writer = Writer::new(group.clone(), message.clone());
            if let Err(error) = writer
                .error(
                    &message.action,
                    StatusCode::NOT_FOUND,
                    b"no handler registered for action".to_vec(),
                )
                .await
            {
                debug!(
                    target: "courier::dispatcher",
                    id = %message.id,
                    error = %error,
                    "best-effort failure event was not produced"
                );
            }
            Resolution::Ack
        }
        MessageKind::Event => {
            debug!(
                target: "courier::dispatcher",
                id = %message.id,
                action = %message.action,
                "dropping unroutable event"
            );
            Resolution::Ack
        }
    }
}
