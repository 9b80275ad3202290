// Middleware pipeline for cross-cutting concerns
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::message::Message;
use crate::{CourierError, Result};

/// Interceptor attached to the consume/publish/close lifecycle.
///
/// Hooks run synchronously on the dispatching or publishing task in
/// registration order and may mutate the message context, e.g. to attach a
/// tracing span or user headers. An error from `before_consume` causes the
/// message to be nacked. Hook panics are caught and converted to errors.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_consume(&self, _message: &mut Message) -> Result<()> {
        Ok(())
    }

    async fn after_consume(&self, _message: &Message, _error: Option<&CourierError>) {}

    async fn before_publish(&self, _message: &mut Message) {}

    async fn after_publish(&self, _message: &Message, _error: Option<&CourierError>) {}

    async fn on_close(&self) {}
}

/// Ordered middleware stack shared by a client and its groups.
#[derive(Default)]
pub(crate) struct Pipeline {
    stack: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Pipeline {
    pub(crate) fn append(&self, middleware: Arc<dyn Middleware>) {
        self.stack
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(middleware);
    }

    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.stack
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) async fn before_consume(&self, message: &mut Message) -> Result<()> {
        for middleware in self.snapshot() {
            match AssertUnwindSafe(middleware.before_consume(message))
                .catch_unwind()
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(CourierError::Middleware(
                        "before-consume hook panicked".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn after_consume(&self, message: &Message, error: Option<&CourierError>) {
        for middleware in self.snapshot() {
            if AssertUnwindSafe(middleware.after_consume(message, error))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(target: "courier::middleware", "after-consume hook panicked");
            }
        }
    }

    pub(crate) async fn before_publish(&self, message: &mut Message) {
        for middleware in self.snapshot() {
            if AssertUnwindSafe(middleware.before_publish(message))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(target: "courier::middleware", "before-publish hook panicked");
            }
        }
    }

    pub(crate) async fn after_publish(&self, message: &Message, error: Option<&CourierError>) {
        for middleware in self.snapshot() {
            if AssertUnwindSafe(middleware.after_publish(message, error))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(target: "courier::middleware", "after-publish hook panicked");
            }
        }
    }

    pub(crate) async fn on_close(&self) {
        for middleware in self.snapshot() {
            if AssertUnwindSafe(middleware.on_close())
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(target: "courier::middleware", "on-close hook panicked");
            }
        }
    }
}

/// Middleware logging every lifecycle step through `tracing`.
pub struct LogMiddleware;

#[async_trait]
impl Middleware for LogMiddleware {
    async fn before_consume(&self, message: &mut Message) -> Result<()> {
        debug!(
            target: "courier::middleware",
            id = %message.id,
            kind = %message.kind,
            action = %message.action,
            topic = %message.topic.name,
            retries = message.retries,
            "consuming message"
        );
        Ok(())
    }

    async fn after_consume(&self, message: &Message, error: Option<&CourierError>) {
        match error {
            Some(error) => warn!(
                target: "courier::middleware",
                id = %message.id,
                action = %message.action,
                error = %error,
                "message consumption failed"
            ),
            None => debug!(
                target: "courier::middleware",
                id = %message.id,
                action = %message.action,
                "message consumed"
            ),
        }
    }

    async fn before_publish(&self, message: &mut Message) {
        debug!(
            target: "courier::middleware",
            id = %message.id,
            kind = %message.kind,
            action = %message.action,
            "publishing message"
        );
    }

    async fn after_publish(&self, message: &Message, error: Option<&CourierError>) {
        if let Some(error) = error {
            warn!(
                target: "courier::middleware",
                id = %message.id,
                action = %message.action,
                error = %error,
                "publish failed"
            );
        }
    }

    async fn on_close(&self) {
        debug!(target: "courier::middleware", "pipeline closed");
    }
}
