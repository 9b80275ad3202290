// Courier Core Library
// Command/event messaging runtime on top of pluggable transports

pub mod client;
pub mod codec;
pub mod correlator;
pub mod dialect;
pub mod dialects;
pub mod group;
pub mod message;
pub mod middleware;
pub mod telemetry;
pub mod topic;
pub mod writer;

mod dispatcher;

// Export core types
pub use client::Client;
pub use codec::Record;
pub use correlator::EventSink;
pub use dialect::{Consumer, Dialect, Producer, Subscription, SubscriptionId};
pub use dialects::mock::MockDialect;
pub use group::{Group, Handler};
pub use message::{Context, Message, MessageKind, Resolution, StatusCode};
pub use middleware::{LogMiddleware, Middleware};
pub use topic::{Mode, Topic};
pub use writer::Writer;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler failure: {0}")]
    Handler(String),

    #[error("middleware failure: {0}")]
    Middleware(String),

    #[error("no response received for command {parent} within the timeout period")]
    Timeout { parent: String },

    #[error("client has been closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CourierError>;
