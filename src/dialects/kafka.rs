// Configuration contract of the reference log-broker dialect.
//
// The broker client itself is an external collaborator; this module owns
// the connection-string surface the runtime demands from it.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{CourierError, Result};

pub const BROKERS_KEY: &str = "brokers";
pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const INITIAL_OFFSET_KEY: &str = "initial-offset";
pub const RETRY_ON_PANIC_KEY: &str = "retry-on-panic";

/// Offset a fresh consumer group starts reading from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialOffset {
    #[default]
    Newest,
    Oldest,
}

impl FromStr for InitialOffset {
    type Err = CourierError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "newest" => Ok(InitialOffset::Newest),
            "oldest" => Ok(InitialOffset::Oldest),
            other => Err(CourierError::Config(format!(
                "unexpected initial offset {other:?}, expected \"newest\" or \"oldest\""
            ))),
        }
    }
}

/// Broker protocol version, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

/// Lowest broker version the runtime supports.
pub const MIN_VERSION: BrokerVersion = BrokerVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

impl FromStr for BrokerVersion {
    type Err = CourierError;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, '.');
        let mut component = |name: &str| -> Result<u16> {
            parts
                .next()
                .ok_or_else(|| {
                    CourierError::Config(format!("broker version {value:?} is missing its {name}"))
                })?
                .parse::<u16>()
                .map_err(|_| CourierError::Config(format!("invalid broker version {value:?}")))
        };

        Ok(BrokerVersion {
            major: component("major")?,
            minor: component("minor")?,
            patch: component("patch")?,
        })
    }
}

impl fmt::Display for BrokerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parsed connection options of the reference log-broker dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub group: String,
    pub version: BrokerVersion,
    pub initial_offset: InitialOffset,
    pub retry_on_panic: bool,
}

impl KafkaConfig {
    /// Parses a space-separated `key=value` connection string.
    ///
    /// `version` is required and must be at least 1.0.0; at least one broker
    /// must be given. Unknown keys are ignored with a warning.
    pub fn from_connection_string(connection: &str) -> Result<Self> {
        let mut brokers = Vec::new();
        let mut group = String::new();
        let mut version = None;
        let mut initial_offset = InitialOffset::default();
        let mut retry_on_panic = false;

        for token in connection.split_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                CourierError::Config(format!(
                    "malformed connection option {token:?}, expected key=value"
                ))
            })?;

            match key {
                BROKERS_KEY => {
                    brokers = value
                        .split(',')
                        .filter(|broker| !broker.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                GROUP_KEY => group = value.to_string(),
                VERSION_KEY => version = Some(value.parse::<BrokerVersion>()?),
                INITIAL_OFFSET_KEY => initial_offset = value.parse()?,
                RETRY_ON_PANIC_KEY => {
                    retry_on_panic = value.parse::<bool>().map_err(|_| {
                        CourierError::Config(format!("invalid retry-on-panic value {value:?}"))
                    })?;
                }
                unknown => {
                    warn!(
                        target: "courier::kafka",
                        key = unknown,
                        "ignoring unknown connection option"
                    );
                }
            }
        }

        let version = version.ok_or_else(|| {
            CourierError::Config("connection string is missing the required version".to_string())
        })?;
        if version < MIN_VERSION {
            return Err(CourierError::Config(format!(
                "broker version {version} is not supported, at least {MIN_VERSION} is required"
            )));
        }

        if brokers.is_empty() {
            return Err(CourierError::Config(
                "at least one broker needs to be specified".to_string(),
            ));
        }

        Ok(Self {
            brokers,
            group,
            version,
            initial_offset,
            retry_on_panic,
        })
    }
}
