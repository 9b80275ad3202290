// Envelope codec: Message <-> transport record
use chrono::{DateTime, Utc};

use crate::message::{Message, StatusCode};
use crate::topic::Topic;

/// Reserved record header carrying the message id.
pub const HEADER_ID: &str = "cmdr_id";
/// Reserved record header carrying the action name.
pub const HEADER_ACTION: &str = "cmdr_action";
/// Reserved record header carrying the payload schema version.
pub const HEADER_VERSION: &str = "cmdr_version";
/// Reserved record header carrying the status code.
pub const HEADER_STATUS: &str = "cmdr_status";
/// Reserved record header carrying the end-of-stream flag.
pub const HEADER_EOS: &str = "cmdr_eos";
/// Reserved record header carrying the parent message id.
pub const HEADER_PARENT: &str = "cmdr_parent";
/// Reserved record header carrying the parent timestamp in nanoseconds.
pub const HEADER_PARENT_TIMESTAMP: &str = "cmdr_command_timestamp";

/// Divider byte joining the values of a multi-value user header.
pub const HEADER_VALUE_DIVIDER: u8 = 0x1f;

/// A transport record: the wire shape of a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

/// Encodes a message into its transport record.
///
/// All reserved headers are emitted; zero status and version are valid wire
/// values. The parent pair is emitted only when present in the message
/// context. An empty key is defaulted from the message id.
pub fn encode(message: &Message) -> Record {
    let mut headers = vec![
        (HEADER_ID.to_string(), message.id.clone().into_bytes()),
        (HEADER_ACTION.to_string(), message.action.clone().into_bytes()),
        (
            HEADER_VERSION.to_string(),
            message.version.to_string().into_bytes(),
        ),
        (
            HEADER_STATUS.to_string(),
            message.status.to_string().into_bytes(),
        ),
        (HEADER_EOS.to_string(), message.eos.to_string().into_bytes()),
    ];

    if let Some(parent) = message.context.parent_id() {
        headers.push((HEADER_PARENT.to_string(), parent.as_bytes().to_vec()));
    }

    if let Some(timestamp) = message.context.parent_timestamp() {
        let nanos = timestamp.timestamp_nanos_opt().unwrap_or_default();
        headers.push((
            HEADER_PARENT_TIMESTAMP.to_string(),
            nanos.to_string().into_bytes(),
        ));
    }

    for (key, values) in message.context.headers() {
        headers.push((key.clone(), join_values(values)));
    }

    let key = if message.key.is_empty() {
        message.id.clone().into_bytes()
    } else {
        message.key.clone()
    };

    Record {
        topic: message.topic.name.clone(),
        key,
        value: message.data.clone(),
        headers,
        partition: message.partition,
        offset: message.offset,
        timestamp: message.timestamp,
    }
}

/// Decodes a transport record into a message bound to the given topic.
///
/// Unknown headers become user headers. A parse failure on a numeric
/// reserved header is non-fatal: the field keeps its zero value. Duplicate
/// reserved headers resolve last-write-wins.
pub fn decode(record: Record, topic: Topic) -> Message {
    let mut message = Message::new(topic.kind, "", 0, record.value);
    message.id = String::new();
    message.key = record.key;
    message.topic = topic;
    message.timestamp = record.timestamp;
    message.partition = record.partition;
    message.offset = record.offset;

    for (key, value) in record.headers {
        match key.as_str() {
            HEADER_ID => message.id = String::from_utf8_lossy(&value).into_owned(),
            HEADER_ACTION => message.action = String::from_utf8_lossy(&value).into_owned(),
            HEADER_VERSION => {
                if let Ok(version) = String::from_utf8_lossy(&value).parse::<u8>() {
                    message.version = version;
                }
            }
            HEADER_STATUS => {
                if let Ok(status) = String::from_utf8_lossy(&value).parse::<u16>() {
                    message.status = StatusCode(status);
                }
            }
            HEADER_EOS => message.eos = value == b"true",
            HEADER_PARENT => {
                message
                    .context
                    .set_parent_id(String::from_utf8_lossy(&value).into_owned());
            }
            HEADER_PARENT_TIMESTAMP => {
                if let Ok(nanos) = String::from_utf8_lossy(&value).parse::<i64>() {
                    message
                        .context
                        .set_parent_timestamp(DateTime::from_timestamp_nanos(nanos));
                }
            }
            _ => {
                message.context.set_header(key, split_values(&value));
            }
        }
    }

    message
}

fn join_values(values: &[String]) -> Vec<u8> {
    let mut joined = Vec::new();
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            joined.push(HEADER_VALUE_DIVIDER);
        }
        joined.extend_from_slice(value.as_bytes());
    }
    joined
}

fn split_values(value: &[u8]) -> Vec<String> {
    value
        .split(|byte| *byte == HEADER_VALUE_DIVIDER)
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}
