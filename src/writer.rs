// Writer: handler-facing API for emitting derived messages
use crate::group::Group;
use crate::message::{Message, MessageKind, StatusCode};
use crate::Result;

/// Emits messages derived from one inbound message.
///
/// Every produced message carries the inbound id as parent, the inbound
/// transport timestamp as parent timestamp, and inherits the user headers
/// and middleware carriers of the inbound context. `event`, `event_eos` and
/// `error` acknowledge the inbound message once the publish succeeded;
/// `command` leaves the resolution to the handler.
pub struct Writer {
    group: Group,
    inbound: Message,
}

impl Writer {
    pub(crate) fn new(group: Group, inbound: Message) -> Self {
        Self { group, inbound }
    }

    /// The message this writer derives from.
    pub fn inbound(&self) -> &Message {
        &self.inbound
    }

    /// Produces a response event to every produce-mode event topic of the
    /// group and acknowledges the inbound message.
    pub async fn event(
        &self,
        action: &str,
        version: u8,
        key: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<Message> {
        let message = self.derive(MessageKind::Event, action, version, key, data);
        let produced = self.group.produce_event(message).await?;
        self.inbound.ack();
        Ok(produced)
    }

    /// As [`event`](Self::event), additionally marking the produced event as
    /// the last of a streamed response.
    pub async fn event_eos(
        &self,
        action: &str,
        version: u8,
        key: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<Message> {
        let mut message = self.derive(MessageKind::Event, action, version, key, data);
        message.eos = true;
        let produced = self.group.produce_event(message).await?;
        self.inbound.ack();
        Ok(produced)
    }

    /// Produces a single terminal failure event carrying the given 4xx/5xx
    /// status and acknowledges the inbound message.
    pub async fn error(&self, action: &str, status: StatusCode, data: Vec<u8>) -> Result<Message> {
        let mut message = self.derive(MessageKind::Event, action, self.inbound.version, Vec::new(), data);
        message.status = status;
        message.eos = true;
        let produced = self.group.produce_event(message).await?;
        self.inbound.ack();
        Ok(produced)
    }

    /// Produces a downstream command. The inbound message is left
    /// unresolved; the handler remains responsible for it.
    pub async fn command(
        &self,
        action: &str,
        version: u8,
        key: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<Message> {
        let message = self.derive(MessageKind::Command, action, version, key, data);
        self.group.produce_command(message).await
    }

    fn derive(
        &self,
        kind: MessageKind,
        action: &str,
        version: u8,
        key: Vec<u8>,
        data: Vec<u8>,
    ) -> Message {
        let mut message = Message::new(kind, action, version, data);
        message.key = key;
        message.context = self.inbound.context.derived();
        message.context.set_parent_id(self.inbound.id.clone());
        message.context.set_parent_timestamp(self.inbound.timestamp);
        message
    }
}
