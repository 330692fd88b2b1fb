//! Core message data model.
//!
//! A [`Message`] is the unit of work a channel processes; it owns one
//! [`ConnectorMessage`] per connector, keyed by metadata id (`0` is the
//! source, positive ids are destinations). Back-references are avoided by
//! keeping the `metadata id -> connector message` arena on the message and
//! letting connector messages hold only their own map handles.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nutype::nutype;
use uuid::Uuid;

pub mod content;
pub mod maps;
pub mod status;

pub use content::{ContentType, DataType, DataTypeError, MessageContent, PassthroughDataType};
pub use maps::{DestinationSet, MessageMap};
pub use status::Status;

/// Per-channel 64-bit message identifier allocated from the channel's
/// sequence table.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(i64);

/// Connector identifier within a channel; `0` is the source.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MetaDataId(u32);

impl MetaDataId {
    /// The source connector's metadata id.
    #[must_use]
    pub fn source() -> Self {
        Self::new(0)
    }

    /// Whether this id addresses the source connector.
    #[must_use]
    pub fn is_source(self) -> bool {
        self.into_inner() == 0
    }
}

/// Channel identifier; uuid-shaped, validated before it is ever
/// interpolated into a table name.
#[nutype(
    validate(predicate = |id: &str| {
        !id.is_empty()
            && id.len() <= 64
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct ChannelId(String);

/// Stable per-host identifier partitioning unfinished work across a
/// cluster.
#[nutype(
    validate(predicate = |id: &str| !id.is_empty() && id.len() <= 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct ServerId(String);

/// One message traversing a channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// Sequence-allocated identifier, unique per channel.
    pub message_id: MessageId,
    /// Owning channel.
    pub channel_id: ChannelId,
    /// Host that received the message.
    pub server_id: ServerId,
    /// Receipt timestamp, millisecond precision.
    pub received_date: DateTime<Utc>,
    /// Flips to true exactly once, after the postprocessor (or recovery).
    pub processed: bool,
    /// Source message id when this message was created by reprocessing.
    pub original_id: Option<MessageId>,
    /// Source message id when this message was imported.
    pub import_id: Option<MessageId>,
    /// Connector messages by metadata id; `0` is the source.
    pub connector_messages: BTreeMap<MetaDataId, ConnectorMessage>,
}

impl Message {
    /// Creates an unprocessed message shell.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        channel_id: ChannelId,
        server_id: ServerId,
        received_date: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            channel_id,
            server_id,
            received_date,
            processed: false,
            original_id: None,
            import_id: None,
            connector_messages: BTreeMap::new(),
        }
    }

    /// The source connector message, when dispatched.
    #[must_use]
    pub fn source_connector_message(&self) -> Option<&ConnectorMessage> {
        self.connector_messages.get(&MetaDataId::source())
    }

    /// Inserts a connector message into the arena, replacing any previous
    /// entry for the same metadata id.
    pub fn insert_connector_message(&mut self, connector_message: ConnectorMessage) {
        self.connector_messages
            .insert(connector_message.meta_data_id, connector_message);
    }
}

/// Per-connector state of a message: status, maps, and in-memory content
/// slots.
#[derive(Debug, Clone)]
pub struct ConnectorMessage {
    /// Owning message id.
    pub message_id: MessageId,
    /// Connector identity within the channel.
    pub meta_data_id: MetaDataId,
    /// Owning channel.
    pub channel_id: ChannelId,
    /// Display name of the connector.
    pub connector_name: String,
    /// Host that received the owning message.
    pub server_id: ServerId,
    /// Receipt timestamp of the owning message.
    pub received_date: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: Status,
    /// Number of send attempts performed so far.
    pub send_attempts: u32,
    /// Timestamp of the most recent send attempt.
    pub send_date: Option<DateTime<Utc>>,
    /// Timestamp of the most recent response receipt.
    pub response_date: Option<DateTime<Utc>>,
    /// Connector-specific error code, `0` when none.
    pub error_code: i32,
    /// Chain this connector message belongs to; `0` for the source.
    pub chain_id: u32,
    /// Position within the chain; `0` for the source.
    pub order_id: u32,
    /// Immutable after dispatch; shared across all connector messages.
    pub source_map: MessageMap,
    /// Shared by reference within a chain, copied by value into new chains.
    pub channel_map: MessageMap,
    /// Fresh per connector.
    pub connector_map: MessageMap,
    /// Shared across a chain, keyed by destination name.
    pub response_map: MessageMap,
    content: BTreeMap<ContentType, MessageContent>,
}

impl ConnectorMessage {
    /// Creates the source connector message in `RECEIVED`.
    #[must_use]
    pub fn source(
        message_id: MessageId,
        channel_id: ChannelId,
        server_id: ServerId,
        connector_name: impl Into<String>,
        received_date: DateTime<Utc>,
        source_map: MessageMap,
    ) -> Self {
        Self {
            message_id,
            meta_data_id: MetaDataId::source(),
            channel_id,
            connector_name: connector_name.into(),
            server_id,
            received_date,
            status: Status::Received,
            send_attempts: 0,
            send_date: None,
            response_date: None,
            error_code: 0,
            chain_id: 0,
            order_id: 0,
            source_map,
            channel_map: MessageMap::new(),
            connector_map: MessageMap::new(),
            response_map: MessageMap::new(),
            content: BTreeMap::new(),
        }
    }

    /// Creates a destination connector message, wiring the map handles per
    /// the chain sharing rules. The caller decides which handles are shared
    /// and which are forked.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn destination(
        message_id: MessageId,
        meta_data_id: MetaDataId,
        channel_id: ChannelId,
        server_id: ServerId,
        connector_name: impl Into<String>,
        received_date: DateTime<Utc>,
        chain_id: u32,
        order_id: u32,
        source_map: MessageMap,
        channel_map: MessageMap,
        response_map: MessageMap,
    ) -> Self {
        Self {
            message_id,
            meta_data_id,
            channel_id,
            connector_name: connector_name.into(),
            server_id,
            received_date,
            status: Status::Received,
            send_attempts: 0,
            send_date: None,
            response_date: None,
            error_code: 0,
            chain_id,
            order_id,
            source_map,
            channel_map,
            connector_map: MessageMap::new(),
            response_map,
            content: BTreeMap::new(),
        }
    }

    /// Writes a content slot, overwriting any previous value.
    pub fn set_content(&mut self, content: MessageContent) {
        self.content.insert(content.content_type, content);
    }

    /// Reads a content slot.
    #[must_use]
    pub fn content(&self, content_type: ContentType) -> Option<&MessageContent> {
        self.content.get(&content_type)
    }

    /// Convenience accessor for a slot's text.
    #[must_use]
    pub fn content_text(&self, content_type: ContentType) -> Option<&str> {
        self.content.get(&content_type).map(|c| c.content.as_str())
    }
}

/// A (possibly large) attachment extracted from a message payload.
///
/// Persistence chunks the body into fixed-size segments keyed by
/// `(id, message_id, segment_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Attachment identifier, unique within the message.
    pub id: String,
    /// Owning message.
    pub message_id: MessageId,
    /// MIME type of the body.
    pub mime_type: String,
    /// The attachment body.
    pub body: Bytes,
}

impl Attachment {
    /// Creates an attachment with a generated identifier.
    #[must_use]
    pub fn new(message_id: MessageId, mime_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id,
            mime_type: mime_type.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_id() -> ChannelId {
        ChannelId::try_new("0b4e1f6c-2f60-4a3b-9f2d-1c8a5b7d9e01".to_string()).unwrap()
    }

    fn server_id() -> ServerId {
        ServerId::try_new("node-a".to_string()).unwrap()
    }

    #[test]
    fn test_should_reject_unsafe_input_when_validating_channel_id() {
        // Channel ids are interpolated into table names after validation.
        assert!(ChannelId::try_new("abc; DROP TABLE D_CHANNELS".to_string()).is_err());
        assert!(ChannelId::try_new(String::new()).is_err());
        assert!(ChannelId::try_new("0b4e1f6c-2f60-4a3b-9f2d-1c8a5b7d9e01".to_string()).is_ok());
    }

    #[test]
    fn test_should_start_unprocessed_when_creating_message() {
        let message = Message::new(
            MessageId::new(1),
            channel_id(),
            server_id(),
            Utc::now(),
        );
        assert!(!message.processed);
        assert!(message.source_connector_message().is_none());
    }

    #[test]
    fn test_should_key_source_at_zero_when_inserting_connector_messages() {
        let mut message = Message::new(MessageId::new(7), channel_id(), server_id(), Utc::now());
        let source = ConnectorMessage::source(
            message.message_id,
            channel_id(),
            server_id(),
            "Source",
            message.received_date,
            MessageMap::new(),
        );
        message.insert_connector_message(source);

        let source = message.source_connector_message().unwrap();
        assert!(source.meta_data_id.is_source());
        assert_eq!(source.status, Status::Received);
    }

    #[test]
    fn test_should_overwrite_slot_when_setting_content_twice() {
        let mut cm = ConnectorMessage::source(
            MessageId::new(1),
            channel_id(),
            server_id(),
            "Source",
            Utc::now(),
            MessageMap::new(),
        );
        cm.set_content(MessageContent::new(ContentType::Raw, "first"));
        cm.set_content(MessageContent::new(ContentType::Raw, "second"));
        assert_eq!(cm.content_text(ContentType::Raw), Some("second"));
    }
}
