//! Persistence layer for channel messages.
//!
//! A fixed set of tables exists per channel, named after the channel's
//! local id (`D_M<n>`, `D_MM<n>`, `D_MC<n>`, `D_MA<n>`, `D_MS<n>`,
//! `D_MSQ<n>`, `D_MCM<n>`); the process-wide `D_CHANNELS` table maps the
//! validated channel uuid to its local id. Channel ids are validated at
//! the type level ([`crate::message::ChannelId`]) before any identifier
//! reaches a statement.
//!
//! Content persistence is gated by [`StorageSettings`]; message and
//! connector-message rows always persist so the recovery task can see
//! message boundaries. Multi-statement operations (`insert_dispatch`,
//! `recover_message`, `delete_message`, `reset_message`) run under a
//! transaction internally, one transaction per message.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{
    Attachment, ChannelId, ConnectorMessage, ContentType, Message, MessageContent, MessageId,
    MetaDataId, ServerId, Status,
};
use crate::settings::StorageSettings;

pub mod sqlite;

pub use sqlite::SqliteMessageStore;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error from the underlying driver.
    #[error("database error: {source}")]
    Database {
        /// Underlying driver error.
        #[from]
        source: sqlx::Error,
    },

    /// A channel was used before `register_channel`.
    #[error("channel not registered: {channel_id}")]
    ChannelNotRegistered {
        /// The unregistered channel.
        channel_id: ChannelId,
    },

    /// A map or content value failed to (de)serialize.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// A persisted row held a value the data model rejects.
    #[error("invalid row: {message}")]
    InvalidRow {
        /// What was wrong with the row.
        message: String,
    },

    /// The schema's presence contradicted the configured engine mode.
    #[error("schema mode violation: {message}")]
    SchemaMode {
        /// Which expectation was violated.
        message: String,
    },
}

/// One coalesced statistics delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsUpdate {
    /// Row to update; `0` is the source/channel-aggregate row.
    pub meta_data_id: MetaDataId,
    /// Tracked status column to touch. `QUEUED` folds into the `SENT`
    /// column for historical compatibility, though the accumulator never
    /// emits it.
    pub status: Status,
    /// Signed delta to apply.
    pub delta: i64,
}

/// One persisted statistics row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsRow {
    /// Connector the row belongs to; `0` is the source/aggregate row.
    pub meta_data_id: MetaDataId,
    /// Host the counts belong to.
    pub server_id: ServerId,
    /// RECEIVED count.
    pub received: i64,
    /// FILTERED count.
    pub filtered: i64,
    /// SENT count.
    pub sent: i64,
    /// ERROR count.
    pub error: i64,
}

/// A connector message resolved by the recovery sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredConnector {
    /// Which connector was recovered.
    pub meta_data_id: MetaDataId,
    /// Status the connector held before recovery (`RECEIVED` or
    /// `PENDING`).
    pub original_status: Status,
}

/// Error raised by a failed decrypt; the store degrades to plaintext
/// treatment instead of propagating it.
#[derive(Debug, Error)]
#[error("decrypt failed: {message}")]
pub struct EncryptError {
    /// Why the ciphertext could not be decrypted.
    pub message: String,
}

/// Content-at-rest encryption seam.
///
/// Applied before store and after load. Key management is configuration
/// policy outside the core: the store never rewraps.
pub trait Encryptor: Send + Sync {
    /// Encrypts plaintext for storage.
    fn encrypt(&self, plaintext: &str) -> String;

    /// Decrypts stored ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptError`] when the ciphertext cannot be decrypted;
    /// callers degrade to plaintext treatment.
    fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptError>;
}

/// Typed operations over the per-channel tables.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Ensures the channel is registered and its tables exist. Idempotent;
    /// returns the local channel id.
    async fn register_channel(&self, channel_id: &ChannelId) -> Result<i64, StoreError>;

    /// Drops the channel's tables and registry row.
    async fn drop_channel(&self, channel_id: &ChannelId) -> Result<(), StoreError>;

    /// Allocates the next message id from the channel's sequence.
    async fn next_message_id(&self, channel_id: &ChannelId) -> Result<MessageId, StoreError>;

    /// Persists a new message, its source connector message in `RECEIVED`,
    /// any initial content allowed by the storage settings, and the
    /// RECEIVED statistics increment — all in one transaction.
    async fn insert_dispatch(
        &self,
        message: &Message,
        source: &ConnectorMessage,
        settings: &StorageSettings,
    ) -> Result<(), StoreError>;

    /// Persists a destination connector message row.
    async fn insert_connector_message(
        &self,
        connector_message: &ConnectorMessage,
    ) -> Result<(), StoreError>;

    /// Persists the connector message's current status, send/response
    /// dates and error code. Terminal statuses already persisted are left
    /// untouched; only explicit reset operations reopen them.
    async fn update_status(&self, connector_message: &ConnectorMessage) -> Result<(), StoreError>;

    /// Persists the connector message's send attempt counters.
    async fn update_send_attempts(
        &self,
        connector_message: &ConnectorMessage,
    ) -> Result<(), StoreError>;

    /// Marks the message processed. Exactly-once is the caller's contract;
    /// the update is idempotent.
    async fn set_processed(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// Writes one content slot (insert-or-replace), encrypting when an
    /// encryptor is configured. The caller is responsible for storage-mode
    /// gating.
    async fn store_content(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content: &MessageContent,
    ) -> Result<(), StoreError>;

    /// Reads one content slot, decrypting when flagged. A failed decrypt
    /// logs and returns the stored text as plaintext.
    async fn get_content(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content_type: ContentType,
    ) -> Result<Option<MessageContent>, StoreError>;

    /// Persists the connector message's source/channel/connector maps as
    /// content rows, gated by `store_maps` (source map only on the source
    /// connector).
    async fn store_maps(
        &self,
        connector_message: &ConnectorMessage,
        settings: &StorageSettings,
    ) -> Result<(), StoreError>;

    /// Persists the connector message's response map, gated by
    /// `store_response_map`.
    async fn store_response_map(
        &self,
        connector_message: &ConnectorMessage,
        settings: &StorageSettings,
    ) -> Result<(), StoreError>;

    /// Loads a message and its connector message rows (no content).
    async fn get_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<Option<Message>, StoreError>;

    /// Ids of messages with `PROCESSED = 0` for the given host, oldest
    /// first.
    async fn get_unfinished_message_ids(
        &self,
        channel_id: &ChannelId,
        server_id: &ServerId,
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Loads `QUEUED` connector messages for one destination, oldest
    /// first, skipping the given message ids, with their content and maps
    /// attached.
    async fn get_queued_connector_messages(
        &self,
        channel_id: &ChannelId,
        meta_data_id: MetaDataId,
        exclude: &[MessageId],
        limit: u32,
    ) -> Result<Vec<ConnectorMessage>, StoreError>;

    /// Recovers one unfinished message in a dedicated transaction:
    /// `RECEIVED`/`PENDING` connector messages transition to `ERROR` with
    /// a `PROCESSING_ERROR` note, ERROR statistics increment, and the
    /// message is marked processed. Returns what was transitioned.
    async fn recover_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        settings: &StorageSettings,
    ) -> Result<Vec<RecoveredConnector>, StoreError>;

    /// Applies a batch of statistics deltas in one transaction, ordered by
    /// `meta_data_id` ascending so the aggregate row (`0`) is always first.
    async fn increment_statistics(
        &self,
        channel_id: &ChannelId,
        updates: &[StatisticsUpdate],
    ) -> Result<(), StoreError>;

    /// Reads all statistics rows for the channel.
    async fn get_statistics(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<StatisticsRow>, StoreError>;

    /// Zeros statistics for one connector, or the whole channel when
    /// `meta_data_id` is `None`.
    async fn reset_statistics(
        &self,
        channel_id: &ChannelId,
        meta_data_id: Option<MetaDataId>,
    ) -> Result<(), StoreError>;

    /// Reopens a message: `PROCESSED = 0`, destinations to `PENDING` with
    /// attempt counters cleared. Idempotent.
    async fn reset_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// Deletes a message and its children in child→parent order: content,
    /// attachments, custom metadata, connector messages, message.
    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// Completion cleanup: deletes all content for the message, or only
    /// content of terminally `FILTERED` connectors.
    async fn prune_completed_content(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        only_filtered: bool,
    ) -> Result<(), StoreError>;

    /// Persists an attachment, chunked into segments.
    async fn insert_attachment(
        &self,
        channel_id: &ChannelId,
        attachment: &Attachment,
    ) -> Result<(), StoreError>;

    /// Deletes all attachments of a message.
    async fn delete_attachments(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// Persists custom metadata columns for one connector message.
    async fn store_custom_metadata(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        values: &HashMap<String, String>,
    ) -> Result<(), StoreError>;
}
