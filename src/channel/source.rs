//! Source connector contract and dispatch-side configuration.
//!
//! Concrete transports (HTTP listeners, socket readers, file pollers) live
//! outside the core; they hold the channel and call
//! [`crate::channel::Channel::dispatch_raw_message`] when a payload
//! arrives. The reply hook is opaque to the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::message::{DataType, PassthroughDataType, Status};
use crate::script::{Filter, Transformer};

use super::destination::ConnectorError;

/// Source transport adapter contract.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Adapter display name.
    fn name(&self) -> &str;

    /// Starts accepting messages from the external peer.
    async fn start(&self) -> Result<(), ConnectorError>;

    /// Stops accepting messages.
    async fn stop(&self) -> Result<(), ConnectorError>;

    /// Sends a reply or acknowledgment back to the external peer.
    async fn reply(
        &self,
        response_status: Status,
        response_message: Option<String>,
    ) -> Result<(), ConnectorError>;
}

/// In-process source with no external transport.
///
/// Embedders dispatch into the channel directly; this adapter only
/// satisfies the lifecycle contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelReader;

#[async_trait]
impl SourceConnector for ChannelReader {
    fn name(&self) -> &str {
        "Channel Reader"
    }

    async fn start(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn reply(
        &self,
        _response_status: Status,
        _response_message: Option<String>,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Configuration for the source side of a channel.
#[derive(Clone)]
pub struct SourceSettings {
    /// Display name of the source connector.
    pub connector_name: String,
    /// `true`: the dispatch call runs the whole pipeline before returning.
    /// `false`: it returns once the message is persisted in RECEIVED and a
    /// background worker drains the source queue sequentially.
    pub respond_after_processing: bool,
    /// Capacity of the in-memory source queue.
    pub queue_buffer_size: usize,
    /// Source filter.
    pub filter: Filter,
    /// Source transformer.
    pub transformer: Transformer,
    /// Data type adapter for inbound payloads.
    pub data_type: Arc<dyn DataType>,
}

impl SourceSettings {
    /// A synchronous pass-through source.
    #[must_use]
    pub fn new(connector_name: impl Into<String>) -> Self {
        Self {
            connector_name: connector_name.into(),
            respond_after_processing: true,
            queue_buffer_size: 1_000,
            filter: Filter::accept_all(),
            transformer: Transformer::passthrough(),
            data_type: Arc::new(PassthroughDataType),
        }
    }
}

/// A raw inbound payload plus the transport's initial source map.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// The payload as received. Empty payloads are legal.
    pub raw: String,
    /// Initial source map entries supplied by the transport.
    pub source_map: HashMap<String, Value>,
}

impl RawMessage {
    /// Wraps a payload with an empty source map.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            source_map: HashMap::new(),
        }
    }

    /// Adds a source map entry.
    #[must_use]
    pub fn with_source_map_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.source_map.insert(key.into(), value);
        self
    }
}
