//! # Interchange — a message integration engine
//!
//! A long-running server core that accepts messages on source connectors,
//! routes each message through a configurable per-channel pipeline of
//! filter, transformer and destination chains, and persists every step to
//! an embedded relational store so interrupted work is recovered after a
//! crash.
//!
//! The pipeline order is fixed per channel:
//!
//! ```text
//! raw input
//!   -> preprocessor
//!   -> source filter / transformer
//!   -> fan-out to destination chains (concurrent; sequential inside)
//!        filter -> transformer -> send -> response transformer
//!   -> postprocessor
//!   -> mark processed
//! ```
//!
//! Delivery is at-least-once: queue-enabled destinations requeue on
//! connection failures and may duplicate sends under retry. Unfinished
//! work is partitioned across hosts by a stable server id and swept by the
//! recovery task at channel start.

pub mod channel;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod globals;
pub mod message;
pub mod script;
pub mod settings;
pub mod statistics;
pub mod store;

pub use channel::{
    ChainConfig, Channel, ChannelConfig, ChannelError, ChannelReader, ChannelScripts,
    ConnectorError, DestinationConnector, DestinationQueue, DestinationSettings, QueueSettings,
    RawMessage, RecoveryReport, SourceConnector, SourceSettings,
};
pub use config::{EngineConfig, EngineMode};
pub use engine::{Engine, EngineError};
pub use error::{ErrorKind, SendError};
pub use globals::GlobalMaps;
pub use message::{
    Attachment, ChannelId, ConnectorMessage, ContentType, DataType, DestinationSet, Message,
    MessageContent, MessageId, MessageMap, MetaDataId, PassthroughDataType, ServerId, Status,
};
pub use script::{
    Filter, FilterOperator, FilterRule, InProcessScriptExecutor, ScriptError, ScriptExecutor,
    ScriptScope, Transformer, TransformerStep,
};
pub use settings::{StorageMode, StorageSettings};
pub use statistics::{MessageEvent, Statistics, StatusCounts};
pub use store::{MessageStore, SqliteMessageStore, StoreError};
