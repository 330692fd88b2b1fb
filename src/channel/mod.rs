//! Channel: the unit of configuration and lifecycle.
//!
//! A channel owns one source connector, an ordered list of destination
//! chains, scripts, storage settings and queues. Dispatch runs the fixed
//! pipeline order: preprocessor, source filter/transformer, concurrent
//! fan-out to chains (sequential inside a chain), postprocessor, mark
//! processed. Every step persists through the store so the recovery sweep
//! can resolve interrupted work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::message::{
    ChannelId, ConnectorMessage, ContentType, DestinationSet, Message, MessageContent, MessageId,
    MessageMap, MetaDataId, ServerId, Status,
};
use crate::script::{
    FilterTransformerOutcome, ScriptError, ScriptExecutor, ScriptScope, run_filter_transformer,
};
use crate::settings::StorageSettings;
use crate::statistics::{MessageEvent, Statistics, StatusCounts};
use crate::store::{MessageStore, StoreError};

pub mod chain;
pub mod destination;
pub mod queue;
pub mod recovery;
pub mod source;

pub use chain::{ChainInput, DestinationChain};
pub use destination::{
    ConnectorError, Destination, DestinationConnector, DestinationSettings,
};
pub use queue::{DestinationQueue, QueueSettings};
pub use recovery::{RecoveryReport, run_recovery};
pub use source::{ChannelReader, RawMessage, SourceConnector, SourceSettings};

use destination::DestinationContext;

/// Channel-level errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A connector lifecycle operation failed.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// A lifecycle script failed during deploy/undeploy.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The channel configuration is inconsistent.
    #[error("invalid channel configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid channel state: {message}")]
    InvalidState {
        /// Which transition was rejected.
        message: String,
    },

    /// A dispatched message lost its source connector message.
    #[error("message {message_id} has no source connector message")]
    MissingSource {
        /// The malformed message.
        message_id: MessageId,
    },
}

/// Channel lifecycle scripts. All optional.
#[derive(Debug, Clone, Default)]
pub struct ChannelScripts {
    /// Runs once at channel start, before recovery.
    pub deploy: Option<String>,
    /// Runs once at channel stop, after draining.
    pub undeploy: Option<String>,
    /// Process-wide preprocessor, runs before the channel preprocessor.
    pub global_preprocessor: Option<String>,
    /// Channel preprocessor.
    pub preprocessor: Option<String>,
    /// Channel postprocessor, runs before the global postprocessor.
    pub postprocessor: Option<String>,
    /// Process-wide postprocessor.
    pub global_postprocessor: Option<String>,
}

/// One ordered group of destinations.
#[derive(Clone, Default)]
pub struct ChainConfig {
    /// The chain's destinations in execution order.
    pub destinations: Vec<DestinationSettings>,
}

/// Full channel configuration.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Validated channel identifier.
    pub channel_id: ChannelId,
    /// Display name.
    pub name: String,
    /// Host identifier for cluster partitioning.
    pub server_id: ServerId,
    /// Storage policy.
    pub storage: StorageSettings,
    /// Lifecycle scripts.
    pub scripts: ChannelScripts,
    /// Source-side configuration.
    pub source: SourceSettings,
    /// Destination chains; at least one destination overall.
    pub chains: Vec<ChainConfig>,
    /// Whether statistics emit [`MessageEvent`]s.
    pub send_events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Stopped,
    Started,
}

/// A deployed channel.
pub struct Channel {
    channel_id: ChannelId,
    name: String,
    server_id: ServerId,
    storage: StorageSettings,
    scripts: ChannelScripts,
    source_settings: SourceSettings,
    source_connector: Arc<dyn SourceConnector>,
    chains: Vec<Arc<DestinationChain>>,
    destinations: Vec<Arc<Destination>>,
    store: Arc<dyn MessageStore>,
    statistics: Arc<Statistics>,
    executor: Arc<dyn ScriptExecutor>,
    state: Mutex<ChannelState>,
    source_queue_tx: Mutex<Option<mpsc::Sender<Message>>>,
    source_worker: Mutex<Option<JoinHandle<()>>>,
    halt_tx: watch::Sender<bool>,
}

impl Channel {
    /// Wires a channel from its configuration and adapters.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] when chains are empty,
    /// metadata ids collide or are zero, or an adapter is missing.
    pub fn new(
        config: ChannelConfig,
        source_connector: Arc<dyn SourceConnector>,
        destination_connectors: HashMap<MetaDataId, Arc<dyn DestinationConnector>>,
        store: Arc<dyn MessageStore>,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Result<Arc<Self>, ChannelError> {
        if config.chains.iter().all(|chain| chain.destinations.is_empty()) {
            return Err(ChannelError::Configuration {
                message: "a channel needs at least one destination".to_string(),
            });
        }

        let statistics = Arc::new(Statistics::new(
            config.channel_id.clone(),
            config.send_events,
        ));
        let (halt_tx, halt_rx) = watch::channel(false);

        let mut seen = std::collections::HashSet::new();
        let mut chains = Vec::with_capacity(config.chains.len());
        let mut all_destinations = Vec::new();
        for (chain_index, chain_config) in config.chains.iter().enumerate() {
            let mut chain_destinations = Vec::with_capacity(chain_config.destinations.len());
            for settings in &chain_config.destinations {
                let meta = settings.meta_data_id;
                if meta.is_source() {
                    return Err(ChannelError::Configuration {
                        message: format!("destination '{}' uses the source metadata id", settings.name),
                    });
                }
                if !seen.insert(meta) {
                    return Err(ChannelError::Configuration {
                        message: format!("duplicate metadata id {meta}"),
                    });
                }
                let connector = destination_connectors.get(&meta).cloned().ok_or_else(|| {
                    ChannelError::Configuration {
                        message: format!("no connector supplied for destination '{}'", settings.name),
                    }
                })?;
                let destination = Destination::new(
                    settings.clone(),
                    connector,
                    DestinationContext {
                        channel_id: config.channel_id.clone(),
                        channel_name: config.name.clone(),
                        store: store.clone(),
                        statistics: statistics.clone(),
                        storage: config.storage.clone(),
                        executor: executor.clone(),
                        halt: halt_rx.clone(),
                    },
                );
                chain_destinations.push(destination.clone());
                all_destinations.push(destination);
            }
            if chain_destinations.is_empty() {
                continue;
            }
            chains.push(Arc::new(DestinationChain {
                chain_id: chain_index as u32 + 1,
                destinations: chain_destinations,
                channel_id: config.channel_id.clone(),
                server_id: config.server_id.clone(),
                channel_name: config.name.clone(),
                store: store.clone(),
                statistics: statistics.clone(),
                storage: config.storage.clone(),
                executor: executor.clone(),
            }));
        }

        Ok(Arc::new(Self {
            channel_id: config.channel_id,
            name: config.name,
            server_id: config.server_id,
            storage: config.storage,
            scripts: config.scripts,
            source_settings: config.source,
            source_connector,
            chains,
            destinations: all_destinations,
            store,
            statistics,
            executor,
            state: Mutex::new(ChannelState::Stopped),
            source_queue_tx: Mutex::new(None),
            source_worker: Mutex::new(None),
            halt_tx,
        }))
    }

    /// The channel's identifier.
    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Subscribes to message events.
    #[must_use]
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<MessageEvent> {
        self.statistics.subscribe()
    }

    /// Snapshot of the channel-aggregate counters.
    #[must_use]
    pub fn get_statistics(&self) -> StatusCounts {
        self.statistics.channel_aggregate()
    }

    /// Per-connector counters.
    #[must_use]
    pub fn get_connector_statistics(&self, meta_data_id: MetaDataId) -> StatusCounts {
        self.statistics.counts(meta_data_id)
    }

    /// The queue of a queue-enabled destination.
    #[must_use]
    pub fn destination_queue(&self, meta_data_id: MetaDataId) -> Option<Arc<DestinationQueue>> {
        self.destinations
            .iter()
            .find(|destination| destination.settings.meta_data_id == meta_data_id)
            .and_then(|destination| destination.queue().cloned())
    }

    /// Starts the channel: tables, deploy script, recovery sweep,
    /// destinations before source, then the source queue worker when
    /// responses do not wait for processing.
    ///
    /// # Errors
    ///
    /// Fails when the store, a lifecycle script, or a connector fails;
    /// partial starts are torn down by the caller via [`Self::halt`].
    #[instrument(skip(self), fields(channel = %self.name))]
    pub async fn start(self: Arc<Self>) -> Result<RecoveryReport, ChannelError> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if *state == ChannelState::Started {
                return Err(ChannelError::InvalidState {
                    message: "channel is already started".to_string(),
                });
            }
        }
        let _ = self.halt_tx.send(false);

        self.store.register_channel(&self.channel_id).await?;

        if let Some(deploy) = self.scripts.deploy.clone() {
            let mut scope = self.lifecycle_scope();
            self.executor.execute(&deploy, &mut scope).await?;
        }

        let report = if self.storage.message_recovery_enabled {
            run_recovery(
                self.store.as_ref(),
                &self.channel_id,
                &self.server_id,
                &self.storage,
            )
            .await?
        } else {
            RecoveryReport::default()
        };

        self.statistics
            .load(&self.store.get_statistics(&self.channel_id).await?);

        // Destinations come up before the source so nothing arrives with
        // nowhere to go.
        for destination in &self.destinations {
            Arc::clone(destination).start().await?;
        }
        self.source_connector.start().await?;

        if !self.source_settings.respond_after_processing {
            let (tx, mut rx) = mpsc::channel::<Message>(self.source_settings.queue_buffer_size);
            let channel = Arc::clone(&self);
            let worker = tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let message_id = message.message_id;
                    if let Err(e) = channel.process_message(message).await {
                        error!(%message_id, error = %e, "source queue processing failed");
                    }
                }
                debug!("source queue worker drained");
            });
            *self.source_queue_tx.lock().expect("queue lock poisoned") = Some(tx);
            *self.source_worker.lock().expect("worker lock poisoned") = Some(worker);
        }

        *self.state.lock().expect("state lock poisoned") = ChannelState::Started;
        info!(recovered = report.recovered, "channel started");
        Ok(report)
    }

    /// Graceful stop: the source stops accepting, the source queue drains,
    /// destinations finish their in-flight message, the undeploy script
    /// runs.
    ///
    /// # Errors
    ///
    /// Propagates connector stop failures; draining continues regardless.
    #[instrument(skip(self), fields(channel = %self.name))]
    pub async fn stop(&self) -> Result<(), ChannelError> {
        self.source_connector.stop().await?;

        let sender = self.source_queue_tx.lock().expect("queue lock poisoned").take();
        drop(sender);
        let worker = self.source_worker.lock().expect("worker lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        for destination in self.destinations.iter().rev() {
            destination.stop().await?;
        }

        if let Some(undeploy) = self.scripts.undeploy.clone() {
            let mut scope = self.lifecycle_scope();
            if let Err(e) = self.executor.execute(&undeploy, &mut scope).await {
                warn!(error = %e, "undeploy script failed");
            }
        }

        if let Err(e) = self.statistics.flush(self.store.as_ref()).await {
            warn!(error = %e, "final statistics flush failed");
        }

        *self.state.lock().expect("state lock poisoned") = ChannelState::Stopped;
        info!("channel stopped");
        Ok(())
    }

    /// Forceful stop: outstanding sends are aborted, the source queue
    /// worker is cancelled mid-message.
    #[instrument(skip(self), fields(channel = %self.name))]
    pub async fn halt(&self) -> Result<(), ChannelError> {
        let _ = self.halt_tx.send(true);

        self.source_connector.stop().await?;
        let sender = self.source_queue_tx.lock().expect("queue lock poisoned").take();
        drop(sender);
        let worker = self.source_worker.lock().expect("worker lock poisoned").take();
        if let Some(worker) = worker {
            worker.abort();
        }

        for destination in self.destinations.iter().rev() {
            destination.halt().await?;
        }

        *self.state.lock().expect("state lock poisoned") = ChannelState::Stopped;
        info!("channel halted");
        Ok(())
    }

    /// Accepts a raw message from the source transport.
    ///
    /// Persists the message and its source connector message in one
    /// transaction, then either runs the pipeline synchronously
    /// (`respond_after_processing`) or hands the message to the source
    /// queue worker and returns immediately. Without a running source
    /// queue the call falls through to synchronous processing.
    ///
    /// # Errors
    ///
    /// Fails when the dispatch transaction cannot be persisted.
    #[instrument(skip(self, raw), fields(channel = %self.name))]
    pub async fn dispatch_raw_message(&self, raw: RawMessage) -> Result<Message, ChannelError> {
        let message_id = self.store.next_message_id(&self.channel_id).await?;
        let received_date = Utc::now();
        let source_map = MessageMap::from_entries(raw.source_map);

        let mut message = Message::new(
            message_id,
            self.channel_id.clone(),
            self.server_id.clone(),
            received_date,
        );
        let mut source = ConnectorMessage::source(
            message_id,
            self.channel_id.clone(),
            self.server_id.clone(),
            self.source_settings.connector_name.clone(),
            received_date,
            source_map,
        );
        source.set_content(MessageContent::new(ContentType::Raw, raw.raw));

        self.store
            .insert_dispatch(&message, &source, &self.storage)
            .await?;
        self.statistics
            .record_persisted(MetaDataId::source(), Status::Received);
        message.insert_connector_message(source);
        debug!(%message_id, "message dispatched");

        if !self.source_settings.respond_after_processing {
            let sender = self
                .source_queue_tx
                .lock()
                .expect("queue lock poisoned")
                .clone();
            if let Some(sender) = sender {
                if sender.send(message.clone()).await.is_ok() {
                    // Ack as soon as RECEIVED is durable.
                    if let Err(e) = self.source_connector.reply(Status::Received, None).await {
                        warn!(error = %e, "source reply failed");
                    }
                    return Ok(message);
                }
                // Worker gone; fall through to synchronous processing.
            }
        }

        let message = self.process_message(message).await?;
        let response_status = message
            .source_connector_message()
            .map_or(Status::Error, |cm| cm.status);
        if let Err(e) = self.source_connector.reply(response_status, None).await {
            warn!(error = %e, "source reply failed");
        }
        Ok(message)
    }

    /// Runs the pipeline for a dispatched message.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; script and send failures are recorded
    /// on the message itself.
    pub(crate) async fn process_message(&self, mut message: Message) -> Result<Message, ChannelError> {
        let message_id = message.message_id;
        let mut source = message
            .connector_messages
            .remove(&MetaDataId::source())
            .ok_or(ChannelError::MissingSource { message_id })?;

        let raw_text = source
            .content_text(ContentType::Raw)
            .unwrap_or_default()
            .to_string();

        // Preprocessors: global first, then channel. A null/undefined
        // result means "unchanged"; a thrown error stops the message but
        // not the postprocessor.
        let mut current = raw_text.clone();
        let mut preprocessor_error: Option<ScriptError> = None;
        let preprocessors = [
            self.scripts.global_preprocessor.clone(),
            self.scripts.preprocessor.clone(),
        ];
        for script in preprocessors.iter().flatten() {
            let mut scope = self.source_scope(&source, current.clone(), None);
            match self.executor.execute(script, &mut scope).await {
                Ok(Value::String(changed)) => current = changed,
                Ok(_) => {}
                Err(e) => {
                    preprocessor_error = Some(e);
                    break;
                }
            }
        }
        if current != raw_text {
            source.set_content(MessageContent::new(ContentType::ProcessedRaw, current.clone()));
            if self.storage.stores_content(ContentType::ProcessedRaw, true) {
                let content = MessageContent::new(ContentType::ProcessedRaw, current.clone());
                if let Err(e) = self
                    .store
                    .store_content(&self.channel_id, message_id, MetaDataId::source(), &content)
                    .await
                {
                    warn!(error = %e, "failed to store processed raw");
                }
            }
        }

        let destination_set = DestinationSet::new(self.destinations.iter().map(|destination| {
            (
                destination.settings.name.clone(),
                destination.settings.meta_data_id,
            )
        }));

        if let Some(e) = preprocessor_error {
            self.record_source_error(&mut source, &e.to_string()).await;
        } else {
            self.run_source_stage(&mut source, &current, &destination_set)
                .await;
        }

        // Postprocessors: channel first, then global. Failures are
        // recorded without canceling each other.
        let postprocessors = [
            self.scripts.postprocessor.clone(),
            self.scripts.global_postprocessor.clone(),
        ];
        for script in postprocessors.iter().flatten() {
            let mut scope = self.source_scope(&source, current.clone(), None);
            match self.executor.execute(script, &mut scope).await {
                Ok(Value::String(response)) => {
                    source.set_content(MessageContent::new(
                        ContentType::ProcessedResponse,
                        response.clone(),
                    ));
                    if self.storage.stores_content(ContentType::ProcessedResponse, true) {
                        let content =
                            MessageContent::new(ContentType::ProcessedResponse, response);
                        if let Err(e) = self
                            .store
                            .store_content(
                                &self.channel_id,
                                message_id,
                                MetaDataId::source(),
                                &content,
                            )
                            .await
                        {
                            warn!(error = %e, "failed to store processed response");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "postprocessor failed");
                    let note =
                        MessageContent::new(ContentType::PostprocessorError, e.to_string());
                    if let Err(store_error) = self
                        .store
                        .store_content(&self.channel_id, message_id, MetaDataId::source(), &note)
                        .await
                    {
                        warn!(error = %store_error, "failed to store postprocessor error");
                    }
                }
            }
        }

        if let Err(e) = self.store.store_response_map(&source, &self.storage).await {
            warn!(error = %e, "failed to store source response map");
        }

        self.store.set_processed(&self.channel_id, message_id).await?;
        message.processed = true;
        message.insert_connector_message(source);

        completion_cleanup(
            self.store.as_ref(),
            &self.storage,
            &self.channel_id,
            message_id,
        )
        .await;

        if let Err(e) = self.statistics.flush(self.store.as_ref()).await {
            warn!(error = %e, "statistics flush failed");
        }

        Ok(self
            .store
            .get_message(&self.channel_id, message_id)
            .await?
            .unwrap_or(message))
    }

    /// Source filter/transform plus fan-out.
    async fn run_source_stage(
        &self,
        source: &mut ConnectorMessage,
        current: &str,
        destination_set: &DestinationSet,
    ) {
        let xml = match self.source_settings.data_type.to_xml(current) {
            Ok(xml) => xml,
            Err(e) => {
                self.record_source_error(source, &e.to_string()).await;
                return;
            }
        };

        let mut scope = self.source_scope(source, xml, Some(destination_set.clone()));
        let outcome = run_filter_transformer(
            self.executor.as_ref(),
            &self.source_settings.filter,
            &self.source_settings.transformer,
            self.source_settings.data_type.as_ref(),
            &mut scope,
        )
        .await;

        match outcome {
            Ok(FilterTransformerOutcome::Rejected) => {
                source.status = Status::Filtered;
                if let Err(e) = self.store.update_status(source).await {
                    warn!(error = %e, "failed to persist filtered status");
                }
                self.statistics
                    .update_status(MetaDataId::source(), Status::Filtered, None);
                debug!("source filter rejected message");
            }
            Ok(FilterTransformerOutcome::Accepted {
                transformed,
                encoded,
            }) => {
                source.set_content(MessageContent::new(
                    ContentType::Transformed,
                    transformed.clone(),
                ));
                if self.storage.stores_content(ContentType::Transformed, true) {
                    let content = MessageContent::new(ContentType::Transformed, transformed);
                    if let Err(e) = self
                        .store
                        .store_content(
                            &self.channel_id,
                            source.message_id,
                            MetaDataId::source(),
                            &content,
                        )
                        .await
                    {
                        warn!(error = %e, "failed to store transformed content");
                    }
                }
                source.set_content(MessageContent::new(ContentType::Encoded, encoded.clone()));
                if self.storage.stores_content(ContentType::Encoded, true) {
                    let content = MessageContent::new(ContentType::Encoded, encoded.clone())
                        .with_data_type(self.source_settings.data_type.name());
                    if let Err(e) = self
                        .store
                        .store_content(
                            &self.channel_id,
                            source.message_id,
                            MetaDataId::source(),
                            &content,
                        )
                        .await
                    {
                        warn!(error = %e, "failed to store encoded content");
                    }
                }
                if let Err(e) = self.store.store_maps(source, &self.storage).await {
                    warn!(error = %e, "failed to store source maps");
                }
                if self.storage.store_custom_meta_data {
                    let values = custom_metadata_values(&source.connector_map);
                    if let Err(e) = self
                        .store
                        .store_custom_metadata(
                            &self.channel_id,
                            source.message_id,
                            MetaDataId::source(),
                            &values,
                        )
                        .await
                    {
                        warn!(error = %e, "failed to store custom metadata");
                    }
                }

                source.status = Status::Transformed;
                if let Err(e) = self.store.update_status(source).await {
                    warn!(error = %e, "failed to persist transformed status");
                }

                self.fan_out(source, encoded, destination_set.clone()).await;
            }
            Err(e) => {
                self.record_source_error(source, &e.to_string()).await;
            }
        }
    }

    /// Runs every chain concurrently and merges their response maps back
    /// into the source connector message.
    async fn fan_out(
        &self,
        source: &ConnectorMessage,
        encoded: String,
        destination_set: DestinationSet,
    ) {
        let mut response_maps = Vec::with_capacity(self.chains.len());
        let mut handles = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            let input = ChainInput {
                message_id: source.message_id,
                received_date: source.received_date,
                source_encoded: encoded.clone(),
                source_map: source.source_map.clone(),
                // Copied by value into each chain, shared by reference
                // inside it.
                channel_map: source.channel_map.deep_copy(),
                response_map: source.response_map.deep_copy(),
                destination_set: destination_set.clone(),
            };
            response_maps.push(input.response_map.clone());
            let chain = Arc::clone(chain);
            handles.push(tokio::spawn(async move { chain.process(input).await }));
        }

        let results = futures::future::join_all(handles).await;
        for (response_map, result) in response_maps.into_iter().zip(results) {
            match result {
                Ok(outcomes) => {
                    for (meta_data_id, status) in &outcomes {
                        debug!(%meta_data_id, ?status, "chain destination finished");
                    }
                    for (key, value) in response_map.snapshot() {
                        source.response_map.set(key, value);
                    }
                }
                Err(join_error) => {
                    // A panicked chain is isolated from its siblings.
                    error!(error = %join_error, "destination chain task failed");
                }
            }
        }
    }

    async fn record_source_error(&self, source: &mut ConnectorMessage, message: &str) {
        source.status = Status::Error;
        if self.storage.stores_content(ContentType::ProcessingError, true) {
            let note = MessageContent::new(ContentType::ProcessingError, message.to_string());
            if let Err(e) = self
                .store
                .store_content(
                    &self.channel_id,
                    source.message_id,
                    MetaDataId::source(),
                    &note,
                )
                .await
            {
                warn!(error = %e, "failed to store source error");
            }
        }
        if let Err(e) = self.store.update_status(source).await {
            warn!(error = %e, "failed to persist source error status");
        }
        self.statistics
            .update_status(MetaDataId::source(), Status::Error, None);
        warn!(message_id = %source.message_id, error = message, "source stage failed");
    }

    fn source_scope(
        &self,
        source: &ConnectorMessage,
        msg: String,
        destination_set: Option<DestinationSet>,
    ) -> ScriptScope {
        ScriptScope {
            msg,
            response: None,
            response_status: None,
            response_status_message: None,
            source_map: source.source_map.clone(),
            channel_map: source.channel_map.clone(),
            connector_map: source.connector_map.clone(),
            response_map: source.response_map.clone(),
            destination_set,
            channel_id: self.channel_id.clone(),
            channel_name: self.name.clone(),
            message_id: source.message_id,
            meta_data_id: MetaDataId::source(),
            connector_name: source.connector_name.clone(),
        }
    }

    fn lifecycle_scope(&self) -> ScriptScope {
        ScriptScope {
            msg: String::new(),
            response: None,
            response_status: None,
            response_status_message: None,
            source_map: MessageMap::new(),
            channel_map: MessageMap::new(),
            connector_map: MessageMap::new(),
            response_map: MessageMap::new(),
            destination_set: None,
            channel_id: self.channel_id.clone(),
            channel_name: self.name.clone(),
            message_id: MessageId::new(0),
            meta_data_id: MetaDataId::source(),
            connector_name: self.source_settings.connector_name.clone(),
        }
    }

    /// Reopens a message for reprocessing: destinations return to PENDING
    /// with cleared attempt counters. Queues re-read from storage.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reset_message(&self, message_id: MessageId) -> Result<(), ChannelError> {
        self.store.reset_message(&self.channel_id, message_id).await?;
        for destination in &self.destinations {
            if let Some(queue) = destination.queue() {
                queue.invalidate();
            }
        }
        Ok(())
    }

    /// Deletes a message, coordinating with the queues so already-acquired
    /// copies are discarded instead of sent.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ChannelError> {
        for destination in &self.destinations {
            if let Some(queue) = destination.queue() {
                queue.mark_as_deleted(message_id);
                queue.invalidate();
            }
        }
        self.store.delete_message(&self.channel_id, message_id).await?;
        Ok(())
    }

    /// Zeros statistics for one connector or the whole channel.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reset_statistics(
        &self,
        meta_data_id: Option<MetaDataId>,
    ) -> Result<(), ChannelError> {
        self.store
            .reset_statistics(&self.channel_id, meta_data_id)
            .await?;
        self.statistics.reset(meta_data_id);
        Ok(())
    }
}

/// String-valued connector map entries, persisted as custom metadata
/// columns when the storage policy asks for them.
pub(crate) fn custom_metadata_values(connector_map: &MessageMap) -> HashMap<String, String> {
    connector_map
        .snapshot()
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(text) => Some((key, text)),
            _ => None,
        })
        .collect()
}

/// Applies the completion-cleanup policy once a message is processed and
/// no destination remains queued.
pub(crate) async fn completion_cleanup(
    store: &dyn MessageStore,
    storage: &StorageSettings,
    channel_id: &ChannelId,
    message_id: MessageId,
) {
    if !storage.remove_content_on_completion
        && !storage.remove_only_filtered_on_completion
        && !storage.remove_attachments_on_completion
    {
        return;
    }
    let message = match store.get_message(channel_id, message_id).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "completion cleanup could not load message");
            return;
        }
    };
    if !message.processed {
        return;
    }
    let destinations_settled = message
        .connector_messages
        .values()
        .filter(|cm| !cm.meta_data_id.is_source())
        .all(|cm| cm.status.is_terminal());
    if !destinations_settled {
        // A queued destination still needs its content to resend.
        return;
    }

    if storage.remove_content_on_completion {
        if let Err(e) = store
            .prune_completed_content(channel_id, message_id, false)
            .await
        {
            warn!(error = %e, "completion content cleanup failed");
        }
    } else if storage.remove_only_filtered_on_completion {
        if let Err(e) = store
            .prune_completed_content(channel_id, message_id, true)
            .await
        {
            warn!(error = %e, "filtered content cleanup failed");
        }
    }
    if storage.remove_attachments_on_completion {
        if let Err(e) = store.delete_attachments(channel_id, message_id).await {
            warn!(error = %e, "attachment cleanup failed");
        }
    }
}
