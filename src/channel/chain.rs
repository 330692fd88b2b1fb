//! Sequential execution of one destination chain.
//!
//! The first destination consumes the source's ENCODED content as its RAW;
//! each later destination consumes the previous destination's ENCODED.
//! Within the chain `channel_map` and `response_map` are shared by
//! reference; the channel forks fresh copies per chain before calling in.
//! A destination error stops this chain without touching its siblings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::message::{
    ChannelId, ConnectorMessage, ContentType, DestinationSet, MessageContent, MessageId,
    MessageMap, MetaDataId, ServerId, Status,
};
use crate::script::{FilterTransformerOutcome, ScriptScope, run_filter_transformer};
use crate::settings::StorageSettings;
use crate::statistics::Statistics;
use crate::store::MessageStore;

use super::destination::Destination;

/// Everything a chain needs to process one message fan-out.
#[derive(Clone)]
pub struct ChainInput {
    /// The message being fanned out.
    pub message_id: MessageId,
    /// Receipt timestamp of the owning message.
    pub received_date: DateTime<Utc>,
    /// The source's ENCODED content.
    pub source_encoded: String,
    /// Shared source map.
    pub source_map: MessageMap,
    /// This chain's copy of the channel map.
    pub channel_map: MessageMap,
    /// This chain's response map.
    pub response_map: MessageMap,
    /// Fan-out control shared across chains.
    pub destination_set: DestinationSet,
}

/// An ordered group of destinations with output-as-input coupling.
pub struct DestinationChain {
    pub(crate) chain_id: u32,
    pub(crate) destinations: Vec<Arc<Destination>>,
    pub(crate) channel_id: ChannelId,
    pub(crate) server_id: ServerId,
    pub(crate) channel_name: String,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) statistics: Arc<Statistics>,
    pub(crate) storage: StorageSettings,
    pub(crate) executor: Arc<dyn crate::script::ScriptExecutor>,
}

impl DestinationChain {
    /// Metadata ids of this chain's destinations, in order.
    #[must_use]
    pub fn meta_data_ids(&self) -> Vec<MetaDataId> {
        self.destinations
            .iter()
            .map(|destination| destination.settings.meta_data_id)
            .collect()
    }

    /// Runs the chain for one message. Returns the final status of each
    /// destination that was materialized.
    #[instrument(skip(self, input), fields(chain_id = self.chain_id, message_id = %input.message_id))]
    pub async fn process(&self, input: ChainInput) -> Vec<(MetaDataId, Status)> {
        let mut outcomes = Vec::with_capacity(self.destinations.len());
        let mut previous_encoded = input.source_encoded.clone();

        for (index, destination) in self.destinations.iter().enumerate() {
            let settings = &destination.settings;
            if !settings.enabled {
                continue;
            }
            let meta_data_id = settings.meta_data_id;

            let mut cm = ConnectorMessage::destination(
                input.message_id,
                meta_data_id,
                self.channel_id.clone(),
                self.server_id.clone(),
                settings.name.clone(),
                input.received_date,
                self.chain_id,
                index as u32 + 1,
                input.source_map.clone(),
                input.channel_map.clone(),
                input.response_map.clone(),
            );
            cm.set_content(MessageContent::new(
                ContentType::Raw,
                previous_encoded.clone(),
            ));
            if let Err(e) = self.store.insert_connector_message(&cm).await {
                warn!(error = %e, destination = %settings.name, "failed to persist connector message; stopping chain");
                outcomes.push((meta_data_id, Status::Error));
                break;
            }
            self.statistics
                .update_status(meta_data_id, Status::Received, None);

            // Suppressed by a source transformer for this fan-out only.
            if !input.destination_set.contains(meta_data_id) {
                cm.status = Status::Filtered;
                self.persist_status(&cm).await;
                self.statistics
                    .update_status(meta_data_id, Status::Filtered, None);
                outcomes.push((meta_data_id, Status::Filtered));
                continue;
            }

            let xml = match settings.data_type.to_xml(&previous_encoded) {
                Ok(xml) => xml,
                Err(e) => {
                    self.record_error(&mut cm, &e.to_string()).await;
                    outcomes.push((meta_data_id, Status::Error));
                    break;
                }
            };

            let mut scope = ScriptScope {
                msg: xml,
                response: None,
                response_status: None,
                response_status_message: None,
                source_map: cm.source_map.clone(),
                channel_map: cm.channel_map.clone(),
                connector_map: cm.connector_map.clone(),
                response_map: cm.response_map.clone(),
                destination_set: None,
                channel_id: self.channel_id.clone(),
                channel_name: self.channel_name.clone(),
                message_id: cm.message_id,
                meta_data_id,
                connector_name: settings.name.clone(),
            };

            let outcome = run_filter_transformer(
                self.executor.as_ref(),
                &settings.filter,
                &settings.transformer,
                settings.data_type.as_ref(),
                &mut scope,
            )
            .await;

            match outcome {
                Ok(FilterTransformerOutcome::Rejected) => {
                    cm.status = Status::Filtered;
                    self.persist_status(&cm).await;
                    self.statistics
                        .update_status(meta_data_id, Status::Filtered, None);
                    outcomes.push((meta_data_id, Status::Filtered));
                    // A filtered destination leaves the payload untouched
                    // for the rest of the chain.
                    continue;
                }
                Ok(FilterTransformerOutcome::Accepted {
                    transformed,
                    encoded,
                }) => {
                    cm.set_content(MessageContent::new(
                        ContentType::Transformed,
                        transformed.clone(),
                    ));
                    if self.storage.stores_content(ContentType::Transformed, false) {
                        let content = MessageContent::new(ContentType::Transformed, transformed);
                        if let Err(e) = self
                            .store
                            .store_content(&self.channel_id, cm.message_id, meta_data_id, &content)
                            .await
                        {
                            warn!(error = %e, "failed to store transformed content");
                        }
                    }
                    cm.set_content(MessageContent::new(ContentType::Encoded, encoded.clone()));
                    if self.storage.stores_content(ContentType::Encoded, false) {
                        let content = MessageContent::new(ContentType::Encoded, encoded.clone())
                            .with_data_type(settings.data_type.name());
                        if let Err(e) = self
                            .store
                            .store_content(&self.channel_id, cm.message_id, meta_data_id, &content)
                            .await
                        {
                            warn!(error = %e, "failed to store encoded content");
                        }
                    }
                    if let Err(e) = self.store.store_maps(&cm, &self.storage).await {
                        warn!(error = %e, "failed to store connector maps");
                    }
                    if self.storage.store_custom_meta_data {
                        let values = super::custom_metadata_values(&cm.connector_map);
                        if let Err(e) = self
                            .store
                            .store_custom_metadata(
                                &self.channel_id,
                                cm.message_id,
                                meta_data_id,
                                &values,
                            )
                            .await
                        {
                            warn!(error = %e, "failed to store custom metadata");
                        }
                    }

                    if settings.queue.enabled {
                        // Queued mode: persist QUEUED and hand off to the
                        // send workers; the chain keeps going on this
                        // destination's ENCODED output.
                        cm.status = Status::Queued;
                        self.persist_status(&cm).await;
                        if let Some(queue) = destination.queue() {
                            queue.add(cm.clone());
                        }
                        debug!(destination = %settings.name, "destination queued");
                        outcomes.push((meta_data_id, Status::Queued));
                        previous_encoded = encoded;
                        continue;
                    }

                    match destination.attempt_send(&mut cm).await {
                        Ok(response) => {
                            destination.finish_successful_send(&mut cm, response).await;
                            outcomes.push((meta_data_id, cm.status));
                            if cm.status == Status::Error {
                                break;
                            }
                            previous_encoded = encoded;
                        }
                        Err(send_error) => {
                            destination.fail(&mut cm, &send_error).await;
                            outcomes.push((meta_data_id, Status::Error));
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.record_error(&mut cm, &e.to_string()).await;
                    outcomes.push((meta_data_id, Status::Error));
                    break;
                }
            }
        }

        if let Err(e) = self.statistics.flush(self.store.as_ref()).await {
            warn!(error = %e, "statistics flush failed");
        }
        outcomes
    }

    async fn persist_status(&self, cm: &ConnectorMessage) {
        if let Err(e) = self.store.update_status(cm).await {
            warn!(error = %e, destination = %cm.connector_name, "failed to persist status");
        }
    }

    async fn record_error(&self, cm: &mut ConnectorMessage, message: &str) {
        cm.status = Status::Error;
        if self
            .storage
            .stores_content(ContentType::ProcessingError, false)
        {
            let note = MessageContent::new(ContentType::ProcessingError, message.to_string());
            if let Err(e) = self
                .store
                .store_content(&self.channel_id, cm.message_id, cm.meta_data_id, &note)
                .await
            {
                warn!(error = %e, "failed to store error content");
            }
        }
        self.persist_status(cm).await;
        self.statistics
            .update_status(cm.meta_data_id, Status::Error, None);
    }
}
