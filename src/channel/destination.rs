//! Destination connector base: direct and queued send modes, in-process
//! retry, and the send worker pool.
//!
//! Error classification is the adapter's responsibility; this module only
//! consults [`SendError::is_retryable`]. A halt signal aborts the in-flight
//! send attempt; a stop signal lets it finish.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::SendError;
use crate::message::{
    ChannelId, ConnectorMessage, ContentType, DataType, MessageContent, MetaDataId, Status,
};
use crate::script::{Filter, ScriptExecutor, ScriptScope, Transformer, run_response_transformer};
use crate::settings::StorageSettings;
use crate::statistics::Statistics;
use crate::store::MessageStore;

use super::queue::{DestinationQueue, QueueSettings};

/// Error raised by connector lifecycle operations.
#[derive(Debug, Clone, Error)]
#[error("connector error: {message}")]
pub struct ConnectorError {
    /// What failed.
    pub message: String,
}

impl ConnectorError {
    /// Creates a connector error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Destination transport adapter contract.
///
/// `send` may fail with a classified [`SendError`]: connection errors are
/// retryable, application negatives (SOAP faults, NAKs) are not — even when
/// the destination queue is enabled.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// Adapter display name.
    fn name(&self) -> &str;

    /// Starts the transport.
    async fn start(&self) -> Result<(), ConnectorError>;

    /// Stops the transport.
    async fn stop(&self) -> Result<(), ConnectorError>;

    /// Delivers the connector message's ENCODED payload.
    async fn send(&self, connector_message: &ConnectorMessage) -> Result<(), SendError>;

    /// The response payload of the last send, when the transport produced
    /// one.
    async fn get_response(&self, connector_message: &ConnectorMessage) -> Option<String>;
}

/// Configuration for one destination.
#[derive(Clone)]
pub struct DestinationSettings {
    /// Display name, also the response map key.
    pub name: String,
    /// Identity within the channel; positive.
    pub meta_data_id: MetaDataId,
    /// Disabled destinations are skipped by their chain.
    pub enabled: bool,
    /// Additional in-process retries after a retryable send failure.
    pub retry_count: u32,
    /// Sleep between in-process retries.
    pub retry_interval: Duration,
    /// Queue behavior.
    pub queue: QueueSettings,
    /// Destination filter.
    pub filter: Filter,
    /// Destination transformer.
    pub transformer: Transformer,
    /// Optional response transformer.
    pub response_transformer: Option<Transformer>,
    /// Data type adapter for this destination.
    pub data_type: Arc<dyn DataType>,
}

impl DestinationSettings {
    /// A pass-through destination with sane defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, meta_data_id: MetaDataId) -> Self {
        Self {
            name: name.into(),
            meta_data_id,
            enabled: true,
            retry_count: 0,
            retry_interval: Duration::from_millis(1000),
            queue: QueueSettings::default(),
            filter: Filter::accept_all(),
            transformer: Transformer::passthrough(),
            response_transformer: None,
            data_type: Arc::new(crate::message::PassthroughDataType),
        }
    }
}

/// Shared collaborators a destination needs from its channel.
#[derive(Clone)]
pub(crate) struct DestinationContext {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub store: Arc<dyn MessageStore>,
    pub statistics: Arc<Statistics>,
    pub storage: StorageSettings,
    pub executor: Arc<dyn ScriptExecutor>,
    pub halt: watch::Receiver<bool>,
}

/// One deployed destination: adapter plus queue plus workers.
pub struct Destination {
    pub(crate) settings: DestinationSettings,
    connector: Arc<dyn DestinationConnector>,
    context: DestinationContext,
    queue: Option<Arc<DestinationQueue>>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Destination {
    pub(crate) fn new(
        settings: DestinationSettings,
        connector: Arc<dyn DestinationConnector>,
        context: DestinationContext,
    ) -> Arc<Self> {
        let queue = settings.queue.enabled.then(|| {
            Arc::new(DestinationQueue::new(
                context.channel_id.clone(),
                settings.meta_data_id,
                settings.queue.clone(),
                context.store.clone(),
            ))
        });
        Arc::new(Self {
            settings,
            connector,
            context,
            queue,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// The destination's queue, when queue-enabled.
    #[must_use]
    pub fn queue(&self) -> Option<&Arc<DestinationQueue>> {
        self.queue.as_ref()
    }

    /// The destination's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Starts the adapter and, for queued mode, the send workers.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), ConnectorError> {
        self.stop.store(false, Ordering::SeqCst);
        self.connector.start().await?;
        if let Some(queue) = &self.queue {
            let bucket_count = self.settings.queue.bucket_count();
            let mut workers = self.workers.lock().expect("worker lock poisoned");
            for worker_id in 0..self.settings.queue.thread_count.max(1) as usize {
                let destination = Arc::clone(&self);
                let queue = Arc::clone(queue);
                let bucket = worker_id % bucket_count;
                workers.push(tokio::spawn(async move {
                    destination.worker_loop(queue, worker_id, bucket).await;
                }));
            }
            info!(
                destination = %self.settings.name,
                workers = self.settings.queue.thread_count,
                "send workers started"
            );
        }
        Ok(())
    }

    /// Cooperative stop: workers finish their in-flight message.
    pub(crate) async fn stop(&self) -> Result<(), ConnectorError> {
        self.stop.store(true, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("worker lock poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
        self.connector.stop().await
    }

    /// Forceful stop: in-flight sends are aborted.
    pub(crate) async fn halt(&self) -> Result<(), ConnectorError> {
        self.stop.store(true, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("worker lock poisoned"));
        for worker in workers {
            worker.abort();
        }
        self.connector.stop().await
    }

    async fn worker_loop(self: Arc<Self>, queue: Arc<DestinationQueue>, worker_id: usize, bucket: usize) {
        debug!(destination = %self.settings.name, worker_id, bucket, "send worker running");
        while !self.stop.load(Ordering::SeqCst) {
            match queue.acquire(bucket).await {
                Ok(Some(mut connector_message)) => {
                    if queue.release_if_deleted(&connector_message) {
                        continue;
                    }
                    self.process_queued(&queue, &mut connector_message).await;
                }
                Ok(None) => {
                    queue.wait_for_work(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    warn!(destination = %self.settings.name, error = %e, "queue refill failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!(destination = %self.settings.name, worker_id, "send worker stopped");
    }

    async fn process_queued(&self, queue: &DestinationQueue, cm: &mut ConnectorMessage) {
        match self.attempt_send(cm).await {
            Ok(response) => {
                self.finish_successful_send(cm, response).await;
                queue.release(cm.clone(), true);
                super::completion_cleanup(
                    self.context.store.as_ref(),
                    &self.context.storage,
                    &self.context.channel_id,
                    cm.message_id,
                )
                .await;
            }
            Err(send_error) if send_error.is_retryable() => {
                // Still QUEUED; only the attempt counters move.
                if let Err(e) = self.context.store.update_send_attempts(cm).await {
                    warn!(error = %e, "failed to persist send attempts");
                }
                tokio::time::sleep(self.settings.retry_interval).await;
                queue.release(cm.clone(), false);
            }
            Err(send_error) => {
                self.fail(cm, &send_error).await;
                queue.release(cm.clone(), true);
                super::completion_cleanup(
                    self.context.store.as_ref(),
                    &self.context.storage,
                    &self.context.channel_id,
                    cm.message_id,
                )
                .await;
            }
        }
        if let Err(e) = self.context.statistics.flush(self.context.store.as_ref()).await {
            warn!(error = %e, "statistics flush failed");
        }
    }

    /// One send pass: the initial attempt plus up to `retry_count`
    /// in-process retries on retryable failures. A halt aborts the pass.
    pub(crate) async fn attempt_send(
        &self,
        cm: &mut ConnectorMessage,
    ) -> Result<Option<String>, SendError> {
        let mut retries = 0;
        loop {
            cm.send_attempts += 1;
            cm.send_date = Some(Utc::now());

            let mut halt = self.context.halt.clone();
            let result = tokio::select! {
                biased;
                _ = halt.wait_for(|halted| *halted) => {
                    Err(SendError::connection("send aborted by halt"))
                }
                result = self.connector.send(cm) => result,
            };

            match result {
                Ok(()) => {
                    cm.response_date = Some(Utc::now());
                    return Ok(self.connector.get_response(cm).await);
                }
                Err(send_error)
                    if send_error.is_retryable() && retries < self.settings.retry_count =>
                {
                    retries += 1;
                    warn!(
                        destination = %self.settings.name,
                        message_id = %cm.message_id,
                        attempt = cm.send_attempts,
                        error = %send_error,
                        "retryable send failure, retrying in-process"
                    );
                    tokio::time::sleep(self.settings.retry_interval).await;
                }
                Err(send_error) => return Err(send_error),
            }
        }
    }

    /// Persists a completed send: SENT content, response handling, status
    /// and statistics. A response-transformer failure turns the outcome
    /// into ERROR with response-error content.
    #[instrument(skip(self, cm, response), fields(destination = %self.settings.name, message_id = %cm.message_id))]
    pub(crate) async fn finish_successful_send(
        &self,
        cm: &mut ConnectorMessage,
        response: Option<String>,
    ) {
        let store = self.context.store.as_ref();
        let storage = &self.context.storage;

        if storage.stores_content(ContentType::Sent, false) {
            if let Some(encoded) = cm.content_text(ContentType::Encoded) {
                let content = MessageContent::new(ContentType::Sent, encoded.to_string());
                if let Err(e) = store
                    .store_content(&cm.channel_id, cm.message_id, cm.meta_data_id, &content)
                    .await
                {
                    warn!(error = %e, "failed to store sent content");
                }
            }
        }

        let mut final_response = response.clone();
        if let Some(response_payload) = response {
            cm.set_content(MessageContent::new(
                ContentType::Response,
                response_payload.clone(),
            ));
            if storage.stores_content(ContentType::Response, false) {
                let content = MessageContent::new(ContentType::Response, response_payload.clone());
                if let Err(e) = store
                    .store_content(&cm.channel_id, cm.message_id, cm.meta_data_id, &content)
                    .await
                {
                    warn!(error = %e, "failed to store response content");
                }
            }

            if let Some(response_transformer) = &self.settings.response_transformer {
                let mut scope = self.response_scope(cm, response_payload.clone());
                match run_response_transformer(
                    self.context.executor.as_ref(),
                    response_transformer,
                    &mut scope,
                )
                .await
                {
                    Ok(transformed) => {
                        cm.set_content(MessageContent::new(
                            ContentType::ResponseTransformed,
                            transformed.clone(),
                        ));
                        if storage.stores_content(ContentType::ResponseTransformed, false) {
                            let content = MessageContent::new(
                                ContentType::ResponseTransformed,
                                transformed.clone(),
                            );
                            if let Err(e) = store
                                .store_content(
                                    &cm.channel_id,
                                    cm.message_id,
                                    cm.meta_data_id,
                                    &content,
                                )
                                .await
                            {
                                warn!(error = %e, "failed to store transformed response");
                            }
                        }
                        final_response = Some(transformed);
                    }
                    Err(e) => {
                        error!(error = %e, "response transformer failed");
                        let note = MessageContent::new(ContentType::ResponseError, e.to_string());
                        if let Err(store_error) = store
                            .store_content(&cm.channel_id, cm.message_id, cm.meta_data_id, &note)
                            .await
                        {
                            warn!(error = %store_error, "failed to store response error");
                        }
                        let previous = cm.status;
                        cm.status = Status::Error;
                        self.context.statistics.update_status(
                            cm.meta_data_id,
                            Status::Error,
                            Some(previous).filter(|s| s.is_tracked()),
                        );
                        if let Err(store_error) = store.update_status(cm).await {
                            warn!(error = %store_error, "failed to persist error status");
                        }
                        return;
                    }
                }
            }
        }

        if let Some(value) = final_response {
            cm.response_map
                .set(self.settings.name.clone(), Value::String(value));
        }
        if let Err(e) = store.store_response_map(cm, storage).await {
            warn!(error = %e, "failed to store response map");
        }

        cm.status = Status::Sent;
        self.context
            .statistics
            .update_status(cm.meta_data_id, Status::Sent, None);
        if let Err(e) = store.update_status(cm).await {
            warn!(error = %e, "failed to persist sent status");
        }
        debug!("destination send completed");
    }

    /// Persists a terminal failure: ERROR status, error content and
    /// statistics.
    pub(crate) async fn fail(&self, cm: &mut ConnectorMessage, send_error: &SendError) {
        let store = self.context.store.as_ref();
        cm.status = Status::Error;
        cm.error_code = send_error.error_code;
        if self
            .context
            .storage
            .stores_content(ContentType::ProcessingError, false)
        {
            let note = MessageContent::new(ContentType::ProcessingError, send_error.to_string());
            if let Err(e) = store
                .store_content(&cm.channel_id, cm.message_id, cm.meta_data_id, &note)
                .await
            {
                warn!(error = %e, "failed to store error content");
            }
        }
        self.context
            .statistics
            .update_status(cm.meta_data_id, Status::Error, None);
        if let Err(e) = store.update_status(cm).await {
            warn!(error = %e, "failed to persist error status");
        }
        warn!(
            destination = %self.settings.name,
            message_id = %cm.message_id,
            error = %send_error,
            "destination failed terminally"
        );
    }

    fn response_scope(&self, cm: &ConnectorMessage, response: String) -> ScriptScope {
        ScriptScope {
            msg: cm.content_text(ContentType::Encoded).unwrap_or_default().to_string(),
            response: Some(response),
            response_status: Some(cm.status),
            response_status_message: None,
            source_map: cm.source_map.clone(),
            channel_map: cm.channel_map.clone(),
            connector_map: cm.connector_map.clone(),
            response_map: cm.response_map.clone(),
            destination_set: None,
            channel_id: self.context.channel_id.clone(),
            channel_name: self.context.channel_name.clone(),
            message_id: cm.message_id,
            meta_data_id: cm.meta_data_id,
            connector_name: self.settings.name.clone(),
        }
    }
}
