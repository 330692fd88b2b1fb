//! Shared fixtures for the integration suites: a scratch engine over a
//! tempdir store and an in-process destination adapter with scripted
//! outcomes.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use interchange::channel::ConnectorError;
use interchange::{
    ChainConfig, ChannelConfig, ChannelId, ChannelScripts, ConnectorMessage, ContentType,
    DestinationConnector, DestinationSettings, Engine, EngineConfig, MessageId, MetaDataId,
    SendError, ServerId, SourceSettings, Status, StorageSettings,
};

pub fn channel_id() -> ChannelId {
    ChannelId::try_new("aaaaaaaa-1111-2222-3333-444444444444".to_string()).unwrap()
}

pub fn server_id() -> ServerId {
    ServerId::try_new("node-a".to_string()).unwrap()
}

pub async fn new_engine(dir: &TempDir) -> Engine {
    let config = EngineConfig::for_testing(dir.path().join("engine.db"), server_id());
    Engine::new(config).await.expect("engine should open")
}

pub fn chain(destinations: Vec<DestinationSettings>) -> ChainConfig {
    ChainConfig { destinations }
}

pub fn base_config(chains: Vec<ChainConfig>) -> ChannelConfig {
    ChannelConfig {
        channel_id: channel_id(),
        name: "Test Channel".to_string(),
        server_id: server_id(),
        storage: StorageSettings::development(),
        scripts: ChannelScripts::default(),
        source: SourceSettings::new("Source"),
        chains,
        send_events: false,
    }
}

pub fn connectors(
    pairs: Vec<(u32, Arc<dyn DestinationConnector>)>,
) -> HashMap<MetaDataId, Arc<dyn DestinationConnector>> {
    pairs
        .into_iter()
        .map(|(meta, connector)| (MetaDataId::new(meta), connector))
        .collect()
}

/// In-process destination with scripted send outcomes: the queued outcomes
/// play in order, then every further send uses the default outcome.
pub struct ScriptedDestination {
    queued_outcomes: Mutex<VecDeque<Result<(), SendError>>>,
    default_outcome: Result<(), SendError>,
    response: Option<String>,
    sent_payloads: Mutex<Vec<String>>,
}

impl ScriptedDestination {
    pub fn always_ok() -> Arc<Self> {
        Arc::new(Self {
            queued_outcomes: Mutex::new(VecDeque::new()),
            default_outcome: Ok(()),
            response: None,
            sent_payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn with_response(response: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            queued_outcomes: Mutex::new(VecDeque::new()),
            default_outcome: Ok(()),
            response: Some(response.into()),
            sent_payloads: Mutex::new(Vec::new()),
        })
    }

    /// Fails with the given errors in order, then succeeds.
    pub fn failing_then_ok(errors: Vec<SendError>) -> Arc<Self> {
        Arc::new(Self {
            queued_outcomes: Mutex::new(errors.into_iter().map(Err).collect()),
            default_outcome: Ok(()),
            response: None,
            sent_payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing(error: SendError) -> Arc<Self> {
        Arc::new(Self {
            queued_outcomes: Mutex::new(VecDeque::new()),
            default_outcome: Err(error),
            response: None,
            sent_payloads: Mutex::new(Vec::new()),
        })
    }

    /// Payloads handed to `send`, in attempt order (failures included).
    pub fn attempted_payloads(&self) -> Vec<String> {
        self.sent_payloads.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.sent_payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl DestinationConnector for ScriptedDestination {
    fn name(&self) -> &str {
        "Scripted Writer"
    }

    async fn start(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn send(&self, connector_message: &ConnectorMessage) -> Result<(), SendError> {
        self.sent_payloads.lock().unwrap().push(
            connector_message
                .content_text(ContentType::Encoded)
                .unwrap_or_default()
                .to_string(),
        );
        let scripted = self.queued_outcomes.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_outcome.clone())
    }

    async fn get_response(&self, _connector_message: &ConnectorMessage) -> Option<String> {
        self.response.clone()
    }
}

/// Polls the store until the connector message reaches the status, or
/// panics after five seconds.
pub async fn wait_for_status(
    engine: &Engine,
    message_id: MessageId,
    meta_data_id: u32,
    expected: Status,
) {
    let store = engine.store();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = store
            .get_message(&channel_id(), message_id)
            .await
            .expect("store should answer")
            .expect("message should exist");
        let status = message
            .connector_messages
            .get(&MetaDataId::new(meta_data_id))
            .map(|cm| cm.status);
        if status == Some(expected) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for status {expected:?}, last seen {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
