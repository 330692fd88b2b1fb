//! Engine: the composition root owning the store, the pool and the
//! deployed channels.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::{
    Channel, ChannelConfig, ChannelError, DestinationConnector, RecoveryReport, SourceConnector,
};
use crate::config::{ConfigError, EngineConfig};
use crate::database::{DatabaseConnection, DatabaseError};
use crate::message::{ChannelId, MetaDataId};
use crate::script::ScriptExecutor;
use crate::store::{MessageStore, SqliteMessageStore, StoreError};

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The database could not be opened.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The store could not be bootstrapped.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The channel is not deployed on this engine.
    #[error("channel not deployed: {channel_id}")]
    ChannelNotDeployed {
        /// The unknown channel.
        channel_id: ChannelId,
    },
}

/// A running engine instance.
pub struct Engine {
    connection: DatabaseConnection,
    store: Arc<SqliteMessageStore>,
    channels: DashMap<ChannelId, Arc<Channel>>,
}

impl Engine {
    /// Opens the store per the configured engine mode.
    ///
    /// # Errors
    ///
    /// Fails when the pool cannot be built or the schema contradicts the
    /// mode.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let connection = DatabaseConnection::initialize(&config).await?;
        let store = SqliteMessageStore::open(
            connection.clone(),
            config.server_id.clone(),
            config.mode,
        )
        .await?;
        info!(server_id = %config.server_id, "engine ready");
        Ok(Self {
            connection,
            store: Arc::new(store),
            channels: DashMap::new(),
        })
    }

    /// The shared message store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    /// Builds, starts and registers a channel. Returns the channel and its
    /// recovery report.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is inconsistent or startup fails.
    pub async fn deploy_channel(
        &self,
        config: ChannelConfig,
        source_connector: Arc<dyn SourceConnector>,
        destination_connectors: HashMap<MetaDataId, Arc<dyn DestinationConnector>>,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Result<(Arc<Channel>, RecoveryReport), EngineError> {
        let channel_id = config.channel_id.clone();
        let channel = Channel::new(
            config,
            source_connector,
            destination_connectors,
            self.store.clone(),
            executor,
        )?;
        let report = Arc::clone(&channel).start().await?;
        self.channels.insert(channel_id, channel.clone());
        Ok((channel, report))
    }

    /// Stops and removes a channel.
    ///
    /// # Errors
    ///
    /// Fails when the channel is unknown or refuses to stop.
    pub async fn undeploy_channel(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        let Some((_, channel)) = self.channels.remove(channel_id) else {
            return Err(EngineError::ChannelNotDeployed {
                channel_id: channel_id.clone(),
            });
        };
        channel.stop().await?;
        Ok(())
    }

    /// A deployed channel by id.
    #[must_use]
    pub fn channel(&self, channel_id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(channel_id).map(|entry| entry.clone())
    }

    /// Stops every channel and closes the pool.
    pub async fn shutdown(&self) {
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for channel_id in ids {
            if let Err(e) = self.undeploy_channel(&channel_id).await {
                warn!(%channel_id, error = %e, "channel failed to stop during shutdown");
            }
        }
        self.connection.close().await;
        info!("engine shut down");
    }
}
