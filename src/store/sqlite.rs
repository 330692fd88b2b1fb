//! SQLite implementation of the message store.
//!
//! Table creation happens at channel registration because the schema is
//! per-channel; the process-wide `D_CHANNELS` registry is bootstrapped at
//! open time according to the configured engine mode. Table names embed
//! only the numeric local channel id, never caller-supplied text.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, instrument, warn};

use crate::database::{DatabaseConnection, with_retry};
use crate::message::{
    Attachment, ChannelId, ConnectorMessage, ContentType, Message, MessageContent, MessageId,
    MessageMap, MetaDataId, ServerId, Status,
};
use crate::settings::StorageSettings;

use super::{
    Encryptor, MessageStore, RecoveredConnector, StatisticsRow, StatisticsUpdate, StoreError,
};

/// Attachment bodies are chunked into segments of this size.
const ATTACHMENT_SEGMENT_BYTES: usize = 10_000_000;

const CREATE_CHANNELS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS D_CHANNELS (
    CHANNEL_ID TEXT PRIMARY KEY,
    LOCAL_CHANNEL_ID INTEGER NOT NULL UNIQUE
);
";

const CHANNELS_TABLE_EXISTS: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'D_CHANNELS'";

fn messages_table(local_id: i64) -> String {
    format!("D_M{local_id}")
}

fn connector_messages_table(local_id: i64) -> String {
    format!("D_MM{local_id}")
}

fn content_table(local_id: i64) -> String {
    format!("D_MC{local_id}")
}

fn attachments_table(local_id: i64) -> String {
    format!("D_MA{local_id}")
}

fn statistics_table(local_id: i64) -> String {
    format!("D_MS{local_id}")
}

fn sequence_table(local_id: i64) -> String {
    format!("D_MSQ{local_id}")
}

fn custom_metadata_table(local_id: i64) -> String {
    format!("D_MCM{local_id}")
}

/// Statistics column for a status. `QUEUED` folds into `SENT` for
/// historical compatibility; `TRANSFORMED` and `PENDING` have no column
/// and their updates are dropped.
fn status_column(status: Status) -> Option<&'static str> {
    match status {
        Status::Received => Some("RECEIVED"),
        Status::Filtered => Some("FILTERED"),
        Status::Sent | Status::Queued => Some("SENT"),
        Status::Error => Some("ERROR"),
        Status::Transformed | Status::Pending => None,
    }
}

fn to_millis(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::InvalidRow {
            message: format!("timestamp out of range: {millis}"),
        })
}

fn parse_status(text: &str) -> Result<Status, StoreError> {
    let code = text.chars().next().ok_or_else(|| StoreError::InvalidRow {
        message: "empty status".to_string(),
    })?;
    Status::from_char(code).map_err(|e| StoreError::InvalidRow {
        message: e.to_string(),
    })
}

fn parse_server_id(text: String) -> Result<ServerId, StoreError> {
    ServerId::try_new(text).map_err(|e| StoreError::InvalidRow {
        message: format!("invalid server id: {e}"),
    })
}

/// SQLite-backed [`MessageStore`].
pub struct SqliteMessageStore {
    connection: DatabaseConnection,
    server_id: ServerId,
    encryptor: Option<Arc<dyn Encryptor>>,
    local_ids: DashMap<ChannelId, i64>,
}

impl SqliteMessageStore {
    /// Opens the store, bootstrapping or taking over the schema per the
    /// engine mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaMode`] when the schema's presence
    /// contradicts the mode (`Takeover` without a schema, `Standalone`
    /// over an existing one).
    pub async fn open(
        connection: DatabaseConnection,
        server_id: ServerId,
        mode: crate::config::EngineMode,
    ) -> Result<Self, StoreError> {
        use crate::config::EngineMode;

        let existing = sqlx::query(CHANNELS_TABLE_EXISTS)
            .fetch_optional(connection.pool())
            .await?
            .is_some();

        match (mode, existing) {
            (EngineMode::Takeover, false) => {
                return Err(StoreError::SchemaMode {
                    message: "takeover mode requires an existing schema".to_string(),
                });
            }
            (EngineMode::Standalone, true) => {
                return Err(StoreError::SchemaMode {
                    message: "standalone mode requires a fresh store".to_string(),
                });
            }
            (EngineMode::Takeover, true) => {
                info!("taking over existing schema");
            }
            (EngineMode::Standalone, false) | (EngineMode::Auto, _) => {}
        }

        sqlx::query(CREATE_CHANNELS_TABLE)
            .execute(connection.pool())
            .await?;

        Ok(Self {
            connection,
            server_id,
            encryptor: None,
            local_ids: DashMap::new(),
        })
    }

    /// Installs a content-at-rest encryptor.
    #[must_use]
    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// The host identifier statistics rows are written under.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    async fn local_id(&self, channel_id: &ChannelId) -> Result<i64, StoreError> {
        if let Some(cached) = self.local_ids.get(channel_id) {
            return Ok(*cached);
        }
        let row = sqlx::query("SELECT LOCAL_CHANNEL_ID FROM D_CHANNELS WHERE CHANNEL_ID = ?")
            .bind(channel_id.as_ref())
            .fetch_optional(self.connection.pool())
            .await?;
        match row {
            Some(row) => {
                let local: i64 = row.try_get("LOCAL_CHANNEL_ID")?;
                self.local_ids.insert(channel_id.clone(), local);
                Ok(local)
            }
            None => Err(StoreError::ChannelNotRegistered {
                channel_id: channel_id.clone(),
            }),
        }
    }

    fn encrypt_for_store(&self, content: &MessageContent) -> (String, bool) {
        match &self.encryptor {
            Some(encryptor) => (encryptor.encrypt(&content.content), true),
            None => (content.content.clone(), false),
        }
    }

    /// Decrypts a loaded value; a failed decrypt degrades to the stored
    /// text treated as plaintext.
    fn decrypt_loaded(&self, text: String, encrypted: bool) -> (String, bool) {
        if !encrypted {
            return (text, false);
        }
        match &self.encryptor {
            Some(encryptor) => match encryptor.decrypt(&text) {
                Ok(plain) => (plain, true),
                Err(e) => {
                    warn!(error = %e, "decrypt failed, treating stored content as plaintext");
                    (text, false)
                }
            },
            None => {
                warn!("encrypted content loaded without an encryptor, treating as plaintext");
                (text, false)
            }
        }
    }

    async fn insert_content_in(
        conn: &mut SqliteConnection,
        local_id: i64,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content_type: ContentType,
        text: &str,
        data_type: Option<&str>,
        encrypted: bool,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (MESSAGE_ID, METADATA_ID, CONTENT_TYPE, CONTENT, DATA_TYPE, IS_ENCRYPTED) VALUES (?, ?, ?, ?, ?, ?)",
            content_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(message_id))
            .bind(i64::from(u32::from(meta_data_id)))
            .bind(i64::from(content_type.as_code()))
            .bind(text)
            .bind(data_type)
            .bind(encrypted)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn upsert_statistics_in(
        conn: &mut SqliteConnection,
        local_id: i64,
        meta_data_id: MetaDataId,
        server_id: &ServerId,
        status: Status,
        delta: i64,
    ) -> Result<(), sqlx::Error> {
        let Some(column) = status_column(status) else {
            return Ok(());
        };
        let sql = format!(
            "INSERT INTO {table} (METADATA_ID, SERVER_ID, RECEIVED, FILTERED, SENT, ERROR) \
             VALUES (?, ?, 0, 0, 0, 0) \
             ON CONFLICT(METADATA_ID, SERVER_ID) DO NOTHING",
            table = statistics_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(u32::from(meta_data_id)))
            .bind(server_id.as_ref())
            .execute(&mut *conn)
            .await?;
        let sql = format!(
            "UPDATE {table} SET {column} = MAX(0, {column} + ?) WHERE METADATA_ID = ? AND SERVER_ID = ?",
            table = statistics_table(local_id)
        );
        sqlx::query(&sql)
            .bind(delta)
            .bind(i64::from(u32::from(meta_data_id)))
            .bind(server_id.as_ref())
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn insert_connector_message_in(
        conn: &mut SqliteConnection,
        local_id: i64,
        cm: &ConnectorMessage,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (ID, MESSAGE_ID, SERVER_ID, RECEIVED_DATE, STATUS, CONNECTOR_NAME, \
             SEND_ATTEMPTS, SEND_DATE, RESPONSE_DATE, ERROR_CODE, CHAIN_ID, ORDER_ID) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            connector_messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(u32::from(cm.meta_data_id)))
            .bind(i64::from(cm.message_id))
            .bind(cm.server_id.as_ref())
            .bind(to_millis(cm.received_date))
            .bind(cm.status.as_char().to_string())
            .bind(&cm.connector_name)
            .bind(i64::from(cm.send_attempts))
            .bind(cm.send_date.map(to_millis))
            .bind(cm.response_date.map(to_millis))
            .bind(i64::from(cm.error_code))
            .bind(i64::from(cm.chain_id))
            .bind(i64::from(cm.order_id))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn store_map_content_in(
        &self,
        conn: &mut SqliteConnection,
        local_id: i64,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content_type: ContentType,
        map: &MessageMap,
    ) -> Result<(), StoreError> {
        let snapshot = map.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        let json = serde_json::to_string(&snapshot)?;
        let content = MessageContent::new(content_type, json);
        let (text, encrypted) = self.encrypt_for_store(&content);
        Self::insert_content_in(
            conn,
            local_id,
            message_id,
            meta_data_id,
            content_type,
            &text,
            None,
            encrypted,
        )
        .await?;
        Ok(())
    }

    fn parse_connector_row(
        &self,
        channel_id: &ChannelId,
        row: &sqlx::sqlite::SqliteRow,
    ) -> Result<ConnectorMessage, StoreError> {
        let meta_data_id = MetaDataId::new(u32::try_from(row.try_get::<i64, _>("ID")?).map_err(
            |_| StoreError::InvalidRow {
                message: "negative metadata id".to_string(),
            },
        )?);
        let message_id = MessageId::new(row.try_get::<i64, _>("MESSAGE_ID")?);
        let server_id = parse_server_id(row.try_get::<String, _>("SERVER_ID")?)?;
        let received_date = from_millis(row.try_get::<i64, _>("RECEIVED_DATE")?)?;
        let status = parse_status(&row.try_get::<String, _>("STATUS")?)?;
        let connector_name: String = row.try_get("CONNECTOR_NAME")?;
        let chain_id = u32::try_from(row.try_get::<i64, _>("CHAIN_ID")?).unwrap_or(0);
        let order_id = u32::try_from(row.try_get::<i64, _>("ORDER_ID")?).unwrap_or(0);

        let mut cm = if meta_data_id.is_source() {
            ConnectorMessage::source(
                message_id,
                channel_id.clone(),
                server_id,
                connector_name,
                received_date,
                MessageMap::new(),
            )
        } else {
            ConnectorMessage::destination(
                message_id,
                meta_data_id,
                channel_id.clone(),
                server_id,
                connector_name,
                received_date,
                chain_id,
                order_id,
                MessageMap::new(),
                MessageMap::new(),
                MessageMap::new(),
            )
        };
        cm.status = status;
        cm.send_attempts = u32::try_from(row.try_get::<i64, _>("SEND_ATTEMPTS")?).unwrap_or(0);
        cm.send_date = row
            .try_get::<Option<i64>, _>("SEND_DATE")?
            .map(from_millis)
            .transpose()?;
        cm.response_date = row
            .try_get::<Option<i64>, _>("RESPONSE_DATE")?
            .map(from_millis)
            .transpose()?;
        cm.error_code = i32::try_from(row.try_get::<i64, _>("ERROR_CODE")?).unwrap_or(0);
        Ok(cm)
    }

    /// Attaches persisted content and map rows to a loaded connector
    /// message (content under its own metadata id, source map under `0`).
    async fn load_connector_content(
        &self,
        local_id: i64,
        cm: &mut ConnectorMessage,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "SELECT CONTENT_TYPE, CONTENT, DATA_TYPE, IS_ENCRYPTED FROM {} \
             WHERE MESSAGE_ID = ? AND (METADATA_ID = ? OR (METADATA_ID = 0 AND CONTENT_TYPE = ?))",
            content_table(local_id)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(cm.message_id))
            .bind(i64::from(u32::from(cm.meta_data_id)))
            .bind(i64::from(ContentType::SourceMap.as_code()))
            .fetch_all(self.connection.pool())
            .await?;

        for row in rows {
            let code = u8::try_from(row.try_get::<i64, _>("CONTENT_TYPE")?).map_err(|_| {
                StoreError::InvalidRow {
                    message: "content type out of range".to_string(),
                }
            })?;
            let content_type =
                ContentType::from_code(code).map_err(|e| StoreError::InvalidRow {
                    message: e.to_string(),
                })?;
            let stored: String = row.try_get("CONTENT")?;
            let encrypted: bool = row.try_get("IS_ENCRYPTED")?;
            let (text, still_encrypted) = self.decrypt_loaded(stored, encrypted);

            match content_type {
                ContentType::SourceMap => {
                    cm.source_map
                        .restore(serde_json::from_str(&text).unwrap_or_default());
                }
                ContentType::ChannelMap => {
                    cm.channel_map
                        .restore(serde_json::from_str(&text).unwrap_or_default());
                }
                ContentType::ConnectorMap => {
                    cm.connector_map
                        .restore(serde_json::from_str(&text).unwrap_or_default());
                }
                ContentType::ResponseMap => {
                    cm.response_map
                        .restore(serde_json::from_str(&text).unwrap_or_default());
                }
                other => {
                    let mut content = MessageContent::new(other, text);
                    content.data_type = row.try_get("DATA_TYPE")?;
                    content.encrypted = still_encrypted;
                    cm.set_content(content);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self), fields(channel_id = %channel_id))]
    async fn register_channel(&self, channel_id: &ChannelId) -> Result<i64, StoreError> {
        if let Some(cached) = self.local_ids.get(channel_id) {
            return Ok(*cached);
        }

        let mut tx = self.connection.pool().begin().await?;
        let existing =
            sqlx::query("SELECT LOCAL_CHANNEL_ID FROM D_CHANNELS WHERE CHANNEL_ID = ?")
                .bind(channel_id.as_ref())
                .fetch_optional(&mut *tx)
                .await?;
        let local_id = match existing {
            Some(row) => row.try_get::<i64, _>("LOCAL_CHANNEL_ID")?,
            None => {
                let next: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(LOCAL_CHANNEL_ID), 0) + 1 FROM D_CHANNELS",
                )
                .fetch_one(&mut *tx)
                .await?;
                sqlx::query("INSERT INTO D_CHANNELS (CHANNEL_ID, LOCAL_CHANNEL_ID) VALUES (?, ?)")
                    .bind(channel_id.as_ref())
                    .bind(next)
                    .execute(&mut *tx)
                    .await?;
                next
            }
        };

        let ddl = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    ID INTEGER PRIMARY KEY,
                    SERVER_ID TEXT NOT NULL,
                    RECEIVED_DATE INTEGER NOT NULL,
                    PROCESSED INTEGER NOT NULL DEFAULT 0,
                    ORIGINAL_ID INTEGER,
                    IMPORT_ID INTEGER
                )",
                messages_table(local_id)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    ID INTEGER NOT NULL,
                    MESSAGE_ID INTEGER NOT NULL,
                    SERVER_ID TEXT NOT NULL,
                    RECEIVED_DATE INTEGER NOT NULL,
                    STATUS TEXT NOT NULL CHECK (LENGTH(STATUS) = 1),
                    CONNECTOR_NAME TEXT NOT NULL,
                    SEND_ATTEMPTS INTEGER NOT NULL DEFAULT 0,
                    SEND_DATE INTEGER,
                    RESPONSE_DATE INTEGER,
                    ERROR_CODE INTEGER NOT NULL DEFAULT 0,
                    CHAIN_ID INTEGER NOT NULL DEFAULT 0,
                    ORDER_ID INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (MESSAGE_ID, ID),
                    FOREIGN KEY (MESSAGE_ID) REFERENCES {messages} (ID)
                )",
                table = connector_messages_table(local_id),
                messages = messages_table(local_id)
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS IDX_MM{local_id}_STATUS ON {table} (ID, STATUS)",
                table = connector_messages_table(local_id)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    MESSAGE_ID INTEGER NOT NULL,
                    METADATA_ID INTEGER NOT NULL,
                    CONTENT_TYPE INTEGER NOT NULL,
                    CONTENT TEXT NOT NULL,
                    DATA_TYPE TEXT,
                    IS_ENCRYPTED INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (MESSAGE_ID, METADATA_ID, CONTENT_TYPE)
                )",
                content_table(local_id)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    ID TEXT NOT NULL,
                    MESSAGE_ID INTEGER NOT NULL,
                    SEGMENT_ID INTEGER NOT NULL,
                    TYPE TEXT NOT NULL,
                    SEGMENT BLOB NOT NULL,
                    PRIMARY KEY (ID, MESSAGE_ID, SEGMENT_ID)
                )",
                attachments_table(local_id)
            ),
            // QUEUED folds into the SENT column (historical compatibility).
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    METADATA_ID INTEGER NOT NULL,
                    SERVER_ID TEXT NOT NULL,
                    RECEIVED INTEGER NOT NULL DEFAULT 0,
                    FILTERED INTEGER NOT NULL DEFAULT 0,
                    SENT INTEGER NOT NULL DEFAULT 0,
                    ERROR INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (METADATA_ID, SERVER_ID)
                )",
                statistics_table(local_id)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    LOCAL_CHANNEL_ID INTEGER NOT NULL
                )",
                sequence_table(local_id)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    MESSAGE_ID INTEGER NOT NULL,
                    METADATA_ID INTEGER NOT NULL,
                    NAME TEXT NOT NULL,
                    VALUE TEXT,
                    PRIMARY KEY (MESSAGE_ID, METADATA_ID, NAME)
                )",
                custom_metadata_table(local_id)
            ),
        ];
        for statement in &ddl {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        let seed = format!(
            "INSERT INTO {table} (LOCAL_CHANNEL_ID) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {table})",
            table = sequence_table(local_id)
        );
        sqlx::query(&seed).execute(&mut *tx).await?;
        tx.commit().await?;

        self.local_ids.insert(channel_id.clone(), local_id);
        info!(local_id, "channel registered");
        Ok(local_id)
    }

    #[instrument(skip(self), fields(channel_id = %channel_id))]
    async fn drop_channel(&self, channel_id: &ChannelId) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let mut tx = self.connection.pool().begin().await?;
        for table in [
            content_table(local_id),
            attachments_table(local_id),
            custom_metadata_table(local_id),
            connector_messages_table(local_id),
            messages_table(local_id),
            statistics_table(local_id),
            sequence_table(local_id),
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM D_CHANNELS WHERE CHANNEL_ID = ?")
            .bind(channel_id.as_ref())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.local_ids.remove(channel_id);
        Ok(())
    }

    async fn next_message_id(&self, channel_id: &ChannelId) -> Result<MessageId, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "UPDATE {table} SET LOCAL_CHANNEL_ID = LOCAL_CHANNEL_ID + 1 RETURNING LOCAL_CHANNEL_ID",
            table = sequence_table(local_id)
        );
        let pool = self.connection.pool().clone();
        let id: i64 = with_retry(self.connection.deadlock_retries(), || {
            let sql = sql.clone();
            let pool = pool.clone();
            async move { sqlx::query_scalar(&sql).fetch_one(&pool).await }
        })
        .await?;
        Ok(MessageId::new(id))
    }

    #[instrument(skip(self, message, source, settings), fields(message_id = %message.message_id))]
    async fn insert_dispatch(
        &self,
        message: &Message,
        source: &ConnectorMessage,
        settings: &StorageSettings,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(&message.channel_id).await?;
        let mut tx = self.connection.pool().begin().await?;

        let sql = format!(
            "INSERT INTO {} (ID, SERVER_ID, RECEIVED_DATE, PROCESSED, ORIGINAL_ID, IMPORT_ID) \
             VALUES (?, ?, ?, 0, ?, ?)",
            messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(message.message_id))
            .bind(message.server_id.as_ref())
            .bind(to_millis(message.received_date))
            .bind(message.original_id.map(i64::from))
            .bind(message.import_id.map(i64::from))
            .execute(&mut *tx)
            .await?;

        Self::insert_connector_message_in(&mut tx, local_id, source).await?;

        if settings.stores_content(ContentType::Raw, true) {
            if let Some(raw) = source.content(ContentType::Raw) {
                let (text, encrypted) = self.encrypt_for_store(raw);
                Self::insert_content_in(
                    &mut tx,
                    local_id,
                    message.message_id,
                    MetaDataId::source(),
                    ContentType::Raw,
                    &text,
                    raw.data_type.as_deref(),
                    encrypted,
                )
                .await?;
            }
        }

        if settings.stores_content(ContentType::SourceMap, true) {
            self.store_map_content_in(
                &mut tx,
                local_id,
                message.message_id,
                MetaDataId::source(),
                ContentType::SourceMap,
                &source.source_map,
            )
            .await?;
        }

        Self::upsert_statistics_in(
            &mut tx,
            local_id,
            MetaDataId::source(),
            &self.server_id,
            Status::Received,
            1,
        )
        .await?;

        tx.commit().await?;
        debug!("dispatch persisted");
        Ok(())
    }

    async fn insert_connector_message(
        &self,
        connector_message: &ConnectorMessage,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(&connector_message.channel_id).await?;
        let mut conn = self.connection.pool().acquire().await?;
        Self::insert_connector_message_in(&mut conn, local_id, connector_message).await?;
        Ok(())
    }

    async fn update_status(&self, connector_message: &ConnectorMessage) -> Result<(), StoreError> {
        let local_id = self.local_id(&connector_message.channel_id).await?;
        // Terminal statuses already on disk stay put; only explicit reset
        // operations reopen them.
        let sql = format!(
            "UPDATE {} SET STATUS = ?, SEND_ATTEMPTS = ?, SEND_DATE = ?, RESPONSE_DATE = ?, \
             ERROR_CODE = ? WHERE MESSAGE_ID = ? AND ID = ? AND STATUS NOT IN ('S', 'F', 'E')",
            connector_messages_table(local_id)
        );
        let pool = self.connection.pool().clone();
        let cm = connector_message;
        with_retry(self.connection.deadlock_retries(), || {
            let sql = sql.clone();
            let pool = pool.clone();
            async move {
                sqlx::query(&sql)
                    .bind(cm.status.as_char().to_string())
                    .bind(i64::from(cm.send_attempts))
                    .bind(cm.send_date.map(to_millis))
                    .bind(cm.response_date.map(to_millis))
                    .bind(i64::from(cm.error_code))
                    .bind(i64::from(cm.message_id))
                    .bind(i64::from(u32::from(cm.meta_data_id)))
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn update_send_attempts(
        &self,
        connector_message: &ConnectorMessage,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(&connector_message.channel_id).await?;
        let sql = format!(
            "UPDATE {} SET SEND_ATTEMPTS = ?, SEND_DATE = ?, RESPONSE_DATE = ? \
             WHERE MESSAGE_ID = ? AND ID = ?",
            connector_messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(connector_message.send_attempts))
            .bind(connector_message.send_date.map(to_millis))
            .bind(connector_message.response_date.map(to_millis))
            .bind(i64::from(connector_message.message_id))
            .bind(i64::from(u32::from(connector_message.meta_data_id)))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn set_processed(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "UPDATE {} SET PROCESSED = 1 WHERE ID = ?",
            messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(message_id))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn store_content(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content: &MessageContent,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let (text, encrypted) = self.encrypt_for_store(content);
        let mut conn = self.connection.pool().acquire().await?;
        Self::insert_content_in(
            &mut conn,
            local_id,
            message_id,
            meta_data_id,
            content.content_type,
            &text,
            content.data_type.as_deref(),
            encrypted,
        )
        .await?;
        Ok(())
    }

    async fn get_content(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content_type: ContentType,
    ) -> Result<Option<MessageContent>, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "SELECT CONTENT, DATA_TYPE, IS_ENCRYPTED FROM {} \
             WHERE MESSAGE_ID = ? AND METADATA_ID = ? AND CONTENT_TYPE = ?",
            content_table(local_id)
        );
        let row = sqlx::query(&sql)
            .bind(i64::from(message_id))
            .bind(i64::from(u32::from(meta_data_id)))
            .bind(i64::from(content_type.as_code()))
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let stored: String = row.try_get("CONTENT")?;
        let encrypted: bool = row.try_get("IS_ENCRYPTED")?;
        let (text, still_encrypted) = self.decrypt_loaded(stored, encrypted);
        let mut content = MessageContent::new(content_type, text);
        content.data_type = row.try_get("DATA_TYPE")?;
        content.encrypted = still_encrypted;
        Ok(Some(content))
    }

    async fn store_maps(
        &self,
        connector_message: &ConnectorMessage,
        settings: &StorageSettings,
    ) -> Result<(), StoreError> {
        let is_source = connector_message.meta_data_id.is_source();
        if !settings.stores_content(ContentType::ChannelMap, is_source) {
            return Ok(());
        }
        let local_id = self.local_id(&connector_message.channel_id).await?;
        let mut tx = self.connection.pool().begin().await?;
        if is_source {
            self.store_map_content_in(
                &mut tx,
                local_id,
                connector_message.message_id,
                connector_message.meta_data_id,
                ContentType::SourceMap,
                &connector_message.source_map,
            )
            .await?;
        }
        self.store_map_content_in(
            &mut tx,
            local_id,
            connector_message.message_id,
            connector_message.meta_data_id,
            ContentType::ChannelMap,
            &connector_message.channel_map,
        )
        .await?;
        self.store_map_content_in(
            &mut tx,
            local_id,
            connector_message.message_id,
            connector_message.meta_data_id,
            ContentType::ConnectorMap,
            &connector_message.connector_map,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_response_map(
        &self,
        connector_message: &ConnectorMessage,
        settings: &StorageSettings,
    ) -> Result<(), StoreError> {
        let is_source = connector_message.meta_data_id.is_source();
        if !settings.stores_content(ContentType::ResponseMap, is_source) {
            return Ok(());
        }
        let local_id = self.local_id(&connector_message.channel_id).await?;
        let mut conn = self.connection.pool().acquire().await?;
        self.store_map_content_in(
            &mut conn,
            local_id,
            connector_message.message_id,
            connector_message.meta_data_id,
            ContentType::ResponseMap,
            &connector_message.response_map,
        )
        .await?;
        Ok(())
    }

    async fn get_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<Option<Message>, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "SELECT ID, SERVER_ID, RECEIVED_DATE, PROCESSED, ORIGINAL_ID, IMPORT_ID FROM {} WHERE ID = ?",
            messages_table(local_id)
        );
        let row = sqlx::query(&sql)
            .bind(i64::from(message_id))
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut message = Message::new(
            message_id,
            channel_id.clone(),
            parse_server_id(row.try_get::<String, _>("SERVER_ID")?)?,
            from_millis(row.try_get::<i64, _>("RECEIVED_DATE")?)?,
        );
        message.processed = row.try_get::<i64, _>("PROCESSED")? != 0;
        message.original_id = row
            .try_get::<Option<i64>, _>("ORIGINAL_ID")?
            .map(MessageId::new);
        message.import_id = row
            .try_get::<Option<i64>, _>("IMPORT_ID")?
            .map(MessageId::new);

        let sql = format!(
            "SELECT ID, MESSAGE_ID, SERVER_ID, RECEIVED_DATE, STATUS, CONNECTOR_NAME, SEND_ATTEMPTS, \
             SEND_DATE, RESPONSE_DATE, ERROR_CODE, CHAIN_ID, ORDER_ID FROM {} WHERE MESSAGE_ID = ? ORDER BY ID",
            connector_messages_table(local_id)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(message_id))
            .fetch_all(self.connection.pool())
            .await?;
        for row in &rows {
            message.insert_connector_message(self.parse_connector_row(channel_id, row)?);
        }
        Ok(Some(message))
    }

    async fn get_unfinished_message_ids(
        &self,
        channel_id: &ChannelId,
        server_id: &ServerId,
    ) -> Result<Vec<MessageId>, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "SELECT ID FROM {} WHERE PROCESSED = 0 AND SERVER_ID = ? ORDER BY ID",
            messages_table(local_id)
        );
        let rows = sqlx::query(&sql)
            .bind(server_id.as_ref())
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter()
            .map(|row| Ok(MessageId::new(row.try_get::<i64, _>("ID")?)))
            .collect()
    }

    async fn get_queued_connector_messages(
        &self,
        channel_id: &ChannelId,
        meta_data_id: MetaDataId,
        exclude: &[MessageId],
        limit: u32,
    ) -> Result<Vec<ConnectorMessage>, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let exclusion = if exclude.is_empty() {
            String::new()
        } else {
            let ids: Vec<String> = exclude.iter().map(|id| i64::from(*id).to_string()).collect();
            format!(" AND MESSAGE_ID NOT IN ({})", ids.join(", "))
        };
        let sql = format!(
            "SELECT ID, MESSAGE_ID, SERVER_ID, RECEIVED_DATE, STATUS, CONNECTOR_NAME, SEND_ATTEMPTS, \
             SEND_DATE, RESPONSE_DATE, ERROR_CODE, CHAIN_ID, ORDER_ID FROM {table} \
             WHERE ID = ? AND STATUS = 'Q'{exclusion} ORDER BY MESSAGE_ID LIMIT ?",
            table = connector_messages_table(local_id)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(u32::from(meta_data_id)))
            .bind(i64::from(limit))
            .fetch_all(self.connection.pool())
            .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cm = self.parse_connector_row(channel_id, row)?;
            self.load_connector_content(local_id, &mut cm).await?;
            messages.push(cm);
        }
        Ok(messages)
    }

    #[instrument(skip(self, settings), fields(channel_id = %channel_id, message_id = %message_id))]
    async fn recover_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        settings: &StorageSettings,
    ) -> Result<Vec<RecoveredConnector>, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let mut tx = self.connection.pool().begin().await?;

        let sql = format!(
            "SELECT ID, STATUS FROM {} WHERE MESSAGE_ID = ? AND STATUS IN ('R', 'P')",
            connector_messages_table(local_id)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(message_id))
            .fetch_all(&mut *tx)
            .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in &rows {
            let meta_data_id =
                MetaDataId::new(u32::try_from(row.try_get::<i64, _>("ID")?).map_err(|_| {
                    StoreError::InvalidRow {
                        message: "negative metadata id".to_string(),
                    }
                })?);
            let original_status = parse_status(&row.try_get::<String, _>("STATUS")?)?;

            let sql = format!(
                "UPDATE {} SET STATUS = 'E' WHERE MESSAGE_ID = ? AND ID = ?",
                connector_messages_table(local_id)
            );
            sqlx::query(&sql)
                .bind(i64::from(message_id))
                .bind(i64::from(u32::from(meta_data_id)))
                .execute(&mut *tx)
                .await?;

            if settings.stores_content(ContentType::ProcessingError, meta_data_id.is_source()) {
                let note = format!(
                    "Message recovered after server restart. Original status: {}",
                    original_status.as_char()
                );
                Self::insert_content_in(
                    &mut tx,
                    local_id,
                    message_id,
                    meta_data_id,
                    ContentType::ProcessingError,
                    &note,
                    None,
                    false,
                )
                .await?;
            }

            Self::upsert_statistics_in(
                &mut tx,
                local_id,
                meta_data_id,
                &self.server_id,
                Status::Error,
                1,
            )
            .await?;
            if !meta_data_id.is_source() {
                // Destinations also contribute ERROR to the aggregate row.
                Self::upsert_statistics_in(
                    &mut tx,
                    local_id,
                    MetaDataId::source(),
                    &self.server_id,
                    Status::Error,
                    1,
                )
                .await?;
            }

            recovered.push(RecoveredConnector {
                meta_data_id,
                original_status,
            });
        }

        let sql = format!(
            "UPDATE {} SET PROCESSED = 1 WHERE ID = ?",
            messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(message_id))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(recovered)
    }

    async fn increment_statistics(
        &self,
        channel_id: &ChannelId,
        updates: &[StatisticsUpdate],
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let local_id = self.local_id(channel_id).await?;

        // Channel-aggregate updates (metadata id 0) go first across every
        // flush cycle; concurrent flushes touching both levels then lock
        // rows in the same order.
        let mut ordered: Vec<StatisticsUpdate> = updates.to_vec();
        ordered.sort_by_key(|update| update.meta_data_id);

        let mut tx = self.connection.pool().begin().await?;
        for update in &ordered {
            Self::upsert_statistics_in(
                &mut tx,
                local_id,
                update.meta_data_id,
                &self.server_id,
                update.status,
                update.delta,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_statistics(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<StatisticsRow>, StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "SELECT METADATA_ID, SERVER_ID, RECEIVED, FILTERED, SENT, ERROR FROM {} ORDER BY METADATA_ID",
            statistics_table(local_id)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter()
            .map(|row| {
                Ok(StatisticsRow {
                    meta_data_id: MetaDataId::new(
                        u32::try_from(row.try_get::<i64, _>("METADATA_ID")?).map_err(|_| {
                            StoreError::InvalidRow {
                                message: "negative metadata id".to_string(),
                            }
                        })?,
                    ),
                    server_id: parse_server_id(row.try_get::<String, _>("SERVER_ID")?)?,
                    received: row.try_get("RECEIVED")?,
                    filtered: row.try_get("FILTERED")?,
                    sent: row.try_get("SENT")?,
                    error: row.try_get("ERROR")?,
                })
            })
            .collect()
    }

    async fn reset_statistics(
        &self,
        channel_id: &ChannelId,
        meta_data_id: Option<MetaDataId>,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = match meta_data_id {
            Some(_) => format!(
                "UPDATE {} SET RECEIVED = 0, FILTERED = 0, SENT = 0, ERROR = 0 WHERE METADATA_ID = ?",
                statistics_table(local_id)
            ),
            None => format!(
                "UPDATE {} SET RECEIVED = 0, FILTERED = 0, SENT = 0, ERROR = 0",
                statistics_table(local_id)
            ),
        };
        let mut query = sqlx::query(&sql);
        if let Some(meta) = meta_data_id {
            query = query.bind(i64::from(u32::from(meta)));
        }
        query.execute(self.connection.pool()).await?;
        Ok(())
    }

    async fn reset_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let mut tx = self.connection.pool().begin().await?;
        let sql = format!(
            "UPDATE {} SET PROCESSED = 0 WHERE ID = ?",
            messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(message_id))
            .execute(&mut *tx)
            .await?;
        let sql = format!(
            "UPDATE {} SET STATUS = 'P', SEND_ATTEMPTS = 0, SEND_DATE = NULL, \
             RESPONSE_DATE = NULL, ERROR_CODE = 0 WHERE MESSAGE_ID = ? AND ID > 0",
            connector_messages_table(local_id)
        );
        sqlx::query(&sql)
            .bind(i64::from(message_id))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(channel_id = %channel_id, message_id = %message_id))]
    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let mut tx = self.connection.pool().begin().await?;
        // Child to parent order.
        for table in [
            content_table(local_id),
            attachments_table(local_id),
            custom_metadata_table(local_id),
            connector_messages_table(local_id),
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE MESSAGE_ID = ?"))
                .bind(i64::from(message_id))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!(
            "DELETE FROM {} WHERE ID = ?",
            messages_table(local_id)
        ))
        .bind(i64::from(message_id))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn prune_completed_content(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        only_filtered: bool,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = if only_filtered {
            format!(
                "DELETE FROM {content} WHERE MESSAGE_ID = ? AND METADATA_ID IN \
                 (SELECT ID FROM {mm} WHERE MESSAGE_ID = ? AND STATUS = 'F')",
                content = content_table(local_id),
                mm = connector_messages_table(local_id)
            )
        } else {
            format!(
                "DELETE FROM {} WHERE MESSAGE_ID = ?",
                content_table(local_id)
            )
        };
        let mut query = sqlx::query(&sql).bind(i64::from(message_id));
        if only_filtered {
            query = query.bind(i64::from(message_id));
        }
        query.execute(self.connection.pool()).await?;
        Ok(())
    }

    async fn insert_attachment(
        &self,
        channel_id: &ChannelId,
        attachment: &Attachment,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "INSERT OR REPLACE INTO {} (ID, MESSAGE_ID, SEGMENT_ID, TYPE, SEGMENT) VALUES (?, ?, ?, ?, ?)",
            attachments_table(local_id)
        );
        let mut tx = self.connection.pool().begin().await?;
        for (segment_id, segment) in attachment.body.chunks(ATTACHMENT_SEGMENT_BYTES).enumerate() {
            sqlx::query(&sql)
                .bind(&attachment.id)
                .bind(i64::from(attachment.message_id))
                .bind(segment_id as i64)
                .bind(&attachment.mime_type)
                .bind(segment)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_attachments(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let local_id = self.local_id(channel_id).await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE MESSAGE_ID = ?",
            attachments_table(local_id)
        ))
        .bind(i64::from(message_id))
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn store_custom_metadata(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        values: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let local_id = self.local_id(channel_id).await?;
        let sql = format!(
            "INSERT OR REPLACE INTO {} (MESSAGE_ID, METADATA_ID, NAME, VALUE) VALUES (?, ?, ?, ?)",
            custom_metadata_table(local_id)
        );
        let mut tx = self.connection.pool().begin().await?;
        for (name, value) in values {
            sqlx::query(&sql)
                .bind(i64::from(message_id))
                .bind(i64::from(u32::from(meta_data_id)))
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
