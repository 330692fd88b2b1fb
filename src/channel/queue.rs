//! Durable per-destination queue with an acquire/release lifecycle.
//!
//! The authoritative queue contents are the `QUEUED` connector-message rows
//! in the store; this type is an in-memory buffer over them. Messages
//! checked out by one worker are invisible to other workers until released.
//! With a `group_by` key the buffer partitions into per-bucket sub-queues,
//! each owned by one send worker, preserving insertion order inside a
//! bucket.

use std::collections::{HashSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::message::{ChannelId, ConnectorMessage, MessageId, MetaDataId};
use crate::store::{MessageStore, StoreError};

/// How many rows a refill pulls from the store at once.
const REFILL_BATCH: u32 = 100;

/// Queue behavior for one destination.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Whether failed sends requeue instead of erroring.
    pub enabled: bool,
    /// Whether a failed message rotates to the back instead of blocking
    /// head-of-line.
    pub rotate: bool,
    /// Number of send workers.
    pub thread_count: u32,
    /// Source-map key whose value buckets messages across workers.
    pub group_by: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rotate: false,
            thread_count: 1,
            group_by: None,
        }
    }
}

impl QueueSettings {
    /// Buckets exist only under a `group_by`; otherwise all workers share
    /// one sub-queue.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        if self.group_by.is_some() {
            self.thread_count.max(1) as usize
        } else {
            1
        }
    }
}

struct Buffers {
    buckets: Vec<VecDeque<ConnectorMessage>>,
    buffered: HashSet<MessageId>,
}

/// Durable queue for one destination.
pub struct DestinationQueue {
    channel_id: ChannelId,
    meta_data_id: MetaDataId,
    store: Arc<dyn MessageStore>,
    settings: QueueSettings,
    buffers: Mutex<Buffers>,
    checked_out: Mutex<HashSet<MessageId>>,
    deleted: Mutex<HashSet<MessageId>>,
    size: AtomicI64,
    notify: Notify,
}

impl DestinationQueue {
    /// Creates an empty queue over the destination's `QUEUED` rows.
    #[must_use]
    pub fn new(
        channel_id: ChannelId,
        meta_data_id: MetaDataId,
        settings: QueueSettings,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let bucket_count = settings.bucket_count();
        Self {
            channel_id,
            meta_data_id,
            store,
            settings,
            buffers: Mutex::new(Buffers {
                buckets: (0..bucket_count).map(|_| VecDeque::new()).collect(),
                buffered: HashSet::new(),
            }),
            checked_out: Mutex::new(HashSet::new()),
            deleted: Mutex::new(HashSet::new()),
            size: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    /// The bucket a message belongs to, by hash of its `group_by` value.
    #[must_use]
    pub fn bucket_for(&self, connector_message: &ConnectorMessage) -> usize {
        let bucket_count = self.settings.bucket_count();
        if bucket_count == 1 {
            return 0;
        }
        let key = self
            .settings
            .group_by
            .as_ref()
            .and_then(|group_by| connector_message.source_map.get(group_by))
            .map(|value| value.to_string())
            .unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % bucket_count
    }

    /// Logical number of unfinished messages in the queue.
    #[must_use]
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Enqueues a message already persisted in `QUEUED`.
    pub fn add(&self, connector_message: ConnectorMessage) {
        let bucket = self.bucket_for(&connector_message);
        {
            let mut buffers = self.buffers.lock().expect("queue lock poisoned");
            if buffers.buffered.insert(connector_message.message_id) {
                buffers.buckets[bucket].push_back(connector_message);
            }
        }
        self.size.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn try_pop(&self, bucket: usize) -> Option<ConnectorMessage> {
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        let mut deleted = self.deleted.lock().expect("queue lock poisoned");
        while let Some(candidate) = buffers.buckets[bucket].pop_front() {
            buffers.buffered.remove(&candidate.message_id);
            if deleted.remove(&candidate.message_id) {
                // Deleted messages never re-enter the pipeline.
                self.size.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            self.checked_out
                .lock()
                .expect("queue lock poisoned")
                .insert(candidate.message_id);
            return Some(candidate);
        }
        None
    }

    /// Takes the next available message in the bucket, refilling from the
    /// store when the buffer is dry. Returns `None` when nothing is
    /// available.
    ///
    /// # Errors
    ///
    /// Propagates store failures during refill.
    pub async fn acquire(&self, bucket: usize) -> Result<Option<ConnectorMessage>, StoreError> {
        if let Some(message) = self.try_pop(bucket) {
            return Ok(Some(message));
        }

        let exclude: Vec<MessageId> = {
            let checked_out = self.checked_out.lock().expect("queue lock poisoned");
            let buffers = self.buffers.lock().expect("queue lock poisoned");
            checked_out
                .iter()
                .chain(buffers.buffered.iter())
                .copied()
                .collect()
        };
        let fetched = self
            .store
            .get_queued_connector_messages(&self.channel_id, self.meta_data_id, &exclude, REFILL_BATCH)
            .await?;
        if !fetched.is_empty() {
            debug!(count = fetched.len(), "refilled destination queue from store");
            let mut buffers = self.buffers.lock().expect("queue lock poisoned");
            for message in fetched {
                let bucket = self.bucket_for(&message);
                if buffers.buffered.insert(message.message_id) {
                    buffers.buckets[bucket].push_back(message);
                }
            }
        }

        Ok(self.try_pop(bucket))
    }

    /// Returns a message after a processing attempt. `finished` means the
    /// message reached a terminal status and leaves the queue; otherwise it
    /// stays queued for retry, rotating to the back when rotation is on.
    pub fn release(&self, connector_message: ConnectorMessage, finished: bool) {
        self.checked_out
            .lock()
            .expect("queue lock poisoned")
            .remove(&connector_message.message_id);
        if finished {
            self.deleted
                .lock()
                .expect("queue lock poisoned")
                .remove(&connector_message.message_id);
            self.size.fetch_sub(1, Ordering::SeqCst);
        } else {
            let bucket = self.bucket_for(&connector_message);
            let mut buffers = self.buffers.lock().expect("queue lock poisoned");
            if buffers.buffered.insert(connector_message.message_id) {
                if self.settings.rotate {
                    buffers.buckets[bucket].push_back(connector_message);
                } else {
                    buffers.buckets[bucket].push_front(connector_message);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Marks a message deleted so workers discard already-acquired copies.
    pub fn mark_as_deleted(&self, message_id: MessageId) {
        self.deleted
            .lock()
            .expect("queue lock poisoned")
            .insert(message_id);
    }

    /// Discards an acquired message when it was deleted underneath the
    /// worker. Returns whether it was deleted.
    pub fn release_if_deleted(&self, connector_message: &ConnectorMessage) -> bool {
        let was_deleted = {
            let mut deleted = self.deleted.lock().expect("queue lock poisoned");
            deleted.remove(&connector_message.message_id)
        };
        if was_deleted {
            self.checked_out
                .lock()
                .expect("queue lock poisoned")
                .remove(&connector_message.message_id);
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        was_deleted
    }

    /// Clears the in-memory buffer; the next acquire re-reads from the
    /// store. Used after external mutation (reset, reprocess).
    pub fn invalidate(&self) {
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        for bucket in &mut buffers.buckets {
            bucket.clear();
        }
        buffers.buffered.clear();
    }

    /// Waits until new work may be available, bounded by `timeout`.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, EngineMode};
    use crate::database::DatabaseConnection;
    use crate::message::maps::MessageMap;
    use crate::message::{ServerId, Status};
    use crate::settings::StorageSettings;
    use crate::store::SqliteMessageStore;
    use chrono::Utc;
    use tempfile::tempdir;

    fn channel_id() -> ChannelId {
        ChannelId::try_new("11111111-2222-3333-4444-555555555555".to_string()).unwrap()
    }

    fn server_id() -> ServerId {
        ServerId::try_new("node-a".to_string()).unwrap()
    }

    async fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteMessageStore> {
        let config = EngineConfig::for_testing(dir.path().join("test.db"), server_id());
        let connection = DatabaseConnection::initialize(&config).await.unwrap();
        let store = SqliteMessageStore::open(connection, server_id(), EngineMode::Standalone)
            .await
            .unwrap();
        store.register_channel(&channel_id()).await.unwrap();
        Arc::new(store)
    }

    async fn queued_message(store: &SqliteMessageStore, meta: u32) -> ConnectorMessage {
        let message_id = store.next_message_id(&channel_id()).await.unwrap();
        let message = crate::message::Message::new(message_id, channel_id(), server_id(), Utc::now());
        let source = ConnectorMessage::source(
            message_id,
            channel_id(),
            server_id(),
            "Source",
            message.received_date,
            MessageMap::new(),
        );
        store
            .insert_dispatch(&message, &source, &StorageSettings::development())
            .await
            .unwrap();

        let mut cm = ConnectorMessage::destination(
            message_id,
            MetaDataId::new(meta),
            channel_id(),
            server_id(),
            "Destination 1",
            message.received_date,
            1,
            1,
            MessageMap::new(),
            MessageMap::new(),
            MessageMap::new(),
        );
        cm.status = Status::Queued;
        store.insert_connector_message(&cm).await.unwrap();
        cm
    }

    #[tokio::test]
    async fn test_should_preserve_insertion_order_when_acquiring_from_bucket() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );

        let first = queued_message(&store, 1).await;
        let second = queued_message(&store, 1).await;
        queue.add(first.clone());
        queue.add(second.clone());

        let a = queue.acquire(0).await.unwrap().unwrap();
        let b = queue.acquire(0).await.unwrap().unwrap();
        assert_eq!(a.message_id, first.message_id);
        assert_eq!(b.message_id, second.message_id);
    }

    #[tokio::test]
    async fn test_should_skip_checked_out_messages_when_acquiring_again() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );
        let message = queued_message(&store, 1).await;
        queue.add(message);

        let acquired = queue.acquire(0).await.unwrap();
        assert!(acquired.is_some());
        // Checked out: invisible even though the store still holds it.
        let again = queue.acquire(0).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_should_refill_from_store_when_buffer_is_empty() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let message = queued_message(&store, 1).await;
        // Nothing was added in memory; the row exists only in the store.
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );

        let acquired = queue.acquire(0).await.unwrap().unwrap();
        assert_eq!(acquired.message_id, message.message_id);
    }

    #[tokio::test]
    async fn test_should_keep_message_queued_when_released_unfinished() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );
        let message = queued_message(&store, 1).await;
        queue.add(message.clone());

        let acquired = queue.acquire(0).await.unwrap().unwrap();
        queue.release(acquired, false);
        assert_eq!(queue.size(), 1);

        let again = queue.acquire(0).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_should_shrink_logical_size_when_released_finished() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );
        let message = queued_message(&store, 1).await;
        queue.add(message);
        assert_eq!(queue.size(), 1);

        let acquired = queue.acquire(0).await.unwrap().unwrap();
        queue.release(acquired, true);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_should_discard_acquired_copy_when_message_marked_deleted() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );
        let message = queued_message(&store, 1).await;
        queue.add(message.clone());

        let acquired = queue.acquire(0).await.unwrap().unwrap();
        queue.mark_as_deleted(message.message_id);
        assert!(queue.release_if_deleted(&acquired));
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_should_rotate_failed_message_to_back_when_rotation_enabled() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = DestinationQueue::new(
            channel_id(),
            MetaDataId::new(1),
            QueueSettings {
                enabled: true,
                rotate: true,
                ..QueueSettings::default()
            },
            store.clone(),
        );
        let first = queued_message(&store, 1).await;
        let second = queued_message(&store, 1).await;
        queue.add(first.clone());
        queue.add(second.clone());

        let head = queue.acquire(0).await.unwrap().unwrap();
        assert_eq!(head.message_id, first.message_id);
        queue.release(head, false);

        // Rotation sends the failure behind the younger message.
        let next = queue.acquire(0).await.unwrap().unwrap();
        assert_eq!(next.message_id, second.message_id);
    }
}
