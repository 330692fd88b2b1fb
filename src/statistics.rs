//! Message statistics: authoritative in-memory counters plus a batching
//! accumulator that persists deltas through the store.
//!
//! The row at metadata id `0` doubles as the channel aggregate: the source
//! alone contributes RECEIVED there, destinations spill their SENT,
//! FILTERED and ERROR counts into it in addition to their own rows. Flushes
//! always order the aggregate row first so concurrent channel-level and
//! destination-level updates lock rows in the same order.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::message::{ChannelId, MetaDataId, Status};
use crate::store::{MessageStore, StatisticsRow, StatisticsUpdate, StoreError};

/// Emitted on every tracked-status change when `send_events` is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Channel the event belongs to.
    pub channel_id: ChannelId,
    /// Connector whose status changed.
    pub meta_data_id: MetaDataId,
    /// The tracked status reached.
    pub status: Status,
}

/// Counts for the four tracked statuses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    /// RECEIVED count.
    pub received: i64,
    /// FILTERED count.
    pub filtered: i64,
    /// SENT count.
    pub sent: i64,
    /// ERROR count.
    pub error: i64,
}

impl StatusCounts {
    fn apply(&mut self, status: Status, delta: i64, allow_negatives: bool) {
        let slot = match status {
            Status::Received => &mut self.received,
            Status::Filtered => &mut self.filtered,
            Status::Sent => &mut self.sent,
            Status::Error => &mut self.error,
            Status::Transformed | Status::Queued | Status::Pending => return,
        };
        *slot += delta;
        if !allow_negatives && *slot < 0 {
            *slot = 0;
        }
    }
}

/// Whether a status on the given connector also touches the aggregate row.
///
/// RECEIVED aggregates from the source alone (which already is row `0`);
/// SENT, FILTERED and ERROR spill over from destinations.
fn spills_to_aggregate(meta_data_id: MetaDataId, status: Status) -> bool {
    !meta_data_id.is_source()
        && matches!(status, Status::Sent | Status::Filtered | Status::Error)
}

/// Authoritative in-memory counters for one channel.
pub struct Statistics {
    channel_id: ChannelId,
    counters: DashMap<MetaDataId, StatusCounts>,
    pending: Mutex<HashMap<(MetaDataId, Status), i64>>,
    allow_negatives: bool,
    send_events: bool,
    events: broadcast::Sender<MessageEvent>,
}

impl Statistics {
    /// Creates empty counters for a channel.
    #[must_use]
    pub fn new(channel_id: ChannelId, send_events: bool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            channel_id,
            counters: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            allow_negatives: false,
            send_events,
            events,
        }
    }

    /// Subscribes to [`MessageEvent`] emissions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    /// Seeds the counters from persisted rows at channel start.
    pub fn load(&self, rows: &[StatisticsRow]) {
        for row in rows {
            self.counters.insert(
                row.meta_data_id,
                StatusCounts {
                    received: row.received,
                    filtered: row.filtered,
                    sent: row.sent,
                    error: row.error,
                },
            );
        }
    }

    /// Applies a status transition: decrements the previous tracked status
    /// (floored at zero unless negatives are allowed), increments the new
    /// one, and queues the deltas for the next flush. A transition to a
    /// non-tracked status is ignored entirely, decrement included.
    ///
    /// The normal pipeline passes no previous status; statuses are event
    /// counts, not state counts. The decrement path serves correction
    /// flows (reset, requeue bookkeeping).
    pub fn update_status(
        &self,
        meta_data_id: MetaDataId,
        new_status: Status,
        previous_status: Option<Status>,
    ) {
        if !new_status.is_tracked() {
            return;
        }
        if let Some(previous) = previous_status {
            if previous.is_tracked() {
                self.apply(meta_data_id, previous, -1, true);
            }
        }
        self.apply(meta_data_id, new_status, 1, true);
        self.emit(meta_data_id, new_status);
    }

    /// Records a tracked status whose database delta was already written
    /// (dispatch and recovery increment inside their own transactions);
    /// updates memory and emits without queueing a flush delta.
    pub fn record_persisted(&self, meta_data_id: MetaDataId, status: Status) {
        if !status.is_tracked() {
            return;
        }
        self.apply(meta_data_id, status, 1, false);
        self.emit(meta_data_id, status);
    }

    fn apply(&self, meta_data_id: MetaDataId, status: Status, delta: i64, queue_flush: bool) {
        self.counters
            .entry(meta_data_id)
            .or_default()
            .apply(status, delta, self.allow_negatives);
        if spills_to_aggregate(meta_data_id, status) {
            self.counters
                .entry(MetaDataId::source())
                .or_default()
                .apply(status, delta, self.allow_negatives);
        }
        if queue_flush {
            let mut pending = self.pending.lock().expect("statistics lock poisoned");
            *pending.entry((meta_data_id, status)).or_insert(0) += delta;
        }
    }

    fn emit(&self, meta_data_id: MetaDataId, status: Status) {
        if self.send_events {
            // Nobody listening is fine; send only fails without receivers.
            let _ = self.events.send(MessageEvent {
                channel_id: self.channel_id.clone(),
                meta_data_id,
                status,
            });
        }
    }

    /// Counters for one connector row.
    #[must_use]
    pub fn counts(&self, meta_data_id: MetaDataId) -> StatusCounts {
        self.counters
            .get(&meta_data_id)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// The channel aggregate: RECEIVED from the source only, SENT from
    /// destinations only, FILTERED and ERROR from all connectors.
    #[must_use]
    pub fn channel_aggregate(&self) -> StatusCounts {
        self.counts(MetaDataId::source())
    }

    /// Zeros one connector's counters, or all of them.
    pub fn reset(&self, meta_data_id: Option<MetaDataId>) {
        match meta_data_id {
            Some(meta) => {
                self.counters.remove(&meta);
            }
            None => self.counters.clear(),
        }
    }

    /// Drains the queued deltas and applies them through the store. The
    /// store orders the batch by metadata id ascending, aggregate first.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the drained deltas are lost with them,
    /// matching the at-least-once posture of the pipeline (counters, not
    /// ledgers).
    pub async fn flush(&self, store: &dyn MessageStore) -> Result<(), StoreError> {
        let drained: Vec<StatisticsUpdate> = {
            let mut pending = self.pending.lock().expect("statistics lock poisoned");
            let mut updates: HashMap<(MetaDataId, Status), i64> = HashMap::new();
            for ((meta_data_id, status), delta) in pending.drain() {
                *updates.entry((meta_data_id, status)).or_insert(0) += delta;
                if spills_to_aggregate(meta_data_id, status) {
                    *updates
                        .entry((MetaDataId::source(), status))
                        .or_insert(0) += delta;
                }
            }
            updates
                .into_iter()
                .filter(|(_, delta)| *delta != 0)
                .map(|((meta_data_id, status), delta)| StatisticsUpdate {
                    meta_data_id,
                    status,
                    delta,
                })
                .collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        debug!(updates = drained.len(), "flushing statistics");
        store.increment_statistics(&self.channel_id, &drained).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_id() -> ChannelId {
        ChannelId::try_new("11111111-2222-3333-4444-555555555555".to_string()).unwrap()
    }

    #[test]
    fn test_should_ignore_transition_entirely_when_new_status_is_not_tracked() {
        let statistics = Statistics::new(channel_id(), false);
        statistics.record_persisted(MetaDataId::source(), Status::Received);
        statistics.update_status(MetaDataId::source(), Status::Transformed, Some(Status::Received));
        statistics.update_status(MetaDataId::new(1), Status::Queued, None);
        statistics.update_status(MetaDataId::new(1), Status::Pending, None);

        // RECEIVED is not decremented by the ignored transition.
        let aggregate = statistics.channel_aggregate();
        assert_eq!(aggregate.received, 1);
        assert_eq!(aggregate.sent, 0);
    }

    #[test]
    fn test_should_aggregate_asymmetrically_when_counting_across_connectors() {
        let statistics = Statistics::new(channel_id(), false);
        let d1 = MetaDataId::new(1);
        let d2 = MetaDataId::new(2);

        statistics.record_persisted(MetaDataId::source(), Status::Received);
        statistics.update_status(d1, Status::Sent, None);
        statistics.update_status(d2, Status::Sent, None);

        let aggregate = statistics.channel_aggregate();
        assert_eq!(aggregate.received, 1);
        assert_eq!(aggregate.sent, 2);
        assert_eq!(aggregate.filtered, 0);
        assert_eq!(aggregate.error, 0);

        // Destination rows keep their own counts.
        assert_eq!(statistics.counts(d1).sent, 1);
        assert_eq!(statistics.counts(d2).sent, 1);
    }

    #[test]
    fn test_should_exclude_destination_received_when_aggregating() {
        let statistics = Statistics::new(channel_id(), false);
        statistics.update_status(MetaDataId::new(1), Status::Received, None);
        assert_eq!(statistics.channel_aggregate().received, 0);
        assert_eq!(statistics.counts(MetaDataId::new(1)).received, 1);
    }

    #[test]
    fn test_should_count_errors_from_all_connectors_when_aggregating() {
        let statistics = Statistics::new(channel_id(), false);
        statistics.update_status(MetaDataId::source(), Status::Error, None);
        statistics.update_status(MetaDataId::new(1), Status::Error, None);
        assert_eq!(statistics.channel_aggregate().error, 2);
    }

    #[test]
    fn test_should_floor_at_zero_when_decrementing_below_empty() {
        let statistics = Statistics::new(channel_id(), false);
        statistics.update_status(MetaDataId::source(), Status::Filtered, Some(Status::Received));
        let aggregate = statistics.channel_aggregate();
        assert_eq!(aggregate.received, 0);
        assert_eq!(aggregate.filtered, 1);
    }

    #[test]
    fn test_should_emit_event_when_tracked_status_reached() {
        let statistics = Statistics::new(channel_id(), true);
        let mut events = statistics.subscribe();
        statistics.update_status(MetaDataId::new(1), Status::Sent, None);

        let event = events.try_recv().unwrap();
        assert_eq!(event.meta_data_id, MetaDataId::new(1));
        assert_eq!(event.status, Status::Sent);
    }

    #[test]
    fn test_should_not_emit_event_when_status_is_not_tracked() {
        let statistics = Statistics::new(channel_id(), true);
        let mut events = statistics.subscribe();
        statistics.update_status(MetaDataId::new(1), Status::Queued, None);
        assert!(events.try_recv().is_err());
    }
}
