//! Queued send mode: retry progression, attempt accounting, and FIFO
//! ordering within a bucket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use common::*;
use interchange::{
    ChannelReader, DestinationSettings, InProcessScriptExecutor, MetaDataId, QueueSettings,
    RawMessage, SendError, Status,
};

fn queued_destination(name: &str, meta: u32) -> DestinationSettings {
    let mut settings = DestinationSettings::new(name, MetaDataId::new(meta));
    settings.queue = QueueSettings {
        enabled: true,
        ..QueueSettings::default()
    };
    settings.retry_interval = Duration::from_millis(10);
    settings
}

#[tokio::test]
async fn test_should_accumulate_send_attempts_on_one_row_when_queue_retries() {
    // retry_count = 2: each worker pass makes up to three attempts. Three
    // connection refusals then success means four attempts total, one row.
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let mut settings = queued_destination("Destination 1", 1);
    settings.retry_count = 2;
    let config = base_config(vec![chain(vec![settings])]);

    let d1 = ScriptedDestination::failing_then_ok(vec![
        SendError::connection("ECONNREFUSED"),
        SendError::connection("ECONNREFUSED"),
        SendError::connection("ECONNREFUSED"),
    ]);
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(InProcessScriptExecutor::new()),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    // Dispatch left the destination QUEUED.
    assert_eq!(
        message.connector_messages[&MetaDataId::new(1)].status,
        Status::Queued
    );

    wait_for_status(&engine, message.message_id, 1, Status::Sent).await;

    let finished = engine
        .store()
        .get_message(&channel_id(), message.message_id)
        .await
        .unwrap()
        .unwrap();
    let destination = &finished.connector_messages[&MetaDataId::new(1)];
    assert_eq!(destination.send_attempts, 4);
    assert_eq!(d1.attempts(), 4);

    // One row for the destination, not one per attempt.
    assert_eq!(finished.connector_messages.len(), 2);

    let stats = channel.get_statistics();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.error, 0);
}

#[tokio::test]
async fn test_should_deliver_in_dispatch_order_when_single_bucket_drains() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let config = base_config(vec![chain(vec![queued_destination("Destination 1", 1)])]);
    let d1 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(InProcessScriptExecutor::new()),
        )
        .await
        .unwrap();

    let mut message_ids = Vec::new();
    for index in 0..3 {
        let message = channel
            .dispatch_raw_message(RawMessage::new(format!("payload-{index}")))
            .await
            .unwrap();
        message_ids.push(message.message_id);
    }
    for message_id in &message_ids {
        wait_for_status(&engine, *message_id, 1, Status::Sent).await;
    }

    assert_eq!(
        d1.attempted_payloads(),
        vec![
            "payload-0".to_string(),
            "payload-1".to_string(),
            "payload-2".to_string()
        ]
    );
}

#[tokio::test]
async fn test_should_keep_message_queued_when_connection_keeps_failing() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let config = base_config(vec![chain(vec![queued_destination("Destination 1", 1)])]);
    let d1 = ScriptedDestination::always_failing(SendError::connection("refused"));
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(InProcessScriptExecutor::new()),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    // Give the worker a few passes; the status must stay QUEUED and
    // QUEUED must never leak into statistics.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let current = engine
        .store()
        .get_message(&channel_id(), message.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        current.connector_messages[&MetaDataId::new(1)].status,
        Status::Queued
    );
    assert!(d1.attempts() >= 1);

    let stats = channel.get_statistics();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.error, 0);
}
