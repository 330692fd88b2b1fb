//! End-to-end pipeline behavior through a deployed channel.

mod common;

use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::tempdir;

use common::*;
use interchange::{
    ChannelReader, ContentType, DestinationSettings, Filter, FilterOperator, FilterRule,
    InProcessScriptExecutor, MetaDataId, RawMessage, SourceSettings, Status, StorageSettings,
    Transformer, TransformerStep,
};

fn transformer_step(script: &str) -> Transformer {
    Transformer {
        steps: vec![TransformerStep {
            name: script.to_string(),
            script: script.to_string(),
        }],
        output_template: None,
    }
}

fn single_rule_filter(script: &str) -> Filter {
    Filter {
        rules: vec![FilterRule {
            name: script.to_string(),
            operator: FilterOperator::And,
            script: script.to_string(),
        }],
    }
}

#[test_log::test(tokio::test)]
async fn test_should_send_to_both_destinations_when_happy_path_runs() {
    // Two destinations in separate chains, both succeed.
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let executor = InProcessScriptExecutor::new().with_handler("set patientName", |scope| {
        scope.channel_map.set("patientName", json!("test"));
        Ok(Value::Null)
    });

    let mut config = base_config(vec![
        chain(vec![DestinationSettings::new(
            "Destination 1",
            MetaDataId::new(1),
        )]),
        chain(vec![DestinationSettings::new(
            "Destination 2",
            MetaDataId::new(2),
        )]),
    ]);
    config.source.transformer = transformer_step("set patientName");

    let d1 = ScriptedDestination::always_ok();
    let d2 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone()), (2, d2.clone())]),
            Arc::new(executor),
        )
        .await
        .unwrap();

    let raw = "<root><name>test</name></root>";
    let message = channel
        .dispatch_raw_message(RawMessage::new(raw))
        .await
        .unwrap();

    assert!(message.processed);
    let statuses: Vec<Status> = message
        .connector_messages
        .values()
        .map(|cm| cm.status)
        .collect();
    assert_eq!(
        statuses,
        vec![Status::Transformed, Status::Sent, Status::Sent]
    );

    let stats = channel.get_statistics();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.filtered, 0);
    assert_eq!(stats.error, 0);

    // Both destinations received the source's encoded payload.
    assert_eq!(d1.attempted_payloads(), vec![raw.to_string()]);
    assert_eq!(d2.attempted_payloads(), vec![raw.to_string()]);
}

#[tokio::test]
async fn test_should_skip_destinations_when_source_filter_rejects() {
    // Source filter accepts only messages containing DOE.
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let executor = InProcessScriptExecutor::new()
        .with_handler("contains DOE", |scope| Ok(json!(scope.msg.contains("DOE"))));

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.source.filter = single_rule_filter("contains DOE");

    let d1 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(executor),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg><name>SMITH</name></msg>"))
        .await
        .unwrap();

    assert!(message.processed);
    assert_eq!(message.connector_messages.len(), 1);
    assert_eq!(
        message.source_connector_message().unwrap().status,
        Status::Filtered
    );
    assert_eq!(d1.attempts(), 0);

    let stats = channel.get_statistics();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.error, 0);
}

#[tokio::test]
async fn test_should_discard_channel_map_but_keep_global_map_when_filter_rejects() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let executor = InProcessScriptExecutor::new().with_handler("write then reject", |scope| {
        scope.channel_map.set("leaked", json!("nope"));
        scope
            .globals()
            .set_global("pipeline-reject-sticky", json!("kept"));
        Ok(json!(false))
    });

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.source.filter = single_rule_filter("write then reject");

    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, ScriptedDestination::always_ok())]),
            Arc::new(executor),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    // Channel-scope writes are rolled back and never persisted.
    let channel_map = engine
        .store()
        .get_content(
            &channel_id(),
            message.message_id,
            MetaDataId::source(),
            ContentType::ChannelMap,
        )
        .await
        .unwrap();
    assert!(channel_map.is_none());

    // Global writes survive the rejection.
    assert_eq!(
        interchange::GlobalMaps::instance().get_global("pipeline-reject-sticky"),
        Some(json!("kept"))
    );
}

#[tokio::test]
async fn test_should_skip_exactly_one_destination_when_destination_set_removes_it() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let executor = InProcessScriptExecutor::new().with_handler("drop destination 2", |scope| {
        let destination_set = scope.destination_set.as_ref().expect("source scope");
        assert!(destination_set.remove_by_name("Destination 2"));
        Ok(Value::Null)
    });

    let mut config = base_config(vec![
        chain(vec![DestinationSettings::new(
            "Destination 1",
            MetaDataId::new(1),
        )]),
        chain(vec![DestinationSettings::new(
            "Destination 2",
            MetaDataId::new(2),
        )]),
    ]);
    config.source.transformer = transformer_step("drop destination 2");

    let d1 = ScriptedDestination::always_ok();
    let d2 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone()), (2, d2.clone())]),
            Arc::new(executor),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    let d1_status = message.connector_messages[&MetaDataId::new(1)].status;
    let d2_status = message.connector_messages[&MetaDataId::new(2)].status;
    assert_eq!(d1_status, Status::Sent);
    assert_eq!(d2_status, Status::Filtered);
    assert_eq!(d2.attempts(), 0);

    let stats = channel.get_statistics();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.filtered, 1);
}

#[tokio::test]
async fn test_should_run_pipeline_when_raw_input_is_empty() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let d1 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            base_config(vec![chain(vec![DestinationSettings::new(
                "Destination 1",
                MetaDataId::new(1),
            )])]),
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(InProcessScriptExecutor::new()),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new(""))
        .await
        .unwrap();

    assert!(message.processed);
    assert_eq!(d1.attempted_payloads(), vec![String::new()]);
}

#[tokio::test]
async fn test_should_store_processed_raw_when_preprocessor_modifies_message() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let executor = InProcessScriptExecutor::new()
        .with_handler("rewrite", |_| Ok(json!("<rewritten/>")));

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.scripts.preprocessor = Some("rewrite".to_string());

    let d1 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(executor),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<original/>"))
        .await
        .unwrap();

    let processed_raw = engine
        .store()
        .get_content(
            &channel_id(),
            message.message_id,
            MetaDataId::source(),
            ContentType::ProcessedRaw,
        )
        .await
        .unwrap()
        .expect("preprocessor output should persist");
    assert_eq!(processed_raw.content, "<rewritten/>");
    // The destination consumed the preprocessed payload.
    assert_eq!(d1.attempted_payloads(), vec!["<rewritten/>".to_string()]);
}

#[tokio::test]
async fn test_should_record_postprocessor_error_without_failing_message() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let executor = InProcessScriptExecutor::new().with_handler("boom", |_| {
        Err(interchange::ScriptError::new("boom", "postprocessor blew up"))
    });

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.scripts.postprocessor = Some("boom".to_string());

    let d1 = ScriptedDestination::always_ok();
    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, d1.clone())]),
            Arc::new(executor),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    // The message still completes and the destination still sent.
    assert!(message.processed);
    assert_eq!(
        message.connector_messages[&MetaDataId::new(1)].status,
        Status::Sent
    );

    let note = engine
        .store()
        .get_content(
            &channel_id(),
            message.message_id,
            MetaDataId::source(),
            ContentType::PostprocessorError,
        )
        .await
        .unwrap()
        .expect("postprocessor error should persist");
    assert!(note.content.contains("postprocessor blew up"));
}

#[tokio::test]
async fn test_should_return_before_processing_when_source_queue_is_enabled() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.source = SourceSettings {
        respond_after_processing: false,
        ..SourceSettings::new("Source")
    };

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

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    // The dispatch returned as soon as RECEIVED was durable.
    assert!(!message.processed);
    assert_eq!(
        message.source_connector_message().unwrap().status,
        Status::Received
    );

    // The background worker finishes the pipeline.
    wait_for_status(&engine, message.message_id, 1, Status::Sent).await;
    let finished = engine
        .store()
        .get_message(&channel_id(), message.message_id)
        .await
        .unwrap()
        .unwrap();
    assert!(finished.processed);
}

#[tokio::test]
async fn test_should_gate_content_rows_when_storage_mode_is_production() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.storage = StorageSettings::production();

    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, ScriptedDestination::always_ok())]),
            Arc::new(InProcessScriptExecutor::new()),
        )
        .await
        .unwrap();

    let message = channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    let store = engine.store();
    let raw = store
        .get_content(
            &channel_id(),
            message.message_id,
            MetaDataId::source(),
            ContentType::Raw,
        )
        .await
        .unwrap();
    assert!(raw.is_some(), "production mode keeps raw");

    let transformed = store
        .get_content(
            &channel_id(),
            message.message_id,
            MetaDataId::source(),
            ContentType::Transformed,
        )
        .await
        .unwrap();
    assert!(transformed.is_none(), "production mode drops intermediates");
}

#[tokio::test]
async fn test_should_emit_message_events_when_send_events_is_enabled() {
    let dir = tempdir().unwrap();
    let engine = new_engine(&dir).await;

    let mut config = base_config(vec![chain(vec![DestinationSettings::new(
        "Destination 1",
        MetaDataId::new(1),
    )])]);
    config.send_events = true;

    let (channel, _) = engine
        .deploy_channel(
            config,
            Arc::new(ChannelReader),
            connectors(vec![(1, ScriptedDestination::always_ok())]),
            Arc::new(InProcessScriptExecutor::new()),
        )
        .await
        .unwrap();

    let mut events = channel.subscribe_events();
    channel
        .dispatch_raw_message(RawMessage::new("<msg/>"))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push((u32::from(event.meta_data_id), event.status));
    }
    assert!(seen.contains(&(0, Status::Received)));
    assert!(seen.contains(&(1, Status::Sent)));
}
