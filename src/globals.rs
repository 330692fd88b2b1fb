//! Process-wide maps shared by every channel.
//!
//! `global_map` and `configuration_map` span the process;
//! `global_channel_map` is partitioned per channel. Writes are key-level
//! atomic. The singleton has an explicit reset so tests start clean.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::Value;

use crate::message::ChannelId;

static INSTANCE: OnceLock<GlobalMaps> = OnceLock::new();

/// Process-wide map manager.
#[derive(Debug, Default)]
pub struct GlobalMaps {
    global: DashMap<String, Value>,
    configuration: DashMap<String, Value>,
    per_channel: DashMap<ChannelId, Arc<DashMap<String, Value>>>,
}

impl GlobalMaps {
    /// The process-wide singleton.
    #[must_use]
    pub fn instance() -> &'static Self {
        INSTANCE.get_or_init(Self::default)
    }

    /// Reads a `global_map` entry.
    #[must_use]
    pub fn get_global(&self, key: &str) -> Option<Value> {
        self.global.get(key).map(|entry| entry.clone())
    }

    /// Writes a `global_map` entry.
    pub fn set_global(&self, key: impl Into<String>, value: Value) {
        self.global.insert(key.into(), value);
    }

    /// Reads a `configuration_map` entry.
    #[must_use]
    pub fn get_configuration(&self, key: &str) -> Option<Value> {
        self.configuration.get(key).map(|entry| entry.clone())
    }

    /// Writes a `configuration_map` entry.
    pub fn set_configuration(&self, key: impl Into<String>, value: Value) {
        self.configuration.insert(key.into(), value);
    }

    /// The `global_channel_map` partition for one channel.
    #[must_use]
    pub fn channel_map(&self, channel_id: &ChannelId) -> Arc<DashMap<String, Value>> {
        self.per_channel
            .entry(channel_id.clone())
            .or_default()
            .clone()
    }

    /// Clears every map. Tests call this to start from a known state.
    pub fn reset(&self) {
        self.global.clear();
        self.configuration.clear();
        self.per_channel.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel_id() -> ChannelId {
        ChannelId::try_new("11111111-2222-3333-4444-555555555555".to_string()).unwrap()
    }

    #[test]
    fn test_should_partition_by_channel_when_using_global_channel_map() {
        let maps = GlobalMaps::default();
        let other =
            ChannelId::try_new("99999999-2222-3333-4444-555555555555".to_string()).unwrap();

        maps.channel_map(&channel_id()).insert("k".to_string(), json!(1));
        assert!(maps.channel_map(&other).get("k").is_none());
        assert_eq!(
            maps.channel_map(&channel_id()).get("k").map(|v| v.clone()),
            Some(json!(1))
        );
    }

    #[test]
    fn test_should_clear_all_maps_when_resetting() {
        let maps = GlobalMaps::default();
        maps.set_global("a", json!(true));
        maps.set_configuration("b", json!("x"));
        maps.channel_map(&channel_id()).insert("c".to_string(), json!(2));

        maps.reset();

        assert!(maps.get_global("a").is_none());
        assert!(maps.get_configuration("b").is_none());
        assert!(maps.channel_map(&channel_id()).get("c").is_none());
    }
}
