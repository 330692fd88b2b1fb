//! Storage policy: declarative gating of what persists at each pipeline
//! stage.
//!
//! Message and connector-message rows always persist so the recovery task
//! can see message boundaries; content inserts are strictly gated by these
//! flags. The named modes are presets over the same flag set, mirroring the
//! development/production preset constructors used for runtime
//! configuration.

use serde::{Deserialize, Serialize};

use crate::message::ContentType;

/// Named storage mode presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// Store everything, including intermediate stages.
    Development,
    /// Store everything except intermediate stages.
    Production,
    /// Store raw content only.
    Raw,
    /// Store metadata rows only.
    Metadata,
    /// Store metadata rows only and skip recovery.
    Disabled,
}

impl StorageMode {
    /// Computes the flag set for this mode.
    #[must_use]
    pub fn settings(self) -> StorageSettings {
        match self {
            Self::Development => StorageSettings::development(),
            Self::Production => StorageSettings::production(),
            Self::Raw => StorageSettings::raw(),
            Self::Metadata => StorageSettings::metadata(),
            Self::Disabled => StorageSettings::disabled(),
        }
    }
}

/// Flag set deciding what persists per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct StorageSettings {
    /// Master switch for content persistence.
    pub enabled: bool,
    /// Persist RAW content.
    pub store_raw: bool,
    /// Persist PROCESSED_RAW content.
    pub store_processed_raw: bool,
    /// Persist TRANSFORMED content.
    pub store_transformed: bool,
    /// Persist the source connector's ENCODED content.
    pub store_source_encoded: bool,
    /// Persist destination connectors' ENCODED content.
    pub store_destination_encoded: bool,
    /// Persist SENT content.
    pub store_sent: bool,
    /// Persist RESPONSE content.
    pub store_response: bool,
    /// Persist RESPONSE_TRANSFORMED content.
    pub store_response_transformed: bool,
    /// Persist PROCESSED_RESPONSE content.
    pub store_processed_response: bool,
    /// Persist source/channel/connector maps.
    pub store_maps: bool,
    /// Persist the response map.
    pub store_response_map: bool,
    /// Persist custom metadata columns.
    pub store_custom_meta_data: bool,
    /// Persist attachments.
    pub store_attachments: bool,
    /// Run the crash-recovery sweep for this channel at start.
    pub message_recovery_enabled: bool,
    /// Flush queued work through the store rather than memory only.
    pub durable: bool,
    /// Keep RAW durable even when later content is trimmed.
    pub raw_durable: bool,
    /// Delete all content for a message once it completes.
    pub remove_content_on_completion: bool,
    /// Restrict completion deletion to terminally FILTERED connectors.
    pub remove_only_filtered_on_completion: bool,
    /// Delete attachments once the message completes.
    pub remove_attachments_on_completion: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self::development()
    }
}

impl StorageSettings {
    /// All stages, maps, recovery and raw durability on.
    #[must_use]
    pub fn development() -> Self {
        Self {
            enabled: true,
            store_raw: true,
            store_processed_raw: true,
            store_transformed: true,
            store_source_encoded: true,
            store_destination_encoded: true,
            store_sent: true,
            store_response: true,
            store_response_transformed: true,
            store_processed_response: true,
            store_maps: true,
            store_response_map: true,
            store_custom_meta_data: true,
            store_attachments: true,
            message_recovery_enabled: true,
            durable: true,
            raw_durable: true,
            remove_content_on_completion: false,
            remove_only_filtered_on_completion: false,
            remove_attachments_on_completion: false,
        }
    }

    /// Development minus the intermediate stages.
    #[must_use]
    pub fn production() -> Self {
        Self {
            store_processed_raw: false,
            store_transformed: false,
            store_response_transformed: false,
            store_processed_response: false,
            ..Self::development()
        }
    }

    /// Raw content only; no maps, no recovery.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            enabled: true,
            store_raw: true,
            store_processed_raw: false,
            store_transformed: false,
            store_source_encoded: false,
            store_destination_encoded: false,
            store_sent: false,
            store_response: false,
            store_response_transformed: false,
            store_processed_response: false,
            store_maps: false,
            store_response_map: false,
            store_custom_meta_data: false,
            store_attachments: false,
            message_recovery_enabled: false,
            durable: false,
            raw_durable: true,
            remove_content_on_completion: false,
            remove_only_filtered_on_completion: false,
            remove_attachments_on_completion: false,
        }
    }

    /// Metadata rows only. Recovery stays on: the sweep needs only message
    /// boundaries, which always persist.
    #[must_use]
    pub fn metadata() -> Self {
        Self {
            enabled: false,
            store_raw: false,
            raw_durable: false,
            message_recovery_enabled: true,
            ..Self::raw()
        }
    }

    /// Metadata rows only, recovery off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            message_recovery_enabled: false,
            ..Self::metadata()
        }
    }

    /// Whether a content slot persists for the given connector.
    ///
    /// Error slots persist whenever content persistence is enabled at all;
    /// everything else follows its dedicated flag.
    #[must_use]
    pub fn stores_content(&self, content_type: ContentType, meta_data_id_is_source: bool) -> bool {
        if !self.enabled {
            // raw_durable keeps RAW even when the master switch is off.
            return content_type == ContentType::Raw && self.raw_durable;
        }
        match content_type {
            ContentType::Raw => self.store_raw,
            ContentType::ProcessedRaw => self.store_processed_raw,
            ContentType::Transformed => self.store_transformed,
            ContentType::Encoded => {
                if meta_data_id_is_source {
                    self.store_source_encoded
                } else {
                    self.store_destination_encoded
                }
            }
            ContentType::Sent => self.store_sent,
            ContentType::Response => self.store_response,
            ContentType::ResponseTransformed => self.store_response_transformed,
            ContentType::ProcessedResponse => self.store_processed_response,
            ContentType::SourceMap | ContentType::ConnectorMap | ContentType::ChannelMap => {
                self.store_maps
            }
            ContentType::ResponseMap => self.store_response_map,
            ContentType::ProcessingError
            | ContentType::PostprocessorError
            | ContentType::ResponseError => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_store_everything_when_mode_is_development() {
        let settings = StorageMode::Development.settings();
        assert!(settings.stores_content(ContentType::ProcessedRaw, true));
        assert!(settings.stores_content(ContentType::Transformed, true));
        assert!(settings.stores_content(ContentType::Encoded, false));
        assert!(settings.store_maps);
        assert!(settings.message_recovery_enabled);
    }

    #[test]
    fn test_should_skip_intermediate_stages_when_mode_is_production() {
        let settings = StorageMode::Production.settings();
        assert!(!settings.stores_content(ContentType::ProcessedRaw, true));
        assert!(!settings.stores_content(ContentType::Transformed, true));
        assert!(!settings.stores_content(ContentType::ResponseTransformed, false));
        assert!(!settings.stores_content(ContentType::ProcessedResponse, true));
        assert!(settings.stores_content(ContentType::Raw, true));
        assert!(settings.stores_content(ContentType::Sent, false));
        assert!(settings.store_maps);
    }

    #[test]
    fn test_should_store_only_raw_when_mode_is_raw() {
        let settings = StorageMode::Raw.settings();
        assert!(settings.stores_content(ContentType::Raw, true));
        assert!(!settings.stores_content(ContentType::Encoded, true));
        assert!(!settings.stores_content(ContentType::SourceMap, true));
        assert!(!settings.message_recovery_enabled);
    }

    #[test]
    fn test_should_store_no_content_when_mode_is_metadata_or_disabled() {
        for mode in [StorageMode::Metadata, StorageMode::Disabled] {
            let settings = mode.settings();
            assert!(!settings.stores_content(ContentType::Raw, true));
            assert!(!settings.stores_content(ContentType::Encoded, false));
            assert!(!settings.stores_content(ContentType::SourceMap, true));
        }
        assert!(StorageMode::Metadata.settings().message_recovery_enabled);
        assert!(!StorageMode::Disabled.settings().message_recovery_enabled);
    }

    #[test]
    fn test_should_distinguish_source_and_destination_encoded_when_gating() {
        let settings = StorageSettings {
            store_source_encoded: true,
            store_destination_encoded: false,
            ..StorageSettings::development()
        };
        assert!(settings.stores_content(ContentType::Encoded, true));
        assert!(!settings.stores_content(ContentType::Encoded, false));
    }

    #[test]
    fn test_should_keep_error_content_when_content_storage_is_enabled() {
        let settings = StorageMode::Production.settings();
        assert!(settings.stores_content(ContentType::ProcessingError, true));
        assert!(settings.stores_content(ContentType::PostprocessorError, true));
        assert!(settings.stores_content(ContentType::ResponseError, false));
    }
}
