//! Message content slots and the data type adapter seam.
//!
//! A connector message owns at most one content value per [`ContentType`];
//! writing the same slot twice overwrites. Content persistence is gated by
//! the channel's storage settings, never by this module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed enumeration of content slots used by the pipeline.
///
/// The numeric codes are the persisted form and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContentType {
    /// Raw input as received by the connector.
    Raw = 1,
    /// Source raw after preprocessor mutation.
    ProcessedRaw = 2,
    /// Parsed/mutated form produced by the transformer steps.
    Transformed = 3,
    /// Serialized wire form; the next connector in a chain reads this as RAW.
    Encoded = 4,
    /// Payload actually handed to the destination transport.
    Sent = 5,
    /// Response payload returned by the destination.
    Response = 6,
    /// Response after the response transformer ran.
    ResponseTransformed = 7,
    /// Response selected for the source reply after postprocessing.
    ProcessedResponse = 8,
    /// Serialized source map.
    SourceMap = 9,
    /// Serialized connector map.
    ConnectorMap = 10,
    /// Serialized channel map.
    ChannelMap = 11,
    /// Serialized response map.
    ResponseMap = 12,
    /// Error text recorded by filter/transform/send failures.
    ProcessingError = 13,
    /// Error text recorded by a failed postprocessor.
    PostprocessorError = 14,
    /// Error text recorded by a failed response transformer.
    ResponseError = 15,
}

/// Error returned when a persisted content code is not recognized.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown content type code {code}")]
pub struct UnknownContentType {
    /// The numeric code that failed to parse.
    pub code: u8,
}

impl ContentType {
    /// Numeric persisted form.
    #[must_use]
    pub fn as_code(self) -> u8 {
        self as u8
    }

    /// Parses the numeric persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownContentType`] for codes outside `1..=15`.
    pub fn from_code(code: u8) -> Result<Self, UnknownContentType> {
        match code {
            1 => Ok(Self::Raw),
            2 => Ok(Self::ProcessedRaw),
            3 => Ok(Self::Transformed),
            4 => Ok(Self::Encoded),
            5 => Ok(Self::Sent),
            6 => Ok(Self::Response),
            7 => Ok(Self::ResponseTransformed),
            8 => Ok(Self::ProcessedResponse),
            9 => Ok(Self::SourceMap),
            10 => Ok(Self::ConnectorMap),
            11 => Ok(Self::ChannelMap),
            12 => Ok(Self::ResponseMap),
            13 => Ok(Self::ProcessingError),
            14 => Ok(Self::PostprocessorError),
            15 => Ok(Self::ResponseError),
            other => Err(UnknownContentType { code: other }),
        }
    }
}

/// One content value attached to a connector message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Which slot this value occupies.
    pub content_type: ContentType,
    /// The content itself. Empty payloads are legal.
    pub content: String,
    /// Name of the data type that produced this value, when known.
    pub data_type: Option<String>,
    /// Whether the stored form is encrypted at rest.
    pub encrypted: bool,
}

impl MessageContent {
    /// Creates plaintext content for a slot.
    #[must_use]
    pub fn new(content_type: ContentType, content: impl Into<String>) -> Self {
        Self {
            content_type,
            content: content.into(),
            data_type: None,
            encrypted: false,
        }
    }

    /// Attaches the producing data type name.
    #[must_use]
    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }
}

/// Errors surfaced by data type adapters.
#[derive(Debug, Error)]
pub enum DataTypeError {
    /// The raw payload could not be parsed into the intermediate form.
    #[error("failed to parse {data_type} payload: {reason}")]
    Parse {
        /// Adapter name.
        data_type: String,
        /// Human-readable parse failure.
        reason: String,
    },
    /// The intermediate form could not be serialized back to wire form.
    #[error("failed to serialize {data_type} payload: {reason}")]
    Serialize {
        /// Adapter name.
        data_type: String,
        /// Human-readable serialize failure.
        reason: String,
    },
}

/// Data type adapter contract: a pure parse/serialize pair.
///
/// The core relies on `from_xml(to_xml(raw))` being lossless for configured
/// data types, and on ENCODED output being byte-for-byte what the next
/// connector consumes as RAW.
pub trait DataType: Send + Sync {
    /// Adapter name recorded on stored content (`"HL7V2"`, `"XML"`, ...).
    fn name(&self) -> &str;

    /// Parses the raw wire form into the intermediate XML form.
    ///
    /// # Errors
    ///
    /// Returns [`DataTypeError::Parse`] when the payload is malformed.
    fn to_xml(&self, raw: &str) -> Result<String, DataTypeError>;

    /// Serializes the intermediate XML form back to the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`DataTypeError::Serialize`] when the form cannot be emitted.
    fn from_xml(&self, xml: &str) -> Result<String, DataTypeError>;
}

/// Identity adapter for payloads already in their wire form.
///
/// Used as the default for channels that do not configure parsing; also the
/// deterministic stand-in in core tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDataType;

impl DataType for PassthroughDataType {
    fn name(&self) -> &str {
        "RAW"
    }

    fn to_xml(&self, raw: &str) -> Result<String, DataTypeError> {
        Ok(raw.to_string())
    }

    fn from_xml(&self, xml: &str) -> Result<String, DataTypeError> {
        Ok(xml.to_string())
    }
}
