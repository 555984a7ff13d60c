//! Frame codecs for bulk-watch messages.
//!
//! The codec layer converts between the crate-owned message types
//! ([`BulkRequest`], [`BulkResponse`]) and frame bytes. The encoding is
//! picked once per connection.
//!
//! Decoding a request happens in two phases. A frame that cannot be parsed
//! at all is an [`Error::Decode`] and ends the session. A frame that parses
//! but does not carry exactly one valid operation is an
//! [`Error::InvalidRequest`], which is answered with a `Failure`.
//!
//! [`Error::Decode`]: crate::Error::Decode
//! [`Error::InvalidRequest`]: crate::Error::InvalidRequest

use crate::error::Result;
use crate::message::{BulkRequest, BulkResponse};
use crate::status::Status;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod json;
pub mod prost;

pub use self::json::JsonCodec;
pub use self::prost::ProstCodec;

/// Trait for encoding/decoding bulk-watch frames.
///
/// Servers use the request-decoding and response-encoding halves; clients
/// use the other two.
pub trait BulkCodec: Send + Sync + 'static {
    /// Decode an inbound frame into a [`BulkRequest`].
    fn decode_request(&self, frame: Bytes) -> Result<BulkRequest>;

    /// Encode a [`BulkResponse`] into an outbound frame.
    fn encode_response(&self, response: &BulkResponse) -> Result<Bytes>;

    /// Encode a [`BulkRequest`] into a frame.
    fn encode_request(&self, request: &BulkRequest) -> Result<Bytes>;

    /// Decode a frame into a [`BulkResponse`].
    fn decode_response(&self, frame: Bytes) -> Result<BulkResponse>;
}

/// The built-in frame encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// JSON objects with camelCase fields; object payloads are base64.
    #[default]
    Json,
    /// Protocol buffers.
    Protobuf,
}

impl Encoding {
    /// The name used to negotiate this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Protobuf => "proto",
        }
    }

    /// A codec for this encoding.
    pub fn codec(&self) -> Arc<dyn BulkCodec> {
        match self {
            Encoding::Json => Arc::new(JsonCodec),
            Encoding::Protobuf => Arc::new(ProstCodec),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = Status;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "json" => Ok(Encoding::Json),
            "proto" | "protobuf" => Ok(Encoding::Protobuf),
            other => Err(Status::invalid_argument(format!(
                "unsupported encoding {other:?}, expected \"json\" or \"proto\""
            ))),
        }
    }
}
