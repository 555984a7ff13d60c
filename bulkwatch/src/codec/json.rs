//! JSON frame codec.

use crate::codec::BulkCodec;
use crate::error::{Error, Result};
use crate::message::{BulkRequest, BulkResponse, RawBulkRequest};
use bytes::Bytes;

/// A codec that encodes frames as JSON objects.
///
/// Requests look like
/// `{"requestId":"r1","watch":{"watchId":"w1","selector":{"resource":"pods"}}}`,
/// and event objects are carried as standard base64 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl BulkCodec for JsonCodec {
    fn decode_request(&self, frame: Bytes) -> Result<BulkRequest> {
        let raw: RawBulkRequest =
            serde_json::from_slice(&frame).map_err(|e| Error::Decode(e.to_string()))?;

        BulkRequest::try_from(raw)
    }

    fn encode_response(&self, response: &BulkResponse) -> Result<Bytes> {
        serde_json::to_vec(response)
            .map(Bytes::from)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    fn encode_request(&self, request: &BulkRequest) -> Result<Bytes> {
        serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode_response(&self, frame: Bytes) -> Result<BulkResponse> {
        serde_json::from_slice(&frame).map_err(|e| Error::Decode(e.to_string()))
    }
}
