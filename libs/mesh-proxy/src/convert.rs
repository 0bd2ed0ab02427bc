//! JSON and wire conversions for dynamic messages.

use bytes::Bytes;
use prost_reflect::{DynamicMessage, MessageDescriptor};

use crate::error::ProxyError;

/// Parse a JSON request against `desc`.
///
/// An empty or blank payload is treated as `{}`.
///
/// # Errors
/// Returns [`ProxyError::InvalidRequest`] if the payload is not valid JSON
/// for the message, including unknown fields and trailing data.
pub fn request_from_json(desc: &MessageDescriptor, json: &[u8]) -> Result<DynamicMessage, ProxyError> {
    if json.iter().all(u8::is_ascii_whitespace) {
        return Ok(DynamicMessage::new(desc.clone()));
    }

    let mut de = serde_json::Deserializer::from_slice(json);
    let message = DynamicMessage::deserialize(desc.clone(), &mut de)
        .map_err(|e| ProxyError::InvalidRequest(format!("{}: {e}", desc.full_name())))?;
    de.end()
        .map_err(|e| ProxyError::InvalidRequest(format!("trailing data after request: {e}")))?;
    Ok(message)
}

/// Decode a response body against `desc`.
///
/// # Errors
/// Returns [`ProxyError::InternalConversionError`] if the bytes do not decode.
pub fn response_from_wire(desc: &MessageDescriptor, wire: Bytes) -> Result<DynamicMessage, ProxyError> {
    DynamicMessage::decode(desc.clone(), wire)
        .map_err(|e| ProxyError::InternalConversionError(format!("{}: {e}", desc.full_name())))
}

/// Serialize using the canonical protobuf JSON mapping.
///
/// # Errors
/// Returns [`ProxyError::InternalConversionError`] if serialization fails.
pub fn to_json(message: &DynamicMessage) -> Result<Vec<u8>, ProxyError> {
    serde_json::to_vec(message).map_err(|e| ProxyError::InternalConversionError(e.to_string()))
}
