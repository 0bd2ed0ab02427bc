//! Call-scoped metadata propagated across service hops.

use std::time::{SystemTime, UNIX_EPOCH};

use tonic::Status;
use tonic::metadata::{MetadataMap, MetadataValue};
use xxhash_rust::xxh3::xxh3_64;

/// Correlation identifier header.
pub const TRACE_ID_KEY: &str = "trace_id";

/// Acting principal header.
pub const USER_ID_KEY: &str = "user_id";

/// Prefix of generated trace ids.
pub const DEFAULT_TRACE_PREFIX: &str = "trace_id";

/// The `trace_id` / `user_id` pair carried by every mesh call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.filter(|s| !s.is_empty()).map(str::to_owned)
}

impl CallMetadata {
    pub fn new(trace_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            user_id: Some(user_id.into()),
        }
    }

    #[must_use]
    pub fn from_metadata(meta: &MetadataMap) -> Self {
        let get = |key| non_empty(meta.get(key).and_then(|v| v.to_str().ok()));
        Self {
            trace_id: get(TRACE_ID_KEY),
            user_id: get(USER_ID_KEY),
        }
    }

    #[must_use]
    pub fn from_headers(headers: &http::HeaderMap) -> Self {
        let get = |key| non_empty(headers.get(key).and_then(|v| v.to_str().ok()));
        Self {
            trace_id: get(TRACE_ID_KEY),
            user_id: get(USER_ID_KEY),
        }
    }

    /// Write the present fields into `meta`, replacing existing values.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a value is not valid ASCII metadata.
    pub fn attach(&self, meta: &mut MetadataMap) -> Result<(), Status> {
        for (key, value) in [(TRACE_ID_KEY, &self.trace_id), (USER_ID_KEY, &self.user_id)] {
            if let Some(value) = value {
                let value = MetadataValue::try_from(value.as_str()).map_err(|e| {
                    Status::invalid_argument(format!("invalid {key} metadata: {e}"))
                })?;
                meta.insert(key, value);
            }
        }
        Ok(())
    }

    /// Fill absent fields from `fallback`.
    #[must_use]
    pub fn or(self, fallback: &Self) -> Self {
        Self {
            trace_id: self.trace_id.or_else(|| fallback.trace_id.clone()),
            user_id: self.user_id.or_else(|| fallback.user_id.clone()),
        }
    }

    #[must_use]
    pub fn trace_id_str(&self) -> &str {
        self.trace_id.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn user_id_str(&self) -> &str {
        self.user_id.as_deref().unwrap_or_default()
    }
}

/// Build a trace id as `prefix`, then a three-digit bucket of the payload
/// hash, then the Unix timestamp in nanoseconds.
///
/// Two calls with different payloads in the same nanosecond still differ.
#[must_use]
pub fn generate_trace_id(prefix: &str, payload: &str, at: SystemTime) -> String {
    let bucket = xxh3_64(payload.as_bytes()) % 1000;
    let nanos = at
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{prefix}{bucket}{nanos}")
}

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

/// Non-OK status carried in response headers, as in a trailers-only reply.
///
/// A missing `grpc-status` header counts as OK.
pub(crate) fn failed_status(headers: &http::HeaderMap) -> Option<(tonic::Code, String)> {
    let code = headers
        .get(GRPC_STATUS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .map_or(tonic::Code::Ok, tonic::Code::from);
    if code == tonic::Code::Ok {
        return None;
    }
    let message = headers
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    Some((code, message))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reads_and_attaches_both_keys() {
        let mut meta = MetadataMap::new();
        CallMetadata::new("t-1", "alice").attach(&mut meta).unwrap();

        assert_eq!(meta.get(TRACE_ID_KEY).unwrap(), "t-1");
        assert_eq!(meta.get(USER_ID_KEY).unwrap(), "alice");
        assert_eq!(
            CallMetadata::from_metadata(&meta),
            CallMetadata::new("t-1", "alice")
        );
    }

    #[test]
    fn empty_values_count_as_missing() {
        let mut meta = MetadataMap::new();
        meta.insert(TRACE_ID_KEY, MetadataValue::from_static(""));
        assert_eq!(CallMetadata::from_metadata(&meta), CallMetadata::default());
    }

    #[test]
    fn failed_status_reads_trailers_only_headers() {
        let mut headers = http::HeaderMap::new();
        assert!(failed_status(&headers).is_none());

        headers.insert(GRPC_STATUS, http::HeaderValue::from_static("0"));
        assert!(failed_status(&headers).is_none());

        headers.insert(GRPC_STATUS, http::HeaderValue::from_static("14"));
        headers.insert(GRPC_MESSAGE, http::HeaderValue::from_static("down"));
        assert_eq!(
            failed_status(&headers),
            Some((tonic::Code::Unavailable, "down".to_owned()))
        );
    }

    #[test]
    fn attach_rejects_non_ascii() {
        let mut meta = MetadataMap::new();
        let md = CallMetadata {
            trace_id: Some("line\nbreak".into()),
            user_id: None,
        };
        let err = md.attach(&mut meta).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn headers_and_metadata_agree() {
        let mut headers = http::HeaderMap::new();
        headers.insert(TRACE_ID_KEY, http::HeaderValue::from_static("t-9"));
        let md = CallMetadata::from_headers(&headers);
        assert_eq!(md.trace_id.as_deref(), Some("t-9"));
        assert!(md.user_id.is_none());
    }

    #[test]
    fn or_keeps_present_fields() {
        let md = CallMetadata {
            trace_id: Some("mine".into()),
            user_id: None,
        }
        .or(&CallMetadata::new("other", "svc"));
        assert_eq!(md, CallMetadata::new("mine", "svc"));
    }

    #[test]
    fn trace_id_layout() {
        let at = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        let id = generate_trace_id("trace_id", "payload", at);
        let bucket = xxh3_64(b"payload") % 1000;
        assert_eq!(id, format!("trace_id{bucket}1700000000123456789"));
    }

    #[test]
    fn trace_id_differs_by_payload_at_same_instant() {
        let at = SystemTime::now();
        let distinct: std::collections::HashSet<String> = (0..50)
            .map(|i| generate_trace_id("t", &i.to_string(), at))
            .collect();
        assert!(distinct.len() > 1);
    }
}
