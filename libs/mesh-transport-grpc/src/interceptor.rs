//! Outbound call interceptor.
//!
//! Makes sure every call leaving this process carries a `trace_id` and a
//! `user_id`, and logs the request and its outcome. Errors are passed through
//! untouched and nothing is retried. Generated clients get the same
//! treatment through [`crate::OutboundLayer`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tonic::{Request, Response, Status};

use crate::metadata::{CallMetadata, DEFAULT_TRACE_PREFIX, generate_trace_id};

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct OutboundInterceptor {
    local_service: Arc<str>,
    trace_prefix: Arc<str>,
}

impl OutboundInterceptor {
    /// `local_service` becomes the default `user_id` of outgoing calls.
    pub fn new(local_service: impl AsRef<str>) -> Self {
        Self {
            local_service: Arc::from(local_service.as_ref()),
            trace_prefix: Arc::from(DEFAULT_TRACE_PREFIX),
        }
    }

    #[must_use]
    pub fn with_trace_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.trace_prefix = Arc::from(prefix.as_ref());
        self
    }

    #[must_use]
    pub fn local_service(&self) -> &str {
        &self.local_service
    }

    /// Complete `meta`: keep what the caller supplied and generate the rest.
    ///
    /// `payload` feeds the trace id hash; pass a representation of the
    /// request message.
    #[must_use]
    pub fn complete(&self, meta: CallMetadata, payload: &str) -> CallMetadata {
        CallMetadata {
            trace_id: meta.trace_id.or_else(|| {
                Some(generate_trace_id(
                    &self.trace_prefix,
                    payload,
                    SystemTime::now(),
                ))
            }),
            user_id: meta.user_id.or_else(|| Some(self.local_service.to_string())),
        }
    }

    /// Stamp `request` with complete call metadata and return it.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if caller-supplied metadata is not valid
    /// ASCII.
    pub fn stamp<T: Debug>(&self, request: &mut Request<T>) -> Result<CallMetadata, Status> {
        let present = CallMetadata::from_metadata(request.metadata());
        let meta = if present.trace_id.is_some() {
            self.complete(present, "")
        } else {
            #[allow(clippy::use_debug)]
            let payload = format!("{:?}", request.get_ref());
            self.complete(present, &payload)
        };
        meta.attach(request.metadata_mut())?;
        Ok(meta)
    }

    /// Run one unary call through the interceptor.
    ///
    /// # Errors
    /// Returns whatever `call` returns, or `InvalidArgument` if the request
    /// metadata cannot be stamped.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        method: &str,
        mut request: Request<Req>,
        call: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Debug,
        Resp: Debug,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let meta = self.stamp(&mut request)?;
        tracing::info!(
            method,
            trace_id = meta.trace_id_str(),
            user_id = meta.user_id_str(),
            request = ?request.get_ref(),
            "outbound call"
        );

        let started = Instant::now();
        match call(request).await {
            Ok(response) => {
                tracing::info!(
                    method,
                    trace_id = meta.trace_id_str(),
                    elapsed_ms = elapsed_ms(started),
                    response = ?response.get_ref(),
                    "outbound call completed"
                );
                Ok(response)
            }
            Err(status) => {
                tracing::error!(
                    method,
                    trace_id = meta.trace_id_str(),
                    elapsed_ms = elapsed_ms(started),
                    code = ?status.code(),
                    message = status.message(),
                    "outbound call failed"
                );
                Err(status)
            }
        }
    }
}
