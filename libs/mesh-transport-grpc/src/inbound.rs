//! Inbound call logging layer.
//!
//! Wraps the server's router: every incoming call is given a span carrying
//! its `trace_id`, `user_id` and peer address, and its outcome is logged from
//! the `grpc-status` the handler produced. Requests and responses pass
//! through unchanged.
//!
//! The layer only sees encoded bodies. Handlers that want their decoded
//! payloads in the log run through [`log_payloads`], which logs inside the
//! same span.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{HeaderMap, Request, Response};
use tonic::transport::server::TcpConnectInfo;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::metadata::{CallMetadata, failed_status};

/// Run a unary handler, logging its decoded request and response at `debug`.
///
/// # Errors
/// Returns the handler's status unchanged.
pub async fn log_payloads<Req, Resp, F, Fut>(
    request: tonic::Request<Req>,
    handler: F,
) -> Result<tonic::Response<Resp>, tonic::Status>
where
    Req: Debug,
    Resp: Debug,
    F: FnOnce(tonic::Request<Req>) -> Fut,
    Fut: Future<Output = Result<tonic::Response<Resp>, tonic::Status>>,
{
    tracing::debug!(request = ?request.get_ref(), "inbound request");
    let result = handler(request).await;
    match &result {
        Ok(response) => tracing::debug!(response = ?response.get_ref(), "inbound response"),
        Err(status) => tracing::debug!(
            code = ?status.code(),
            message = status.message(),
            "inbound handler error"
        ),
    }
    result
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InboundLayer;

impl InboundLayer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for InboundLayer {
    type Service = InboundService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InboundService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct InboundService<S> {
    inner: S,
}

fn peer_of<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<TcpConnectInfo>()
        .and_then(TcpConnectInfo::remote_addr)
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

fn log_outcome(headers: &HeaderMap, started: Instant) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match failed_status(headers) {
        None => tracing::info!(elapsed_ms, "inbound call completed"),
        Some((code, message)) => tracing::error!(
            elapsed_ms,
            code = ?code,
            message,
            "inbound call failed"
        ),
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InboundService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone is not guaranteed ready; swap it in and drive the ready one.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let meta = CallMetadata::from_headers(req.headers());
        let span = tracing::info_span!(
            "inbound_call",
            method = %req.uri().path(),
            trace_id = meta.trace_id_str(),
            user_id = meta.user_id_str(),
            peer = %peer_of(&req),
        );

        Box::pin(
            async move {
                tracing::info!("inbound call");
                let started = Instant::now();
                let result = inner.call(req).await;
                match &result {
                    Ok(resp) => log_outcome(resp.headers(), started),
                    Err(_) => tracing::error!("inbound call failed in transport"),
                }
                result
            }
            .instrument(span),
        )
    }
}
