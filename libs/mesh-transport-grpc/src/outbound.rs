//! Outbound call layer for generated clients.
//!
//! Wraps a client channel so every call made through it is stamped with
//! `trace_id`/`user_id`, logged before dispatch, and logged again once the
//! response headers arrive. The payload is encoded by then, so the trace id
//! hash covers the method path.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{Request, Response};
use tonic::metadata::MetadataMap;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::interceptor::OutboundInterceptor;
use crate::metadata::{CallMetadata, failed_status};

#[derive(Debug, Clone)]
pub struct OutboundLayer {
    interceptor: OutboundInterceptor,
}

impl OutboundLayer {
    #[must_use]
    pub fn new(interceptor: OutboundInterceptor) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for OutboundLayer {
    type Service = OutboundService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OutboundService {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundService<S> {
    inner: S,
    interceptor: OutboundInterceptor,
}

impl<S> OutboundService<S> {
    pub fn new(inner: S, interceptor: OutboundInterceptor) -> Self {
        Self { inner, interceptor }
    }
}

fn stamp<B>(interceptor: &OutboundInterceptor, req: &mut Request<B>) -> CallMetadata {
    let method = req.uri().path().to_owned();
    let meta = interceptor.complete(CallMetadata::from_headers(req.headers()), &method);

    let mut map = MetadataMap::from_headers(std::mem::take(req.headers_mut()));
    if let Err(status) = meta.attach(&mut map) {
        tracing::warn!(method, error = status.message(), "call metadata not attached");
    }
    *req.headers_mut() = map.into_headers();
    meta
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for OutboundService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let meta = stamp(&self.interceptor, &mut req);
        let span = tracing::info_span!(
            "outbound_call",
            method = %req.uri().path(),
            trace_id = meta.trace_id_str(),
            user_id = meta.user_id_str(),
        );

        Box::pin(
            async move {
                tracing::info!("outbound call");
                let started = Instant::now();
                let result = inner.call(req).await;
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                match &result {
                    Ok(resp) => match failed_status(resp.headers()) {
                        None => tracing::info!(elapsed_ms, "outbound call completed"),
                        Some((code, message)) => tracing::error!(
                            elapsed_ms,
                            code = ?code,
                            message,
                            "outbound call failed"
                        ),
                    },
                    Err(e) => tracing::error!(elapsed_ms, error = %e, "outbound call failed"),
                }
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::client::{GrpcClientConfig, connect_channel, peer_uri};
    use crate::metadata::{TRACE_ID_KEY, USER_ID_KEY};
    use crate::server::{HEALTH_SERVICE, ServiceHost};
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use tonic_health::pb::HealthCheckRequest;
    use tonic_health::pb::health_client::HealthClient;
    use tower::ServiceExt;
    use tracing_test::traced_test;

    #[derive(Clone)]
    struct Recorder;

    impl Service<Request<()>> for Recorder {
        type Response = Response<CallMetadata>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<()>) -> Self::Future {
            std::future::ready(Ok(Response::new(CallMetadata::from_headers(req.headers()))))
        }
    }

    #[tokio::test]
    async fn stamps_missing_metadata_and_keeps_the_rest() {
        let mut svc = OutboundLayer::new(OutboundInterceptor::new("orders")).layer(Recorder);

        let req = Request::builder()
            .uri("/pkg.Svc/Get")
            .body(())
            .unwrap();
        let seen = svc.ready().await.unwrap().call(req).await.unwrap().into_body();
        assert!(seen.trace_id_str().starts_with("trace_id"));
        assert_eq!(seen.user_id.as_deref(), Some("orders"));

        let req = Request::builder()
            .uri("/pkg.Svc/Get")
            .header(TRACE_ID_KEY, "t-9")
            .header(USER_ID_KEY, "carol")
            .body(())
            .unwrap();
        let seen = svc.ready().await.unwrap().call(req).await.unwrap().into_body();
        assert_eq!(seen, CallMetadata::new("t-9", "carol"));
    }

    #[tokio::test]
    #[traced_test]
    async fn generated_client_calls_log_their_outcome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(ServiceHost::new().serve(listener, cancel.clone()));

        let cfg = GrpcClientConfig::default().with_connect_timeout(Duration::from_secs(2));
        let channel = connect_channel(peer_uri(&addr.ip().to_string(), addr.port()), &cfg)
            .await
            .unwrap();
        let mut client = HealthClient::new(OutboundService::new(
            channel,
            OutboundInterceptor::new("orders"),
        ));

        client
            .check(HealthCheckRequest {
                service: HEALTH_SERVICE.to_owned(),
            })
            .await
            .unwrap();
        assert!(logs_contain("outbound call completed"));

        let err = client
            .check(HealthCheckRequest {
                service: "no.such.Service".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
        assert!(logs_contain("outbound call failed"));

        drop(client);
        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
