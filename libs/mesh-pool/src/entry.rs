//! Pooled connections and the handle callers get from selection.

use std::fmt::Debug;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::uri::PathAndQuery;
use mesh_proxy::{DynamicProxy, ProxyError};
use mesh_registry::ServiceInstance;
use mesh_transport_grpc::{CallMetadata, OutboundInterceptor, OutboundService};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::balancer::Weighted;

/// One live connection and the registry record it was dialed for.
///
/// The record is swapped in place when a `Put` arrives for a known key, so a
/// weight change never redials.
pub(crate) struct PoolEntry {
    key: String,
    instance: ArcSwap<ServiceInstance>,
    channel: Channel,
    interceptor: OutboundInterceptor,
    proxy: DynamicProxy,
}

impl PoolEntry {
    pub(crate) fn new(
        instance: ServiceInstance,
        channel: Channel,
        interceptor: OutboundInterceptor,
    ) -> Self {
        Self {
            key: instance.key.clone(),
            proxy: DynamicProxy::for_channel(channel.clone(), interceptor.clone()),
            instance: ArcSwap::from_pointee(instance),
            channel,
            interceptor,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn instance(&self) -> Arc<ServiceInstance> {
        self.instance.load_full()
    }

    pub(crate) fn replace(&self, instance: ServiceInstance) {
        self.instance.store(Arc::new(instance));
    }
}

impl Weighted for PoolEntry {
    fn weight(&self) -> u32 {
        self.instance.load().weight
    }
}

/// A connection handed out by [`crate::ConnectionPool::select`].
///
/// Holding a client keeps its channel usable even if the instance leaves the
/// pool meanwhile, so calls in flight are not cut off.
#[derive(Clone)]
pub struct PooledClient {
    entry: Arc<PoolEntry>,
}

impl PooledClient {
    pub(crate) fn new(entry: Arc<PoolEntry>) -> Self {
        Self { entry }
    }

    /// Registry record as of the last update.
    #[must_use]
    pub fn instance(&self) -> Arc<ServiceInstance> {
        self.entry.instance()
    }

    /// The bare channel. Calls made on it skip the outbound interceptor:
    /// no metadata is stamped and nothing is logged.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.entry.channel.clone()
    }

    /// Channel for generated clients. Every call gets `trace_id`/`user_id`
    /// and is logged before dispatch and on completion or failure.
    #[must_use]
    pub fn intercepted_channel(&self) -> OutboundService<Channel> {
        OutboundService::new(self.channel(), self.entry.interceptor.clone())
    }

    /// Unary call with prost-generated messages through the interceptor.
    ///
    /// # Errors
    /// `Internal` for a malformed `path`, `Unavailable` if the channel is not
    /// ready, otherwise the status returned by the remote side.
    pub async fn unary<Req, Resp>(
        &self,
        path: &str,
        request: Request<Req>,
    ) -> Result<Response<Resp>, Status>
    where
        Req: prost::Message + Debug + Send + Sync + 'static,
        Resp: prost::Message + Default + Debug + Send + Sync + 'static,
    {
        let grpc_path = PathAndQuery::try_from(path)
            .map_err(|e| Status::internal(format!("invalid method path '{path}': {e}")))?;
        let channel = self.channel();

        self.entry
            .interceptor
            .unary(path, request, |req| async move {
                let mut grpc = tonic::client::Grpc::new(channel);
                grpc.ready()
                    .await
                    .map_err(|e| Status::unavailable(format!("channel not ready: {e}")))?;
                grpc.unary(req, grpc_path, tonic_prost::ProstCodec::default())
                    .await
            })
            .await
    }

    /// Dynamic call where the gRPC service is named after the mesh service.
    ///
    /// # Errors
    /// See [`DynamicProxy::call_with_metadata`].
    pub async fn proxy(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let service = self.instance().name.clone();
        self.entry.proxy.call(&service, method, request).await
    }

    /// Dynamic call of any service hosted by this instance.
    ///
    /// # Errors
    /// See [`DynamicProxy::call_with_metadata`].
    pub async fn call_dynamic(
        &self,
        service: &str,
        method: &str,
        request: &[u8],
        meta: CallMetadata,
    ) -> Result<Vec<u8>, ProxyError> {
        self.entry
            .proxy
            .call_with_metadata(service, method, request, meta)
            .await
    }

    #[must_use]
    pub fn dynamic_proxy(&self) -> &DynamicProxy {
        &self.entry.proxy
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("key", &self.entry.key())
            .finish_non_exhaustive()
    }
}
