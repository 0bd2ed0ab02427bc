//! Transport seam of the dynamic proxy.

use async_trait::async_trait;
use bytes::Bytes;
use mesh_transport_grpc::{CallMetadata, OutboundInterceptor};
use prost_reflect::DynamicMessage;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::codec::DynamicCodec;
use crate::descriptor::InvocationDescriptor;

/// Performs one unary call and returns the raw response body.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// # Errors
    /// Returns the status reported by the transport or the backend.
    async fn invoke(
        &self,
        descriptor: &InvocationDescriptor,
        request: DynamicMessage,
        meta: CallMetadata,
    ) -> Result<Bytes, Status>;
}

/// Invokes over a tonic channel, through the outbound interceptor.
#[derive(Debug, Clone)]
pub struct GrpcInvoker {
    channel: Channel,
    interceptor: OutboundInterceptor,
}

impl GrpcInvoker {
    #[must_use]
    pub fn new(channel: Channel, interceptor: OutboundInterceptor) -> Self {
        Self {
            channel,
            interceptor,
        }
    }
}

#[async_trait]
impl Invoker for GrpcInvoker {
    async fn invoke(
        &self,
        descriptor: &InvocationDescriptor,
        request: DynamicMessage,
        meta: CallMetadata,
    ) -> Result<Bytes, Status> {
        let mut request = Request::new(request);
        meta.attach(request.metadata_mut())?;

        let channel = self.channel.clone();
        let path = descriptor.path().clone();
        self.interceptor
            .unary(descriptor.path().path(), request, |req| async move {
                let mut grpc = tonic::client::Grpc::new(channel);
                grpc.ready()
                    .await
                    .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;
                grpc.unary(req, path, DynamicCodec).await
            })
            .await
            .map(Response::into_inner)
    }
}
