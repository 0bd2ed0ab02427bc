//! Generic invocation of remote methods by name.

use std::sync::Arc;

use mesh_transport_grpc::{CallMetadata, OutboundInterceptor};
use tonic::transport::Channel;

use crate::cache::DescriptorCache;
use crate::convert;
use crate::descriptor::InvocationDescriptor;
use crate::error::ProxyError;
use crate::invoker::{GrpcInvoker, Invoker};
use crate::resolver::{ReflectionResolver, SchemaResolver};

/// Calls any unary method of a backend given its service and method names
/// and a JSON request.
///
/// Descriptors are resolved once and cached. A transport failure drops the
/// whole cache, since the backend may come back with a different schema; an
/// `Unimplemented` answer drops only the method that produced it.
pub struct DynamicProxy {
    resolver: Arc<dyn SchemaResolver>,
    invoker: Arc<dyn Invoker>,
    cache: DescriptorCache,
}

impl DynamicProxy {
    #[must_use]
    pub fn new(resolver: Arc<dyn SchemaResolver>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            resolver,
            invoker,
            cache: DescriptorCache::new(),
        }
    }

    /// Reflection-backed proxy over a single connection.
    #[must_use]
    pub fn for_channel(channel: Channel, interceptor: OutboundInterceptor) -> Self {
        Self::new(
            Arc::new(ReflectionResolver::new(channel.clone())),
            Arc::new(GrpcInvoker::new(channel, interceptor)),
        )
    }

    #[must_use]
    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    /// Resolve `service`/`method`, consulting the cache first.
    ///
    /// # Errors
    /// See [`SchemaResolver::resolve`].
    pub async fn describe(
        &self,
        service: &str,
        method: &str,
    ) -> Result<Arc<InvocationDescriptor>, ProxyError> {
        if let Some(hit) = self.cache.get(service, method) {
            return Ok(hit);
        }
        match self.resolver.resolve(service, method).await {
            Ok(descriptor) => Ok(self.cache.insert(service, method, descriptor)),
            Err(e) => {
                if matches!(e, ProxyError::BackendUnavailable(_)) {
                    self.cache.invalidate_all();
                }
                Err(e)
            }
        }
    }

    /// Invoke with fresh call metadata.
    ///
    /// # Errors
    /// See [`DynamicProxy::call_with_metadata`].
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, ProxyError> {
        self.call_with_metadata(service, method, request, CallMetadata::default())
            .await
    }

    /// Invoke `service`/`method` with a JSON request and return the JSON
    /// response. Missing metadata fields are generated by the interceptor.
    ///
    /// # Errors
    /// - [`ProxyError::SchemaResolutionFailed`] for unknown methods
    /// - [`ProxyError::StreamingNotSupported`] for streaming methods
    /// - [`ProxyError::InvalidRequest`] if `request` does not fit the input type
    /// - [`ProxyError::BackendUnavailable`] if the backend cannot be reached
    /// - [`ProxyError::Remote`] for any other non-OK status
    /// - [`ProxyError::InternalConversionError`] if the response cannot be decoded
    pub async fn call_with_metadata(
        &self,
        service: &str,
        method: &str,
        request: &[u8],
        meta: CallMetadata,
    ) -> Result<Vec<u8>, ProxyError> {
        let descriptor = self.describe(service, method).await?;
        if !descriptor.is_unary() {
            return Err(ProxyError::StreamingNotSupported(
                descriptor.method().full_name().to_owned(),
            ));
        }

        let message = convert::request_from_json(&descriptor.input(), request)?;
        let wire = match self.invoker.invoke(&descriptor, message, meta).await {
            Ok(wire) => wire,
            Err(status) => {
                let err = ProxyError::from_status(&status);
                match &err {
                    ProxyError::BackendUnavailable(_) => self.cache.invalidate_all(),
                    ProxyError::Remote {
                        code: tonic::Code::Unimplemented,
                        ..
                    } => self.cache.invalidate(service, method),
                    _ => {}
                }
                return Err(err);
            }
        };

        let response = convert::response_from_wire(&descriptor.output(), wire)?;
        convert::to_json(&response)
    }
}
