//! Call-time schema of a single remote method.

use http::uri::PathAndQuery;
use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor};

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct InvocationDescriptor {
    method: MethodDescriptor,
    path: PathAndQuery,
}

impl InvocationDescriptor {
    /// # Errors
    /// Returns [`ProxyError::SchemaResolutionFailed`] if the method name does
    /// not form a valid request path.
    pub fn new(method: MethodDescriptor) -> Result<Self, ProxyError> {
        let path = format!(
            "/{}/{}",
            method.parent_service().full_name(),
            method.name()
        );
        let path = PathAndQuery::try_from(path)
            .map_err(|e| ProxyError::SchemaResolutionFailed(e.to_string()))?;
        Ok(Self { method, path })
    }

    #[must_use]
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    #[must_use]
    pub fn input(&self) -> MessageDescriptor {
        self.method.input()
    }

    #[must_use]
    pub fn output(&self) -> MessageDescriptor {
        self.method.output()
    }

    /// `/<package.Service>/<Method>`
    #[must_use]
    pub fn path(&self) -> &PathAndQuery {
        &self.path
    }

    #[must_use]
    pub fn is_unary(&self) -> bool {
        !self.method.is_client_streaming() && !self.method.is_server_streaming()
    }
}

/// Look up `service`/`method` in `pool`.
///
/// # Errors
/// Returns [`ProxyError::SchemaResolutionFailed`] if either is unknown.
pub fn find_method(
    pool: &DescriptorPool,
    service: &str,
    method: &str,
) -> Result<InvocationDescriptor, ProxyError> {
    let svc = pool.get_service_by_name(service).ok_or_else(|| {
        ProxyError::SchemaResolutionFailed(format!("service '{service}' not found"))
    })?;
    let found = svc.methods().find(|m| m.name() == method).ok_or_else(|| {
        ProxyError::SchemaResolutionFailed(format!("method '{method}' not found in '{service}'"))
    })?;
    InvocationDescriptor::new(found)
}
