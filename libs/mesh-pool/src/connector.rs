use async_trait::async_trait;
use mesh_registry::ServiceInstance;
use mesh_transport_grpc::{GrpcClientConfig, connect_channel, peer_uri};
use tonic::transport::Channel;

use crate::error::PoolError;

/// Dials the channel for a newly discovered instance.
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    /// [`PoolError::DialFailed`] when the instance cannot be reached.
    async fn connect(&self, instance: &ServiceInstance) -> Result<Channel, PoolError>;
}

/// Dials plain-text HTTP/2 channels with [`connect_channel`].
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    cfg: GrpcClientConfig,
}

impl GrpcConnector {
    #[must_use]
    pub fn new(cfg: GrpcClientConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, instance: &ServiceInstance) -> Result<Channel, PoolError> {
        connect_channel(peer_uri(&instance.ip, instance.port), &self.cfg)
            .await
            .map_err(|e| PoolError::DialFailed {
                key: instance.key.clone(),
                reason: e.to_string(),
            })
    }
}
