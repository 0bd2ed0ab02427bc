//! Serving side of a mesh node.
//!
//! [`ServiceHost`] hosts the application's gRPC services next to the standard
//! health service and server reflection, and wraps everything with the
//! [`InboundLayer`]. Reflection is what lets remote callers invoke this node
//! dynamically, so every service added here should also register its file
//! descriptor set.

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;

use crate::inbound::InboundLayer;

/// Fully qualified name of the standard health service.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

pub struct ServiceHost {
    routes: RoutesBuilder,
    health: HealthReporter,
    descriptor_sets: Vec<Vec<u8>>,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    #[must_use]
    pub fn new() -> Self {
        let (health, health_service) = tonic_health::server::health_reporter();
        let mut routes = RoutesBuilder::default();
        routes.add_service(health_service);

        Self {
            routes,
            health,
            descriptor_sets: vec![tonic_health::pb::FILE_DESCRIPTOR_SET.to_vec()],
        }
    }

    /// Routes to add application services to.
    pub fn routes_mut(&mut self) -> &mut RoutesBuilder {
        &mut self.routes
    }

    /// Expose an encoded `FileDescriptorSet` through reflection.
    pub fn register_file_descriptor_set(&mut self, encoded: &[u8]) -> &mut Self {
        self.descriptor_sets.push(encoded.to_vec());
        self
    }

    /// Handle for flipping per-service health while serving.
    #[must_use]
    pub fn health_reporter(&self) -> HealthReporter {
        self.health.clone()
    }

    fn reflection_builder(&self) -> tonic_reflection::server::Builder<'_> {
        self.descriptor_sets.iter().fold(
            tonic_reflection::server::Builder::configure(),
            |builder, set| builder.register_encoded_file_descriptor_set(set),
        )
    }

    /// Serve on `listener` until `cancel` fires.
    ///
    /// # Errors
    /// Returns an error if the reflection index cannot be built from the
    /// registered descriptor sets or if the server fails.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        let reflection_v1 = self
            .reflection_builder()
            .build_v1()
            .context("failed to build reflection service")?;
        let reflection_v1alpha = self
            .reflection_builder()
            .build_v1alpha()
            .context("failed to build reflection service")?;

        let Self {
            mut routes, health, ..
        } = self;
        routes
            .add_service(reflection_v1)
            .add_service(reflection_v1alpha);

        health
            .set_service_status(HEALTH_SERVICE, ServingStatus::Serving)
            .await;

        let bound_addr = listener.local_addr()?;
        tracing::info!(%bound_addr, "gRPC server listening");

        let incoming = TcpListenerStream::new(listener);
        let result = Server::builder()
            .layer(InboundLayer::new())
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(incoming, async move {
                cancel.cancelled().await;
            })
            .await;

        health
            .set_service_status(HEALTH_SERVICE, ServingStatus::NotServing)
            .await;
        tracing::info!(%bound_addr, "gRPC server stopped");
        result.context("gRPC server failed")
    }
}
