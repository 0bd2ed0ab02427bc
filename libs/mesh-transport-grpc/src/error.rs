use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid peer uri '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to connect to {uri}: {source}")]
    Transport {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("health check failed: {0}")]
    HealthCheck(#[source] tonic::Status),

    #[error("service '{service}' reported {status}")]
    Unhealthy { service: String, status: String },
}
