use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backend could not be reached or refused the request.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("invalid registry record at '{key}': {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("lease error: {0}")]
    Lease(String),

    /// The watch stream terminated without being cancelled.
    #[error("watch on '{0}' closed by the backend")]
    WatchClosed(String),
}

impl From<etcd_client::Error> for RegistryError {
    fn from(e: etcd_client::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}
