use mesh_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No selectable instance: the name is not watched, its bucket is empty,
    /// or every instance has weight zero.
    #[error("no instance available for service '{0}'")]
    NoInstance(String),

    /// Service names are a single non-empty registry key segment.
    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),

    #[error("failed to dial {key}: {reason}")]
    DialFailed { key: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
