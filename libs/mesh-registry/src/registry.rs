use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::instance::{Registration, ServiceInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Instance created or updated.
    Put,
    /// Instance removed (lease expired or deregistered).
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub instance: ServiceInstance,
}

impl WatchEvent {
    #[must_use]
    pub fn put(instance: ServiceInstance) -> Self {
        Self {
            kind: EventKind::Put,
            instance,
        }
    }

    #[must_use]
    pub fn delete(instance: ServiceInstance) -> Self {
        Self {
            kind: EventKind::Delete,
            instance,
        }
    }
}

/// Ordered change stream for one service name.
///
/// Ends when the watch is cancelled. An `Err` item is terminal: the backend
/// gave up and the caller must resubscribe.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, RegistryError>> + Send>>;

/// Strongly consistent store of service instances.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create or refresh the key for `reg`, bound to the process lease.
    ///
    /// The lease is acquired on first use and renewed in the background
    /// until the process exits.
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] if the backend cannot be reached,
    /// [`RegistryError::Lease`] if no lease could be granted.
    async fn register(&self, reg: &Registration) -> Result<ServiceInstance, RegistryError>;

    /// Remove a previously registered instance.
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] if the backend cannot be reached.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Point-in-time snapshot of all instances of `name`, ordered by key.
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] if the backend cannot be reached.
    async fn list(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Subscribe to changes under `name`.
    ///
    /// Events are delivered in registry order. The stream ends once `cancel`
    /// fires.
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] if the watch cannot be opened.
    async fn watch(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream, RegistryError>;
}
