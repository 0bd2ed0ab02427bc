//! Process lease acquisition and background renewal.
//!
//! A process holds exactly one lease. Every key it registers is bound to
//! that lease, so when the process dies (or stops renewing) the backend
//! removes its keys after the TTL elapses.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;

/// Default lease time-to-live.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unleased,
    Leased(LeaseId),
}

/// Backend operations needed to hold a lease.
#[async_trait]
pub trait LeaseClient: Send + Sync + 'static {
    /// # Errors
    /// Returns [`RegistryError::Lease`] or [`RegistryError::Unavailable`]
    /// if the backend refuses or cannot be reached.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, RegistryError>;

    /// Refresh the lease and return the remaining TTL reported by the backend.
    ///
    /// A zero TTL means the lease no longer exists.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the renewal request fails.
    async fn keep_alive(&self, id: LeaseId) -> Result<Duration, RegistryError>;
}

#[derive(Debug, Default)]
struct RenewalStats {
    renewals: AtomicU64,
    failures: AtomicU64,
}

/// Holds a granted lease and renews it every `ttl / 3`.
///
/// Renewal failures are logged and counted, never retried inline: the next
/// tick simply tries again. If renewals keep failing the lease expires
/// naturally on the backend.
pub struct LeaseKeeper {
    id: LeaseId,
    ttl: Duration,
    stats: Arc<RenewalStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LeaseKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseKeeper")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .field("stats", &self.stats)
            .field("cancel", &self.cancel)
            .field("task", &self.task.lock().is_some())
            .finish()
    }
}

impl LeaseKeeper {
    /// Grant a lease and start renewing it.
    ///
    /// # Errors
    /// Returns the backend error if the lease cannot be granted.
    pub async fn start(client: Arc<dyn LeaseClient>, ttl: Duration) -> Result<Self, RegistryError> {
        let id = client.grant(ttl).await?;
        tracing::info!(lease = %id, ttl_secs = ttl.as_secs(), "registry lease granted");

        let stats = Arc::new(RenewalStats::default());
        let cancel = CancellationToken::new();
        let period = renew_period(ttl);
        let task = tokio::spawn(renew_loop(
            client,
            id,
            period,
            stats.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            id,
            ttl,
            stats,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    #[must_use]
    pub fn id(&self) -> LeaseId {
        self.id
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn renewals(&self) -> u64 {
        self.stats.renewals.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn renewal_failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    /// Stop renewing and wait for the renewal task to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(lease = %self.id, error = %e, "lease renewal task failed");
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn renew_period(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(100))
}

async fn renew_loop(
    client: Arc<dyn LeaseClient>,
    id: LeaseId,
    period: Duration,
    stats: Arc<RenewalStats>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just granted.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            r = tokio::time::timeout(period, client.keep_alive(id)) => r,
        };

        match outcome {
            Ok(Ok(remaining)) if remaining.is_zero() => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(lease = %id, "lease no longer exists on the registry");
            }
            Ok(Ok(remaining)) => {
                stats.renewals.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(lease = %id, remaining_secs = remaining.as_secs(), "lease renewed");
            }
            Ok(Err(e)) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(lease = %id, error = %e, "lease renewal failed");
            }
            Err(_) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(lease = %id, "lease renewal timed out");
            }
        }
    }

    tracing::debug!(lease = %id, "lease renewal stopped");
}
