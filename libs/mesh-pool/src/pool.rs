//! Registry-driven connection pool.
//!
//! For every watched service name the pool keeps one connection per live
//! instance in a bucket, fed by a background watch loop. Callers pick a
//! connection with [`ConnectionPool::select`], which never blocks on I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use mesh_registry::{
    EventKind, LocalIdentity, Registry, ServiceInstance, WatchEvent, WatchStream,
};
use mesh_transport_grpc::{GrpcClientConfig, OutboundInterceptor};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balancer::WeightedRandom;
use crate::config::PoolConfig;
use crate::connector::{Connector, GrpcConnector};
use crate::entry::{PoolEntry, PooledClient};
use crate::error::PoolError;

/// Cheap to clone; all clones share the same buckets and watch loops.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct WatchHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Set once the initial listing is pooled.
    ready: bool,
}

#[derive(Default)]
struct PoolState {
    /// Selection order per service name.
    buckets: HashMap<String, Vec<Arc<PoolEntry>>>,
    /// Instance key to its entry, across all buckets.
    index: HashMap<String, Arc<PoolEntry>>,
    watches: HashMap<String, WatchHandle>,
}

struct PoolInner {
    registry: Arc<dyn Registry>,
    connector: Arc<dyn Connector>,
    interceptor: OutboundInterceptor,
    balancer: WeightedRandom,
    config: PoolConfig,
    local: ArcSwapOption<LocalIdentity>,
    state: RwLock<PoolState>,
    /// Serializes watch setup so each name gets exactly one loop.
    init: tokio::sync::Mutex<()>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(
        registry: Arc<dyn Registry>,
        connector: Arc<dyn Connector>,
        interceptor: OutboundInterceptor,
        config: PoolConfig,
    ) -> Self {
        let balancer = config
            .rng_seed
            .map_or_else(WeightedRandom::new, WeightedRandom::with_seed);
        Self {
            inner: Arc::new(PoolInner {
                registry,
                connector,
                interceptor,
                balancer,
                config,
                local: ArcSwapOption::empty(),
                state: RwLock::new(PoolState::default()),
                init: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Pool dialing real gRPC channels.
    #[must_use]
    pub fn with_grpc(
        registry: Arc<dyn Registry>,
        client: GrpcClientConfig,
        interceptor: OutboundInterceptor,
        config: PoolConfig,
    ) -> Self {
        Self::new(
            registry,
            Arc::new(GrpcConnector::new(client)),
            interceptor,
            config,
        )
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Identity of the hosting process; matching instances are never pooled.
    ///
    /// Read whenever an event is applied, so setting it late only affects
    /// instances that arrive afterwards.
    pub fn set_local_identity(&self, identity: LocalIdentity) {
        self.inner.local.store(Some(Arc::new(identity)));
    }

    #[must_use]
    pub fn local_identity(&self) -> Option<Arc<LocalIdentity>> {
        self.inner.local.load_full()
    }

    #[must_use]
    pub fn is_watching(&self, name: &str) -> bool {
        self.inner.state.read().watches.contains_key(name)
    }

    fn is_ready(&self, name: &str) -> bool {
        self.inner
            .state
            .read()
            .watches
            .get(name)
            .is_some_and(|handle| handle.ready)
    }

    #[must_use]
    pub fn watched_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.read().watches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the instances currently pooled for `name`.
    #[must_use]
    pub fn instances(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.inner
            .state
            .read()
            .buckets
            .get(name)
            .map(|bucket| bucket.iter().map(|e| e.instance()).collect())
            .unwrap_or_default()
    }

    /// Every pooled connection for `name`, in bucket order.
    #[must_use]
    pub fn clients(&self, name: &str) -> Vec<PooledClient> {
        self.inner
            .state
            .read()
            .buckets
            .get(name)
            .map(|bucket| bucket.iter().cloned().map(PooledClient::new).collect())
            .unwrap_or_default()
    }

    /// Start tracking `name` unless it is already tracked.
    ///
    /// Subscribes first and lists second, so nothing that changes between the
    /// two is missed. The initial instances are dialed before this returns;
    /// later changes are applied by a background loop.
    ///
    /// Concurrent callers for the same name all return after the initial
    /// instances are pooled.
    ///
    /// # Errors
    /// [`PoolError::InvalidServiceName`] if `name` is empty or contains `/`.
    /// [`PoolError::Registry`] if the subscription or the listing fails. The
    /// pool is left untouched in that case and the call may be retried.
    pub async fn ensure_watching(&self, name: &str) -> Result<(), PoolError> {
        if name.is_empty() || name.contains('/') {
            return Err(PoolError::InvalidServiceName(name.to_owned()));
        }
        if self.is_ready(name) {
            return Ok(());
        }
        let _setup = self.inner.init.lock().await;
        if self.is_ready(name) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let stream = self.inner.registry.watch(name, cancel.clone()).await?;
        let snapshot = match self.inner.registry.list(name).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        {
            let mut state = self.inner.state.write();
            // A setup abandoned halfway leaves a handle that never became ready.
            if let Some(stale) = state.watches.insert(
                name.to_owned(),
                WatchHandle {
                    cancel: cancel.clone(),
                    task: None,
                    ready: false,
                },
            ) {
                stale.cancel.cancel();
            }
            state.buckets.entry(name.to_owned()).or_default();
        }
        self.inner.reconcile(name, snapshot, &cancel).await;

        let task = tokio::spawn(watch_loop(
            Arc::downgrade(&self.inner),
            name.to_owned(),
            stream,
            cancel.clone(),
        ));
        if let Some(handle) = self.inner.state.write().watches.get_mut(name) {
            handle.task = Some(task);
            handle.ready = true;
        }
        tracing::info!(service = name, "watching service");
        Ok(())
    }

    /// Apply one registry event to the bucket of `name`.
    ///
    /// Events for names that are not watched are ignored.
    pub async fn apply_event(&self, name: &str, event: WatchEvent) {
        let cancel = {
            let state = self.inner.state.read();
            match state.watches.get(name) {
                Some(handle) => handle.cancel.clone(),
                None => return,
            }
        };
        self.inner.apply_event(name, event, &cancel).await;
    }

    /// Pick a connection for `name` by weight.
    ///
    /// # Errors
    /// [`PoolError::NoInstance`] when nothing selectable is pooled.
    pub fn select(&self, name: &str) -> Result<PooledClient, PoolError> {
        let state = self.inner.state.read();
        state
            .buckets
            .get(name)
            .and_then(|bucket| self.inner.balancer.pick(bucket))
            .map(|entry| PooledClient::new(Arc::clone(entry)))
            .ok_or_else(|| PoolError::NoInstance(name.to_owned()))
    }

    /// Stop tracking `name`: stop its loop and close its connections.
    ///
    /// Returns once the loop has exited. A later
    /// [`ConnectionPool::ensure_watching`] starts from scratch.
    pub async fn shutdown(&self, name: &str) {
        let (handle, entries) = {
            let mut state = self.inner.state.write();
            let Some(handle) = state.watches.remove(name) else {
                return;
            };
            handle.cancel.cancel();
            let entries = state.buckets.remove(name).unwrap_or_default();
            for entry in &entries {
                state.index.remove(entry.key());
            }
            (handle, entries)
        };

        let closed = entries.len();
        drop(entries);
        if let Some(task) = handle.task
            && let Err(e) = task.await
        {
            tracing::warn!(service = name, error = %e, "watch loop ended abnormally");
        }
        tracing::info!(service = name, closed, "stopped watching service");
    }

    /// [`ConnectionPool::shutdown`] for every watched name.
    pub async fn shutdown_all(&self) {
        for name in self.watched_names() {
            self.shutdown(&name).await;
        }
    }
}

impl PoolInner {
    async fn apply_event(&self, name: &str, event: WatchEvent, cancel: &CancellationToken) {
        match event.kind {
            EventKind::Put => self.apply_put(name, event.instance, cancel).await,
            EventKind::Delete => self.apply_delete(name, &event.instance.key),
        }
    }

    fn is_local(&self, instance: &ServiceInstance) -> bool {
        self.local
            .load()
            .as_deref()
            .is_some_and(|local| instance.is_same_process(local))
    }

    async fn apply_put(&self, name: &str, instance: ServiceInstance, cancel: &CancellationToken) {
        if self.is_local(&instance) {
            tracing::debug!(key = %instance.key, "skipping own instance");
            return;
        }
        {
            let state = self.state.write();
            if let Some(entry) = state.index.get(&instance.key) {
                tracing::debug!(key = %instance.key, weight = instance.weight, "instance updated");
                entry.replace(instance);
                return;
            }
        }

        let dialed = tokio::select! {
            () = cancel.cancelled() => return,
            dialed = self.connector.connect(&instance) => dialed,
        };
        let channel = match dialed {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(key = %instance.key, error = %e, "instance not added");
                return;
            }
        };

        let key = instance.key.clone();
        let address = instance.address();
        let entry = Arc::new(PoolEntry::new(instance, channel, self.interceptor.clone()));

        let mut state = self.state.write();
        if cancel.is_cancelled() || !state.watches.contains_key(name) {
            tracing::debug!(%key, "discarding connection for a stopped watch");
            return;
        }
        if let Some(existing) = state.index.get(&key) {
            existing.replace(entry.instance().as_ref().clone());
            return;
        }
        state.index.insert(key.clone(), Arc::clone(&entry));
        state.buckets.entry(name.to_owned()).or_default().push(entry);
        tracing::info!(service = name, %key, %address, "instance added");
    }

    fn apply_delete(&self, name: &str, key: &str) {
        let removed = {
            let mut state = self.state.write();
            let Some(entry) = state.index.remove(key) else {
                return;
            };
            if let Some(bucket) = state.buckets.get_mut(name) {
                bucket.retain(|e| !Arc::ptr_eq(e, &entry));
            }
            entry
        };
        drop(removed);
        tracing::info!(service = name, key, "instance removed, connection closed");
    }

    /// Make the bucket of `name` match `snapshot`.
    async fn reconcile(
        &self,
        name: &str,
        snapshot: Vec<ServiceInstance>,
        cancel: &CancellationToken,
    ) {
        let live: HashSet<&str> = snapshot.iter().map(|i| i.key.as_str()).collect();
        let stale: Vec<String> = self
            .state
            .read()
            .buckets
            .get(name)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|e| !live.contains(e.key()))
                    .map(|e| e.key().to_owned())
                    .collect()
            })
            .unwrap_or_default();
        for key in stale {
            self.apply_delete(name, &key);
        }

        futures::stream::iter(snapshot)
            .for_each_concurrent(None, |instance| self.apply_put(name, instance, cancel))
            .await;
    }

    /// New subscription plus a full reconcile against a fresh listing.
    async fn resubscribe(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<WatchStream, PoolError> {
        let stream = self.registry.watch(name, cancel.clone()).await?;
        let snapshot = self.registry.list(name).await?;
        self.reconcile(name, snapshot, cancel).await;
        Ok(stream)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for handle in self.state.get_mut().watches.values() {
            handle.cancel.cancel();
        }
    }
}

/// Applies events for one name in arrival order until cancelled.
///
/// Only a weak reference is kept between events so dropping the last pool
/// handle ends the loop.
async fn watch_loop(
    pool: Weak<PoolInner>,
    name: String,
    mut stream: WatchStream,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let Some(inner) = pool.upgrade() else { break };
                inner.apply_event(&name, event, &cancel).await;
            }
            Some(Err(e)) => {
                tracing::error!(service = %name, error = %e, "watch failed, resubscribing");
                match resync(&pool, &name, &cancel).await {
                    Some(fresh) => stream = fresh,
                    None => break,
                }
            }
            None => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::error!(service = %name, "watch stream ended, resubscribing");
                match resync(&pool, &name, &cancel).await {
                    Some(fresh) => stream = fresh,
                    None => break,
                }
            }
        }
    }
    tracing::debug!(service = %name, "watch loop stopped");
}

/// Retry [`PoolInner::resubscribe`] with linear backoff. `None` once the
/// watch is cancelled or the pool is gone.
async fn resync(
    pool: &Weak<PoolInner>,
    name: &str,
    cancel: &CancellationToken,
) -> Option<WatchStream> {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let backoff = {
            let inner = pool.upgrade()?;
            match inner.resubscribe(name, cancel).await {
                Ok(stream) => {
                    tracing::info!(service = name, attempt, "watch resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    let backoff = inner.config.resync_backoff(attempt);
                    tracing::warn!(
                        service = name,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "resubscribe failed"
                    );
                    backoff
                }
            }
        };

        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(backoff) => {}
        }
    }
}
