//! In-process registry.
//!
//! Behaves like the etcd backend (ordered keys, prefix watches, a leased
//! registration) without a cluster. It also exposes hooks that let tests play
//! the part of other processes and of a misbehaving backend.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::instance::{KeySpace, Registration, ServiceInstance};
use crate::lease::{DEFAULT_LEASE_TTL, LeaseClient, LeaseId, LeaseKeeper, LeaseState};
use crate::registry::{Registry, WatchEvent, WatchStream};

type EventSender = mpsc::UnboundedSender<Result<WatchEvent, RegistryError>>;

struct Record {
    instance: ServiceInstance,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: EventSender,
}

#[derive(Default)]
struct Store {
    records: BTreeMap<String, Record>,
    watchers: Vec<Watcher>,
    leases: HashSet<LeaseId>,
}

impl Store {
    fn notify(&mut self, event: &WatchEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for w in &self.watchers {
            if event.instance.key.starts_with(&w.prefix) {
                w.tx.send(Ok(event.clone())).ok();
            }
        }
    }

    fn upsert(&mut self, instance: ServiceInstance, lease: Option<LeaseId>) {
        let event = WatchEvent::put(instance.clone());
        self.records
            .insert(instance.key.clone(), Record { instance, lease });
        self.notify(&event);
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.records.remove(key) {
            Some(record) => {
                self.notify(&WatchEvent::delete(record.instance));
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Shared {
    store: Mutex<Store>,
    offline: AtomicBool,
    fail_renewals: AtomicBool,
    next_lease: AtomicI64,
}

impl Shared {
    fn check_online(&self) -> Result<(), RegistryError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RegistryError::Unavailable("in-memory registry is offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseClient for Shared {
    async fn grant(&self, _ttl: Duration) -> Result<LeaseId, RegistryError> {
        self.check_online()?;
        let id = LeaseId(self.next_lease.fetch_add(1, Ordering::SeqCst) + 1);
        self.store.lock().leases.insert(id);
        Ok(id)
    }

    async fn keep_alive(&self, id: LeaseId) -> Result<Duration, RegistryError> {
        self.check_online()?;
        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("renewal rejected".to_owned()));
        }
        if self.store.lock().leases.contains(&id) {
            Ok(DEFAULT_LEASE_TTL)
        } else {
            Ok(Duration::ZERO)
        }
    }
}

pub struct MemoryRegistry {
    shared: Arc<Shared>,
    keys: KeySpace,
    ttl: Duration,
    lease: OnceCell<LeaseKeeper>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(KeySpace::default())
    }
}

impl MemoryRegistry {
    #[must_use]
    pub fn new(keys: KeySpace) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            keys,
            ttl: DEFAULT_LEASE_TTL,
            lease: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    #[must_use]
    pub fn lease_state(&self) -> LeaseState {
        self.lease
            .get()
            .map_or(LeaseState::Unleased, |k| LeaseState::Leased(k.id()))
    }

    #[must_use]
    pub fn lease(&self) -> Option<&LeaseKeeper> {
        self.lease.get()
    }

    /// Store `instance` as if another process had registered it.
    pub fn put(&self, instance: ServiceInstance) {
        self.shared.store.lock().upsert(instance, None);
    }

    /// Remove `key`, emitting a delete event. Returns `false` if absent.
    pub fn delete(&self, key: &str) -> bool {
        self.shared.store.lock().remove(key)
    }

    /// Expire a lease now, deleting every key bound to it.
    pub fn expire_lease(&self, id: LeaseId) {
        let mut store = self.shared.store.lock();
        store.leases.remove(&id);
        let bound: Vec<String> = store
            .records
            .iter()
            .filter(|(_, r)| r.lease == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in bound {
            store.remove(&key);
        }
    }

    /// Make subsequent lease renewals fail.
    pub fn set_fail_renewals(&self, fail: bool) {
        self.shared.fail_renewals.store(fail, Ordering::SeqCst);
    }

    /// Make every backend operation fail with [`RegistryError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Terminate every open watch on `name` with an error item.
    pub fn fail_watchers(&self, name: &str) {
        let prefix = self.keys.name_prefix(name);
        let mut store = self.shared.store.lock();
        store.watchers.retain(|w| {
            if w.prefix == prefix {
                w.tx
                    .send(Err(RegistryError::Unavailable("watch stream broken".to_owned())))
                    .ok();
                false
            } else {
                true
            }
        });
    }

    /// Number of live watch streams on `name`.
    #[must_use]
    pub fn watcher_count(&self, name: &str) -> usize {
        let prefix = self.keys.name_prefix(name);
        self.shared
            .store
            .lock()
            .watchers
            .iter()
            .filter(|w| w.prefix == prefix && !w.tx.is_closed())
            .count()
    }

    async fn ensure_lease(&self) -> Result<LeaseId, RegistryError> {
        let keeper = self
            .lease
            .get_or_try_init(|| async {
                let client: Arc<dyn LeaseClient> = self.shared.clone();
                LeaseKeeper::start(client, self.ttl).await
            })
            .await?;
        Ok(keeper.id())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, reg: &Registration) -> Result<ServiceInstance, RegistryError> {
        self.shared.check_online()?;
        let lease = self.ensure_lease().await?;
        let instance = self.keys.instance_for(reg);
        self.shared
            .store
            .lock()
            .upsert(instance.clone(), Some(lease));
        tracing::info!(key = %instance.key, lease = %lease, "service instance registered");
        Ok(instance)
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.shared.check_online()?;
        self.shared.store.lock().remove(&instance.key);
        Ok(())
    }

    async fn list(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.shared.check_online()?;
        let prefix = self.keys.name_prefix(name);
        let store = self.shared.store.lock();
        Ok(store
            .records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, r)| r.instance.clone())
            .collect())
    }

    async fn watch(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream, RegistryError> {
        self.shared.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.store.lock().watchers.push(Watcher {
            prefix: self.keys.name_prefix(name),
            tx,
        });
        let stream = UnboundedReceiverStream::new(rx).take_until(cancel.cancelled_owned());
        Ok(Box::pin(stream))
    }
}
