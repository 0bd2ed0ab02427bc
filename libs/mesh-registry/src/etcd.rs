//! etcd-backed registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, KeyValue, LeaseKeepAliveStream,
    LeaseKeeper as EtcdKeeper, PutOptions, SortOrder, SortTarget, WatchOptions,
};
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::instance::{KeySpace, Registration, ServiceInstance};
use crate::lease::{LeaseClient, LeaseId, LeaseKeeper, LeaseState};
use crate::registry::{Registry, WatchEvent, WatchStream};

/// Registry stored in an etcd cluster.
///
/// Values are JSON-encoded [`ServiceInstance`] records. The process lease is
/// granted lazily on the first [`Registry::register`] call and then kept
/// alive for the lifetime of this value.
pub struct EtcdRegistry {
    client: Client,
    keys: KeySpace,
    ttl: Duration,
    lease: OnceCell<LeaseKeeper>,
}

impl EtcdRegistry {
    /// Connect to the configured endpoints.
    ///
    /// # Errors
    /// Returns [`RegistryError::Unavailable`] if no endpoint answers within
    /// the dial timeout.
    pub async fn connect(cfg: &RegistryConfig) -> Result<Self, RegistryError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(cfg.dial_timeout())
            .with_timeout(cfg.request_timeout())
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let client = Client::connect(cfg.endpoints.as_slice(), Some(options))
            .instrument(tracing::debug_span!("etcd_connect", endpoints = ?cfg.endpoints))
            .await?;
        tracing::info!(prefix = %cfg.prefix, "connected to etcd registry");

        Ok(Self {
            client,
            keys: KeySpace::new(cfg.prefix.clone()),
            ttl: cfg.lease_ttl(),
            lease: OnceCell::new(),
        })
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

    /// The process lease, once granted.
    #[must_use]
    pub fn lease(&self) -> Option<&LeaseKeeper> {
        self.lease.get()
    }

    async fn ensure_lease(&self) -> Result<LeaseId, RegistryError> {
        let keeper = self
            .lease
            .get_or_try_init(|| async {
                let client: Arc<dyn LeaseClient> = Arc::new(EtcdLease::new(self.client.clone()));
                LeaseKeeper::start(client, self.ttl).await
            })
            .await?;
        Ok(keeper.id())
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, reg: &Registration) -> Result<ServiceInstance, RegistryError> {
        let lease = self.ensure_lease().await?;
        let instance = self.keys.instance_for(reg);
        let value = serde_json::to_vec(&instance).map_err(|e| RegistryError::InvalidRecord {
            key: instance.key.clone(),
            reason: e.to_string(),
        })?;

        let mut client = self.client.clone();
        client
            .put(
                instance.key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease.0)),
            )
            .await?;

        tracing::info!(
            key = %instance.key,
            version = %instance.version,
            weight = instance.weight,
            lease = %lease,
            "service instance registered"
        );
        Ok(instance)
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client.delete(instance.key.as_str(), None).await?;
        tracing::info!(key = %instance.key, "service instance deregistered");
        Ok(())
    }

    async fn list(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let prefix = self.keys.name_prefix(name);
        let mut client = self.client.clone();
        let resp = client
            .get(
                prefix.as_str(),
                Some(
                    GetOptions::new()
                        .with_prefix()
                        .with_sort(SortTarget::Key, SortOrder::Ascend),
                ),
            )
            .await?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match decode_kv(&self.keys, kv) {
                Ok(instance) => out.push(instance),
                Err(e) => tracing::warn!(service = name, error = %e, "skipping registry record"),
            }
        }
        tracing::debug!(service = name, count = out.len(), "listed service instances");
        Ok(out)
    }

    async fn watch(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream, RegistryError> {
        let prefix = self.keys.name_prefix(name);
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(
                prefix.as_str(),
                Some(WatchOptions::new().with_prefix().with_prev_key()),
            )
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let keys = self.keys.clone();
        let name = name.to_owned();

        tokio::spawn(async move {
            'pump: loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => break,
                    m = stream.message() => m,
                };

                match next {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            tracing::warn!(service = %name, reason = resp.cancel_reason(), "etcd cancelled the watch");
                            tx.send(Err(RegistryError::WatchClosed(name.clone()))).ok();
                            break;
                        }
                        for event in resp.events() {
                            let Some(ev) = translate(&keys, event) else {
                                continue;
                            };
                            if tx.send(Ok(ev)).is_err() {
                                break 'pump;
                            }
                        }
                    }
                    Ok(None) => {
                        tx.send(Err(RegistryError::WatchClosed(name.clone()))).ok();
                        break;
                    }
                    Err(e) => {
                        tx.send(Err(e.into())).ok();
                        break;
                    }
                }
            }

            if let Err(e) = watcher.cancel().await {
                tracing::debug!(service = %name, error = %e, "failed to cancel etcd watcher");
            }
            tracing::debug!(service = %name, "etcd watch pump stopped");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn decode_kv(keys: &KeySpace, kv: &KeyValue) -> Result<ServiceInstance, RegistryError> {
    let key = kv.key_str().map_err(|e| RegistryError::InvalidRecord {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        reason: e.to_string(),
    })?;
    keys.decode(key, kv.value())
}

fn translate(keys: &KeySpace, event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let decoded = match event.event_type() {
        EventType::Put => decode_kv(keys, kv).map(WatchEvent::put),
        EventType::Delete => {
            // The deleted value is only available through prev_kv.
            let previous = event.prev_kv().and_then(|prev| decode_kv(keys, prev).ok());
            match previous {
                Some(instance) => Ok(WatchEvent::delete(instance)),
                None => kv
                    .key_str()
                    .map_err(|e| RegistryError::InvalidRecord {
                        key: String::from_utf8_lossy(kv.key()).into_owned(),
                        reason: e.to_string(),
                    })
                    .and_then(|key| keys.tombstone(key))
                    .map(WatchEvent::delete),
            }
        }
    };

    match decoded {
        Ok(ev) => Some(ev),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring undecodable watch event");
            None
        }
    }
}

/// Lease operations over an etcd client.
///
/// The keep-alive stream is opened lazily and reopened after any failure.
struct EtcdLease {
    client: Client,
    channel: Mutex<Option<(EtcdKeeper, LeaseKeepAliveStream)>>,
}

impl EtcdLease {
    fn new(client: Client) -> Self {
        Self {
            client,
            channel: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LeaseClient for EtcdLease {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, RegistryError> {
        let ttl = i64::try_from(ttl.as_secs())
            .map_err(|_| RegistryError::Lease(format!("lease ttl out of range: {}s", ttl.as_secs())))?;
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| RegistryError::Lease(e.to_string()))?;
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive(&self, id: LeaseId) -> Result<Duration, RegistryError> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            let mut client = self.client.clone();
            *guard = Some(client.lease_keep_alive(id.0).await?);
        }
        let Some((keeper, stream)) = guard.as_mut() else {
            return Err(RegistryError::Lease("keep-alive channel missing".to_owned()));
        };

        let result = refresh(keeper, stream).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

async fn refresh(
    keeper: &mut EtcdKeeper,
    stream: &mut LeaseKeepAliveStream,
) -> Result<Duration, RegistryError> {
    keeper.keep_alive().await?;
    match stream.message().await? {
        Some(resp) => Ok(Duration::from_secs(u64::try_from(resp.ttl()).unwrap_or(0))),
        None => Err(RegistryError::Lease("keep-alive stream closed".to_owned())),
    }
}
