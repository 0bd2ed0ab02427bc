//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use mesh_bootstrap::{AppConfig, cancel_on_signal};
use mesh_pool::ConnectionPool;
use mesh_registry::{EtcdRegistry, Registry};
use mesh_transport_grpc::{CallMetadata, OutboundInterceptor, ServiceHost};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct CallRequest {
    pub name: String,
    pub method: String,
    pub grpc_service: Option<String>,
    pub data: String,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
}

fn outbound_pool(config: &AppConfig, registry: Arc<EtcdRegistry>) -> ConnectionPool {
    ConnectionPool::with_grpc(
        registry,
        config.client.to_grpc(),
        OutboundInterceptor::new(&config.service.name),
        config.pool.clone(),
    )
}

async fn connect_registry(config: &AppConfig) -> Result<Arc<EtcdRegistry>> {
    let registry = EtcdRegistry::connect(&config.registry)
        .await
        .with_context(|| {
            format!(
                "failed to connect to registry at {}",
                config.registry.endpoints.join(", ")
            )
        })?;
    Ok(Arc::new(registry))
}

/// Serve health and reflection, stay registered and keep the configured
/// peers pooled until a shutdown signal arrives.
pub async fn serve(config: &AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let mut server = tokio::spawn(ServiceHost::new().serve(listener, cancel.clone()));

    let registry = connect_registry(config).await?;
    let registration = config.registration();
    let instance = registry
        .register(&registration)
        .await
        .context("failed to register this node")?;

    let pool = outbound_pool(config, registry.clone());
    pool.set_local_identity(registration.identity());
    for name in &config.pool.watch {
        if let Err(e) = pool.ensure_watching(name).await {
            tracing::warn!(service = %name, error = %e, "failed to watch peer service");
        }
    }
    tracing::info!(key = %instance.key, peers = config.pool.watch.len(), "mesh node ready");

    let finished = tokio::select! {
        () = cancel.cancelled() => None,
        res = &mut server => Some(res),
    };
    cancel.cancel();
    signals.abort();

    pool.shutdown_all().await;
    if let Err(e) = registry.deregister(&instance).await {
        tracing::warn!(
            key = %instance.key,
            error = %e,
            "failed to deregister, lease expiry will remove the key"
        );
    }
    if let Some(lease) = registry.lease() {
        lease.stop().await;
    }

    let served = match finished {
        Some(res) => res,
        None => server.await,
    };
    served.context("gRPC server task failed")?
}

/// Print the registered instances of `name` as JSON.
pub async fn list(config: &AppConfig, name: &str) -> Result<()> {
    let registry = connect_registry(config).await?;
    let instances = registry.list(name).await?;
    println!("{}", serde_json::to_string_pretty(&instances)?);
    Ok(())
}

/// Discover `name`, pick an instance and call `method` on it dynamically.
pub async fn call(config: &AppConfig, request: CallRequest) -> Result<()> {
    let CallRequest {
        name,
        method,
        grpc_service,
        data,
        trace_id,
        user_id,
    } = request;

    let registry = connect_registry(config).await?;
    let pool = outbound_pool(config, registry);
    pool.ensure_watching(&name).await?;
    let client = pool.select(&name)?;
    tracing::debug!(key = %client.instance().key, "selected instance");

    let meta = CallMetadata { trace_id, user_id };
    let service = grpc_service.unwrap_or_else(|| name.clone());
    let result = client
        .call_dynamic(&service, &method, data.as_bytes(), meta)
        .await;
    drop(client);
    pool.shutdown(&name).await;

    let response = result.with_context(|| format!("call {service}/{method} failed"))?;
    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
