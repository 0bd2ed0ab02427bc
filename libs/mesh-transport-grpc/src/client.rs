//! Client-side channel construction for pooled connections.
//!
//! Every connection the mesh opens goes through [`connect_channel`]:
//! - connect and per-RPC timeouts
//! - TCP and HTTP/2 keepalive so dead peers are noticed
//! - an optional check of the standard health service before the channel is
//!   handed out
//!
//! Retrying is left to the caller. The pool, for example, drops an instance it
//! cannot dial and picks it up again on the next registry event.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tracing::Instrument;

use crate::error::ConnectError;
use crate::server::HEALTH_SERVICE;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Transport settings shared by every outbound channel.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing the TCP/HTTP2 connection.
    pub connect_timeout: Duration,

    /// Deadline applied to every RPC on the channel.
    pub rpc_timeout: Duration,

    /// Interval between HTTP/2 keepalive pings.
    pub keepalive_interval: Duration,

    /// How long to wait for a keepalive ack before the connection is dropped.
    pub keepalive_timeout: Duration,

    /// Probe `grpc.health.v1.Health` after connecting.
    pub health_check: bool,

    /// Defer the connection until the first request.
    pub lazy: bool,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            health_check: true,
            lazy: false,
        }
    }
}

impl GrpcClientConfig {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn without_health_check(mut self) -> Self {
        self.health_check = false;
        self
    }

    /// Connect on first use instead of up front. Implies no health check.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self.health_check = false;
        self
    }
}

fn build_endpoint(uri: String, cfg: &GrpcClientConfig) -> Result<Endpoint, ConnectError> {
    let endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|source| ConnectError::InvalidUri { uri, source })?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(cfg.keepalive_interval))
        .http2_keep_alive_interval(cfg.keepalive_interval)
        .keep_alive_timeout(cfg.keepalive_timeout)
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// `http://ip:port` URI for a plaintext peer.
#[must_use]
pub fn peer_uri(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("http://[{ip}]:{port}")
    } else {
        format!("http://{ip}:{port}")
    }
}

/// Open a channel to `uri` with the configured transport stack.
///
/// # Errors
/// [`ConnectError::InvalidUri`] for a malformed address,
/// [`ConnectError::Transport`] if the peer cannot be reached, and
/// [`ConnectError::Unhealthy`] / [`ConnectError::HealthCheck`] if the health
/// check is enabled and does not report `SERVING`.
pub async fn connect_channel(
    uri: impl Into<String>,
    cfg: &GrpcClientConfig,
) -> Result<Channel, ConnectError> {
    let uri = uri.into();
    let span = tracing::debug_span!("grpc_connect", uri = %uri, lazy = cfg.lazy);

    async move {
        let endpoint = build_endpoint(uri.clone(), cfg)?;
        if cfg.lazy {
            return Ok(endpoint.connect_lazy());
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|source| ConnectError::Transport {
                uri: uri.clone(),
                source,
            })?;

        if cfg.health_check {
            check_health(channel.clone(), HEALTH_SERVICE).await?;
        }

        tracing::debug!(
            connect_timeout_ms = duration_to_u64_ms(cfg.connect_timeout),
            rpc_timeout_ms = duration_to_u64_ms(cfg.rpc_timeout),
            "gRPC channel connected"
        );
        Ok(channel)
    }
    .instrument(span)
    .await
}

/// Ask the peer's health service whether `service` is serving.
///
/// An empty `service` asks about the server as a whole.
///
/// # Errors
/// [`ConnectError::HealthCheck`] if the RPC fails, [`ConnectError::Unhealthy`]
/// if the reported status is anything but `SERVING`.
pub async fn check_health(channel: Channel, service: &str) -> Result<(), ConnectError> {
    let mut client = HealthClient::new(channel);
    let resp = client
        .check(HealthCheckRequest {
            service: service.to_owned(),
        })
        .await
        .map_err(ConnectError::HealthCheck)?
        .into_inner();

    let status = ServingStatus::try_from(resp.status).unwrap_or(ServingStatus::Unknown);
    if status == ServingStatus::Serving {
        Ok(())
    } else {
        tracing::warn!(health_service = HEALTH_SERVICE, service, status = status.as_str_name(), "peer is not serving");
        Err(ConnectError::Unhealthy {
            service: service.to_owned(),
            status: status.as_str_name().to_owned(),
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_config_checks_health() {
        let cfg = GrpcClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(30));
        assert!(cfg.health_check);
        assert!(!cfg.lazy);
    }

    #[test]
    fn lazy_disables_health_check() {
        let cfg = GrpcClientConfig::default()
            .with_connect_timeout(Duration::from_secs(1))
            .lazy();
        assert!(cfg.lazy);
        assert!(!cfg.health_check);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn build_endpoint_rejects_empty_uri() {
        let cfg = GrpcClientConfig::default();
        assert!(matches!(
            build_endpoint(String::new(), &cfg),
            Err(ConnectError::InvalidUri { .. })
        ));
    }

    #[test]
    fn peer_uri_brackets_ipv6() {
        assert_eq!(peer_uri("10.0.0.1", 80), "http://10.0.0.1:80");
        assert_eq!(peer_uri("::1", 80), "http://[::1]:80");
    }

    #[tokio::test]
    async fn lazy_channel_is_returned_without_dialing() {
        let cfg = GrpcClientConfig::default().lazy();
        assert!(connect_channel("http://127.0.0.1:1", &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn eager_connect_to_closed_port_fails() {
        let cfg = GrpcClientConfig::default().with_connect_timeout(Duration::from_millis(500));
        assert!(matches!(
            connect_channel("http://127.0.0.1:1", &cfg).await,
            Err(ConnectError::Transport { .. })
        ));
    }
}
