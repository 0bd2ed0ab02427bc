//! Layered node configuration.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. YAML file, after `${VAR}` placeholders are replaced from the environment
//! 3. `MESH__`-prefixed environment variables, `__` separating sections
//!    (`MESH__SERVER__PORT=9000`)
//! 4. command-line overrides

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use mesh_pool::PoolConfig;
use mesh_registry::{Registration, RegistryConfig};
use mesh_transport_grpc::GrpcClientConfig;
use serde::{Deserialize, Serialize};

/// Prefix of environment variables that override configuration values.
pub const ENV_PREFIX: &str = "MESH__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("environment variable '{0}' is referenced by the configuration but not set")]
    MissingEnvVar(String),

    #[error("failed to load configuration: {0}")]
    Load(Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Name this node registers under.
    pub name: String,
    pub version: String,
    /// Selection weight advertised to peers; 0 keeps the node out of rotation.
    pub weight: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "mesh-node".to_owned(),
            version: "1.0.1".to_owned(),
            weight: 100,
        }
    }
}

/// Listen address, also advertised in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_owned(),
            port: 50051,
        }
    }
}

impl ServerConfig {
    /// # Errors
    /// [`ConfigError::Invalid`] if `ip` is not an IP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("server.ip '{}' is not an IP address", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Outbound connection settings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub health_check: bool,
    pub lazy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            rpc_timeout_ms: 30_000,
            keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 10_000,
            health_check: true,
            lazy: false,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn to_grpc(&self) -> GrpcClientConfig {
        let cfg = GrpcClientConfig::default()
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms))
            .with_keepalive(
                Duration::from_millis(self.keepalive_interval_ms),
                Duration::from_millis(self.keepalive_timeout_ms),
            );
        let cfg = if self.health_check {
            cfg
        } else {
            cfg.without_health_check()
        };
        if self.lazy { cfg.lazy() } else { cfg }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
    /// Also write to this file, rotated by size. `~` is expanded.
    pub file: Option<String>,
    pub file_max_size_mb: u64,
    pub file_max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            ansi: true,
            file: None,
            file_max_size_mb: 100,
            file_max_files: 5,
        }
    }
}

/// Command-line values that take part in configuration merging.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub client: ClientConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load defaults, the optional YAML file and environment overrides, then
    /// validate.
    ///
    /// # Errors
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::MissingEnvVar`] for a `${VAR}` with `VAR` unset
    /// - [`ConfigError::Load`] for malformed YAML or mistyped values
    /// - [`ConfigError::Invalid`] if validation fails
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path)?
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The merged sources without extraction.
    ///
    /// # Errors
    /// See [`AppConfig::load`].
    pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            figment = figment.merge(Yaml::string(&expand_env_vars(&raw)?));
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// `-v` info, `-vv` debug, `-vvv` trace.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let level = match args.verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        level.clone_into(&mut self.logging.level);
    }

    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.service.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("service.name must not be empty".to_owned()));
        }
        if name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "service.name '{name}' must not contain '/'"
            )));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".to_owned()));
        }
        self.server.socket_addr()?;
        if self.registry.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "registry.endpoints must list at least one endpoint".to_owned(),
            ));
        }
        if self.registry.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "registry.lease_ttl_secs must not be 0".to_owned(),
            ));
        }
        if self.pool.resync_base_backoff_ms > self.pool.resync_max_backoff_ms {
            return Err(ConfigError::Invalid(
                "pool.resync_base_backoff_ms exceeds pool.resync_max_backoff_ms".to_owned(),
            ));
        }
        Ok(())
    }

    /// Registry record this node publishes about itself.
    #[must_use]
    pub fn registration(&self) -> Registration {
        Registration {
            name: self.service.name.clone(),
            ip: self.server.ip.clone(),
            port: self.server.port,
            version: self.service.version.clone(),
            weight: self.service.weight,
        }
    }

    /// # Errors
    /// [`ConfigError::Render`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_saphyr::to_string(self).map_err(|e| ConfigError::Render(e.to_string()))
    }
}

/// Replace every `${VAR}` in `input` with the value of `VAR`.
///
/// # Errors
/// [`ConfigError::MissingEnvVar`] naming the first unset variable.
pub fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let mut result = input.to_owned();

    for caps in re.captures_iter(input) {
        let full_match = &caps[0];
        let var_name = &caps[1];
        let value =
            std::env::var(var_name).map_err(|_| ConfigError::MissingEnvVar(var_name.to_owned()))?;
        result = result.replace(full_match, &value);
    }

    Ok(result)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn expands_placeholders() {
        temp_env::with_vars(
            [("MESH_TEST_HOST", Some("10.0.0.7")), ("MESH_TEST_PORT", Some("7000"))],
            || {
                let out = expand_env_vars("ip: ${MESH_TEST_HOST}\nport: ${MESH_TEST_PORT}").unwrap();
                assert_eq!(out, "ip: 10.0.0.7\nport: 7000");
            },
        );
    }

    #[test]
    fn unset_placeholder_fails() {
        temp_env::with_var_unset("MESH_TEST_MISSING", || {
            let err = expand_env_vars("a: ${MESH_TEST_MISSING}").unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "MESH_TEST_MISSING"));
        });
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        assert_eq!(expand_env_vars("a: $HOME {b}").unwrap(), "a: $HOME {b}");
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let mut cfg = AppConfig::default();
        cfg.apply_cli_overrides(&CliArgs::default());
        assert_eq!(cfg.logging.level, "info");

        for (verbose, level) in [(1, "info"), (2, "debug"), (3, "trace"), (9, "trace")] {
            cfg.apply_cli_overrides(&CliArgs {
                verbose,
                ..CliArgs::default()
            });
            assert_eq!(cfg.logging.level, level);
        }
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.service.version, "1.0.1");
        assert_eq!(cfg.service.weight, 100);
        assert_eq!(cfg.registry.lease_ttl_secs, 20);
        assert_eq!(cfg.registry.prefix, "services");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases: [fn(&mut AppConfig); 5] = [
            |c| c.service.name = "  ".to_owned(),
            |c| c.service.name = "a/b".to_owned(),
            |c| c.server.port = 0,
            |c| c.server.ip = "not-an-ip".to_owned(),
            |c| c.registry.endpoints.clear(),
        ];
        for mutate in cases {
            let mut cfg = AppConfig::default();
            mutate(&mut cfg);
            assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn registration_comes_from_service_and_server() {
        let mut cfg = AppConfig::default();
        cfg.service.name = "orders".to_owned();
        cfg.server.port = 9001;
        let reg = cfg.registration();
        assert_eq!(reg.name, "orders");
        assert_eq!(reg.ip, "127.0.0.1");
        assert_eq!(reg.port, 9001);
        assert_eq!(reg.weight, 100);
    }

    #[test]
    fn client_settings_map_to_transport_config() {
        let cfg = ClientConfig {
            connect_timeout_ms: 250,
            health_check: false,
            ..ClientConfig::default()
        }
        .to_grpc();
        assert_eq!(cfg.connect_timeout, Duration::from_millis(250));
        assert!(!cfg.health_check);
        assert!(!cfg.lazy);

        let lazy = ClientConfig {
            lazy: true,
            ..ClientConfig::default()
        }
        .to_grpc();
        assert!(lazy.lazy);
    }

    #[test]
    fn ipv6_listen_address() {
        let server = ServerConfig {
            ip: "::1".to_owned(),
            port: 7000,
        };
        assert_eq!(server.socket_addr().unwrap().to_string(), "[::1]:7000");
    }
}
