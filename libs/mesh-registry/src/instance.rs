//! Service instance records and the registry key layout.
//!
//! Every running process of a named service is stored under
//! `<prefix>/<name>/<ip>:<port>` with a JSON-encoded [`ServiceInstance`] as
//! the value.

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Default key prefix under which all instances are stored.
pub const DEFAULT_PREFIX: &str = "services";

/// One running process of a named service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub key: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    /// Relative selection weight; `0` means the instance is never selected.
    #[serde(default, alias = "power")]
    pub weight: u32,
}

impl ServiceInstance {
    /// `ip:port` of the instance, suitable for dialing.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Returns `true` if this instance is the process identified by `local`.
    #[must_use]
    pub fn is_same_process(&self, local: &LocalIdentity) -> bool {
        self.name == local.name && self.ip == local.ip && self.port == local.port
    }
}

/// Identity of the current process, used to avoid dialing ourselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalIdentity {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
        }
    }
}

/// What a serving process publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
    pub weight: u32,
}

impl Registration {
    #[must_use]
    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity::new(self.name.clone(), self.ip.clone(), self.port)
    }
}

/// Builds and parses registry keys for a given prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_owned();
        Self { prefix }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn instance_key(&self, name: &str, ip: &str, port: u16) -> String {
        format!("{}/{name}/{ip}:{port}", self.prefix)
    }

    /// Prefix matching every instance of `name` and nothing else.
    ///
    /// The trailing slash keeps `foo` from matching `foobar`.
    #[must_use]
    pub fn name_prefix(&self, name: &str) -> String {
        format!("{}/{name}/", self.prefix)
    }

    /// Split a key into `(name, ip, port)`.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidRecord`] if the key does not follow
    /// the `<prefix>/<name>/<ip>:<port>` layout.
    pub fn parse(&self, key: &str) -> Result<(String, String, u16), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidRecord {
            key: key.to_owned(),
            reason: reason.to_owned(),
        };

        let rest = key
            .strip_prefix(&self.prefix)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| invalid("key outside of registry prefix"))?;
        let (name, addr) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing address segment"))?;
        if name.is_empty() {
            return Err(invalid("empty service name"));
        }
        let (ip, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("address is not ip:port"))?;
        if ip.is_empty() {
            return Err(invalid("empty ip"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok((name.to_owned(), ip.to_owned(), port))
    }

    /// Build a full record for a registration.
    #[must_use]
    pub fn instance_for(&self, reg: &Registration) -> ServiceInstance {
        ServiceInstance {
            key: self.instance_key(&reg.name, &reg.ip, reg.port),
            name: reg.name.clone(),
            ip: reg.ip.clone(),
            port: reg.port,
            version: reg.version.clone(),
            weight: reg.weight,
        }
    }

    /// Identity-only record for a key whose value is no longer available.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidRecord`] if the key cannot be parsed.
    pub fn tombstone(&self, key: &str) -> Result<ServiceInstance, RegistryError> {
        let (name, ip, port) = self.parse(key)?;
        Ok(ServiceInstance {
            key: key.to_owned(),
            name,
            ip,
            port,
            version: String::new(),
            weight: 0,
        })
    }

    /// Decode a stored value, filling in identity from the key when absent.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidRecord`] if the value is not a valid
    /// record or disagrees with its key.
    pub fn decode(&self, key: &str, value: &[u8]) -> Result<ServiceInstance, RegistryError> {
        let mut instance: ServiceInstance =
            serde_json::from_slice(value).map_err(|e| RegistryError::InvalidRecord {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        let (name, ip, port) = self.parse(key)?;
        if instance.name != name || instance.ip != ip || instance.port != port {
            return Err(RegistryError::InvalidRecord {
                key: key.to_owned(),
                reason: format!(
                    "record {}/{}:{} does not match its key",
                    instance.name, instance.ip, instance.port
                ),
            });
        }
        key.clone_into(&mut instance.key);
        Ok(instance)
    }
}
