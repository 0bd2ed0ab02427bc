#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Layered configuration loading from files and the environment.

use std::io::Write as _;

use mesh_bootstrap::{AppConfig, ConfigError, LogFormat};
use tempfile::NamedTempFile;

fn yaml_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const NODE_YAML: &str = r#"
service:
  name: orders
  weight: 40
server:
  ip: 10.1.2.3
  port: 9001
registry:
  endpoints: ["http://etcd-0:2379", "http://etcd-1:2379"]
pool:
  watch: [billing, users]
logging:
  level: debug
  format: json
"#;

#[test]
fn defaults_without_file() {
    temp_env::with_vars_unset(["MESH__SERVER__PORT", "MESH__SERVICE__NAME"], || {
        let cfg = AppConfig::load(None).unwrap();
        assert_eq!(cfg, AppConfig::default());
    });
}

#[test]
fn yaml_overrides_defaults() {
    let file = yaml_file(NODE_YAML);
    temp_env::with_vars_unset(["MESH__SERVER__PORT", "MESH__SERVICE__NAME"], || {
        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.service.name, "orders");
        assert_eq!(cfg.service.weight, 40);
        assert_eq!(cfg.service.version, "1.0.1");
        assert_eq!(cfg.server.port, 9001);
        assert_eq!(cfg.registry.endpoints.len(), 2);
        assert_eq!(cfg.registry.lease_ttl_secs, 20);
        assert_eq!(cfg.pool.watch, vec!["billing".to_owned(), "users".to_owned()]);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    });
}

#[test]
fn environment_overrides_yaml() {
    let file = yaml_file(NODE_YAML);
    temp_env::with_vars(
        [
            ("MESH__SERVER__PORT", Some("9100")),
            ("MESH__SERVICE__NAME", Some("orders-canary")),
        ],
        || {
            let cfg = AppConfig::load(Some(file.path())).unwrap();
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.service.name, "orders-canary");
            assert_eq!(cfg.service.weight, 40);
        },
    );
}

#[test]
fn placeholders_are_expanded_before_parsing() {
    let file = yaml_file(
        "server:\n  ip: ${MESH_IT_HOST}\n  port: ${MESH_IT_PORT}\n",
    );
    temp_env::with_vars(
        [("MESH_IT_HOST", Some("192.168.1.5")), ("MESH_IT_PORT", Some("7443"))],
        || {
            let cfg = AppConfig::load(Some(file.path())).unwrap();
            assert_eq!(cfg.server.ip, "192.168.1.5");
            assert_eq!(cfg.server.port, 7443);
        },
    );
}

#[test]
fn unset_placeholder_is_an_error() {
    let file = yaml_file("service:\n  name: ${MESH_IT_UNSET}\n");
    temp_env::with_var_unset("MESH_IT_UNSET", || {
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "MESH_IT_UNSET"));
    });
}

#[test]
fn unknown_keys_are_rejected() {
    let file = yaml_file("service:\n  nmae: typo\n");
    let err = AppConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Load(_)), "{err}");
}

#[test]
fn invalid_values_fail_validation() {
    let file = yaml_file("server:\n  port: 0\n");
    temp_env::with_var_unset("MESH__SERVER__PORT", || {
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    });
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(Some(&dir.path().join("absent.yaml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn yaml_dump_mentions_every_section() {
    let yaml = AppConfig::default().to_yaml().unwrap();
    for section in ["service:", "server:", "registry:", "client:", "pool:", "logging:"] {
        assert!(yaml.contains(section), "missing {section} in:\n{yaml}");
    }
}
