#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! Service registry client.
//!
//! Publishes the current process under a leased key and lets callers list and
//! watch the instances of any named service. [`EtcdRegistry`] talks to a real
//! etcd cluster; [`MemoryRegistry`] keeps everything in process.

pub mod config;
pub mod error;
pub mod etcd;
pub mod instance;
pub mod lease;
pub mod memory;
pub mod registry;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use etcd::EtcdRegistry;
pub use instance::{KeySpace, LocalIdentity, Registration, ServiceInstance};
pub use lease::{LeaseClient, LeaseId, LeaseKeeper, LeaseState};
pub use memory::MemoryRegistry;
pub use registry::{EventKind, Registry, WatchEvent, WatchStream};
