#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! Client side of the mesh: a pool of connections to discovered instances,
//! kept in sync with the registry and balanced by weight.

pub mod balancer;
pub mod config;
pub mod connector;
pub mod entry;
pub mod error;
pub mod pool;

pub use balancer::{Weighted, WeightedRandom};
pub use config::PoolConfig;
pub use connector::{Connector, GrpcConnector};
pub use entry::PooledClient;
pub use error::PoolError;
pub use pool::ConnectionPool;
