#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! Dynamic invocation of gRPC methods.
//!
//! The schema of a method is looked up when it is first called (normally via
//! the backend's reflection service), requests are parsed from JSON against
//! the input type, and responses are rendered back to JSON.

pub mod cache;
pub mod codec;
pub mod convert;
pub mod descriptor;
pub mod error;
pub mod invoker;
pub mod proxy;
pub mod resolver;

pub use cache::DescriptorCache;
pub use codec::DynamicCodec;
pub use descriptor::{InvocationDescriptor, find_method};
pub use error::ProxyError;
pub use invoker::{GrpcInvoker, Invoker};
pub use proxy::DynamicProxy;
pub use resolver::{ReflectionResolver, SchemaResolver, StaticResolver};

pub use prost_reflect;
