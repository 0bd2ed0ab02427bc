#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod inbound;
pub mod interceptor;
pub mod metadata;
pub mod outbound;
pub mod server;

pub use client::{GrpcClientConfig, check_health, connect_channel, peer_uri};
pub use error::ConnectError;
pub use inbound::{InboundLayer, InboundService, log_payloads};
pub use interceptor::OutboundInterceptor;
pub use metadata::{CallMetadata, TRACE_ID_KEY, USER_ID_KEY, generate_trace_id};
pub use outbound::{OutboundLayer, OutboundService};
pub use server::{HEALTH_SERVICE, ServiceHost};
