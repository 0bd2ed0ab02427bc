//! Schema resolution for dynamic calls.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorProto;
use tonic::transport::Channel;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;

use crate::descriptor::{InvocationDescriptor, find_method};
use crate::error::ProxyError;

/// Turns a `(service, method)` pair into an [`InvocationDescriptor`].
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// # Errors
    /// [`ProxyError::SchemaResolutionFailed`] if the method is unknown,
    /// [`ProxyError::BackendUnavailable`] if the schema source is unreachable.
    async fn resolve(&self, service: &str, method: &str)
    -> Result<InvocationDescriptor, ProxyError>;
}

/// Resolves against descriptors known up front.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    pool: DescriptorPool,
}

impl StaticResolver {
    #[must_use]
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaResolver for StaticResolver {
    async fn resolve(
        &self,
        service: &str,
        method: &str,
    ) -> Result<InvocationDescriptor, ProxyError> {
        find_method(&self.pool, service, method)
    }
}

/// Resolves by asking the backend's `grpc.reflection.v1` service.
///
/// The file defining the service is fetched first, then every dependency it
/// names that was not already returned.
#[derive(Debug, Clone)]
pub struct ReflectionResolver {
    channel: Channel,
}

fn map_status(status: &tonic::Status) -> ProxyError {
    match status.code() {
        tonic::Code::Unavailable => ProxyError::BackendUnavailable(status.message().to_owned()),
        code => ProxyError::SchemaResolutionFailed(format!(
            "reflection request failed ({code}): {}",
            status.message()
        )),
    }
}

fn absorb(
    batch: Vec<FileDescriptorProto>,
    files: &mut HashMap<String, FileDescriptorProto>,
    pending: &mut Vec<String>,
) {
    for file in batch {
        pending.extend(file.dependency.iter().cloned());
        files.insert(file.name().to_owned(), file);
    }
}

impl ReflectionResolver {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    async fn fetch(&self, request: MessageRequest) -> Result<Vec<FileDescriptorProto>, ProxyError> {
        let mut client = ServerReflectionClient::new(self.channel.clone());
        let outbound = tokio_stream::once(ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        });

        let mut inbound = client
            .server_reflection_info(outbound)
            .await
            .map_err(|s| map_status(&s))?
            .into_inner();
        let resp = inbound
            .message()
            .await
            .map_err(|s| map_status(&s))?
            .ok_or_else(|| {
                ProxyError::SchemaResolutionFailed("empty reflection response".to_owned())
            })?;

        match resp.message_response {
            Some(MessageResponse::FileDescriptorResponse(files)) => files
                .file_descriptor_proto
                .iter()
                .map(|raw| {
                    FileDescriptorProto::decode(raw.as_slice()).map_err(|e| {
                        ProxyError::SchemaResolutionFailed(format!(
                            "malformed file descriptor: {e}"
                        ))
                    })
                })
                .collect(),
            Some(MessageResponse::ErrorResponse(err)) => Err(ProxyError::SchemaResolutionFailed(
                format!("reflection error {}: {}", err.error_code, err.error_message),
            )),
            _ => Err(ProxyError::SchemaResolutionFailed(
                "unexpected reflection response".to_owned(),
            )),
        }
    }

    /// Fetch `service`'s file and its transitive dependencies.
    ///
    /// # Errors
    /// See [`SchemaResolver::resolve`].
    pub async fn fetch_pool(&self, service: &str) -> Result<DescriptorPool, ProxyError> {
        let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut requested: HashSet<String> = HashSet::new();
        let mut pending: Vec<String> = Vec::new();

        let first = self
            .fetch(MessageRequest::FileContainingSymbol(service.to_owned()))
            .await?;
        absorb(first, &mut files, &mut pending);

        while let Some(name) = pending.pop() {
            if files.contains_key(&name) || !requested.insert(name.clone()) {
                continue;
            }
            tracing::trace!(file = %name, "fetching dependency through reflection");
            let batch = self.fetch(MessageRequest::FileByFilename(name)).await?;
            absorb(batch, &mut files, &mut pending);
        }

        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_protos(files.into_values())
            .map_err(|e| ProxyError::SchemaResolutionFailed(e.to_string()))?;
        Ok(pool)
    }
}

#[async_trait]
impl SchemaResolver for ReflectionResolver {
    async fn resolve(
        &self,
        service: &str,
        method: &str,
    ) -> Result<InvocationDescriptor, ProxyError> {
        let pool = self.fetch_pool(service).await?;
        let descriptor = find_method(&pool, service, method)?;
        tracing::debug!(path = %descriptor.path(), "resolved method through reflection");
        Ok(descriptor)
    }
}
