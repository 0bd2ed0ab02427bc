#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Dynamic proxy behaviour with in-memory schemas and invokers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use mesh_proxy::prost_reflect::{DescriptorPool, DynamicMessage, Value};
use mesh_proxy::{
    DynamicProxy, InvocationDescriptor, Invoker, ProxyError, SchemaResolver, StaticResolver,
};
use mesh_transport_grpc::{CallMetadata, GrpcClientConfig, OutboundInterceptor, connect_channel};
use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, MethodDescriptorProto,
    ServiceDescriptorProto,
};
use serde_json::json;
use tonic::Status;

fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_owned()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(Type::String as i32),
        json_name: Some(name.to_owned()),
        ..Default::default()
    }
}

fn method(name: &str, input: &str, output: &str, streaming: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_owned()),
        input_type: Some(format!(".test.kv.{input}")),
        output_type: Some(format!(".test.kv.{output}")),
        server_streaming: Some(streaming),
        ..Default::default()
    }
}

/// `test.kv.KeyValue` with a unary `Get` and a server-streaming `Scan`.
fn kv_pool() -> DescriptorPool {
    let file = FileDescriptorProto {
        name: Some("test/kv.proto".to_owned()),
        package: Some("test.kv".to_owned()),
        syntax: Some("proto3".to_owned()),
        message_type: vec![
            DescriptorProto {
                name: Some("GetRequest".to_owned()),
                field: vec![string_field("key", 1)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("GetResponse".to_owned()),
                field: vec![string_field("key", 1), string_field("value", 2)],
                ..Default::default()
            },
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("KeyValue".to_owned()),
            method: vec![
                method("Get", "GetRequest", "GetResponse", false),
                method("Scan", "GetRequest", "GetResponse", true),
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let mut pool = DescriptorPool::new();
    pool.add_file_descriptor_proto(file).unwrap();
    pool
}

/// Answers `Get` with `value = "bar"` or with a fixed status.
struct FakeBackend {
    calls: AtomicUsize,
    fail_with: Option<Status>,
}

impl FakeBackend {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_with: None,
        })
    }

    fn failing(status: Status) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(status),
        })
    }
}

#[async_trait]
impl Invoker for FakeBackend {
    async fn invoke(
        &self,
        descriptor: &InvocationDescriptor,
        request: DynamicMessage,
        meta: CallMetadata,
    ) -> Result<Bytes, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(meta.trace_id.is_none(), "proxy must not invent metadata itself");
        if let Some(status) = &self.fail_with {
            return Err(status.clone());
        }

        let key = request
            .get_field_by_name("key")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        let mut resp = DynamicMessage::new(descriptor.output());
        resp.set_field_by_name("key", Value::String(key));
        resp.set_field_by_name("value", Value::String("bar".to_owned()));
        Ok(Bytes::from(resp.encode_to_vec()))
    }
}

/// Counts resolutions to observe cache behaviour.
struct CountingResolver {
    inner: StaticResolver,
    resolutions: AtomicUsize,
}

#[async_trait]
impl SchemaResolver for CountingResolver {
    async fn resolve(
        &self,
        service: &str,
        method: &str,
    ) -> Result<InvocationDescriptor, ProxyError> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(service, method).await
    }
}

fn counting_resolver() -> Arc<CountingResolver> {
    Arc::new(CountingResolver {
        inner: StaticResolver::new(kv_pool()),
        resolutions: AtomicUsize::new(0),
    })
}

fn as_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn json_round_trip_through_dynamic_message() {
    let proxy = DynamicProxy::new(Arc::new(StaticResolver::new(kv_pool())), FakeBackend::ok());

    let out = proxy
        .call("test.kv.KeyValue", "Get", br#"{"key":"foo"}"#)
        .await
        .unwrap();
    assert_eq!(as_json(&out), json!({"key": "foo", "value": "bar"}));
}

#[tokio::test]
async fn descriptors_are_resolved_once() {
    let resolver = counting_resolver();
    let proxy = DynamicProxy::new(resolver.clone(), FakeBackend::ok());

    for _ in 0..3 {
        proxy
            .call("test.kv.KeyValue", "Get", br#"{"key":"k"}"#)
            .await
            .unwrap();
    }
    assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.cache().len(), 1);
}

#[tokio::test]
async fn payload_not_matching_input_is_rejected() {
    let backend = FakeBackend::ok();
    let proxy = DynamicProxy::new(Arc::new(StaticResolver::new(kv_pool())), backend.clone());

    for payload in [&br#"{"nope":1}"#[..], br#"{"key":5}"#, b"{", br#"{"key":"a"} x"#] {
        let err = proxy
            .call("test.kv.KeyValue", "Get", payload)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)), "{err}");
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_payload_is_an_empty_message() {
    let proxy = DynamicProxy::new(Arc::new(StaticResolver::new(kv_pool())), FakeBackend::ok());
    let out = proxy.call("test.kv.KeyValue", "Get", b"").await.unwrap();
    assert_eq!(as_json(&out), json!({"value": "bar"}));
}

#[tokio::test]
async fn unknown_method_fails_resolution() {
    let proxy = DynamicProxy::new(Arc::new(StaticResolver::new(kv_pool())), FakeBackend::ok());
    for (service, method) in [("test.kv.KeyValue", "Put"), ("test.kv.Missing", "Get")] {
        let err = proxy.call(service, method, b"{}").await.unwrap_err();
        assert!(matches!(err, ProxyError::SchemaResolutionFailed(_)));
    }
}

#[tokio::test]
async fn streaming_methods_are_refused() {
    let backend = FakeBackend::ok();
    let proxy = DynamicProxy::new(Arc::new(StaticResolver::new(kv_pool())), backend.clone());
    let err = proxy
        .call("test.kv.KeyValue", "Scan", b"{}")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::StreamingNotSupported(ref m) if m == "test.kv.KeyValue.Scan"));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unavailable_backend_clears_the_cache() {
    let resolver = counting_resolver();
    let proxy = DynamicProxy::new(
        resolver.clone(),
        FakeBackend::failing(Status::unavailable("connection refused")),
    );

    let err = proxy
        .call("test.kv.KeyValue", "Get", b"{}")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::BackendUnavailable(_)));
    assert!(proxy.cache().is_empty());

    proxy
        .call("test.kv.KeyValue", "Get", b"{}")
        .await
        .unwrap_err();
    assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unimplemented_drops_only_that_method() {
    let proxy = DynamicProxy::new(
        counting_resolver(),
        FakeBackend::failing(Status::unimplemented("gone")),
    );
    proxy.describe("test.kv.KeyValue", "Scan").await.unwrap();

    let err = proxy
        .call("test.kv.KeyValue", "Get", b"{}")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Remote {
            code: tonic::Code::Unimplemented,
            ..
        }
    ));
    assert!(proxy.cache().get("test.kv.KeyValue", "Get").is_none());
    assert!(proxy.cache().get("test.kv.KeyValue", "Scan").is_some());
}

#[tokio::test]
async fn remote_status_is_reported_verbatim() {
    let proxy = DynamicProxy::new(
        counting_resolver(),
        FakeBackend::failing(Status::not_found("no such key")),
    );
    let err = proxy
        .call("test.kv.KeyValue", "Get", b"{}")
        .await
        .unwrap_err();
    match err {
        ProxyError::Remote { code, message } => {
            assert_eq!(code, tonic::Code::NotFound);
            assert_eq!(message, "no such key");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(proxy.cache().len(), 1);
}

#[tokio::test]
async fn undecodable_response_is_a_conversion_error() {
    struct Garbage;

    #[async_trait]
    impl Invoker for Garbage {
        async fn invoke(
            &self,
            _descriptor: &InvocationDescriptor,
            _request: DynamicMessage,
            _meta: CallMetadata,
        ) -> Result<Bytes, Status> {
            Ok(Bytes::from_static(&[0xff, 0xff, 0xff]))
        }
    }

    let proxy = DynamicProxy::new(Arc::new(StaticResolver::new(kv_pool())), Arc::new(Garbage));
    let err = proxy
        .call("test.kv.KeyValue", "Get", b"{}")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::InternalConversionError(_)));
}

#[tokio::test]
async fn unreachable_backend_is_reported_as_unavailable() {
    let cfg = GrpcClientConfig::default().lazy();
    let channel = connect_channel("http://127.0.0.1:1", &cfg).await.unwrap();
    let proxy = DynamicProxy::for_channel(channel, OutboundInterceptor::new("tests"));

    let err = proxy
        .call("test.kv.KeyValue", "Get", br#"{"key":"foo"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::BackendUnavailable(_)), "{err}");
}
