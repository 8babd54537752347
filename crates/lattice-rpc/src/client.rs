//! Client factory and dynamic call surface
//!
//! `ServiceClient::connect` dials the host, performs the Connect
//! handshake (shipping the client's own descriptor for comparison), and
//! builds serializer tables from the descriptor the host returns, so
//! interface and operation ids are always the host's. Calls are dynamic:
//! arguments and results travel as [`Value`]s, addressed by interface
//! and operation name.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use lattice_proto::serializer::{error_summary, value_to_db_error};
use lattice_proto::schema::{
    TYPE_ID_PROTOCOL_MISMATCH_ERROR, TYPE_ID_SERVICE_UNKNOWN_ERROR,
};
use lattice_proto::{
    compare_descriptors, decode_descriptor, encode_descriptor, ChunkPool, ClientConfig,
    CompareResult, DbError, ProtocolDescriptor, RequestKind, ResponseBody, ResponseKind,
    SchemaBuilder, SerializerSet, TlsMode, Value, WireError, FORMAT_VERSION,
};

use crate::clock::{system_clock, Clock};
use crate::connection::{CommError, Connection, MessageHandler};

/// Client-side faults.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("connect timed out")]
    Timeout,

    #[error("tls mode requires an external terminator on the transport seam")]
    TlsUnsupported,

    #[error("descriptor mismatch at {operation}: {reason}")]
    ProtocolMismatch { operation: String, reason: String },

    #[error("no service named '{0}' on the host")]
    ServiceUnknown(String),

    #[error("connect rejected: {0}")]
    Rejected(String),

    #[error("unknown interface or operation: {0}")]
    UnknownOperation(String),

    #[error("service is stopped")]
    ServiceUnavailable,

    #[error("host reported a protocol error")]
    ProtocolError,

    #[error("operation fault: {message}")]
    Fault {
        type_id: u16,
        message: String,
        retryable: bool,
        value: Value,
    },
}

impl ClientError {
    /// The engine fault behind this error, when there is one.
    pub fn as_db_error(&self) -> Option<DbError> {
        match self {
            ClientError::Fault { type_id, value, .. } => value_to_db_error(*type_id, value),
            _ => None,
        }
    }

    /// Whether retrying the operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Fault { retryable: true, .. })
    }
}

/// A connection bound to one hosted service.
pub struct ServiceClient {
    conn: Arc<Connection>,
    serializers: Arc<SerializerSet>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("conn_id", &self.conn.id())
            .finish()
    }
}

impl ServiceClient {
    /// Dial the configured endpoint and bind to `service_name`. The
    /// `local` descriptor is what this client was compiled against; the
    /// host verifies compatibility before answering with its own.
    pub async fn connect(
        config: &ClientConfig,
        service_name: &str,
        local: &ProtocolDescriptor,
    ) -> Result<ServiceClient, ClientError> {
        ServiceClient::connect_with_clock(config, service_name, local, system_clock()).await
    }

    pub async fn connect_with_clock(
        config: &ClientConfig,
        service_name: &str,
        local: &ProtocolDescriptor,
        clock: Arc<dyn Clock>,
    ) -> Result<ServiceClient, ClientError> {
        if config.tls != TlsMode::Off {
            return Err(ClientError::TlsUnsupported);
        }

        let stream = timeout(config.connect_timeout(), TcpStream::connect(config.endpoint))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Io(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let peer = stream
            .peer_addr()
            .map_err(|e| ClientError::Io(e.to_string()))?;

        let pool = ChunkPool::new(
            config.transport.chunk_pool_size,
            config.transport.chunk_size,
        )?;
        let conn = Connection::spawn(
            stream,
            peer,
            pool,
            config.transport.clone(),
            clock,
            unsolicited_handler(),
        );

        let service = service_name.to_owned();
        let local_version = local.version;
        let (_, response) = conn
            .send_request(|w| {
                w.write_u16(FORMAT_VERSION);
                w.write_u8(RequestKind::Connect as u8);
                w.write_string(Some(&service));
                encode_descriptor(w, local);
                Ok(())
            })
            .await?;

        let mut reader = timeout(config.connect_timeout(), response)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| CommError::Closed("connection dropped during connect".into()))??;

        let tag = reader.read_u8()?;
        match ResponseKind::from_tag(tag) {
            Some(ResponseKind::Response) => {
                let remote = decode_descriptor(&mut reader)?;
                let version_match = remote.version == local_version;
                if !version_match || !config.accept_by_version {
                    if let CompareResult::Mismatch(detail) = compare_descriptors(local, &remote) {
                        conn.close(CommError::Closed("descriptor mismatch".into()));
                        return Err(ClientError::ProtocolMismatch {
                            operation: detail.operation_path(),
                            reason: detail.reason,
                        });
                    }
                }
                conn.mark_open();
                info!(service = %service, peer = %peer, "connected");
                // Tables are generated from the host descriptor: its ids
                // are the ones that travel.
                let serializers = Arc::new(SerializerSet::new(Arc::new(remote)));
                Ok(ServiceClient { conn, serializers })
            }
            Some(ResponseKind::Error) => {
                let core = core_serializers();
                let (type_id, value) = core.decode_error_body(&mut reader)?;
                conn.close(CommError::Closed("connect rejected".into()));
                Err(connect_rejection(type_id, value))
            }
            Some(ResponseKind::ServiceUnavailable) => {
                conn.close(CommError::Closed("service unavailable".into()));
                Err(ClientError::ServiceUnavailable)
            }
            _ => {
                conn.close(CommError::Closed("protocol error during connect".into()));
                Err(ClientError::ProtocolError)
            }
        }
    }

    pub fn descriptor(&self) -> &Arc<ProtocolDescriptor> {
        self.serializers.descriptor()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Invoke an operation by interface and operation name.
    pub async fn invoke(
        &self,
        interface: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let descriptor = self.serializers.descriptor();
        let iface = descriptor
            .interface_by_name(interface)
            .ok_or_else(|| ClientError::UnknownOperation(interface.to_owned()))?;
        let op = iface
            .operations
            .iter()
            .find(|o| o.name == operation)
            .ok_or_else(|| ClientError::UnknownOperation(format!("{interface}.{operation}")))?;
        self.invoke_by_id(iface.id, op.id, args).await
    }

    /// Invoke an operation by its dense ids.
    pub async fn invoke_by_id(
        &self,
        interface_id: u16,
        operation_id: u16,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let serializers = Arc::clone(&self.serializers);
        let (request_id, response) = self
            .conn
            .send_request(|w| serializers.encode_request(w, interface_id, operation_id, &args))
            .await?;
        debug!(request_id, interface_id, operation_id, "request sent");

        let mut reader = response
            .await
            .map_err(|_| CommError::Closed("connection dropped".into()))??;
        let op = self
            .serializers
            .descriptor()
            .operation(interface_id, operation_id)
            .ok_or(WireError::CorruptMessage("operation vanished from descriptor"))?;

        match self.serializers.decode_response(&mut reader, op)? {
            ResponseBody::Value(value) => Ok(value),
            ResponseBody::Error { type_id, value } => {
                let (message, retryable) = error_summary(&value)
                    .unwrap_or_else(|| ("malformed error payload".to_owned(), false));
                Err(ClientError::Fault {
                    type_id,
                    message,
                    retryable,
                    value,
                })
            }
            ResponseBody::ServiceUnavailable => Err(ClientError::ServiceUnavailable),
            ResponseBody::ProtocolError => Err(ClientError::ProtocolError),
        }
    }

    /// Close the connection; every outstanding request fails with a
    /// communication error.
    pub fn close(&self) {
        self.conn.close(CommError::Closed("client closed".into()));
    }
}

fn unsolicited_handler() -> MessageHandler {
    Arc::new(|conn, request_id, _reader| {
        warn!(conn = conn.id(), request_id, "unsolicited message from host, dropping");
    })
}

fn core_serializers() -> SerializerSet {
    let descriptor = SchemaBuilder::new()
        .finish()
        .expect("core schema always builds");
    SerializerSet::new(Arc::new(descriptor))
}

/// Map a Connect-time error payload onto a client error.
pub(crate) fn connect_rejection(type_id: u16, value: Value) -> ClientError {
    let fields = value
        .as_object()
        .map(|obj| obj.read().fields.clone())
        .unwrap_or_default();
    let field_str = |i: usize| {
        fields
            .get(i)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned()
    };
    match type_id {
        // Flattened layout: [message, retryable, operation, reason]
        TYPE_ID_PROTOCOL_MISMATCH_ERROR => ClientError::ProtocolMismatch {
            operation: field_str(2),
            reason: field_str(3),
        },
        // Flattened layout: [message, retryable, service]
        TYPE_ID_SERVICE_UNKNOWN_ERROR => ClientError::ServiceUnknown(field_str(2)),
        _ => {
            let message = error_summary(&value)
                .map(|(m, _)| m)
                .unwrap_or_else(|| "unspecified".to_owned());
            ClientError::Rejected(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use lattice_proto::schema::FIRST_USER_TYPE_ID;
    use lattice_proto::{DbErrorKind, GraphSupport, HostConfig, TransportConfig, TypeExpr};

    use crate::host::ApiHost;
    use crate::service::{OperationFault, ServiceDefinition};

    const NODE_TYPE: u16 = FIRST_USER_TYPE_ID;

    fn test_transport() -> TransportConfig {
        TransportConfig {
            chunk_size: 64,
            chunk_pool_size: 512,
            max_queued_chunk_count: 128,
            inactivity_interval_secs: 30,
            inactivity_timeout_secs: 60,
        }
    }

    async fn start_host(definitions: Vec<ServiceDefinition>) -> (Arc<ApiHost>, SocketAddr) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
        let mut config = HostConfig::default();
        config.endpoints = vec!["127.0.0.1:0".parse().unwrap()];
        config.transport = test_transport();
        let host = ApiHost::new(config);
        for def in definitions {
            host.host_service(def).unwrap();
        }
        let addrs = host.bind().await.unwrap();
        (host, addrs[0])
    }

    fn client_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            endpoint: addr,
            transport: test_transport(),
            ..ClientConfig::default()
        }
    }

    fn echo_definition() -> ServiceDefinition {
        let mut def = ServiceDefinition::new("EchoService");
        def.interface("Echo")
            .operation("Echo")
            .param("text", TypeExpr::String)
            .returns(TypeExpr::String);
        def.handle("Echo", "Echo", |_ctx, mut args| async move { Ok(args.remove(0)) });
        def
    }

    fn echo_client_schema(return_type: TypeExpr) -> ProtocolDescriptor {
        let mut b = SchemaBuilder::new();
        b.interface("Echo")
            .operation("Echo")
            .param("text", TypeExpr::String)
            .returns(return_type);
        b.finish().unwrap()
    }

    fn graph_definition() -> ServiceDefinition {
        let mut def = ServiceDefinition::new("GraphService");
        def.class("Node")
            .field("value", TypeExpr::I32)
            .field("a", TypeExpr::class("Node"))
            .field("b", TypeExpr::class("Node"));
        def.interface("Graph")
            .operation("Identity")
            .param("root", TypeExpr::class("Node"))
            .returns(TypeExpr::class("Node"))
            .graph(GraphSupport::BOTH);
        def.handle("Graph", "Identity", |_ctx, mut args| async move { Ok(args.remove(0)) });
        def
    }

    fn graph_client_schema() -> ProtocolDescriptor {
        let mut b = SchemaBuilder::new();
        b.class("Node")
            .field("value", TypeExpr::I32)
            .field("a", TypeExpr::class("Node"))
            .field("b", TypeExpr::class("Node"));
        b.interface("Graph")
            .operation("Identity")
            .param("root", TypeExpr::class("Node"))
            .returns(TypeExpr::class("Node"))
            .graph(GraphSupport::BOTH);
        b.finish().unwrap()
    }

    fn node(value: i32) -> Value {
        Value::object(NODE_TYPE, vec![Value::I32(value), Value::Null, Value::Null])
    }

    fn set_field(target: &Value, index: usize, value: Value) {
        target.as_object().unwrap().write().fields[index] = value;
    }

    fn get_field(target: &Value, index: usize) -> Value {
        target.as_object().unwrap().read().fields[index].clone()
    }

    #[tokio::test]
    async fn test_connect_descriptor_mismatch() {
        let (host, addr) = start_host(vec![echo_definition()]).await;
        let local = echo_client_schema(TypeExpr::I32);

        let result = ServiceClient::connect(&client_config(addr), "EchoService", &local).await;
        match result {
            Err(ClientError::ProtocolMismatch { operation, reason }) => {
                assert_eq!(operation, "Echo.Echo");
                assert_eq!(reason, "returnType");
            }
            other => panic!("expected protocol mismatch, got {other:?}"),
        }
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_unknown_service() {
        let (host, addr) = start_host(vec![echo_definition()]).await;
        let local = echo_client_schema(TypeExpr::String);

        let result = ServiceClient::connect(&client_config(addr), "NoSuchService", &local).await;
        match result {
            Err(ClientError::ServiceUnknown(name)) => assert_eq!(name, "NoSuchService"),
            other => panic!("expected unknown service, got {other:?}"),
        }
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_echo_roundtrip_across_chunk_boundaries() {
        let (host, addr) = start_host(vec![echo_definition()]).await;
        let local = echo_client_schema(TypeExpr::String);
        let client = ServiceClient::connect(&client_config(addr), "EchoService", &local)
            .await
            .unwrap();

        // 200 chars at chunk size 64 spans several chunks each way.
        let long: String = std::iter::repeat('x').take(200).collect();
        let result = client
            .invoke("Echo", "Echo", vec![Value::Str(long.clone())])
            .await
            .unwrap();
        assert_eq!(result.as_str(), Some(long.as_str()));

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_preserves_shared_references() {
        let (host, addr) = start_host(vec![graph_definition()]).await;
        let client =
            ServiceClient::connect(&client_config(addr), "GraphService", &graph_client_schema())
                .await
                .unwrap();

        let shared = node(7);
        let root = node(1);
        set_field(&root, 1, shared.clone());
        set_field(&root, 2, shared);

        let result = client.invoke("Graph", "Identity", vec![root]).await.unwrap();
        let a = get_field(&result, 1);
        let b = get_field(&result, 2);
        assert_eq!(get_field(&a, 0).as_i32(), Some(7));
        assert!(a.same_ref(&b), "both slots must point at one decoded node");

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_preserves_cycles() {
        let (host, addr) = start_host(vec![graph_definition()]).await;
        let client =
            ServiceClient::connect(&client_config(addr), "GraphService", &graph_client_schema())
                .await
                .unwrap();

        let a = node(1);
        let b = node(2);
        set_field(&a, 1, b.clone());
        set_field(&b, 1, a.clone());

        let result = client.invoke("Graph", "Identity", vec![a]).await.unwrap();
        let result_b = get_field(&result, 1);
        let back = get_field(&result_b, 1);
        assert!(back.same_ref(&result), "a -> b -> a must survive the roundtrip");

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_complete_out_of_order() {
        let mut def = ServiceDefinition::new("MixedService");
        let iface = def.interface("Api");
        iface
            .operation("Slow")
            .param("text", TypeExpr::String)
            .returns(TypeExpr::String);
        iface
            .operation("Fast")
            .param("text", TypeExpr::String)
            .returns(TypeExpr::String);
        def.handle("Api", "Slow", |_ctx, mut args| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(args.remove(0))
        });
        def.handle("Api", "Fast", |_ctx, mut args| async move { Ok(args.remove(0)) });

        let mut b = SchemaBuilder::new();
        let iface = b.interface("Api");
        iface
            .operation("Slow")
            .param("text", TypeExpr::String)
            .returns(TypeExpr::String);
        iface
            .operation("Fast")
            .param("text", TypeExpr::String)
            .returns(TypeExpr::String);
        let local = b.finish().unwrap();

        let (host, addr) = start_host(vec![def]).await;
        let client = Arc::new(
            ServiceClient::connect(&client_config(addr), "MixedService", &local)
                .await
                .unwrap(),
        );

        let slow_client = Arc::clone(&client);
        let slow = tokio::spawn(async move {
            slow_client
                .invoke("Api", "Slow", vec![Value::Str("r1".into())])
                .await
        });
        // Give the slow request time to hit the wire first.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        let fast = client
            .invoke("Api", "Fast", vec![Value::Str("r2".into())])
            .await
            .unwrap();
        assert_eq!(fast.as_str(), Some("r2"));
        assert!(
            started.elapsed() < Duration::from_millis(300),
            "fast response must not wait for the slow one"
        );

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.as_str(), Some("r1"));

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_service_stop_and_start_without_reconnect() {
        let (host, addr) = start_host(vec![echo_definition()]).await;
        let local = echo_client_schema(TypeExpr::String);
        let client = ServiceClient::connect(&client_config(addr), "EchoService", &local)
            .await
            .unwrap();

        let ok = client
            .invoke("Echo", "Echo", vec![Value::Str("before".into())])
            .await
            .unwrap();
        assert_eq!(ok.as_str(), Some("before"));

        assert!(host.stop_service("EchoService"));
        let stopped = client
            .invoke("Echo", "Echo", vec![Value::Str("while stopped".into())])
            .await;
        assert!(matches!(stopped, Err(ClientError::ServiceUnavailable)));

        assert!(host.start_service("EchoService"));
        let restored = client
            .invoke("Echo", "Echo", vec![Value::Str("after".into())])
            .await
            .unwrap();
        assert_eq!(restored.as_str(), Some("after"));

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_fault_reaches_client_typed() {
        let mut def = ServiceDefinition::new("FaultService");
        def.interface("Api")
            .operation("Clash")
            .param("key", TypeExpr::String)
            .returns(TypeExpr::Bool)
            .error("ConflictError");
        def.handle("Api", "Clash", |_ctx, args| async move {
            let key = args[0].as_str().unwrap_or_default().to_owned();
            Err(OperationFault::Db(lattice_proto::DbError::conflict(format!(
                "conflict on {key}"
            ))))
        });

        let mut b = SchemaBuilder::new();
        b.interface("Api")
            .operation("Clash")
            .param("key", TypeExpr::String)
            .returns(TypeExpr::Bool)
            .error("ConflictError");
        let local = b.finish().unwrap();

        let (host, addr) = start_host(vec![def]).await;
        let client = ServiceClient::connect(&client_config(addr), "FaultService", &local)
            .await
            .unwrap();

        let result = client
            .invoke("Api", "Clash", vec![Value::Str("users/7".into())])
            .await;
        match result {
            Err(err @ ClientError::Fault { .. }) => {
                assert!(err.is_retryable());
                let db = err.as_db_error().unwrap();
                assert_eq!(db.kind, DbErrorKind::Conflict);
                assert_eq!(db.message, "conflict on users/7");
            }
            other => panic!("expected typed fault, got {other:?}"),
        }

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_undeclared_typed_fault_becomes_unknown() {
        let mut def = ServiceDefinition::new("LeakService");
        def.class("SecretError")
            .extends("DatabaseError")
            .field("internal", TypeExpr::String);
        def.interface("Api")
            .operation("Do")
            .param("x", TypeExpr::I32)
            .returns(TypeExpr::Bool);
        def.handle("Api", "Do", |_ctx, _args| async move {
            let secret = Value::object(
                NODE_TYPE, // SecretError is the first user class
                vec![
                    Value::Str("boom".into()),
                    Value::Bool(false),
                    Value::Str("stack details".into()),
                ],
            );
            Err(OperationFault::Typed(secret))
        });

        let mut b = SchemaBuilder::new();
        b.class("SecretError")
            .extends("DatabaseError")
            .field("internal", TypeExpr::String);
        b.interface("Api")
            .operation("Do")
            .param("x", TypeExpr::I32)
            .returns(TypeExpr::Bool);
        let local = b.finish().unwrap();

        let (host, addr) = start_host(vec![def]).await;
        let client = ServiceClient::connect(&client_config(addr), "LeakService", &local)
            .await
            .unwrap();

        // The class exists in the schema but is not declared on the
        // operation, so only the unknown kind crosses the wire.
        let result = client.invoke("Api", "Do", vec![Value::I32(1)]).await;
        match result {
            Err(ClientError::Fault { type_id, message, .. }) => {
                assert_eq!(
                    type_id,
                    lattice_proto::schema::TYPE_ID_UNKNOWN_ERROR
                );
                assert!(!message.contains("stack details"));
            }
            other => panic!("expected fault, got {other:?}"),
        }

        client.close();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_subset_descriptor_is_compatible() {
        // Host exposes two operations, client only knows one: structural
        // comparison tolerates the extra operation.
        let mut def = ServiceDefinition::new("WideService");
        let iface = def.interface("Api");
        iface
            .operation("Used")
            .param("x", TypeExpr::I32)
            .returns(TypeExpr::I32);
        iface
            .operation("Ignored")
            .param("y", TypeExpr::String)
            .returns(TypeExpr::String);
        def.handle("Api", "Used", |_ctx, mut args| async move { Ok(args.remove(0)) });
        def.handle("Api", "Ignored", |_ctx, mut args| async move { Ok(args.remove(0)) });

        let mut b = SchemaBuilder::new();
        b.interface("Api")
            .operation("Used")
            .param("x", TypeExpr::I32)
            .returns(TypeExpr::I32);
        let local = b.finish().unwrap();

        let (host, addr) = start_host(vec![def]).await;
        let client = ServiceClient::connect(&client_config(addr), "WideService", &local)
            .await
            .unwrap();
        let result = client.invoke("Api", "Used", vec![Value::I32(41)]).await.unwrap();
        assert_eq!(result.as_i32(), Some(41));

        client.close();
        host.shutdown().await;
    }
}
