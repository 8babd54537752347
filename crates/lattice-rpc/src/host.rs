//! API host
//!
//! Owns the service registry, accepts connections, and demultiplexes
//! inbound messages: Connect handshakes bind a connection to a service,
//! Operation frames are decoded and routed to the registered
//! implementation, and every outcome is answered with a typed response
//! frame. Messages on one connection dispatch concurrently on the shared
//! runtime; ordering between them is deliberately not preserved.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lattice_proto::serializer::{
    db_error_to_value, protocol_mismatch_value, service_unknown_value, unknown_error_value,
};
use lattice_proto::{
    compare_descriptors, decode_descriptor, encode_descriptor, ChunkPool, CompareResult,
    HostConfig, MessageReader, RequestKind, ResponseKind, SchemaBuilder, SerializerSet, TlsMode,
    ValidationError, WireError, FORMAT_VERSION,
};

use crate::clock::{system_clock, Clock};
use crate::connection::{CommError, Connection, MessageHandler};
use crate::listener::bind_listener;
use crate::pending::{PendingRequest, RespondError};
use crate::service::{OperationContext, OperationFault, Service, ServiceDefinition};
use crate::validation::{validate_definition, ValidationOptions};

/// Host lifecycle events.
#[derive(Clone, Debug)]
pub enum HostEvent {
    ConnectionOpened { conn_id: u64, peer: SocketAddr },
    ConnectionClosed { conn_id: u64, peer: SocketAddr },
    ServiceBound { conn_id: u64, service: String },
}

/// Faults raised while starting or running the host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("tls mode '{0}' requires an external terminator on the transport seam")]
    TlsUnsupported(&'static str),
}

/// Why a dispatch attempt was abandoned.
enum DispatchAbort {
    /// Malformed frame: answer `ProtocolError`, then drop the peer.
    Protocol(&'static str),
    /// Frame speaks a different wire format: drop the peer silently.
    Version(u16),
    /// The peer went away while we were answering.
    Comm(CommError),
}

impl From<WireError> for DispatchAbort {
    fn from(e: WireError) -> DispatchAbort {
        debug!(error = %e, "frame decode failed");
        DispatchAbort::Protocol("frame decode failed")
    }
}

impl From<RespondError> for DispatchAbort {
    fn from(e: RespondError) -> DispatchAbort {
        match e {
            RespondError::Comm(e) => DispatchAbort::Comm(e),
            RespondError::Wire(e) => e.into(),
        }
    }
}

/// The host: service registry, listeners, and live connections.
pub struct ApiHost {
    config: HostConfig,
    validation: ValidationOptions,
    clock: Arc<dyn Clock>,
    pool: Arc<ChunkPool>,
    /// Readers are dispatchers; the writer is service install/remove.
    services: RwLock<HashMap<String, Arc<Service>>>,
    /// Tables for typed errors sent before any service is bound.
    core_serializers: Arc<SerializerSet>,
    connections: DashMap<u64, Arc<Connection>>,
    conn_semaphore: Arc<Semaphore>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    events: broadcast::Sender<HostEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl ApiHost {
    pub fn new(config: HostConfig) -> Arc<ApiHost> {
        ApiHost::with_options(config, ValidationOptions::default(), system_clock())
    }

    pub fn with_options(
        config: HostConfig,
        validation: ValidationOptions,
        clock: Arc<dyn Clock>,
    ) -> Arc<ApiHost> {
        let pool = ChunkPool::new(config.transport.chunk_pool_size, config.transport.chunk_size)
            .expect("transport config validated");
        let core_descriptor = SchemaBuilder::new()
            .finish()
            .expect("core schema always builds");
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(ApiHost {
            conn_semaphore: Arc::new(Semaphore::new(config.max_open_conn_count)),
            config,
            validation,
            clock,
            pool,
            services: RwLock::new(HashMap::new()),
            core_serializers: Arc::new(SerializerSet::new(Arc::new(core_descriptor))),
            connections: DashMap::new(),
            listener_tasks: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
            events,
            shutdown_tx,
        })
    }

    /// Subscribe to host lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Addresses actually bound (resolves port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    // --- Service registry ---

    /// Validate and install a service under its unique name.
    ///
    /// Replacement semantics (see [`ApiHost::replace_service`]): when a
    /// service is replaced, operations already executing against the old
    /// registration run to completion and their responses are delivered;
    /// only new requests see the replacement.
    pub fn host_service(&self, definition: ServiceDefinition) -> Result<(), ValidationError> {
        validate_definition(&definition, &self.validation)?;
        let name = definition.name().to_owned();
        let service = Arc::new(definition.build()?);
        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(ValidationError::DuplicateServiceName(name));
        }
        info!(service = %name, "hosting service");
        services.insert(name, service);
        Ok(())
    }

    /// Atomically substitute a service registration and stop the old
    /// one. Connections bound to the old registration keep delivering
    /// responses for operations already in flight, then observe
    /// `ServiceUnavailable` until they reconnect.
    pub fn replace_service(&self, definition: ServiceDefinition) -> Result<(), ValidationError> {
        validate_definition(&definition, &self.validation)?;
        let name = definition.name().to_owned();
        let service = Arc::new(definition.build()?);
        let old = {
            let mut services = self.services.write();
            services.insert(name.clone(), service)
        };
        if let Some(old) = old {
            old.stop();
            info!(service = %name, "replaced service; old registration stopped");
        }
        Ok(())
    }

    /// Stop dispatching operations for a service; Connect and in-flight
    /// responses still work.
    pub fn stop_service(&self, name: &str) -> bool {
        match self.services.read().get(name) {
            Some(service) => {
                service.stop();
                info!(service = %name, "service stopped");
                true
            }
            None => false,
        }
    }

    /// Resume dispatching for a stopped service, without any reconnect.
    pub fn start_service(&self, name: &str) -> bool {
        match self.services.read().get(name) {
            Some(service) => {
                service.start();
                info!(service = %name, "service started");
                true
            }
            None => false,
        }
    }

    /// Remove a service entirely; it stops first.
    pub fn remove_service(&self, name: &str) -> bool {
        let removed = self.services.write().remove(name);
        match removed {
            Some(service) => {
                service.stop();
                true
            }
            None => false,
        }
    }

    // --- Listener ---

    /// Bind every configured endpoint and start accepting. Returns the
    /// bound addresses.
    pub async fn bind(self: &Arc<Self>) -> Result<Vec<SocketAddr>, HostError> {
        match &self.config.tls {
            TlsMode::Off => {}
            TlsMode::Mutual { .. } => return Err(HostError::TlsUnsupported("mutual")),
            TlsMode::SniMap { .. } => return Err(HostError::TlsUnsupported("sni-map")),
        }

        let mut addrs = Vec::new();
        for endpoint in &self.config.endpoints {
            let listener = bind_listener(*endpoint, self.config.backlog_size)
                .map_err(|source| HostError::Bind { addr: *endpoint, source })?;
            let addr = listener.local_addr().map_err(|source| HostError::Bind {
                addr: *endpoint,
                source,
            })?;
            info!(%addr, "listening");
            addrs.push(addr);
            let task = tokio::spawn(ApiHost::accept_loop(Arc::clone(self), listener));
            self.listener_tasks.lock().push(task);
        }
        *self.local_addrs.lock() = addrs.clone();
        Ok(addrs)
    }

    async fn accept_loop(host: Arc<ApiHost>, listener: tokio::net::TcpListener) {
        let mut shutdown_rx = host.shutdown_tx.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_rx.changed() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    match Arc::clone(&host.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => host.admit(stream, peer, permit),
                        Err(_) => {
                            warn!(%peer, "connection limit reached, refusing");
                            drop(stream);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
        debug!("accept loop exited");
    }

    fn admit(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        let _ = stream.set_nodelay(true);
        let conn = Connection::spawn(
            stream,
            peer,
            Arc::clone(&self.pool),
            self.config.transport.clone(),
            Arc::clone(&self.clock),
            self.message_handler(),
        );
        debug!(conn = conn.id(), %peer, "connection admitted");
        self.connections.insert(conn.id(), Arc::clone(&conn));
        let _ = self.events.send(HostEvent::ConnectionOpened { conn_id: conn.id(), peer });

        // Janitor: drop the registry entry and the permit on close.
        let host = Arc::clone(self);
        tokio::spawn(async move {
            conn.wait_closed().await;
            host.connections.remove(&conn.id());
            let _ = host
                .events
                .send(HostEvent::ConnectionClosed { conn_id: conn.id(), peer });
            drop(permit);
        });
    }

    /// Stop the listeners and close every live connection, failing their
    /// pending requests with a communication error.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let conns: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in conns {
            conn.close(CommError::Closed("host shutting down".into()));
        }
        let tasks = std::mem::take(&mut *self.listener_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("host shut down");
    }

    // --- Dispatch ---

    fn message_handler(self: &Arc<Self>) -> MessageHandler {
        let host = Arc::downgrade(self);
        Arc::new(move |conn, request_id, reader| {
            let Some(host) = host.upgrade() else {
                conn.close(CommError::Closed("host is gone".into()));
                return;
            };
            // Each message dispatches on the shared pool; messages on
            // one connection may complete out of order.
            tokio::spawn(async move {
                host.dispatch(conn, request_id, reader).await;
            });
        })
    }

    async fn dispatch(self: Arc<Self>, conn: Arc<Connection>, request_id: u64, mut reader: MessageReader) {
        match self.dispatch_inner(&conn, request_id, &mut reader).await {
            Ok(()) => {}
            Err(DispatchAbort::Protocol(why)) => {
                warn!(conn = conn.id(), request_id, why, "protocol fault");
                let pending = PendingRequest::new(
                    Arc::clone(&conn),
                    request_id,
                    Arc::clone(&self.core_serializers),
                    0,
                    0,
                );
                let _ = pending.respond_status(ResponseKind::ProtocolError).await;
                conn.close(CommError::Closed(format!("protocol fault: {why}")));
            }
            Err(DispatchAbort::Version(version)) => {
                warn!(conn = conn.id(), version, "format version mismatch");
                conn.close(CommError::Closed("format version mismatch".into()));
            }
            Err(DispatchAbort::Comm(e)) => {
                debug!(conn = conn.id(), error = %e, "response could not be delivered");
            }
        }
    }

    async fn dispatch_inner(
        &self,
        conn: &Arc<Connection>,
        request_id: u64,
        reader: &mut MessageReader,
    ) -> Result<(), DispatchAbort> {
        let version = reader.read_u16()?;
        if version != FORMAT_VERSION {
            return Err(DispatchAbort::Version(version));
        }
        let kind_tag = reader.read_u8()?;
        match RequestKind::from_tag(kind_tag) {
            Some(RequestKind::Connect) => self.handle_connect(conn, request_id, reader).await,
            Some(RequestKind::Operation) => self.handle_operation(conn, request_id, reader).await,
            None => Err(DispatchAbort::Protocol("unknown request kind")),
        }
    }

    async fn handle_connect(
        &self,
        conn: &Arc<Connection>,
        request_id: u64,
        reader: &mut MessageReader,
    ) -> Result<(), DispatchAbort> {
        let service_name = reader
            .read_string()?
            .ok_or(DispatchAbort::Protocol("null service name"))?;
        let client_descriptor = decode_descriptor(reader)?;

        let service = self.services.read().get(&service_name).cloned();
        let Some(service) = service else {
            info!(conn = conn.id(), service = %service_name, "connect to unknown service");
            let (type_id, value) = service_unknown_value(&service_name);
            self.pending_core(conn, request_id)
                .respond_error(type_id, &value)
                .await?;
            return Ok(());
        };

        // Identical version stamps mean identical descriptors; only
        // differing stamps need the structural walk.
        let descriptor = service.descriptor();
        if client_descriptor.version != descriptor.version {
            if let CompareResult::Mismatch(detail) =
                compare_descriptors(&client_descriptor, descriptor)
            {
                info!(
                    conn = conn.id(),
                    service = %service_name,
                    operation = %detail.operation_path(),
                    reason = %detail.reason,
                    "descriptor mismatch on connect"
                );
                let (type_id, value) =
                    protocol_mismatch_value(&detail.operation_path(), &detail.reason);
                self.pending_core(conn, request_id)
                    .respond_error(type_id, &value)
                    .await?;
                return Ok(());
            }
        }

        conn.set_tag(Arc::clone(&service) as Arc<dyn std::any::Any + Send + Sync>);
        conn.mark_open();
        info!(conn = conn.id(), service = %service_name, "connection bound to service");
        let _ = self.events.send(HostEvent::ServiceBound {
            conn_id: conn.id(),
            service: service_name,
        });

        let descriptor = Arc::clone(descriptor);
        conn.send_response(request_id, move |w| {
            w.write_u8(ResponseKind::Response as u8);
            encode_descriptor(w, &descriptor);
            Ok(())
        })
        .await
        .map_err(DispatchAbort::Comm)?;
        Ok(())
    }

    async fn handle_operation(
        &self,
        conn: &Arc<Connection>,
        request_id: u64,
        reader: &mut MessageReader,
    ) -> Result<(), DispatchAbort> {
        let Some(tag) = conn.tag() else {
            return Err(DispatchAbort::Protocol("operation before connect"));
        };
        let Ok(service) = tag.downcast::<Service>() else {
            return Err(DispatchAbort::Protocol("connection tag is not a service"));
        };

        let interface_id = reader.read_u16()?;
        let operation_id = reader.read_u16()?;
        let pending = PendingRequest::new(
            Arc::clone(conn),
            request_id,
            Arc::clone(service.serializers()),
            interface_id,
            operation_id,
        );

        if service.is_stopped() {
            pending.respond_status(ResponseKind::ServiceUnavailable).await?;
            return Ok(());
        }

        let descriptor = service.descriptor();
        let Some(op) = descriptor.operation(interface_id, operation_id) else {
            return Err(DispatchAbort::Protocol("unknown interface or operation id"));
        };
        let args = service.serializers().decode_request_args(reader, op)?;
        let Some(handler) = service.invoker(interface_id, operation_id) else {
            return Err(DispatchAbort::Protocol("no invoker for operation"));
        };

        let ctx = OperationContext {
            connection: Arc::clone(conn),
            request_id,
            service_name: Arc::clone(service.name()),
        };
        // The implementation is a black box; it may suspend freely.
        let result = handler(ctx, args).await;

        match result {
            Ok(value) => match pending.respond_value(&value).await {
                Ok(()) => Ok(()),
                Err(RespondError::Wire(e)) => {
                    // The implementation returned a value that does not
                    // fit the declared return type. Nothing was sent yet;
                    // fall back to a typed unknown error.
                    error!(
                        conn = conn.id(),
                        request_id,
                        error = %e,
                        "return value failed to serialize"
                    );
                    let (type_id, payload) = unknown_error_value("operation result not serializable");
                    self.pending_for(conn, request_id, &service, interface_id, operation_id)
                        .respond_error(type_id, &payload)
                        .await?;
                    Ok(())
                }
                Err(RespondError::Comm(e)) => Err(DispatchAbort::Comm(e)),
            },
            Err(OperationFault::Db(db)) => {
                debug!(conn = conn.id(), request_id, fault = %db, "operation fault");
                let (type_id, payload) = db_error_to_value(&db);
                pending.respond_error(type_id, &payload).await?;
                Ok(())
            }
            Err(OperationFault::Typed(value)) => {
                let concrete = value.as_object().map(|o| o.read().type_id);
                let declared = concrete.map_or(false, |tid| {
                    descriptor.derives_error_base(tid)
                        && op.error_types.iter().any(|&e| descriptor.is_assignable(tid, e))
                });
                if let (true, Some(type_id)) = (declared, concrete) {
                    pending.respond_error(type_id, &value).await?;
                } else {
                    // Undeclared faults are logged host-side only and
                    // cross the wire as the unknown kind.
                    error!(
                        conn = conn.id(),
                        request_id,
                        type_id = ?concrete,
                        "undeclared fault raised by operation"
                    );
                    let (type_id, payload) = unknown_error_value("operation raised an undeclared fault");
                    pending.respond_error(type_id, &payload).await?;
                }
                Ok(())
            }
        }
    }

    fn pending_core(&self, conn: &Arc<Connection>, request_id: u64) -> PendingRequest {
        PendingRequest::new(
            Arc::clone(conn),
            request_id,
            Arc::clone(&self.core_serializers),
            0,
            0,
        )
    }

    fn pending_for(
        &self,
        conn: &Arc<Connection>,
        request_id: u64,
        service: &Arc<Service>,
        interface_id: u16,
        operation_id: u16,
    ) -> PendingRequest {
        PendingRequest::new(
            Arc::clone(conn),
            request_id,
            Arc::clone(service.serializers()),
            interface_id,
            operation_id,
        )
    }
}

impl std::fmt::Debug for ApiHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiHost")
            .field("services", &self.services.read().len())
            .field("connections", &self.connections.len())
            .finish()
    }
}
