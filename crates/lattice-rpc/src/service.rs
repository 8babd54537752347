//! Service definition and installed services
//!
//! A `ServiceDefinition` couples a schema declaration with the async
//! implementations of its operations. Hosting turns it into an installed
//! `Service`: immutable descriptor, generated serializer tables, and a
//! dense invoker table per interface. A stopped service keeps its
//! registration but answers every operation with `ServiceUnavailable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use lattice_proto::schema::{ClassDecl, InterfaceDecl};
use lattice_proto::{
    DbError, ProtocolDescriptor, SchemaBuilder, SerializerSet, ValidationError, Value,
};

use crate::connection::Connection;

/// Per-invocation context handed to every operation implementation.
pub struct OperationContext {
    pub connection: Arc<Connection>,
    pub request_id: u64,
    pub service_name: Arc<str>,
}

/// Fault returned by an operation implementation.
#[derive(Debug)]
pub enum OperationFault {
    /// Engine fault, forwarded verbatim with its core wire type.
    Db(DbError),
    /// Instance of a declared error class (its concrete type id is
    /// carried by the object itself).
    Typed(Value),
}

impl From<DbError> for OperationFault {
    fn from(err: DbError) -> OperationFault {
        OperationFault::Db(err)
    }
}

pub type OperationResult = Result<Value, OperationFault>;

/// Boxed async operation implementation.
pub type OperationHandler =
    Arc<dyn Fn(OperationContext, Vec<Value>) -> BoxFuture<'static, OperationResult> + Send + Sync>;

/// Trait form of an operation implementation, for implementations that
/// carry state (an engine handle, a transaction manager).
#[async_trait::async_trait]
pub trait OperationImpl: Send + Sync + 'static {
    async fn invoke(&self, ctx: OperationContext, args: Vec<Value>) -> OperationResult;
}

/// A named API under definition: schema plus implementations.
pub struct ServiceDefinition {
    name: String,
    schema: SchemaBuilder,
    handlers: HashMap<(String, String), OperationHandler>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> ServiceDefinition {
        ServiceDefinition {
            name: name.into(),
            schema: SchemaBuilder::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a class in the service schema.
    pub fn class(&mut self, name: impl Into<String>) -> &mut ClassDecl {
        self.schema.class(name)
    }

    /// Declare an interface in the service schema.
    pub fn interface(&mut self, name: impl Into<String>) -> &mut InterfaceDecl {
        self.schema.interface(name)
    }

    /// Register the implementation of one declared operation.
    pub fn handle<F, Fut>(
        &mut self,
        interface: impl Into<String>,
        operation: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(OperationContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = OperationResult> + Send + 'static,
    {
        let boxed: OperationHandler = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.handlers.insert((interface.into(), operation.into()), boxed);
        self
    }

    /// Register a trait-object implementation for one operation.
    pub fn handle_impl(
        &mut self,
        interface: impl Into<String>,
        operation: impl Into<String>,
        implementation: Arc<dyn OperationImpl>,
    ) -> &mut Self {
        let boxed: OperationHandler = Arc::new(move |ctx, args| {
            let implementation = Arc::clone(&implementation);
            async move { implementation.invoke(ctx, args).await }.boxed()
        });
        self.handlers.insert((interface.into(), operation.into()), boxed);
        self
    }

    pub(crate) fn schema(&self) -> &SchemaBuilder {
        &self.schema
    }

    pub(crate) fn handler(&self, interface: &str, operation: &str) -> Option<&OperationHandler> {
        self.handlers
            .get(&(interface.to_owned(), operation.to_owned()))
    }

    /// Build the installed service: discover the schema, generate the
    /// serializer tables, and wire the invoker table. Shape validation
    /// is the host's job and runs before this.
    pub(crate) fn build(self) -> Result<Service, ValidationError> {
        let name: Arc<str> = self.name.into();
        let descriptor = Arc::new(self.schema.finish()?);
        let serializers = Arc::new(SerializerSet::new(Arc::clone(&descriptor)));

        let mut interfaces = Vec::with_capacity(descriptor.interfaces.len());
        for interface in &descriptor.interfaces {
            let mut operations = Vec::with_capacity(interface.operations.len());
            for op in &interface.operations {
                let handler = self
                    .handlers
                    .get(&(interface.name.clone(), op.name.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        ValidationError::MissingOperationImpl(format!(
                            "{}.{}",
                            interface.name, op.name
                        ))
                    })?;
                operations.push(handler);
            }
            interfaces.push(InterfaceDispatch { operations });
        }

        Ok(Service {
            name,
            descriptor,
            serializers,
            interfaces,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Dense invoker table of one interface.
struct InterfaceDispatch {
    operations: Vec<OperationHandler>,
}

/// An installed, running (or stopped) service.
pub struct Service {
    name: Arc<str>,
    descriptor: Arc<ProtocolDescriptor>,
    serializers: Arc<SerializerSet>,
    interfaces: Vec<InterfaceDispatch>,
    stopped: AtomicBool,
}

impl Service {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn descriptor(&self) -> &Arc<ProtocolDescriptor> {
        &self.descriptor
    }

    pub fn serializers(&self) -> &Arc<SerializerSet> {
        &self.serializers
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Look up the implementation of `(interfaceId, operationId)`.
    pub fn invoker(&self, interface_id: u16, operation_id: u16) -> Option<&OperationHandler> {
        self.interfaces
            .get(interface_id as usize)?
            .operations
            .get(operation_id as usize)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
