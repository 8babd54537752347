//! Lattice RPC - Framed connection transport, API host, and client
//!
//! Everything that touches a socket lives here: the chunked full-duplex
//! connection with its background tasks, the listener, the host that
//! validates and dispatches services, and the client factory with its
//! dynamic call surface. The wire format, schema, and serializers come
//! from `lattice-proto`.

pub mod client;
pub mod clock;
pub mod connection;
pub mod host;
pub mod listener;
pub mod pending;
pub mod service;
pub mod validation;

pub use client::{ClientError, ServiceClient};
pub use clock::{system_clock, Clock, SystemClock};
pub use connection::{
    CommError, Connection, ConnectionState, MessageHandler, ResponseFuture, Transport,
};
pub use host::{ApiHost, HostError, HostEvent};
pub use listener::bind_listener;
pub use pending::{PendingRequest, RespondError};
pub use service::{
    OperationContext, OperationFault, OperationHandler, OperationImpl, OperationResult, Service,
    ServiceDefinition,
};
pub use validation::{validate_definition, ValidationOptions};
