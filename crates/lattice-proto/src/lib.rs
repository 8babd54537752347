//! Lattice Proto - Wire format, protocol schema, and serialization core
//!
//! This crate contains everything below the socket: pooled chunk
//! framing, primitive readers/writers, the self-describing protocol
//! schema, the dynamic value model, the per-message graph context, and
//! the generated serializer tables. It has no networking code; the rpc
//! crate drives it over real connections.

pub mod chunk;
pub mod config;
pub mod error;
pub mod graph;
pub mod reader;
pub mod schema;
pub mod serializer;
pub mod types;
pub mod value;
pub mod writer;

pub use chunk::{ChunkHeader, ChunkPool, PooledChunk, CHUNK_HEADER_SIZE, KEEP_ALIVE_MESSAGE_ID};
pub use config::{ClientConfig, Config, ConfigError, HostConfig, TlsMode, TransportConfig};
pub use error::{DbError, DbErrorKind, RequestKind, ResponseKind, ValidationError, WireError};
pub use graph::{GraphContext, GraphScope, ABSOLUTE_MAX_GRAPH_DEPTH};
pub use reader::MessageReader;
pub use schema::{
    compare_descriptors, decode_descriptor, encode_descriptor, CompareResult, GraphSupport,
    MismatchDetail, OperationKind, ProtocolDescriptor, SchemaBuilder, SchemaLimits, TypeExpr,
    MAX_REQUEST_ARGUMENTS,
};
pub use serializer::{ResponseBody, SerializerSet};
pub use types::{BuiltInKind, DateTime, Decimal, Guid, TimeSpan};
pub use value::{ObjRef, ObjectInstance, Value};
pub use writer::MessageWriter;

/// Current wire format version, the first field of every request frame.
/// A peer speaking a different version is disconnected at dispatch.
pub const FORMAT_VERSION: u16 = 1;
