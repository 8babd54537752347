//! Generated serializer/deserializer tables
//!
//! A `SerializerSet` is built once per service install from its
//! descriptor: per-class layouts are flattened and cached so the hot
//! encode/decode paths walk plain vectors instead of chasing the
//! inheritance tree. Dispatch is keyed by dense type id; the only
//! indirection left at runtime is the concrete-type tag on polymorphic
//! slots, mirroring how the original synthesized per-type fast paths.
//!
//! The object-graph algorithm lives here: preludes carry presence,
//! optional concrete tag, and instance id; bodies deeper than
//! `ABSOLUTE_MAX_GRAPH_DEPTH` are deferred onto the context's resume
//! queue and appended after the top-level value, symmetrically on both
//! sides of the wire.

use std::sync::Arc;

use crate::error::{DbError, RequestKind, ResponseKind, WireError};
use crate::graph::{GraphContext, GraphScope, ResumeItem, ABSOLUTE_MAX_GRAPH_DEPTH};
use crate::reader::MessageReader;
use crate::schema::{
    db_error_kind_for, db_error_type_id, ProtocolDescriptor, ProtocolOperation, ProtocolProperty,
    TypeDef, ERR_FIELD_MESSAGE, ERR_FIELD_RETRYABLE, TYPE_ID_PROTOCOL_MISMATCH_ERROR,
    TYPE_ID_SERVICE_UNKNOWN_ERROR, TYPE_ID_UNKNOWN_ERROR,
};
use crate::types::BuiltInKind;
use crate::value::{ObjectInstance, Value};
use crate::writer::MessageWriter;
use crate::FORMAT_VERSION;

const PRESENCE_NULL: u8 = 0;
const PRESENCE_BACKREF: u8 = 1;
const PRESENCE_NEW: u8 = 2;

/// Cached per-class encode/decode layout.
struct ClassLayout {
    /// Flattened properties: inherited first, own last.
    properties: Vec<ProtocolProperty>,
    is_abstract: bool,
    /// Whether slots declared as this class carry a concrete-type tag.
    polymorphic: bool,
}

/// Per-type codec entry, indexed by dense type id.
enum TypeCodec {
    BuiltIn(BuiltInKind),
    Class(ClassLayout),
    Array { element: u16 },
}

/// Decoded response payload.
#[derive(Debug)]
pub enum ResponseBody {
    Value(Value),
    Error { type_id: u16, value: Value },
    ServiceUnavailable,
    ProtocolError,
}

/// The encoder/decoder tables generated for one service schema.
pub struct SerializerSet {
    descriptor: Arc<ProtocolDescriptor>,
    codecs: Vec<TypeCodec>,
}

impl SerializerSet {
    /// Generate the tables. Cost is proportional to schema size; runs
    /// once at service install or connect.
    pub fn new(descriptor: Arc<ProtocolDescriptor>) -> SerializerSet {
        let codecs = descriptor
            .types
            .iter()
            .map(|ty| match &ty.def {
                TypeDef::BuiltIn(kind) => TypeCodec::BuiltIn(*kind),
                TypeDef::Class(class) => TypeCodec::Class(ClassLayout {
                    properties: descriptor.flattened_properties(ty.id),
                    is_abstract: class.is_abstract,
                    polymorphic: !class.descendants.is_empty(),
                }),
                TypeDef::Array { element } => TypeCodec::Array { element: *element },
            })
            .collect();
        SerializerSet { descriptor, codecs }
    }

    pub fn descriptor(&self) -> &Arc<ProtocolDescriptor> {
        &self.descriptor
    }

    fn codec(&self, type_id: u16) -> Result<&TypeCodec, WireError> {
        self.codecs
            .get(type_id as usize)
            .ok_or(WireError::UnknownTypeId(type_id))
    }

    fn layout(&self, type_id: u16) -> Result<&ClassLayout, WireError> {
        match self.codec(type_id)? {
            TypeCodec::Class(layout) => Ok(layout),
            _ => Err(WireError::UnknownTypeId(type_id)),
        }
    }

    // --- Request/response frames (operation table) ---

    /// Encode an operation request frame:
    /// `formatVersion | Operation | interfaceId | operationId | args`.
    pub fn encode_request(
        &self,
        w: &mut MessageWriter,
        interface_id: u16,
        operation_id: u16,
        args: &[Value],
    ) -> Result<(), WireError> {
        let op = self
            .descriptor
            .operation(interface_id, operation_id)
            .ok_or(WireError::CorruptMessage("unknown operation"))?;
        if args.len() != op.params.len() {
            return Err(WireError::ArgumentCountMismatch {
                expected: op.params.len(),
                actual: args.len(),
            });
        }

        w.write_u16(FORMAT_VERSION);
        w.write_u8(RequestKind::Operation as u8);
        w.write_u16(interface_id);
        w.write_u16(operation_id);

        let mut scope = GraphScope::acquire(op.graph.request);
        let ctx = scope.ctx();
        for (arg, param) in args.iter().zip(&op.params) {
            self.encode_value(w, ctx, arg, param.type_id, 0)?;
        }
        self.drain_encode(w, ctx)
    }

    /// Decode the argument list of an operation request. The caller has
    /// already consumed the frame header.
    pub fn decode_request_args(
        &self,
        r: &mut MessageReader,
        op: &ProtocolOperation,
    ) -> Result<Vec<Value>, WireError> {
        let mut scope = GraphScope::acquire(op.graph.request);
        let ctx = scope.ctx();
        let mut args = Vec::with_capacity(op.params.len());
        for param in &op.params {
            args.push(self.decode_value(r, ctx, param.type_id, 0)?);
        }
        self.drain_decode(r, ctx)?;
        Ok(args)
    }

    /// Encode a success response frame: `Response | payload`.
    pub fn encode_response(
        &self,
        w: &mut MessageWriter,
        op: &ProtocolOperation,
        result: &Value,
    ) -> Result<(), WireError> {
        w.write_u8(ResponseKind::Response as u8);
        let mut scope = GraphScope::acquire(op.graph.response);
        let ctx = scope.ctx();
        self.encode_value(w, ctx, result, op.return_type.type_id, 0)?;
        self.drain_encode(w, ctx)
    }

    /// Encode a typed error response frame: `Error | typeId | body`.
    /// Error bodies never use sharing.
    pub fn encode_error_response(
        &self,
        w: &mut MessageWriter,
        type_id: u16,
        error: &Value,
    ) -> Result<(), WireError> {
        w.write_u8(ResponseKind::Error as u8);
        w.write_u16(type_id);
        let mut scope = GraphScope::acquire(false);
        let ctx = scope.ctx();
        self.encode_value(w, ctx, error, type_id, 0)?;
        self.drain_encode(w, ctx)
    }

    /// Encode a header-only response frame.
    pub fn encode_status_response(&self, w: &mut MessageWriter, kind: ResponseKind) {
        debug_assert!(matches!(
            kind,
            ResponseKind::ServiceUnavailable | ResponseKind::ProtocolError
        ));
        w.write_u8(kind as u8);
    }

    /// Decode a response frame for the given operation.
    pub fn decode_response(
        &self,
        r: &mut MessageReader,
        op: &ProtocolOperation,
    ) -> Result<ResponseBody, WireError> {
        let tag = r.read_u8()?;
        let kind = ResponseKind::from_tag(tag)
            .ok_or(WireError::InvalidTag { what: "response kind", tag })?;
        match kind {
            ResponseKind::Response => {
                let mut scope = GraphScope::acquire(op.graph.response);
                let ctx = scope.ctx();
                let value = self.decode_value(r, ctx, op.return_type.type_id, 0)?;
                self.drain_decode(r, ctx)?;
                Ok(ResponseBody::Value(value))
            }
            ResponseKind::Error => {
                let (type_id, value) = self.decode_error_body(r)?;
                Ok(ResponseBody::Error { type_id, value })
            }
            ResponseKind::ServiceUnavailable => Ok(ResponseBody::ServiceUnavailable),
            ResponseKind::ProtocolError => Ok(ResponseBody::ProtocolError),
        }
    }

    /// Decode the `typeId | body` tail of an error response frame. Used
    /// both inside [`SerializerSet::decode_response`] and wherever an
    /// error arrives outside an operation exchange (Connect rejections).
    pub fn decode_error_body(&self, r: &mut MessageReader) -> Result<(u16, Value), WireError> {
        let type_id = r.read_u16()?;
        let mut scope = GraphScope::acquire(false);
        let ctx = scope.ctx();
        let value = self.decode_value(r, ctx, type_id, 0)?;
        self.drain_decode(r, ctx)?;
        Ok((type_id, value))
    }

    // --- Value encoding (type table) ---

    /// Encode one value against its declared type. `depth` counts
    /// enclosing reference bodies.
    pub fn encode_value(
        &self,
        w: &mut MessageWriter,
        ctx: &mut GraphContext,
        value: &Value,
        declared: u16,
        depth: usize,
    ) -> Result<(), WireError> {
        match self.codec(declared)? {
            TypeCodec::BuiltIn(kind) => encode_builtin(w, *kind, value),
            TypeCodec::Class(_) | TypeCodec::Array { .. } => {
                self.encode_ref(w, ctx, value, declared, depth)
            }
        }
    }

    fn encode_ref(
        &self,
        w: &mut MessageWriter,
        ctx: &mut GraphContext,
        value: &Value,
        declared: u16,
        depth: usize,
    ) -> Result<(), WireError> {
        if value.is_null() {
            w.write_u8(PRESENCE_NULL);
            return Ok(());
        }

        let concrete = match (self.codec(declared)?, value) {
            (TypeCodec::Class(_), Value::Object(obj)) => {
                let concrete = obj.read().type_id;
                if !self.descriptor.is_assignable(concrete, declared) {
                    return Err(WireError::NotAssignable { concrete, declared });
                }
                if self.layout(concrete)?.is_abstract {
                    return Err(WireError::AbstractInstance(concrete));
                }
                concrete
            }
            (TypeCodec::Array { .. }, Value::Array(_)) => declared,
            (TypeCodec::Class(_), _) => {
                return Err(WireError::TypeMismatch { expected: "class instance" })
            }
            _ => return Err(WireError::TypeMismatch { expected: "array" }),
        };

        let (is_new, instance_id) = ctx.acquire_instance_id(value);
        if !is_new {
            w.write_u8(PRESENCE_BACKREF);
            w.write_u32(instance_id);
            return Ok(());
        }

        w.write_u8(PRESENCE_NEW);
        if self.slot_is_polymorphic(declared)? {
            w.write_u16(concrete);
        }
        w.write_u32(instance_id);

        if depth >= ABSOLUTE_MAX_GRAPH_DEPTH {
            // Placeholder: prelude only; the body goes onto the queue
            // and is appended after the top-level value.
            ctx.enqueue_resume(ResumeItem {
                value: value.clone(),
                type_id: concrete,
            });
            return Ok(());
        }
        self.encode_body(w, ctx, value, concrete, depth + 1)
    }

    fn encode_body(
        &self,
        w: &mut MessageWriter,
        ctx: &mut GraphContext,
        value: &Value,
        concrete: u16,
        depth: usize,
    ) -> Result<(), WireError> {
        match self.codec(concrete)? {
            TypeCodec::Class(layout) => {
                let Value::Object(obj) = value else {
                    return Err(WireError::TypeMismatch { expected: "class instance" });
                };
                // Snapshot under a short read guard; nested encodes must
                // not run while the instance lock is held.
                let fields: Vec<Value> = obj.read().fields.clone();
                if fields.len() != layout.properties.len() {
                    return Err(WireError::WrongFieldCount { type_id: concrete });
                }
                for (field, prop) in fields.iter().zip(&layout.properties) {
                    self.encode_value(w, ctx, field, prop.type_id, depth)?;
                }
                Ok(())
            }
            TypeCodec::Array { element } => {
                let Value::Array(arr) = value else {
                    return Err(WireError::TypeMismatch { expected: "array" });
                };
                let element = *element;
                let items: Vec<Value> = arr.read().clone();
                w.write_len_tag(Some(items.len()));
                for item in &items {
                    self.encode_value(w, ctx, item, element, depth)?;
                }
                Ok(())
            }
            TypeCodec::BuiltIn(_) => Err(WireError::TypeMismatch { expected: "reference type" }),
        }
    }

    /// Decode one value against its declared type.
    pub fn decode_value(
        &self,
        r: &mut MessageReader,
        ctx: &mut GraphContext,
        declared: u16,
        depth: usize,
    ) -> Result<Value, WireError> {
        match self.codec(declared)? {
            TypeCodec::BuiltIn(kind) => decode_builtin(r, *kind),
            TypeCodec::Class(_) | TypeCodec::Array { .. } => {
                self.decode_ref(r, ctx, declared, depth)
            }
        }
    }

    fn decode_ref(
        &self,
        r: &mut MessageReader,
        ctx: &mut GraphContext,
        declared: u16,
        depth: usize,
    ) -> Result<Value, WireError> {
        match r.read_u8()? {
            PRESENCE_NULL => Ok(Value::Null),
            PRESENCE_BACKREF => {
                let id = r.read_u32()?;
                ctx.get_by_instance_id(id)
                    .cloned()
                    .ok_or(WireError::BackrefOutOfRange(id))
            }
            PRESENCE_NEW => {
                let concrete = match self.codec(declared)? {
                    TypeCodec::Array { .. } => declared,
                    TypeCodec::Class(_) => {
                        if self.slot_is_polymorphic(declared)? {
                            let concrete = r.read_u16()?;
                            if !self.descriptor.is_assignable(concrete, declared) {
                                return Err(WireError::NotAssignable { concrete, declared });
                            }
                            concrete
                        } else {
                            declared
                        }
                    }
                    TypeCodec::BuiltIn(_) => {
                        return Err(WireError::TypeMismatch { expected: "reference type" })
                    }
                };

                // Allocate and register before reading fields so
                // self-references resolve to this instance.
                let value = match self.codec(concrete)? {
                    TypeCodec::Class(layout) => {
                        if layout.is_abstract {
                            return Err(WireError::AbstractInstance(concrete));
                        }
                        Value::Object(Arc::new(parking_lot::RwLock::new(ObjectInstance::new(
                            concrete,
                            layout.properties.len(),
                        ))))
                    }
                    TypeCodec::Array { .. } => Value::Array(Arc::new(parking_lot::RwLock::new(
                        Vec::new(),
                    ))),
                    TypeCodec::BuiltIn(_) => unreachable!("checked above"),
                };
                let wire_id = r.read_u32()?;
                let assigned = ctx.register(value.clone());
                if wire_id != assigned {
                    return Err(WireError::CorruptMessage("instance id out of traversal order"));
                }

                if depth >= ABSOLUTE_MAX_GRAPH_DEPTH {
                    ctx.enqueue_resume(ResumeItem {
                        value: value.clone(),
                        type_id: concrete,
                    });
                    return Ok(value);
                }
                self.decode_body(r, ctx, &value, concrete, depth + 1)?;
                Ok(value)
            }
            tag => Err(WireError::InvalidTag { what: "presence", tag }),
        }
    }

    fn decode_body(
        &self,
        r: &mut MessageReader,
        ctx: &mut GraphContext,
        value: &Value,
        concrete: u16,
        depth: usize,
    ) -> Result<(), WireError> {
        match self.codec(concrete)? {
            TypeCodec::Class(layout) => {
                let prop_types: Vec<u16> = layout.properties.iter().map(|p| p.type_id).collect();
                let mut fields = Vec::with_capacity(prop_types.len());
                for type_id in prop_types {
                    fields.push(self.decode_value(r, ctx, type_id, depth)?);
                }
                let Value::Object(obj) = value else {
                    return Err(WireError::TypeMismatch { expected: "class instance" });
                };
                obj.write().fields = fields;
                Ok(())
            }
            TypeCodec::Array { element } => {
                let element = *element;
                let len = r
                    .read_len_tag()?
                    .ok_or(WireError::CorruptMessage("null length in array body"))?;
                let mut items = Vec::with_capacity(len.min(1 << 16));
                for _ in 0..len {
                    items.push(self.decode_value(r, ctx, element, depth)?);
                }
                let Value::Array(arr) = value else {
                    return Err(WireError::TypeMismatch { expected: "array" });
                };
                *arr.write() = items;
                Ok(())
            }
            TypeCodec::BuiltIn(_) => Err(WireError::TypeMismatch { expected: "reference type" }),
        }
    }

    /// Encode deferred bodies until the queue runs dry. Each continuation
    /// restarts with a fresh depth budget, which bounds the stack at
    /// `ABSOLUTE_MAX_GRAPH_DEPTH` plus a constant.
    fn drain_encode(&self, w: &mut MessageWriter, ctx: &mut GraphContext) -> Result<(), WireError> {
        while let Some(item) = ctx.pop_resume() {
            self.encode_body(w, ctx, &item.value, item.type_id, 0)?;
        }
        Ok(())
    }

    fn drain_decode(&self, r: &mut MessageReader, ctx: &mut GraphContext) -> Result<(), WireError> {
        while let Some(item) = ctx.pop_resume() {
            self.decode_body(r, ctx, &item.value, item.type_id, 0)?;
        }
        Ok(())
    }

    /// Whether a slot declared as `type_id` carries a concrete-type tag.
    fn slot_is_polymorphic(&self, type_id: u16) -> Result<bool, WireError> {
        Ok(match self.codec(type_id)? {
            TypeCodec::Class(layout) => layout.polymorphic,
            _ => false,
        })
    }
}

fn encode_builtin(w: &mut MessageWriter, kind: BuiltInKind, value: &Value) -> Result<(), WireError> {
    match (kind, value) {
        (BuiltInKind::Bool, Value::Bool(v)) => w.write_bool(*v),
        (BuiltInKind::I8, Value::I8(v)) => w.write_i8(*v),
        (BuiltInKind::I16, Value::I16(v)) => w.write_i16(*v),
        (BuiltInKind::I32, Value::I32(v)) => w.write_i32(*v),
        (BuiltInKind::I64, Value::I64(v)) => w.write_i64(*v),
        (BuiltInKind::U8, Value::U8(v)) => w.write_u8(*v),
        (BuiltInKind::U16, Value::U16(v)) => w.write_u16(*v),
        (BuiltInKind::U32, Value::U32(v)) => w.write_u32(*v),
        (BuiltInKind::U64, Value::U64(v)) => w.write_u64(*v),
        (BuiltInKind::F32, Value::F32(v)) => w.write_f32(*v),
        (BuiltInKind::F64, Value::F64(v)) => w.write_f64(*v),
        (BuiltInKind::Decimal, Value::Decimal(v)) => w.write_decimal(*v),
        (BuiltInKind::DateTime, Value::DateTime(v)) => w.write_datetime(*v),
        (BuiltInKind::TimeSpan, Value::TimeSpan(v)) => w.write_timespan(*v),
        (BuiltInKind::Guid, Value::Guid(v)) => w.write_guid(*v),
        (BuiltInKind::String, Value::Str(v)) => w.write_string(Some(v)),
        (BuiltInKind::String, Value::Null) => w.write_string(None),
        (kind, _) => return Err(WireError::TypeMismatch { expected: kind.name() }),
    }
    Ok(())
}

fn decode_builtin(r: &mut MessageReader, kind: BuiltInKind) -> Result<Value, WireError> {
    Ok(match kind {
        BuiltInKind::Bool => Value::Bool(r.read_bool()?),
        BuiltInKind::I8 => Value::I8(r.read_i8()?),
        BuiltInKind::I16 => Value::I16(r.read_i16()?),
        BuiltInKind::I32 => Value::I32(r.read_i32()?),
        BuiltInKind::I64 => Value::I64(r.read_i64()?),
        BuiltInKind::U8 => Value::U8(r.read_u8()?),
        BuiltInKind::U16 => Value::U16(r.read_u16()?),
        BuiltInKind::U32 => Value::U32(r.read_u32()?),
        BuiltInKind::U64 => Value::U64(r.read_u64()?),
        BuiltInKind::F32 => Value::F32(r.read_f32()?),
        BuiltInKind::F64 => Value::F64(r.read_f64()?),
        BuiltInKind::Decimal => Value::Decimal(r.read_decimal()?),
        BuiltInKind::DateTime => Value::DateTime(r.read_datetime()?),
        BuiltInKind::TimeSpan => Value::TimeSpan(r.read_timespan()?),
        BuiltInKind::Guid => Value::Guid(r.read_guid()?),
        BuiltInKind::String => match r.read_string()? {
            Some(s) => Value::Str(s),
            None => Value::Null,
        },
    })
}

// --- Core error payload helpers ---

/// Build the wire value for an engine fault.
pub fn db_error_to_value(err: &DbError) -> (u16, Value) {
    let type_id = db_error_type_id(err.kind);
    (
        type_id,
        Value::object(
            type_id,
            vec![Value::Str(err.message.clone()), Value::Bool(err.retryable)],
        ),
    )
}

/// Interpret a decoded error payload as an engine fault, if its type is
/// one of the core kinds.
pub fn value_to_db_error(type_id: u16, value: &Value) -> Option<DbError> {
    let kind = db_error_kind_for(type_id)?;
    let (message, retryable) = error_summary(value)?;
    Some(DbError { kind, message, retryable })
}

/// Build the Connect-time mismatch error payload.
pub fn protocol_mismatch_value(operation: &str, reason: &str) -> (u16, Value) {
    (
        TYPE_ID_PROTOCOL_MISMATCH_ERROR,
        Value::object(
            TYPE_ID_PROTOCOL_MISMATCH_ERROR,
            vec![
                Value::Str(format!("protocol mismatch at {operation}: {reason}")),
                Value::Bool(false),
                Value::Str(operation.to_owned()),
                Value::Str(reason.to_owned()),
            ],
        ),
    )
}

/// Build the unknown-service error payload.
pub fn service_unknown_value(service: &str) -> (u16, Value) {
    (
        TYPE_ID_SERVICE_UNKNOWN_ERROR,
        Value::object(
            TYPE_ID_SERVICE_UNKNOWN_ERROR,
            vec![
                Value::Str(format!("no service named '{service}' is hosted")),
                Value::Bool(false),
                Value::Str(service.to_owned()),
            ],
        ),
    )
}

/// Build the payload for an undeclared fault.
pub fn unknown_error_value(message: &str) -> (u16, Value) {
    (
        TYPE_ID_UNKNOWN_ERROR,
        Value::object(
            TYPE_ID_UNKNOWN_ERROR,
            vec![Value::Str(message.to_owned()), Value::Bool(false)],
        ),
    )
}

/// `(message, retryable)` from any error payload: the base class fields
/// sit at fixed leading positions in every flattened error layout.
pub fn error_summary(value: &Value) -> Option<(String, bool)> {
    let obj = value.as_object()?;
    let guard = obj.read();
    let message = guard.fields.get(ERR_FIELD_MESSAGE)?.as_str()?.to_owned();
    let retryable = guard.fields.get(ERR_FIELD_RETRYABLE)?.as_bool()?;
    Some((message, retryable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPool;
    use crate::error::DbErrorKind;
    use crate::schema::{GraphSupport, SchemaBuilder, TypeExpr, FIRST_USER_TYPE_ID};
    use crate::types::Guid;

    const NODE_TYPE: u16 = FIRST_USER_TYPE_ID;

    /// `Node { value: i32, a: Node, b: Node }` plus an Identity op with
    /// graph support in both directions.
    fn node_set(graph: GraphSupport) -> SerializerSet {
        let mut b = SchemaBuilder::new();
        b.class("Node")
            .field("value", TypeExpr::I32)
            .field("a", TypeExpr::class("Node"))
            .field("b", TypeExpr::class("Node"));
        b.interface("NodeApi")
            .operation("Identity")
            .param("node", TypeExpr::class("Node"))
            .returns(TypeExpr::class("Node"))
            .graph(graph);
        SerializerSet::new(Arc::new(b.finish().unwrap()))
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

    fn roundtrip_request(set: &SerializerSet, args: &[Value]) -> Vec<Value> {
        let pool = ChunkPool::new(1024, 128).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        set.encode_request(&mut writer, 0, 0, args).unwrap();
        let mut reader = MessageReader::new(writer.finish()).unwrap();

        // Frame header consumed the way the host does it.
        assert_eq!(reader.read_u16().unwrap(), FORMAT_VERSION);
        assert_eq!(reader.read_u8().unwrap(), RequestKind::Operation as u8);
        assert_eq!(reader.read_u16().unwrap(), 0);
        assert_eq!(reader.read_u16().unwrap(), 0);

        let op = set.descriptor().operation(0, 0).unwrap();
        let args = set.decode_request_args(&mut reader, op).unwrap();
        assert!(reader.at_end());
        args
    }

    fn roundtrip_response(set: &SerializerSet, result: &Value) -> Value {
        let pool = ChunkPool::new(1024, 128).unwrap();
        let op = set.descriptor().operation(0, 0).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        set.encode_response(&mut writer, op, result).unwrap();
        let mut reader = MessageReader::new(writer.finish()).unwrap();
        match set.decode_response(&mut reader, op).unwrap() {
            ResponseBody::Value(v) => v,
            other => panic!("expected value response, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_reference_survives_roundtrip() {
        let set = node_set(GraphSupport::BOTH);
        let shared = node(7);
        let root = node(1);
        set_field(&root, 1, shared.clone());
        set_field(&root, 2, shared);

        let args = roundtrip_request(&set, &[root]);
        let decoded = &args[0];
        let a = get_field(decoded, 1);
        let b = get_field(decoded, 2);
        assert_eq!(get_field(decoded, 0).as_i32(), Some(1));
        assert_eq!(a.as_object().unwrap().read().fields[0].as_i32(), Some(7));
        assert!(a.same_ref(&b), "shared node must decode as one instance");
    }

    #[test]
    fn test_cycle_roundtrip() {
        let set = node_set(GraphSupport::BOTH);
        let a = node(1);
        let b = node(2);
        set_field(&a, 1, b.clone());
        set_field(&b, 1, a.clone());

        let decoded = roundtrip_response(&set, &a);
        let decoded_b = get_field(&decoded, 1);
        let back = get_field(&decoded_b, 1);
        assert!(back.same_ref(&decoded), "a -> b -> a must close the cycle");
    }

    #[test]
    fn test_self_reference() {
        let set = node_set(GraphSupport::BOTH);
        let a = node(5);
        set_field(&a, 1, a.clone());
        let decoded = roundtrip_response(&set, &a);
        assert!(get_field(&decoded, 1).same_ref(&decoded));
    }

    #[test]
    fn test_deep_chain_defers_and_reconstructs() {
        let set = node_set(GraphSupport::BOTH);
        // Chain far deeper than the recursion bound.
        let depth = ABSOLUTE_MAX_GRAPH_DEPTH * 4;
        let head = node(0);
        let mut tail = head.clone();
        for i in 1..depth {
            let next = node(i as i32);
            set_field(&tail, 1, next.clone());
            tail = next;
        }

        let decoded = roundtrip_response(&set, &head);
        let mut cursor = decoded;
        for i in 0..depth {
            assert_eq!(get_field(&cursor, 0).as_i32(), Some(i as i32));
            let next = get_field(&cursor, 1);
            if i + 1 == depth {
                assert!(next.is_null());
                break;
            }
            cursor = next;
        }
    }

    #[test]
    fn test_graph_disabled_duplicates_shared_nodes() {
        let set = node_set(GraphSupport::NONE);
        let shared = node(7);
        let root = node(1);
        set_field(&root, 1, shared.clone());
        set_field(&root, 2, shared);

        let args = roundtrip_request(&set, &[root]);
        let a = get_field(&args[0], 1);
        let b = get_field(&args[0], 2);
        assert!(!a.same_ref(&b), "without graph support the tree is duplicated");
        assert_eq!(a.as_object().unwrap().read().fields[0].as_i32(), Some(7));
    }

    #[test]
    fn test_polymorphic_slot_roundtrip() {
        let mut b = SchemaBuilder::new();
        b.class("Shape").abstract_().field("tag", TypeExpr::I32);
        b.class("Circle").extends("Shape").field("radius", TypeExpr::F64);
        b.class("Square").extends("Shape").field("side", TypeExpr::F64);
        b.interface("Draw")
            .operation("Echo")
            .param("shape", TypeExpr::class("Shape"))
            .returns(TypeExpr::class("Shape"));
        let set = SerializerSet::new(Arc::new(b.finish().unwrap()));

        let circle_id = FIRST_USER_TYPE_ID + 1;
        let circle = Value::object(circle_id, vec![Value::I32(1), Value::F64(2.5)]);

        let args = roundtrip_request(&set, &[circle]);
        let decoded = args[0].as_object().unwrap().read();
        assert_eq!(decoded.type_id, circle_id);
        assert_eq!(decoded.fields.len(), 2);
        assert!(matches!(decoded.fields[1], Value::F64(v) if v == 2.5));
    }

    #[test]
    fn test_abstract_instance_rejected() {
        let mut b = SchemaBuilder::new();
        b.class("Shape").abstract_().field("tag", TypeExpr::I32);
        b.class("Circle").extends("Shape").field("radius", TypeExpr::F64);
        b.interface("Draw")
            .operation("Echo")
            .param("shape", TypeExpr::class("Shape"))
            .returns(TypeExpr::class("Shape"));
        let set = SerializerSet::new(Arc::new(b.finish().unwrap()));

        let shape_id = FIRST_USER_TYPE_ID;
        let abstract_value = Value::object(shape_id, vec![Value::I32(1)]);
        let pool = ChunkPool::new(64, 128).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        let result = set.encode_request(&mut writer, 0, 0, &[abstract_value]);
        assert!(matches!(result, Err(WireError::AbstractInstance(_))));
    }

    #[test]
    fn test_array_of_classes_with_sharing() {
        let mut b = SchemaBuilder::new();
        b.class("Item").field("id", TypeExpr::I64);
        b.interface("Api")
            .operation("Store")
            .param("items", TypeExpr::array(TypeExpr::class("Item")))
            .returns(TypeExpr::Bool)
            .graph(GraphSupport::REQUEST);
        let set = SerializerSet::new(Arc::new(b.finish().unwrap()));

        let item = Value::object(FIRST_USER_TYPE_ID, vec![Value::I64(9)]);
        let items = Value::array(vec![item.clone(), item.clone(), Value::Null]);

        let args = roundtrip_request(&set, &[items]);
        let decoded = args[0].as_array().unwrap().read().clone();
        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].same_ref(&decoded[1]));
        assert!(decoded[2].is_null());
    }

    #[test]
    fn test_scalar_argument_roundtrip() {
        let mut b = SchemaBuilder::new();
        b.interface("Api")
            .operation("Mix")
            .param("flag", TypeExpr::Bool)
            .param("text", TypeExpr::String)
            .param("id", TypeExpr::Guid)
            .param("values", TypeExpr::array(TypeExpr::F64))
            .returns(TypeExpr::String);
        let set = SerializerSet::new(Arc::new(b.finish().unwrap()));

        let guid = Guid::new_random();
        let args = roundtrip_request(
            &set,
            &[
                Value::Bool(true),
                Value::Str("héllo".into()),
                Value::Guid(guid),
                Value::array(vec![Value::F64(1.0), Value::F64(-0.5)]),
            ],
        );
        assert_eq!(args[0].as_bool(), Some(true));
        assert_eq!(args[1].as_str(), Some("héllo"));
        assert!(matches!(args[2], Value::Guid(g) if g == guid));
        let values = args[3].as_array().unwrap().read().clone();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_argument_count_enforced() {
        let set = node_set(GraphSupport::BOTH);
        let pool = ChunkPool::new(64, 128).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        assert!(matches!(
            set.encode_request(&mut writer, 0, 0, &[]),
            Err(WireError::ArgumentCountMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_error_response_roundtrip() {
        let set = node_set(GraphSupport::BOTH);
        let op = set.descriptor().operation(0, 0).unwrap();
        let fault = DbError::conflict("write conflict on Node#4");
        let (type_id, payload) = db_error_to_value(&fault);

        let pool = ChunkPool::new(64, 256).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        set.encode_error_response(&mut writer, type_id, &payload).unwrap();
        let mut reader = MessageReader::new(writer.finish()).unwrap();

        match set.decode_response(&mut reader, op).unwrap() {
            ResponseBody::Error { type_id, value } => {
                let decoded = value_to_db_error(type_id, &value).unwrap();
                assert_eq!(decoded.kind, DbErrorKind::Conflict);
                assert_eq!(decoded.message, "write conflict on Node#4");
                assert!(decoded.retryable);
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_status_response_roundtrip() {
        let set = node_set(GraphSupport::BOTH);
        let op = set.descriptor().operation(0, 0).unwrap();
        let pool = ChunkPool::new(64, 128).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        set.encode_status_response(&mut writer, ResponseKind::ServiceUnavailable);
        let mut reader = MessageReader::new(writer.finish()).unwrap();
        assert!(matches!(
            set.decode_response(&mut reader, op).unwrap(),
            ResponseBody::ServiceUnavailable
        ));
    }

    #[test]
    fn test_mismatch_payload_fields() {
        let (type_id, value) = protocol_mismatch_value("Echo.Echo", "returnType");
        assert_eq!(type_id, TYPE_ID_PROTOCOL_MISMATCH_ERROR);
        let (message, retryable) = error_summary(&value).unwrap();
        assert!(message.contains("Echo.Echo"));
        assert!(!retryable);
    }
}
