//! Protocol schema
//!
//! The self-describing contract negotiated at connect time. A schema is
//! discovered from a service definition (`build`), exchanged on Connect
//! (`wire`), and structurally compared against the peer's expectation
//! (`compare`). Built-in value kinds and the core error classes occupy
//! fixed well-known type ids so typed errors decode without any schema
//! agreement.

mod build;
mod compare;
mod wire;

pub use build::{
    ClassDecl, InterfaceDecl, OperationDecl, SchemaBuilder, SchemaLimits, TypeExpr,
    DEFAULT_MAX_CLASS_PROPERTIES, DEFAULT_MAX_TYPE_COUNT, MAX_REQUEST_ARGUMENTS,
};
pub use compare::{compare_descriptors, CompareResult, MismatchDetail};
pub use wire::{decode_descriptor, encode_descriptor};

use crate::error::{DbErrorKind, WireError};
use crate::types::{BuiltInKind, Guid, BUILT_IN_KIND_COUNT};

// --- Well-known type ids ---

/// Abstract base class of every typed operation error.
pub const TYPE_ID_DATABASE_ERROR: u16 = BUILT_IN_KIND_COUNT;
pub const TYPE_ID_UNKNOWN_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 1;
pub const TYPE_ID_PROTOCOL_MISMATCH_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 2;
pub const TYPE_ID_SERVICE_UNKNOWN_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 3;
pub const TYPE_ID_CONFLICT_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 4;
pub const TYPE_ID_UNIQUENESS_VIOLATION_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 5;
pub const TYPE_ID_UNKNOWN_REFERENCE_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 6;
pub const TYPE_ID_INVALID_ARGUMENT_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 7;
pub const TYPE_ID_NOT_ALLOWED_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 8;
pub const TYPE_ID_BUSY_ERROR: u16 = TYPE_ID_DATABASE_ERROR + 9;

/// First id available to user-declared classes and arrays.
pub const FIRST_USER_TYPE_ID: u16 = TYPE_ID_DATABASE_ERROR + 10;

/// Field indexes of the error base class.
pub const ERR_FIELD_MESSAGE: usize = 0;
pub const ERR_FIELD_RETRYABLE: usize = 1;

/// Wire type id carrying a given engine fault kind.
pub fn db_error_type_id(kind: DbErrorKind) -> u16 {
    match kind {
        DbErrorKind::Conflict => TYPE_ID_CONFLICT_ERROR,
        DbErrorKind::UniquenessViolation => TYPE_ID_UNIQUENESS_VIOLATION_ERROR,
        DbErrorKind::UnknownReference => TYPE_ID_UNKNOWN_REFERENCE_ERROR,
        DbErrorKind::InvalidArgument => TYPE_ID_INVALID_ARGUMENT_ERROR,
        DbErrorKind::NotAllowed => TYPE_ID_NOT_ALLOWED_ERROR,
        DbErrorKind::Busy => TYPE_ID_BUSY_ERROR,
        DbErrorKind::Unknown => TYPE_ID_UNKNOWN_ERROR,
    }
}

/// Reverse of [`db_error_type_id`], `None` for non-core error types.
pub fn db_error_kind_for(type_id: u16) -> Option<DbErrorKind> {
    match type_id {
        TYPE_ID_CONFLICT_ERROR => Some(DbErrorKind::Conflict),
        TYPE_ID_UNIQUENESS_VIOLATION_ERROR => Some(DbErrorKind::UniquenessViolation),
        TYPE_ID_UNKNOWN_REFERENCE_ERROR => Some(DbErrorKind::UnknownReference),
        TYPE_ID_INVALID_ARGUMENT_ERROR => Some(DbErrorKind::InvalidArgument),
        TYPE_ID_NOT_ALLOWED_ERROR => Some(DbErrorKind::NotAllowed),
        TYPE_ID_BUSY_ERROR => Some(DbErrorKind::Busy),
        TYPE_ID_UNKNOWN_ERROR => Some(DbErrorKind::Unknown),
        _ => None,
    }
}

// --- Descriptor model ---

/// One named, typed slot: a class field, an operation parameter, or a
/// return value. `polymorphic` is true when the declared type is a class
/// with subclasses reachable through this slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolProperty {
    pub name: String,
    pub type_id: u16,
    pub polymorphic: bool,
}

/// A class in the schema's inheritance tree. `properties` holds only the
/// fields declared on this class; ancestors contribute theirs through
/// [`ProtocolDescriptor::flattened_properties`].
#[derive(Clone, Debug)]
pub struct ProtocolClass {
    pub name: String,
    pub base: Option<u16>,
    pub is_abstract: bool,
    pub can_be_inherited: bool,
    pub properties: Vec<ProtocolProperty>,
    /// Transitive subclasses, computed at assembly; not transmitted.
    pub descendants: Vec<u16>,
}

/// A protocol type entry.
#[derive(Clone, Debug)]
pub enum TypeDef {
    BuiltIn(BuiltInKind),
    Class(ProtocolClass),
    Array { element: u16 },
}

#[derive(Clone, Debug)]
pub struct ProtocolType {
    pub id: u16,
    pub def: TypeDef,
}

/// Whether an operation only reads or may mutate database state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationKind {
    Read = 0,
    ReadWrite = 1,
}

impl OperationKind {
    pub fn from_tag(tag: u8) -> Option<OperationKind> {
        match tag {
            0 => Some(OperationKind::Read),
            1 => Some(OperationKind::ReadWrite),
            _ => None,
        }
    }
}

/// Per-operation, per-direction shared-object tracking switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GraphSupport {
    pub request: bool,
    pub response: bool,
}

impl GraphSupport {
    pub const NONE: GraphSupport = GraphSupport { request: false, response: false };
    pub const REQUEST: GraphSupport = GraphSupport { request: true, response: false };
    pub const RESPONSE: GraphSupport = GraphSupport { request: false, response: true };
    pub const BOTH: GraphSupport = GraphSupport { request: true, response: true };

    pub fn to_bits(self) -> u8 {
        (self.request as u8) | ((self.response as u8) << 1)
    }

    pub fn from_bits(bits: u8) -> Option<GraphSupport> {
        if bits > 3 {
            return None;
        }
        Some(GraphSupport {
            request: bits & 1 != 0,
            response: bits & 2 != 0,
        })
    }
}

/// One remotely invocable procedure.
#[derive(Clone, Debug)]
pub struct ProtocolOperation {
    pub id: u16,
    pub name: String,
    pub params: Vec<ProtocolProperty>,
    pub return_type: ProtocolProperty,
    pub kind: OperationKind,
    pub graph: GraphSupport,
    pub error_types: Vec<u16>,
}

/// The operations of one API, addressed by a dense id within a service.
#[derive(Clone, Debug)]
pub struct ProtocolInterface {
    pub id: u16,
    pub name: String,
    pub operations: Vec<ProtocolOperation>,
}

/// The full machine-readable schema of a service, version-stamped.
#[derive(Clone, Debug)]
pub struct ProtocolDescriptor {
    pub version: Guid,
    pub interfaces: Vec<ProtocolInterface>,
    /// Dense: `types[i].id == i`.
    pub types: Vec<ProtocolType>,
}

impl ProtocolDescriptor {
    /// Validate id density and inheritance edges, then compute derived
    /// data (descendant lists). Used by both the builder and the wire
    /// decoder.
    pub fn assemble(
        version: Guid,
        interfaces: Vec<ProtocolInterface>,
        mut types: Vec<ProtocolType>,
    ) -> Result<ProtocolDescriptor, WireError> {
        for (i, ty) in types.iter().enumerate() {
            if ty.id as usize != i {
                return Err(WireError::CorruptMessage("type ids are not dense"));
            }
        }

        // Inheritance edges must land on classes present in the schema.
        let class_ids: Vec<Option<u16>> = types
            .iter()
            .map(|t| match &t.def {
                TypeDef::Class(c) => c.base,
                _ => None,
            })
            .collect();
        for base in class_ids.iter().flatten() {
            match types.get(*base as usize).map(|t| &t.def) {
                Some(TypeDef::Class(_)) => {}
                _ => return Err(WireError::CorruptMessage("inheritance edge to non-class")),
            }
        }

        // Descendant lists, one upward walk per class.
        let mut descendants: Vec<Vec<u16>> = vec![Vec::new(); types.len()];
        for (id, base) in class_ids.iter().enumerate() {
            let mut cursor = *base;
            let mut hops = 0;
            while let Some(ancestor) = cursor {
                descendants[ancestor as usize].push(id as u16);
                cursor = match &types[ancestor as usize].def {
                    TypeDef::Class(c) => c.base,
                    _ => None,
                };
                hops += 1;
                if hops > types.len() {
                    return Err(WireError::CorruptMessage("inheritance cycle"));
                }
            }
        }
        for (ty, desc) in types.iter_mut().zip(descendants) {
            if let TypeDef::Class(class) = &mut ty.def {
                class.descendants = desc;
            }
        }

        Ok(ProtocolDescriptor {
            version,
            interfaces,
            types,
        })
    }

    pub fn type_def(&self, id: u16) -> Option<&TypeDef> {
        self.types.get(id as usize).map(|t| &t.def)
    }

    pub fn class(&self, id: u16) -> Option<&ProtocolClass> {
        match self.type_def(id) {
            Some(TypeDef::Class(c)) => Some(c),
            _ => None,
        }
    }

    /// Human-readable name of a type, for diagnostics and comparison.
    pub fn type_name(&self, id: u16) -> String {
        match self.type_def(id) {
            Some(TypeDef::BuiltIn(kind)) => kind.name().to_owned(),
            Some(TypeDef::Class(c)) => c.name.clone(),
            Some(TypeDef::Array { element }) => format!("{}[]", self.type_name(*element)),
            None => format!("<unknown:{id}>"),
        }
    }

    /// All fields of a class: inherited first (root ancestor leading),
    /// then own, in declaration order.
    pub fn flattened_properties(&self, id: u16) -> Vec<ProtocolProperty> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(class) = self.class(current) else { break };
            chain.push(current);
            cursor = class.base;
        }
        chain.reverse();
        chain
            .into_iter()
            .flat_map(|cid| self.class(cid).expect("chain holds classes").properties.clone())
            .collect()
    }

    /// Whether `concrete` is `declared` or one of its descendants.
    pub fn is_assignable(&self, concrete: u16, declared: u16) -> bool {
        let mut cursor = Some(concrete);
        while let Some(current) = cursor {
            if current == declared {
                return true;
            }
            cursor = self.class(current).and_then(|c| c.base);
        }
        false
    }

    /// Whether a class derives the core error base class.
    pub fn derives_error_base(&self, id: u16) -> bool {
        self.is_assignable(id, TYPE_ID_DATABASE_ERROR)
    }

    pub fn interface_by_name(&self, name: &str) -> Option<&ProtocolInterface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn operation(&self, interface_id: u16, operation_id: u16) -> Option<&ProtocolOperation> {
        self.interfaces
            .get(interface_id as usize)
            .and_then(|i| i.operations.get(operation_id as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_id_mapping_roundtrip() {
        use DbErrorKind::*;
        for kind in [
            Conflict,
            UniquenessViolation,
            UnknownReference,
            InvalidArgument,
            NotAllowed,
            Busy,
            Unknown,
        ] {
            assert_eq!(db_error_kind_for(db_error_type_id(kind)), Some(kind));
        }
        assert_eq!(db_error_kind_for(TYPE_ID_DATABASE_ERROR), None);
    }

    #[test]
    fn test_graph_support_bits() {
        for graph in [
            GraphSupport::NONE,
            GraphSupport::REQUEST,
            GraphSupport::RESPONSE,
            GraphSupport::BOTH,
        ] {
            assert_eq!(GraphSupport::from_bits(graph.to_bits()), Some(graph));
        }
        assert_eq!(GraphSupport::from_bits(4), None);
    }
}
