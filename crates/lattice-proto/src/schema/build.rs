//! Schema discovery
//!
//! Builds a `ProtocolDescriptor` from a declarative service definition.
//! The build is two-phase: pass one registers every class under a dense
//! type id, pass two resolves field and signature types (creating array
//! types on first encounter) and computes polymorphism. The cyclic class
//! graphs this enables are resolved without laziness: ids exist before
//! any field list is filled.

use std::collections::{HashMap, HashSet};

use crate::chunk::ChunkPool;
use crate::error::ValidationError;
use crate::types::{BuiltInKind, Guid};
use crate::writer::MessageWriter;

use super::{
    encode_descriptor, GraphSupport, OperationKind, ProtocolClass, ProtocolDescriptor,
    ProtocolInterface, ProtocolOperation, ProtocolProperty, ProtocolType, TypeDef,
    FIRST_USER_TYPE_ID, TYPE_ID_DATABASE_ERROR,
};

/// Default cap on operation parameters.
pub const MAX_REQUEST_ARGUMENTS: usize = 16;

/// Default cap on the flattened property count of one class.
pub const DEFAULT_MAX_CLASS_PROPERTIES: usize = 64;

/// Default cap on the total number of schema types.
pub const DEFAULT_MAX_TYPE_COUNT: usize = 4096;

/// A type expression in a service definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeExpr {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Decimal,
    DateTime,
    TimeSpan,
    Guid,
    String,
    Class(std::string::String),
    Array(Box<TypeExpr>),
}

impl TypeExpr {
    pub fn class(name: impl Into<std::string::String>) -> TypeExpr {
        TypeExpr::Class(name.into())
    }

    pub fn array(element: TypeExpr) -> TypeExpr {
        TypeExpr::Array(Box::new(element))
    }

    fn built_in(&self) -> Option<BuiltInKind> {
        match self {
            TypeExpr::Bool => Some(BuiltInKind::Bool),
            TypeExpr::I8 => Some(BuiltInKind::I8),
            TypeExpr::I16 => Some(BuiltInKind::I16),
            TypeExpr::I32 => Some(BuiltInKind::I32),
            TypeExpr::I64 => Some(BuiltInKind::I64),
            TypeExpr::U8 => Some(BuiltInKind::U8),
            TypeExpr::U16 => Some(BuiltInKind::U16),
            TypeExpr::U32 => Some(BuiltInKind::U32),
            TypeExpr::U64 => Some(BuiltInKind::U64),
            TypeExpr::F32 => Some(BuiltInKind::F32),
            TypeExpr::F64 => Some(BuiltInKind::F64),
            TypeExpr::Decimal => Some(BuiltInKind::Decimal),
            TypeExpr::DateTime => Some(BuiltInKind::DateTime),
            TypeExpr::TimeSpan => Some(BuiltInKind::TimeSpan),
            TypeExpr::Guid => Some(BuiltInKind::Guid),
            TypeExpr::String => Some(BuiltInKind::String),
            _ => None,
        }
    }
}

/// Configured schema caps.
#[derive(Clone, Copy, Debug)]
pub struct SchemaLimits {
    pub max_request_args: usize,
    pub max_class_properties: usize,
    pub max_type_count: usize,
}

impl Default for SchemaLimits {
    fn default() -> SchemaLimits {
        SchemaLimits {
            max_request_args: MAX_REQUEST_ARGUMENTS,
            max_class_properties: DEFAULT_MAX_CLASS_PROPERTIES,
            max_type_count: DEFAULT_MAX_TYPE_COUNT,
        }
    }
}

/// A class under declaration.
#[derive(Clone, Debug)]
pub struct ClassDecl {
    name: std::string::String,
    base: Option<std::string::String>,
    is_abstract: bool,
    sealed: bool,
    fields: Vec<(std::string::String, TypeExpr)>,
}

impl ClassDecl {
    fn new(name: std::string::String) -> ClassDecl {
        ClassDecl {
            name,
            base: None,
            is_abstract: false,
            sealed: false,
            fields: Vec::new(),
        }
    }

    pub fn extends(&mut self, base: impl Into<std::string::String>) -> &mut Self {
        self.base = Some(base.into());
        self
    }

    pub fn abstract_(&mut self) -> &mut Self {
        self.is_abstract = true;
        self
    }

    pub fn sealed(&mut self) -> &mut Self {
        self.sealed = true;
        self
    }

    pub fn field(&mut self, name: impl Into<std::string::String>, ty: TypeExpr) -> &mut Self {
        self.fields.push((name.into(), ty));
        self
    }
}

/// An operation under declaration. Defaults: `bool` return, `Read`
/// kind, graph support off, no declared errors.
#[derive(Clone, Debug)]
pub struct OperationDecl {
    name: std::string::String,
    params: Vec<(std::string::String, TypeExpr)>,
    returns: TypeExpr,
    kind: OperationKind,
    graph: GraphSupport,
    errors: Vec<std::string::String>,
}

impl OperationDecl {
    fn new(name: std::string::String) -> OperationDecl {
        OperationDecl {
            name,
            params: Vec::new(),
            returns: TypeExpr::Bool,
            kind: OperationKind::Read,
            graph: GraphSupport::NONE,
            errors: Vec::new(),
        }
    }

    pub fn param(&mut self, name: impl Into<std::string::String>, ty: TypeExpr) -> &mut Self {
        self.params.push((name.into(), ty));
        self
    }

    pub fn returns(&mut self, ty: TypeExpr) -> &mut Self {
        self.returns = ty;
        self
    }

    pub fn kind(&mut self, kind: OperationKind) -> &mut Self {
        self.kind = kind;
        self
    }

    pub fn graph(&mut self, graph: GraphSupport) -> &mut Self {
        self.graph = graph;
        self
    }

    pub fn error(&mut self, class_name: impl Into<std::string::String>) -> &mut Self {
        self.errors.push(class_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(n, _)| n.as_str())
    }

    pub fn param_exprs(&self) -> impl Iterator<Item = &TypeExpr> {
        self.params.iter().map(|(_, t)| t)
    }
}

/// An interface under declaration.
#[derive(Clone, Debug)]
pub struct InterfaceDecl {
    name: std::string::String,
    operations: Vec<OperationDecl>,
}

impl InterfaceDecl {
    fn new(name: std::string::String) -> InterfaceDecl {
        InterfaceDecl {
            name,
            operations: Vec::new(),
        }
    }

    pub fn operation(&mut self, name: impl Into<std::string::String>) -> &mut OperationDecl {
        self.operations.push(OperationDecl::new(name.into()));
        self.operations.last_mut().unwrap()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[OperationDecl] {
        &self.operations
    }
}

struct CoreClass {
    name: &'static str,
    base: Option<u16>,
    is_abstract: bool,
    fields: &'static [(&'static str, BuiltInKind)],
}

/// The error classes present in every schema, in well-known id order
/// starting at `TYPE_ID_DATABASE_ERROR`.
const CORE_ERROR_CLASSES: &[CoreClass] = &[
    CoreClass {
        name: "DatabaseError",
        base: None,
        is_abstract: true,
        fields: &[
            ("message", BuiltInKind::String),
            ("retryable", BuiltInKind::Bool),
        ],
    },
    CoreClass {
        name: "UnknownError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
    CoreClass {
        name: "ProtocolMismatchError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[
            ("operation", BuiltInKind::String),
            ("reason", BuiltInKind::String),
        ],
    },
    CoreClass {
        name: "ServiceUnknownError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[("service", BuiltInKind::String)],
    },
    CoreClass {
        name: "ConflictError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
    CoreClass {
        name: "UniquenessViolationError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
    CoreClass {
        name: "UnknownReferenceError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
    CoreClass {
        name: "InvalidArgumentError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
    CoreClass {
        name: "NotAllowedError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
    CoreClass {
        name: "BusyError",
        base: Some(TYPE_ID_DATABASE_ERROR),
        is_abstract: false,
        fields: &[],
    },
];

/// Discovers a protocol schema from class and interface declarations.
pub struct SchemaBuilder {
    classes: Vec<ClassDecl>,
    interfaces: Vec<InterfaceDecl>,
    limits: SchemaLimits,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        SchemaBuilder::new()
    }
}

impl SchemaBuilder {
    pub fn new() -> SchemaBuilder {
        SchemaBuilder::with_limits(SchemaLimits::default())
    }

    pub fn with_limits(limits: SchemaLimits) -> SchemaBuilder {
        SchemaBuilder {
            classes: Vec::new(),
            interfaces: Vec::new(),
            limits,
        }
    }

    /// Declare a class. Fields, base, and flags are added through the
    /// returned declaration.
    pub fn class(&mut self, name: impl Into<std::string::String>) -> &mut ClassDecl {
        self.classes.push(ClassDecl::new(name.into()));
        self.classes.last_mut().unwrap()
    }

    /// Declare an interface.
    pub fn interface(&mut self, name: impl Into<std::string::String>) -> &mut InterfaceDecl {
        self.interfaces.push(InterfaceDecl::new(name.into()));
        self.interfaces.last_mut().unwrap()
    }

    pub fn interface_decls(&self) -> &[InterfaceDecl] {
        &self.interfaces
    }

    /// Run the two-phase build and produce the immutable descriptor.
    pub fn finish(self) -> Result<ProtocolDescriptor, ValidationError> {
        let limits = self.limits;
        let mut types: Vec<ProtocolType> = Vec::new();
        let mut class_ids: HashMap<std::string::String, u16> = HashMap::new();

        // Built-in kinds occupy the leading ids.
        for kind in BuiltInKind::ALL {
            types.push(ProtocolType {
                id: kind.type_id(),
                def: TypeDef::BuiltIn(kind),
            });
        }

        // Core error classes at their well-known ids.
        for core in CORE_ERROR_CLASSES {
            let id = types.len() as u16;
            class_ids.insert(core.name.to_owned(), id);
            types.push(ProtocolType {
                id,
                def: TypeDef::Class(ProtocolClass {
                    name: core.name.to_owned(),
                    base: core.base,
                    is_abstract: core.is_abstract,
                    can_be_inherited: true,
                    properties: core
                        .fields
                        .iter()
                        .map(|(name, kind)| ProtocolProperty {
                            name: (*name).to_owned(),
                            type_id: kind.type_id(),
                            polymorphic: false,
                        })
                        .collect(),
                    descendants: Vec::new(),
                }),
            });
        }
        debug_assert_eq!(types.len() as u16, FIRST_USER_TYPE_ID);

        // Pass one: register every user class under a dense id.
        for decl in &self.classes {
            if decl.name.is_empty() {
                return Err(ValidationError::UnnamedApi);
            }
            if class_ids.contains_key(&decl.name) {
                return Err(ValidationError::DuplicateTypeName(decl.name.clone()));
            }
            let id = types.len() as u16;
            class_ids.insert(decl.name.clone(), id);
            types.push(ProtocolType {
                id,
                def: TypeDef::Class(ProtocolClass {
                    name: decl.name.clone(),
                    base: None,
                    is_abstract: decl.is_abstract,
                    can_be_inherited: !decl.sealed,
                    properties: Vec::new(),
                    descendants: Vec::new(),
                }),
            });
        }

        // Resolve bases and reject cycles before any chain walk.
        let decl_by_name: HashMap<&str, &ClassDecl> =
            self.classes.iter().map(|d| (d.name.as_str(), d)).collect();
        let mut bases: HashMap<u16, u16> = HashMap::new();
        for decl in &self.classes {
            let Some(base_name) = &decl.base else { continue };
            let class_id = class_ids[&decl.name];
            let base_id = match class_ids.get(base_name) {
                Some(id) => *id,
                None if BuiltInKind::ALL.iter().any(|k| k.name() == base_name.as_str()) => {
                    return Err(ValidationError::BaseClassBuiltIn {
                        class: decl.name.clone(),
                        base: base_name.clone(),
                    });
                }
                None => return Err(ValidationError::UnknownTypeName(base_name.clone())),
            };
            let base_sealed = decl_by_name
                .get(base_name.as_str())
                .map(|d| d.sealed)
                .unwrap_or(false);
            if base_sealed {
                return Err(ValidationError::BaseClassSealed {
                    class: decl.name.clone(),
                    base: base_name.clone(),
                });
            }
            bases.insert(class_id, base_id);
        }
        for decl in &self.classes {
            let mut seen = HashSet::new();
            let mut cursor = Some(class_ids[&decl.name]);
            while let Some(id) = cursor {
                if !seen.insert(id) {
                    return Err(ValidationError::InheritanceCycle(decl.name.clone()));
                }
                cursor = bases.get(&id).copied().or_else(|| match &types[id as usize].def {
                    TypeDef::Class(c) => c.base,
                    _ => None,
                });
            }
        }

        // Pass two: fill user class field lists, creating array types on
        // first encounter.
        let mut array_ids: HashMap<u16, u16> = HashMap::new();
        let mut pending: Vec<(u16, Vec<ProtocolProperty>)> = Vec::new();
        for decl in &self.classes {
            let class_id = class_ids[&decl.name];

            // Ancestor walk for duplicate field names and the cap. Field
            // names come straight from the declarations so no resolved
            // types are needed yet.
            let mut inherited: HashSet<std::string::String> = HashSet::new();
            let mut inherited_count = 0usize;
            let mut base_cursor = bases.get(&class_id).copied();
            while let Some(ancestor) = base_cursor {
                for name in own_field_names(&types, &decl_by_name, ancestor) {
                    inherited.insert(name);
                    inherited_count += 1;
                }
                base_cursor = bases.get(&ancestor).copied().or_else(|| {
                    match &types[ancestor as usize].def {
                        TypeDef::Class(c) => c.base,
                        _ => None,
                    }
                });
            }

            let mut own_names: HashSet<&str> = HashSet::new();
            let mut props = Vec::with_capacity(decl.fields.len());
            for (field_name, expr) in &decl.fields {
                if !own_names.insert(field_name.as_str()) || inherited.contains(field_name) {
                    return Err(ValidationError::DuplicateFieldName {
                        class: decl.name.clone(),
                        field: field_name.clone(),
                    });
                }
                let type_id = resolve_expr(expr, &class_ids, &mut array_ids, &mut types)?;
                props.push(ProtocolProperty {
                    name: field_name.clone(),
                    type_id,
                    polymorphic: false,
                });
            }

            let total = inherited_count + props.len();
            if total > limits.max_class_properties {
                return Err(ValidationError::MaxPropertyCountExceeded {
                    class: decl.name.clone(),
                    count: total,
                    max: limits.max_class_properties,
                });
            }
            pending.push((class_id, props));
        }
        for (class_id, props) in pending {
            if let TypeDef::Class(class) = &mut types[class_id as usize].def {
                class.base = bases.get(&class_id).copied();
                class.properties = props;
            }
        }

        // Interfaces and operations.
        let mut interfaces = Vec::with_capacity(self.interfaces.len());
        let mut interface_names: HashSet<&str> = HashSet::new();
        for (interface_id, decl) in self.interfaces.iter().enumerate() {
            if decl.name.is_empty() {
                return Err(ValidationError::UnnamedApi);
            }
            if !interface_names.insert(decl.name.as_str()) {
                return Err(ValidationError::DuplicateInterfaceName(decl.name.clone()));
            }
            let mut operations = Vec::with_capacity(decl.operations.len());
            let mut op_names: HashSet<&str> = HashSet::new();
            for (op_id, op) in decl.operations.iter().enumerate() {
                if !op_names.insert(op.name.as_str()) {
                    return Err(ValidationError::DuplicateOperationName {
                        interface: decl.name.clone(),
                        operation: op.name.clone(),
                    });
                }
                if op.params.len() > limits.max_request_args {
                    return Err(ValidationError::MaxParamCountExceeded {
                        operation: op.name.clone(),
                        count: op.params.len(),
                        max: limits.max_request_args,
                    });
                }
                let mut params = Vec::with_capacity(op.params.len());
                for (param_name, expr) in &op.params {
                    let type_id = resolve_expr(expr, &class_ids, &mut array_ids, &mut types)?;
                    params.push(ProtocolProperty {
                        name: param_name.clone(),
                        type_id,
                        polymorphic: false,
                    });
                }
                let return_type = ProtocolProperty {
                    name: "return".to_owned(),
                    type_id: resolve_expr(&op.returns, &class_ids, &mut array_ids, &mut types)?,
                    polymorphic: false,
                };
                let mut error_types = Vec::with_capacity(op.errors.len());
                for error_name in &op.errors {
                    let Some(&error_id) = class_ids.get(error_name) else {
                        return Err(ValidationError::UnknownTypeName(error_name.clone()));
                    };
                    error_types.push(error_id);
                }
                operations.push(ProtocolOperation {
                    id: op_id as u16,
                    name: op.name.clone(),
                    params,
                    return_type,
                    kind: op.kind,
                    graph: op.graph,
                    error_types,
                });
            }
            interfaces.push(ProtocolInterface {
                id: interface_id as u16,
                name: decl.name.clone(),
                operations,
            });
        }

        if types.len() > limits.max_type_count {
            return Err(ValidationError::MaxTypeCountExceeded {
                count: types.len(),
                max: limits.max_type_count,
            });
        }

        let mut descriptor = ProtocolDescriptor::assemble(Guid::ZERO, interfaces, types)
            .map_err(|_| ValidationError::InheritanceCycle("<schema>".to_owned()))?;

        // Declared error types must derive the error base class.
        for interface in &descriptor.interfaces {
            for op in &interface.operations {
                for &error_id in &op.error_types {
                    if !descriptor.derives_error_base(error_id) {
                        return Err(ValidationError::InvalidErrorBaseType(
                            descriptor.type_name(error_id),
                        ));
                    }
                }
            }
        }

        apply_polymorphism(&mut descriptor);
        descriptor.version = compute_version(&descriptor);
        Ok(descriptor)
    }
}

/// Field names a class declares on itself: core classes carry them in
/// their registered properties, user classes in their declarations.
fn own_field_names(
    types: &[ProtocolType],
    decl_by_name: &HashMap<&str, &ClassDecl>,
    id: u16,
) -> Vec<std::string::String> {
    match &types[id as usize].def {
        TypeDef::Class(c) if !c.properties.is_empty() => {
            c.properties.iter().map(|p| p.name.clone()).collect()
        }
        TypeDef::Class(c) => decl_by_name
            .get(c.name.as_str())
            .map(|d| d.fields.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn resolve_expr(
    expr: &TypeExpr,
    class_ids: &HashMap<std::string::String, u16>,
    array_ids: &mut HashMap<u16, u16>,
    types: &mut Vec<ProtocolType>,
) -> Result<u16, ValidationError> {
    if let Some(kind) = expr.built_in() {
        return Ok(kind.type_id());
    }
    match expr {
        TypeExpr::Class(name) => class_ids
            .get(name)
            .copied()
            .ok_or_else(|| ValidationError::UnknownTypeName(name.clone())),
        TypeExpr::Array(element) => {
            let element_id = resolve_expr(element, class_ids, array_ids, types)?;
            if let Some(&id) = array_ids.get(&element_id) {
                return Ok(id);
            }
            let id = types.len() as u16;
            types.push(ProtocolType {
                id,
                def: TypeDef::Array { element: element_id },
            });
            array_ids.insert(element_id, id);
            Ok(id)
        }
        _ => unreachable!("built-in handled above"),
    }
}

/// Mark every class-typed slot whose declared class has descendants.
fn apply_polymorphism(descriptor: &mut ProtocolDescriptor) {
    let polymorphic: HashSet<u16> = descriptor
        .types
        .iter()
        .filter_map(|t| match &t.def {
            TypeDef::Class(c) if !c.descendants.is_empty() => Some(t.id),
            _ => None,
        })
        .collect();
    let mark = |prop: &mut ProtocolProperty| {
        prop.polymorphic = polymorphic.contains(&prop.type_id);
    };
    for ty in &mut descriptor.types {
        if let TypeDef::Class(class) = &mut ty.def {
            class.properties.iter_mut().for_each(mark);
        }
    }
    for interface in &mut descriptor.interfaces {
        for op in &mut interface.operations {
            op.params.iter_mut().for_each(mark);
            mark(&mut op.return_type);
        }
    }
}

/// Content-derived version stamp: hash of the canonical serialization
/// with the version field zeroed, truncated to 16 bytes. Two builds of
/// the same definition produce the same stamp on any machine.
fn compute_version(descriptor: &ProtocolDescriptor) -> Guid {
    let mut canonical = descriptor.clone();
    canonical.version = Guid::ZERO;

    let pool = ChunkPool::new(1 << 20, 64 * 1024).expect("hash pool sizes are valid");
    let mut writer = MessageWriter::new(pool, 0);
    encode_descriptor(&mut writer, &canonical);
    let chunks = writer.finish();

    let mut hasher = blake3::Hasher::new();
    for chunk in &chunks {
        hasher.update(chunk.payload());
    }
    let hash = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[0..16]);
    Guid::from_bytes(bytes)
}
