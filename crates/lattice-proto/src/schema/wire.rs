//! Descriptor wire codec
//!
//! Descriptors are exchanged once per connection, on Connect. The
//! encoding is also the canonical byte stream hashed into the version
//! stamp, so it must stay deterministic: interfaces, operations, and
//! types are written in id order, names as non-null strings.

use crate::error::WireError;
use crate::reader::MessageReader;
use crate::types::BuiltInKind;
use crate::writer::MessageWriter;

use super::{
    GraphSupport, OperationKind, ProtocolClass, ProtocolDescriptor, ProtocolInterface,
    ProtocolOperation, ProtocolProperty, ProtocolType, TypeDef,
};

const TYPE_TAG_BUILT_IN: u8 = 0;
const TYPE_TAG_CLASS: u8 = 1;
const TYPE_TAG_ARRAY: u8 = 2;

const CLASS_FLAG_ABSTRACT: u8 = 0b0000_0001;
const CLASS_FLAG_INHERITABLE: u8 = 0b0000_0010;

const PROP_FLAG_POLYMORPHIC: u8 = 0b0000_0001;

/// Serialize a descriptor.
pub fn encode_descriptor(w: &mut MessageWriter, d: &ProtocolDescriptor) {
    w.write_guid(d.version);

    w.write_u32(d.interfaces.len() as u32);
    for interface in &d.interfaces {
        w.write_u16(interface.id);
        w.write_string(Some(&interface.name));
        w.write_u32(interface.operations.len() as u32);
        for op in &interface.operations {
            encode_operation(w, op);
        }
    }

    w.write_u32(d.types.len() as u32);
    for ty in &d.types {
        w.write_u16(ty.id);
        match &ty.def {
            TypeDef::BuiltIn(kind) => {
                w.write_u8(TYPE_TAG_BUILT_IN);
                w.write_u8(*kind as u8);
            }
            TypeDef::Class(class) => {
                w.write_u8(TYPE_TAG_CLASS);
                encode_class(w, class);
            }
            TypeDef::Array { element } => {
                w.write_u8(TYPE_TAG_ARRAY);
                w.write_u16(*element);
            }
        }
    }
}

fn encode_operation(w: &mut MessageWriter, op: &ProtocolOperation) {
    w.write_u16(op.id);
    w.write_string(Some(&op.name));
    w.write_u8(op.kind as u8);
    w.write_u8(op.graph.to_bits());
    w.write_u8(op.params.len() as u8);
    for param in &op.params {
        encode_property(w, param);
    }
    encode_property(w, &op.return_type);
    w.write_u8(op.error_types.len() as u8);
    for error_id in &op.error_types {
        w.write_u16(*error_id);
    }
}

fn encode_property(w: &mut MessageWriter, prop: &ProtocolProperty) {
    w.write_string(Some(&prop.name));
    w.write_u16(prop.type_id);
    w.write_u8(if prop.polymorphic { PROP_FLAG_POLYMORPHIC } else { 0 });
}

fn encode_class(w: &mut MessageWriter, class: &ProtocolClass) {
    w.write_string(Some(&class.name));
    let mut flags = 0u8;
    if class.is_abstract {
        flags |= CLASS_FLAG_ABSTRACT;
    }
    if class.can_be_inherited {
        flags |= CLASS_FLAG_INHERITABLE;
    }
    w.write_u8(flags);
    match class.base {
        Some(base) => {
            w.write_bool(true);
            w.write_u16(base);
        }
        None => w.write_bool(false),
    }
    w.write_u16(class.properties.len() as u16);
    for prop in &class.properties {
        encode_property(w, prop);
    }
}

/// Deserialize and validate a descriptor.
pub fn decode_descriptor(r: &mut MessageReader) -> Result<ProtocolDescriptor, WireError> {
    let version = r.read_guid()?;

    let interface_count = r.read_u32()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count.min(1024));
    for _ in 0..interface_count {
        let id = r.read_u16()?;
        let name = read_name(r)?;
        let op_count = r.read_u32()? as usize;
        let mut operations = Vec::with_capacity(op_count.min(1024));
        for _ in 0..op_count {
            operations.push(decode_operation(r)?);
        }
        interfaces.push(ProtocolInterface { id, name, operations });
    }

    let type_count = r.read_u32()? as usize;
    let mut types = Vec::with_capacity(type_count.min(4096));
    for _ in 0..type_count {
        let id = r.read_u16()?;
        let def = match r.read_u8()? {
            TYPE_TAG_BUILT_IN => {
                let tag = r.read_u8()?;
                let kind = BuiltInKind::from_tag(tag)
                    .ok_or(WireError::InvalidTag { what: "builtin kind", tag })?;
                TypeDef::BuiltIn(kind)
            }
            TYPE_TAG_CLASS => TypeDef::Class(decode_class(r)?),
            TYPE_TAG_ARRAY => TypeDef::Array { element: r.read_u16()? },
            tag => return Err(WireError::InvalidTag { what: "type def", tag }),
        };
        types.push(ProtocolType { id, def });
    }

    ProtocolDescriptor::assemble(version, interfaces, types)
}

fn decode_operation(r: &mut MessageReader) -> Result<ProtocolOperation, WireError> {
    let id = r.read_u16()?;
    let name = read_name(r)?;
    let kind_tag = r.read_u8()?;
    let kind = OperationKind::from_tag(kind_tag)
        .ok_or(WireError::InvalidTag { what: "operation kind", tag: kind_tag })?;
    let graph_tag = r.read_u8()?;
    let graph = GraphSupport::from_bits(graph_tag)
        .ok_or(WireError::InvalidTag { what: "graph support", tag: graph_tag })?;

    let param_count = r.read_u8()? as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        params.push(decode_property(r)?);
    }
    let return_type = decode_property(r)?;

    let error_count = r.read_u8()? as usize;
    let mut error_types = Vec::with_capacity(error_count);
    for _ in 0..error_count {
        error_types.push(r.read_u16()?);
    }

    Ok(ProtocolOperation {
        id,
        name,
        params,
        return_type,
        kind,
        graph,
        error_types,
    })
}

fn decode_property(r: &mut MessageReader) -> Result<ProtocolProperty, WireError> {
    let name = read_name(r)?;
    let type_id = r.read_u16()?;
    let flags = r.read_u8()?;
    if flags & !PROP_FLAG_POLYMORPHIC != 0 {
        return Err(WireError::InvalidTag { what: "property flags", tag: flags });
    }
    Ok(ProtocolProperty {
        name,
        type_id,
        polymorphic: flags & PROP_FLAG_POLYMORPHIC != 0,
    })
}

fn decode_class(r: &mut MessageReader) -> Result<ProtocolClass, WireError> {
    let name = read_name(r)?;
    let flags = r.read_u8()?;
    if flags & !(CLASS_FLAG_ABSTRACT | CLASS_FLAG_INHERITABLE) != 0 {
        return Err(WireError::InvalidTag { what: "class flags", tag: flags });
    }
    let base = if r.read_bool()? { Some(r.read_u16()?) } else { None };
    let prop_count = r.read_u16()? as usize;
    let mut properties = Vec::with_capacity(prop_count);
    for _ in 0..prop_count {
        properties.push(decode_property(r)?);
    }
    Ok(ProtocolClass {
        name,
        base,
        is_abstract: flags & CLASS_FLAG_ABSTRACT != 0,
        can_be_inherited: flags & CLASS_FLAG_INHERITABLE != 0,
        properties,
        descendants: Vec::new(),
    })
}

fn read_name(r: &mut MessageReader) -> Result<String, WireError> {
    r.read_string()?
        .ok_or(WireError::CorruptMessage("null name in descriptor"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPool;
    use crate::schema::{compare_descriptors, CompareResult, SchemaBuilder, TypeExpr};

    fn sample_descriptor() -> ProtocolDescriptor {
        let mut b = SchemaBuilder::new();
        b.class("Shape").abstract_().field("tag", TypeExpr::I32);
        b.class("Circle").extends("Shape").field("radius", TypeExpr::F64);
        b.class("Scene")
            .field("shapes", TypeExpr::array(TypeExpr::class("Shape")))
            .field("name", TypeExpr::String);
        b.interface("Gallery")
            .operation("Store")
            .param("scene", TypeExpr::class("Scene"))
            .returns(TypeExpr::Guid)
            .error("ConflictError");
        b.finish().unwrap()
    }

    fn roundtrip(d: &ProtocolDescriptor) -> ProtocolDescriptor {
        let pool = ChunkPool::new(256, 1024).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        encode_descriptor(&mut writer, d);
        let mut reader = MessageReader::new(writer.finish()).unwrap();
        let decoded = decode_descriptor(&mut reader).unwrap();
        assert!(reader.at_end());
        decoded
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let original = sample_descriptor();
        let decoded = roundtrip(&original);
        assert_eq!(decoded.version, original.version);
        assert_eq!(decoded.interfaces.len(), original.interfaces.len());
        assert_eq!(decoded.types.len(), original.types.len());
        assert_eq!(compare_descriptors(&original, &decoded), CompareResult::Match);
    }

    #[test]
    fn test_descendants_recomputed_on_decode() {
        let decoded = roundtrip(&sample_descriptor());
        let shape_id = decoded
            .types
            .iter()
            .find_map(|t| match &t.def {
                TypeDef::Class(c) if c.name == "Shape" => Some(t.id),
                _ => None,
            })
            .unwrap();
        assert_eq!(decoded.class(shape_id).unwrap().descendants.len(), 1);
    }

    #[test]
    fn test_corrupt_type_tag_rejected() {
        let pool = ChunkPool::new(256, 1024).unwrap();
        let mut writer = MessageWriter::new(pool, 1);
        let d = sample_descriptor();
        writer.write_guid(d.version);
        writer.write_u32(0); // no interfaces
        writer.write_u32(1); // one type
        writer.write_u16(0);
        writer.write_u8(9); // invalid type tag
        let mut reader = MessageReader::new(writer.finish()).unwrap();
        assert!(matches!(
            decode_descriptor(&mut reader),
            Err(WireError::InvalidTag { what: "type def", .. })
        ));
    }
}
