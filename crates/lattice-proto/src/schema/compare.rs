//! Structural descriptor comparison
//!
//! Two descriptors are compatible when every operation whose name exists
//! on both sides has the same signature: parameter types, return type,
//! and declared error types, compared recursively through referenced
//! classes. Ids are ignored entirely; classes are matched by name.
//! Cycles in the class graph are resolved with an already-visited set.

use std::collections::HashSet;

use super::{ProtocolDescriptor, ProtocolOperation, TypeDef};

/// Outcome of comparing two descriptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Match,
    Mismatch(MismatchDetail),
}

/// The first offending operation found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MismatchDetail {
    pub interface: String,
    pub operation: String,
    pub reason: String,
}

impl MismatchDetail {
    /// `Interface.Operation`, the path carried in mismatch errors.
    pub fn operation_path(&self) -> String {
        format!("{}.{}", self.interface, self.operation)
    }
}

/// Compare two descriptors structurally. Commutative: operations present
/// on only one side are ignored in both directions.
pub fn compare_descriptors(a: &ProtocolDescriptor, b: &ProtocolDescriptor) -> CompareResult {
    for a_iface in &a.interfaces {
        let Some(b_iface) = b.interface_by_name(&a_iface.name) else {
            continue;
        };
        for a_op in &a_iface.operations {
            let Some(b_op) = b_iface.operations.iter().find(|o| o.name == a_op.name) else {
                continue;
            };
            if let Some(reason) = compare_operation(a, a_op, b, b_op) {
                return CompareResult::Mismatch(MismatchDetail {
                    interface: a_iface.name.clone(),
                    operation: a_op.name.clone(),
                    reason,
                });
            }
        }
    }
    CompareResult::Match
}

fn compare_operation(
    a: &ProtocolDescriptor,
    a_op: &ProtocolOperation,
    b: &ProtocolDescriptor,
    b_op: &ProtocolOperation,
) -> Option<String> {
    if a_op.params.len() != b_op.params.len() {
        return Some("paramCount".to_owned());
    }
    let mut visited = HashSet::new();
    for (a_param, b_param) in a_op.params.iter().zip(&b_op.params) {
        if !types_equal(a, a_param.type_id, b, b_param.type_id, &mut visited) {
            return Some(format!("param:{}", a_param.name));
        }
    }
    if !types_equal(
        a,
        a_op.return_type.type_id,
        b,
        b_op.return_type.type_id,
        &mut visited,
    ) {
        return Some("returnType".to_owned());
    }
    if a_op.kind != b_op.kind {
        return Some("operationKind".to_owned());
    }
    if a_op.graph != b_op.graph {
        return Some("graphSupport".to_owned());
    }

    // Error sets are matched by class name, then structurally.
    if a_op.error_types.len() != b_op.error_types.len() {
        return Some("errorTypes".to_owned());
    }
    for &a_err in &a_op.error_types {
        let a_name = a.type_name(a_err);
        let Some(&b_err) = b_op
            .error_types
            .iter()
            .find(|&&id| b.type_name(id) == a_name)
        else {
            return Some("errorTypes".to_owned());
        };
        if !types_equal(a, a_err, b, b_err, &mut visited) {
            return Some("errorTypes".to_owned());
        }
    }
    None
}

fn types_equal(
    a: &ProtocolDescriptor,
    a_id: u16,
    b: &ProtocolDescriptor,
    b_id: u16,
    visited: &mut HashSet<(u16, u16)>,
) -> bool {
    match (a.type_def(a_id), b.type_def(b_id)) {
        (Some(TypeDef::BuiltIn(x)), Some(TypeDef::BuiltIn(y))) => x == y,
        (Some(TypeDef::Array { element: ea }), Some(TypeDef::Array { element: eb })) => {
            types_equal(a, *ea, b, *eb, visited)
        }
        (Some(TypeDef::Class(ca)), Some(TypeDef::Class(cb))) => {
            if ca.name != cb.name || ca.is_abstract != cb.is_abstract {
                return false;
            }
            // Revisit means this pair is already being compared higher in
            // the stack; assume equal to terminate cycles.
            if !visited.insert((a_id, b_id)) {
                return true;
            }
            let a_props = a.flattened_properties(a_id);
            let b_props = b.flattened_properties(b_id);
            if a_props.len() != b_props.len() {
                return false;
            }
            a_props.iter().zip(&b_props).all(|(pa, pb)| {
                pa.name == pb.name && types_equal(a, pa.type_id, b, pb.type_id, visited)
            })
        }
        _ => false,
    }
}
