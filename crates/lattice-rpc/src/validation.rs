//! Host-time service validation
//!
//! Shape rules checked once at `host_service`, before any schema build
//! or table generation. Schema-level rules (duplicate type names,
//! inheritance problems, caps) live in the schema builder itself; this
//! module checks what only the host knows: naming, the configured
//! context parameter, and implementation coverage.

use lattice_proto::{TypeExpr, ValidationError};

use crate::service::ServiceDefinition;

/// Host-configured validation options.
#[derive(Clone, Debug, Default)]
pub struct ValidationOptions {
    /// When set, every operation must declare this leading parameter
    /// (name and type) before its own arguments.
    pub required_context_param: Option<(String, TypeExpr)>,
}

/// Validate a definition against the host's rules.
pub fn validate_definition(
    definition: &ServiceDefinition,
    options: &ValidationOptions,
) -> Result<(), ValidationError> {
    if definition.name().is_empty() {
        return Err(ValidationError::UnnamedApi);
    }

    for interface in definition.schema().interface_decls() {
        for op in interface.operations() {
            if let Some((ctx_name, ctx_type)) = &options.required_context_param {
                let first = op.param_names().next().zip(op.param_exprs().next());
                let matches = first
                    .map(|(name, expr)| name == ctx_name && expr == ctx_type)
                    .unwrap_or(false);
                if !matches {
                    return Err(ValidationError::MissingContextParam {
                        operation: format!("{}.{}", interface.name(), op.name()),
                    });
                }
            }
            if definition.handler(interface.name(), op.name()).is_none() {
                return Err(ValidationError::MissingOperationImpl(format!(
                    "{}.{}",
                    interface.name(),
                    op.name()
                )));
            }
        }
    }
    Ok(())
}
