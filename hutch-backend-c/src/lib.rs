#![forbid(unsafe_code)]

//! C code generation from a frozen inference session. The output is one
//! self-contained translation unit: runtime declarations, struct and
//! prototype declarations, the literal-string table, one function per unit,
//! and per-module load/clean entry points.

use hutch_infer::Session;
use miette::Diagnostic;
use thiserror::Error;

mod ctype;
mod define;
mod expr;
mod names;
mod runtime;
mod stmt;

pub use ctype::{CTy, cty_name, ty_name};
pub use define::declare;
pub use names::mangle;
pub use runtime::RUNTIME_HEADER;

#[derive(Debug, Error, Diagnostic)]
pub enum CodegenError {
    #[error("cannot lower in `{scope}`: {construct}")]
    #[diagnostic(code(hutch::codegen::unsupported))]
    Unsupported { scope: String, construct: String },

    #[error("no C representation for type `{ty}` in `{scope}`")]
    #[diagnostic(code(hutch::codegen::ty))]
    Type { scope: String, ty: String },

    #[error("name `{name}` is not defined in `{scope}`")]
    #[diagnostic(code(hutch::codegen::missing_name))]
    MissingName { name: String, scope: String },
}

/// The generated program, split so the driver can route pieces to separate
/// files.
#[derive(Debug)]
pub struct CArtifacts {
    /// struct forward declarations, shape/record definitions, prototypes
    pub declarations: String,
    /// string table plus all compiled functions and module storage
    pub program: String,
    /// standalone entry point loading every module in dependency order
    pub main: String,
}

/// Lowers a frozen session into C.
pub fn lower(session: &Session) -> Result<CArtifacts, CodegenError> {
    debug_assert!(session.registry.is_frozen());
    let declarations = define::declare(session)?;
    let program = stmt::compile(session)?;
    let main = stmt::print_main(&session.order);
    Ok(CArtifacts {
        declarations,
        program,
        main,
    })
}
