#![forbid(unsafe_code)]

//! Sample-driven type inference. Modules are executed once against their
//! sample inputs; every binding the run observes lands in the [`Registry`],
//! which the code generator then treats as the program's static types.

use std::collections::HashMap;
use std::rc::Rc;

use hutch_ast::Phrase;
use miette::Diagnostic;
use thiserror::Error;

mod builtins;
mod eval;
mod registry;
mod scope;
mod ty;
mod value;

pub use eval::{Exit, Flow, Interp};
pub use registry::{JoinError, Registry};
pub use scope::{ScopeData, ScopeRef, can_find, find, new_scope};
pub use ty::Ty;
pub use value::{ArgCast, Value, describe, display_value, truthy, type_of, value_eq};

#[derive(Debug, Error, Diagnostic)]
pub enum InferError {
    #[error("name `{name}` is not defined in scope `{scope}`")]
    #[diagnostic(code(hutch::infer::missing_name))]
    MissingName { name: String, scope: String },

    #[error("conflicting types for `{name}` in `{scope}`: {left} vs {right}")]
    #[diagnostic(code(hutch::infer::join))]
    Join {
        scope: String,
        name: String,
        left: String,
        right: String,
    },

    #[error("inconsistent indentation at statement {index} of module `{module}`")]
    #[diagnostic(code(hutch::infer::indent))]
    Indent { module: String, index: usize },

    #[error("cannot load module `{module}`: {message}")]
    #[diagnostic(code(hutch::infer::import))]
    Import { module: String, message: String },

    #[error("call into `{scope}` expects {expected} arguments, got {got}")]
    #[diagnostic(code(hutch::infer::arity))]
    Arity {
        scope: String,
        expected: usize,
        got: usize,
    },

    #[error("unsupported in `{scope}`: {construct}")]
    #[diagnostic(code(hutch::infer::unsupported))]
    Unsupported { scope: String, construct: String },

    #[error("sample execution failed: {message}")]
    #[diagnostic(code(hutch::infer::sample))]
    Sample { message: String },
}

/// A scanned module body, shared by every function value defined in it.
pub struct ModuleCode {
    pub name: String,
    pub phrases: Vec<Phrase>,
}

/// What a [`ModuleSource`] hands back for one module: its scanned phrases
/// and the sample input its `sys.stdin.read()` returns.
pub struct ModuleInput {
    pub phrases: Vec<Phrase>,
    pub sample: String,
}

/// Resolves module names to source; the CLI backs this with the filesystem,
/// tests with an in-memory map.
pub trait ModuleSource {
    fn load(&self, name: &str) -> Result<ModuleInput, InferError>;
}

/// One inference run over an entry module and everything it imports.
#[derive(Default)]
pub struct Session {
    pub registry: Registry,
    pub modules: HashMap<String, Rc<ModuleCode>>,
    pub scopes: HashMap<String, ScopeRef>,
    /// module names in dependency order, the entry module last
    pub order: Vec<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes the entry module (and, transitively, its imports) against
    /// the sample inputs, recording types as a side effect.
    pub fn infer(&mut self, source: &dyn ModuleSource, entry: &str) -> Result<(), InferError> {
        Interp::new(self, source).load_module(entry)?;
        Ok(())
    }

    /// Seals the registry for code generation.
    pub fn freeze(&mut self) {
        self.registry.freeze();
    }
}
