//! Ambient bindings every module root receives before its body runs.

use std::rc::Rc;

use crate::scope::{ScopeRef, new_scope};
use crate::value::{Builtin, ModuleVal, Value};

/// Synthesized `sys` module whose `stdin.read()` returns the sample input.
pub fn sys_module(sample: &str) -> Value {
    let read: Rc<str> = sample.into();
    let stdin = new_scope(None, false, "stdin".into());
    stdin
        .borrow_mut()
        .vars
        .insert("read".into(), Value::Builtin(Builtin::StdinRead(read)));

    let sys = new_scope(None, false, "sys".into());
    sys.borrow_mut().vars.insert(
        "stdin".into(),
        Value::Module(Rc::new(ModuleVal { scope: stdin })),
    );
    Value::Module(Rc::new(ModuleVal { scope: sys }))
}

/// Installs the builtins directly into the module scope's variable map;
/// they bypass the registry because builtins have no recordable type.
pub fn install(scope: &ScopeRef, sample: &str) {
    let mut data = scope.borrow_mut();
    data.vars.insert("print".into(), Value::Builtin(Builtin::Print));
    data.vars.insert("len".into(), Value::Builtin(Builtin::Len));
    data.vars.insert("range".into(), Value::Builtin(Builtin::Range));
    data.vars.insert("str".into(), Value::Builtin(Builtin::Str));
    data.vars.insert("ord".into(), Value::Builtin(Builtin::Ord));
    data.vars.insert("chr".into(), Value::Builtin(Builtin::Chr));
    data.vars.insert("sys".into(), sys_module(sample));
    data.vars
        .insert("__name__".into(), Value::Str("__main__".into()));
    data.vars
        .insert("__main__".into(), Value::Str("__main__".into()));
}
