//! Lexical scopes for the sample-driven evaluator. Scopes are shared (an
//! instance value and the evaluator both hold the same scope), so they live
//! behind `Rc<RefCell<_>>`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use hutch_ast::ScopeId;

use crate::value::Value;

pub type ScopeRef = Rc<RefCell<ScopeData>>;

pub struct ScopeData {
    pub parent: Option<ScopeRef>,
    pub vars: HashMap<String, Value>,
    /// names currently narrowed by an enclosing `cast` block
    casts: HashSet<String>,
    cast_stack: Vec<HashSet<String>>,
    pub is_instance: bool,
    pub scope_id: ScopeId,
}

pub fn new_scope(parent: Option<ScopeRef>, is_instance: bool, scope_id: ScopeId) -> ScopeRef {
    Rc::new(RefCell::new(ScopeData {
        parent,
        vars: HashMap::new(),
        casts: HashSet::new(),
        cast_stack: Vec::new(),
        is_instance,
        scope_id,
    }))
}

impl ScopeData {
    pub fn push_casts(&mut self, names: &[String]) {
        self.cast_stack.push(self.casts.clone());
        self.casts.extend(names.iter().cloned());
    }

    pub fn pop_casts(&mut self) {
        if let Some(prev) = self.cast_stack.pop() {
            self.casts = prev;
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.get(name) {
            if self.casts.contains(name) {
                return Some(cast_payload(v));
            }
            return Some(v.clone());
        }
        None
    }
}

/// A `cast` read sees through the opaque wrapper of a `ref` parameter.
fn cast_payload(v: &Value) -> Value {
    match v {
        Value::Opaque(inner) => (**inner).clone(),
        other => other.clone(),
    }
}

/// Walks the parent chain; applies cast narrowing at the defining scope.
pub fn find(scope: &ScopeRef, name: &str) -> Option<Value> {
    let data = scope.borrow();
    if let Some(v) = data.lookup(name) {
        return Some(v);
    }
    let parent = data.parent.clone()?;
    drop(data);
    find(&parent, name)
}

pub fn can_find(scope: &ScopeRef, name: &str) -> bool {
    find(scope, name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn find_walks_parent_chain() {
        let root = new_scope(None, false, "main".into());
        root.borrow_mut().vars.insert("x".into(), Value::Num(1.0));
        let child = new_scope(Some(root), false, "main:1".into());
        assert!(matches!(find(&child, "x"), Some(Value::Num(_))));
        assert!(find(&child, "y").is_none());
    }

    #[test]
    fn cast_reads_see_the_payload() {
        let scope = new_scope(None, false, "main:1".into());
        scope.borrow_mut().vars.insert(
            "p".into(),
            Value::Opaque(Rc::new(Value::Num(2.0))),
        );
        assert!(matches!(find(&scope, "p"), Some(Value::Opaque(_))));

        scope.borrow_mut().push_casts(&["p".to_string()]);
        assert!(matches!(find(&scope, "p"), Some(Value::Num(_))));

        scope.borrow_mut().pop_casts();
        assert!(matches!(find(&scope, "p"), Some(Value::Opaque(_))));
    }
}
