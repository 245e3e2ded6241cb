//! The type registry: everything inference records and codegen reads.
//! Append-only while inference runs; `freeze` interns tuple shapes and makes
//! the registry read-only.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hutch_ast::ScopeId;

use crate::ty::Ty;
use crate::value::ArgCast;

/// Incompatible join, reported by the caller with binding context attached.
#[derive(Debug)]
pub struct JoinError {
    pub left: Ty,
    pub right: Ty,
}

#[derive(Default)]
pub struct Registry {
    /// scope id → name → inferred type; the empty name is the return slot
    types: BTreeMap<ScopeId, BTreeMap<String, Ty>>,
    /// container element slots: `list_items:PID`, `dict_keys:PID`,
    /// `dict_values:PID`, `set_elements:PID`
    containers: BTreeMap<String, Ty>,
    generators: BTreeSet<ScopeId>,
    func_args: BTreeMap<ScopeId, Vec<String>>,
    args_cast: BTreeMap<ScopeId, Vec<Option<ArgCast>>>,
    interfaces: BTreeMap<ScopeId, BTreeSet<ScopeId>>,
    constructors: BTreeSet<ScopeId>,
    shapes: Vec<Vec<Ty>>,
    shape_ids: HashMap<Vec<Ty>, usize>,
    frozen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scope(&mut self, scope: &str) {
        debug_assert!(!self.frozen);
        self.types.entry(scope.to_string()).or_default();
    }

    pub fn update(&mut self, scope: &str, name: &str, ty: Ty) -> Result<(), JoinError> {
        debug_assert!(!self.frozen);
        let bag = self.types.entry(scope.to_string()).or_default();
        match bag.get(name) {
            Option::None => {
                bag.insert(name.to_string(), ty);
            }
            Some(old) => {
                let merged = old.join(&ty).ok_or_else(|| JoinError {
                    left: old.clone(),
                    right: ty.clone(),
                })?;
                bag.insert(name.to_string(), merged);
            }
        }
        Ok(())
    }

    pub fn update_container(&mut self, slot: &str, ty: Ty) -> Result<(), JoinError> {
        debug_assert!(!self.frozen);
        match self.containers.get(slot) {
            Option::None => {
                self.containers.insert(slot.to_string(), ty);
            }
            Some(old) => {
                let merged = old.join(&ty).ok_or_else(|| JoinError {
                    left: old.clone(),
                    right: ty.clone(),
                })?;
                self.containers.insert(slot.to_string(), merged);
            }
        }
        Ok(())
    }

    pub fn set_func_args(&mut self, scope: &str, args: Vec<String>, casts: Vec<Option<ArgCast>>) {
        debug_assert!(!self.frozen);
        self.func_args.insert(scope.to_string(), args);
        self.args_cast.insert(scope.to_string(), casts);
    }

    pub fn mark_generator(&mut self, scope: &str) {
        debug_assert!(!self.frozen);
        self.generators.insert(scope.to_string());
    }

    pub fn add_interface(&mut self, scope: &str) {
        debug_assert!(!self.frozen);
        self.interfaces.entry(scope.to_string()).or_default();
    }

    pub fn add_implementation(&mut self, interface: &str, instance: &str) {
        debug_assert!(!self.frozen);
        self.interfaces
            .entry(interface.to_string())
            .or_default()
            .insert(instance.to_string());
    }

    pub fn add_constructor(&mut self, scope: &str) {
        debug_assert!(!self.frozen);
        self.constructors.insert(scope.to_string());
    }

    /// Interns structural tuples into the shape table and seals the registry.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        let types = std::mem::take(&mut self.types);
        self.types = types
            .into_iter()
            .map(|(scope, bag)| {
                let bag = bag
                    .into_iter()
                    .map(|(name, ty)| (name, intern(ty, &mut self.shapes, &mut self.shape_ids)))
                    .collect();
                (scope, bag)
            })
            .collect();
        let containers = std::mem::take(&mut self.containers);
        self.containers = containers
            .into_iter()
            .map(|(slot, ty)| (slot, intern(ty, &mut self.shapes, &mut self.shape_ids)))
            .collect();
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn scopes(&self) -> impl Iterator<Item = &ScopeId> {
        self.types.keys()
    }

    /// A scope exists once anything was recorded in it; unexecuted units
    /// never materialize one.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.types.contains_key(scope)
    }

    pub fn names_in(&self, scope: &str) -> impl Iterator<Item = (&String, &Ty)> {
        self.types.get(scope).into_iter().flatten()
    }

    pub fn ty_of(&self, scope: &str, name: &str) -> Option<&Ty> {
        self.types.get(scope)?.get(name)
    }

    pub fn container(&self, slot: &str) -> Option<&Ty> {
        self.containers.get(slot)
    }

    pub fn containers(&self) -> impl Iterator<Item = (&String, &Ty)> {
        self.containers.iter()
    }

    pub fn is_generator(&self, scope: &str) -> bool {
        self.generators.contains(scope)
    }

    pub fn generators(&self) -> impl Iterator<Item = &ScopeId> {
        self.generators.iter()
    }

    pub fn func_args(&self, scope: &str) -> Option<&[String]> {
        self.func_args.get(scope).map(Vec::as_slice)
    }

    pub fn args_cast(&self, scope: &str) -> Option<&[Option<ArgCast>]> {
        self.args_cast.get(scope).map(Vec::as_slice)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (&ScopeId, &BTreeSet<ScopeId>)> {
        self.interfaces.iter()
    }

    pub fn is_constructor(&self, scope: &str) -> bool {
        self.constructors.contains(scope)
    }

    pub fn shapes(&self) -> &[Vec<Ty>] {
        &self.shapes
    }

    pub fn shape(&self, id: usize) -> Option<&[Ty]> {
        self.shapes.get(id).map(Vec::as_slice)
    }

    /// Snapshot used by the idempotence tests.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (scope, bag) in &self.types {
            for (name, ty) in bag {
                out.push_str(&format!("{scope} | {name} : {ty}\n"));
            }
        }
        for (slot, ty) in &self.containers {
            out.push_str(&format!("container {slot} : {ty}\n"));
        }
        out
    }
}

/// Bottom-up shape interning: nested tuples become shape references first,
/// so structurally identical sequences share one id.
fn intern(ty: Ty, shapes: &mut Vec<Vec<Ty>>, ids: &mut HashMap<Vec<Ty>, usize>) -> Ty {
    match ty {
        Ty::Tuple(elems) => {
            let elems: Vec<Ty> = elems
                .into_iter()
                .map(|e| intern(e, shapes, ids))
                .collect();
            if let Some(&id) = ids.get(&elems) {
                return Ty::Shape(id);
            }
            let id = shapes.len();
            ids.insert(elems.clone(), id);
            shapes.push(elems);
            Ty::Shape(id)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_joins_existing_bindings() {
        let mut reg = Registry::new();
        reg.update("main", "x", Ty::Char).unwrap();
        reg.update("main", "x", Ty::Str).unwrap();
        assert_eq!(reg.ty_of("main", "x"), Some(&Ty::Str));
    }

    #[test]
    fn update_rejects_incompatible_joins() {
        let mut reg = Registry::new();
        reg.update("main", "x", Ty::Double).unwrap();
        assert!(reg.update("main", "x", Ty::Str).is_err());
    }

    #[test]
    fn freeze_interns_identical_shapes_once() {
        let mut reg = Registry::new();
        reg.update("main", "a", Ty::Tuple(vec![Ty::Double, Ty::Str]))
            .unwrap();
        reg.update("main", "b", Ty::Tuple(vec![Ty::Double, Ty::Str]))
            .unwrap();
        reg.update("main", "c", Ty::Tuple(vec![Ty::Str, Ty::Double]))
            .unwrap();
        reg.freeze();
        assert_eq!(reg.ty_of("main", "a"), reg.ty_of("main", "b"));
        assert_ne!(reg.ty_of("main", "a"), reg.ty_of("main", "c"));
        assert_eq!(reg.shapes().len(), 2);
    }

    #[test]
    fn freeze_interns_nested_tuples_bottom_up() {
        let mut reg = Registry::new();
        let inner = Ty::Tuple(vec![Ty::Double, Ty::Double]);
        reg.update("main", "p", Ty::Tuple(vec![inner.clone(), Ty::Str]))
            .unwrap();
        reg.update("main", "q", inner).unwrap();
        reg.freeze();
        // the nested pair and the standalone pair share a shape id
        let Some(Ty::Shape(outer)) = reg.ty_of("main", "p").cloned() else {
            panic!("expected a shape");
        };
        let Some(Ty::Shape(pair)) = reg.ty_of("main", "q").cloned() else {
            panic!("expected a shape");
        };
        assert_eq!(reg.shape(outer), Some(&[Ty::Shape(pair), Ty::Str][..]));
    }
}
