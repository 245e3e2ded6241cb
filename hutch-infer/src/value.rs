//! Runtime values for sample execution. Containers are shared mutable so
//! aliasing during interpretation behaves like the generated code's
//! reference-counted aggregates; dict and set mirror the runtime's
//! list-backed records as association lists.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use hutch_ast::ScopeId;

use crate::ModuleCode;
use crate::scope::ScopeRef;
use crate::ty::Ty;

#[derive(Clone)]
pub enum Value {
    Num(f64),
    Bool(bool),
    None,
    Str(Rc<str>),
    List(Rc<ListObj>),
    Dict(Rc<DictObj>),
    Set(Rc<SetObj>),
    /// live view over a dict's value storage
    DictValues(Rc<DictObj>),
    Tuple(Rc<Vec<Value>>),
    /// `a:b:c` slice literal with per-bound presence
    Slice(Rc<SliceVal>),
    /// materialized `range(...)` sequence
    RangeIter(Rc<Vec<f64>>),
    Func(Rc<FuncObj>),
    Builtin(Builtin),
    Method(Box<Method>),
    Gen(Rc<GenObj>),
    Class(Rc<ClassObj>),
    Instance(Rc<InstanceObj>),
    Interface(Rc<IfaceObj>),
    Module(Rc<ModuleVal>),
    /// `ref` parameter wrapper, opaque until a `cast` narrows it
    Opaque(Rc<Value>),
}

pub struct ListObj {
    pub items: RefCell<Vec<Value>>,
    /// container slot id, the phrase id of the creating literal
    pub id: String,
}

pub struct DictObj {
    pub entries: RefCell<Vec<(Value, Value)>>,
    pub id: String,
}

pub struct SetObj {
    pub elems: RefCell<Vec<Value>>,
    pub id: String,
}

pub struct SliceVal {
    pub bounds: [Option<Value>; 3],
}

impl SliceVal {
    /// Resolves the three bounds against a container of length `n`,
    /// defaulting absent ones to 0 / n / 1.
    pub fn expand(&self, n: usize) -> Option<(i64, i64, i64)> {
        let pick = |b: &Option<Value>, default: i64| -> Option<i64> {
            match b {
                Some(Value::Num(v)) => Some(*v as i64),
                Some(_) => None,
                None => Some(default),
            }
        };
        let i = pick(&self.bounds[0], 0)?;
        let j = pick(&self.bounds[1], n as i64)?;
        let k = pick(&self.bounds[2], 1)?;
        Some((i, j, k))
    }

    /// Index sequence for one expanded slice.
    pub fn indices(&self, n: usize) -> Option<Vec<usize>> {
        let (mut i, j, k) = self.expand(n)?;
        if k == 0 {
            return None;
        }
        let mut out = Vec::new();
        while (k > 0 && i < j) || (k < 0 && i > j) {
            if i >= 0 && (i as usize) < n {
                out.push(i as usize);
            }
            i += k;
        }
        Some(out)
    }
}

/// Parameter-level cast applied when a unit is invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgCast {
    /// wrap the argument in an opaque pointer
    Ref,
    /// the argument must already be a string
    Str,
}

pub struct FuncObj {
    pub code: Rc<ModuleCode>,
    /// index of the first body phrase
    pub body: usize,
    pub args: Vec<String>,
    pub casts: Vec<(usize, ArgCast)>,
    pub parent: ScopeRef,
    pub is_generator: bool,
    pub scope_id: ScopeId,
}

pub struct GenObj {
    pub func: Rc<FuncObj>,
    pub scope: ScopeRef,
    pub state: RefCell<GenState>,
}

#[derive(Default)]
pub struct GenState {
    pub started: bool,
    pub queue: VecDeque<Value>,
}

pub struct ClassObj {
    pub code: Rc<ModuleCode>,
    pub body: usize,
    pub scope: ScopeRef,
    pub scope_id: ScopeId,
}

pub struct InstanceObj {
    pub scope: ScopeRef,
}

pub struct IfaceObj {
    pub scope: ScopeRef,
    pub scope_id: ScopeId,
}

pub struct ModuleVal {
    pub scope: ScopeRef,
}

#[derive(Clone)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Str,
    Ord,
    Chr,
    /// `sys.stdin.read`, returning the module's sample input
    StdinRead(Rc<str>),
}

/// A container method bound to its receiver.
#[derive(Clone)]
pub struct Method {
    pub recv: Value,
    pub op: MethodOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodOp {
    Append,
    Pop,
    Contains,
    Values,
    Items,
    Lower,
    IsDigit,
    IsSpace,
    StartsWith,
}

/// Static type of a value, or `None` for values that cannot be bound to a
/// name (builtins, bound methods, bare slices).
pub fn type_of(v: &Value) -> Option<Ty> {
    match v {
        Value::Num(_) => Some(Ty::Double),
        Value::Bool(_) => Some(Ty::Bool),
        Value::None => Some(Ty::Void),
        Value::Str(s) => {
            if s.chars().count() == 1 {
                Some(Ty::Char)
            } else {
                Some(Ty::Str)
            }
        }
        Value::List(l) => Some(Ty::List(l.id.clone())),
        Value::Dict(d) => Some(Ty::Dict(d.id.clone())),
        Value::Set(s) => Some(Ty::Set(s.id.clone())),
        Value::DictValues(d) => Some(Ty::DictValues(d.id.clone())),
        Value::Tuple(items) => {
            let mut elems = Vec::with_capacity(items.len());
            for item in items.iter() {
                elems.push(type_of(item)?);
            }
            Some(Ty::Tuple(elems))
        }
        Value::RangeIter(_) => Some(Ty::RangeCtor),
        Value::Func(f) => Some(Ty::Func(f.scope_id.clone())),
        Value::Gen(g) => Some(Ty::Generator(g.func.scope_id.clone())),
        Value::Class(c) => Some(Ty::Class(c.scope_id.clone())),
        Value::Instance(i) => Some(Ty::Instance(i.scope.borrow().scope_id.clone())),
        Value::Interface(i) => Some(Ty::Interface(i.scope_id.clone())),
        Value::Module(m) => Some(Ty::Module(m.scope.borrow().scope_id.clone())),
        Value::Opaque(_) => Some(Ty::Ref),
        Value::Slice(_) | Value::Builtin(_) | Value::Method(_) => None,
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Num(n) => *n != 0.0,
        Value::Bool(b) => *b,
        Value::None => false,
        Value::Str(s) => !s.is_empty(),
        Value::List(l) => !l.items.borrow().is_empty(),
        Value::Dict(d) => !d.entries.borrow().is_empty(),
        Value::Set(s) => !s.elems.borrow().is_empty(),
        Value::Tuple(t) => !t.is_empty(),
        Value::RangeIter(r) => !r.is_empty(),
        _ => true,
    }
}

/// Structural equality where the language has it (numbers, strings,
/// containers); identity for the rest.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| value_eq(p, q))
        }
        (Value::List(x), Value::List(y)) => {
            let (xs, ys) = (x.items.borrow(), y.items.borrow());
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(p, q)| value_eq(p, q))
        }
        (Value::Func(x), Value::Func(y)) => Rc::ptr_eq(x, y),
        (Value::Instance(x), Value::Instance(y)) => Rc::ptr_eq(x, y),
        (Value::Class(x), Value::Class(y)) => Rc::ptr_eq(x, y),
        (Value::Gen(x), Value::Gen(y)) => Rc::ptr_eq(x, y),
        (Value::Module(x), Value::Module(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Rendering used by the `str` builtin and by failure messages.
pub fn display_value(v: &Value) -> String {
    match v {
        Value::Num(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{n:.1}")
            } else {
                format!("{n}")
            }
        }
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::None => "None".into(),
        Value::Str(s) => s.to_string(),
        Value::List(l) => {
            let parts: Vec<String> = l.items.borrow().iter().map(display_value).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Dict(d) => {
            let parts: Vec<String> = d
                .entries
                .borrow()
                .iter()
                .map(|(k, v)| format!("{}: {}", display_value(k), display_value(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Set(s) => {
            let parts: Vec<String> = s.elems.borrow().iter().map(display_value).collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Tuple(t) => {
            let parts: Vec<String> = t.iter().map(display_value).collect();
            format!("({})", parts.join(", "))
        }
        Value::Instance(i) => format!("<{}>", i.scope.borrow().scope_id),
        other => format!("<{}>", describe(other)),
    }
}

/// Short tag for diagnostics.
pub fn describe(v: &Value) -> &'static str {
    match v {
        Value::Num(_) => "number",
        Value::Bool(_) => "bool",
        Value::None => "none",
        Value::Str(_) => "string",
        Value::List(_) => "list",
        Value::Dict(_) => "dict",
        Value::Set(_) => "set",
        Value::DictValues(_) => "dict values",
        Value::Tuple(_) => "tuple",
        Value::Slice(_) => "slice",
        Value::RangeIter(_) => "range",
        Value::Func(_) => "unit",
        Value::Builtin(_) => "builtin",
        Value::Method(_) => "method",
        Value::Gen(_) => "generator",
        Value::Class(_) => "class",
        Value::Instance(_) => "instance",
        Value::Interface(_) => "interface",
        Value::Module(_) => "module",
        Value::Opaque(_) => "ref",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_char_strings_are_chars() {
        assert_eq!(type_of(&Value::Str("a".into())), Some(Ty::Char));
        assert_eq!(type_of(&Value::Str("ab".into())), Some(Ty::Str));
        assert_eq!(type_of(&Value::Str("".into())), Some(Ty::Str));
    }

    #[test]
    fn tuple_types_are_structural() {
        let v = Value::Tuple(Rc::new(vec![Value::Num(1.0), Value::Str("hi".into())]));
        assert_eq!(type_of(&v), Some(Ty::Tuple(vec![Ty::Double, Ty::Str])));
    }

    #[test]
    fn slice_expands_with_defaults() {
        let s = SliceVal {
            bounds: [None, None, None],
        };
        assert_eq!(s.expand(5), Some((0, 5, 1)));
        let s = SliceVal {
            bounds: [Some(Value::Num(1.0)), Some(Value::Num(4.0)), None],
        };
        assert_eq!(s.indices(5), Some(vec![1, 2, 3]));
    }

    #[test]
    fn num_display_matches_sample_text() {
        assert_eq!(display_value(&Value::Num(3.0)), "3.0");
        assert_eq!(display_value(&Value::Num(3.5)), "3.5");
    }
}
