//! Inferred static types and the join (merge) rule.

use std::fmt;

use hutch_ast::ScopeId;

/// Concrete type observed for a binding during sample execution. Container
/// variants carry the id of their element slot (the phrase id of the literal
/// that created the container); an empty id is the generic widened form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    Double,
    Bool,
    Void,
    /// general string
    Str,
    /// single-character string, a plain C `char`
    Char,
    List(String),
    Dict(String),
    Set(String),
    /// view over a dict's value storage
    DictValues(String),
    /// structural tuple; replaced by `Shape` when the registry freezes
    Tuple(Vec<Ty>),
    /// interned tuple shape id
    Shape(usize),
    Func(ScopeId),
    /// interface method slot, a function pointer
    FuncPtr(ScopeId),
    Generator(ScopeId),
    Class(ScopeId),
    Instance(ScopeId),
    Interface(ScopeId),
    Module(ScopeId),
    /// the `range(...)` stateful constructor protocol
    RangeCtor,
    /// opaque pointer, no refcounting
    Ref,
}

impl Ty {
    /// Merges two observed types for the same binding. `None` means the pair
    /// is incompatible, which is a fatal inference failure at the call site.
    pub fn join(&self, other: &Ty) -> Option<Ty> {
        if self == other {
            return Some(self.clone());
        }
        match (self, other) {
            (Ty::Char, Ty::Str) | (Ty::Str, Ty::Char) => Some(Ty::Str),
            (Ty::Tuple(a), Ty::Tuple(b)) => {
                if a.len() != b.len() {
                    return Some(Ty::List(String::new()));
                }
                let mut elems = Vec::with_capacity(a.len());
                for (x, y) in a.iter().zip(b) {
                    elems.push(x.join(y)?);
                }
                Some(Ty::Tuple(elems))
            }
            (Ty::Tuple(_), Ty::List(_)) | (Ty::List(_), Ty::Tuple(_)) => {
                Some(Ty::List(String::new()))
            }
            (Ty::Ref, _) | (_, Ty::Ref) => Some(Ty::Ref),
            _ => None,
        }
    }

    /// True for values the generated code reference-counts.
    pub fn is_counted(&self) -> bool {
        matches!(
            self,
            Ty::Str
                | Ty::List(_)
                | Ty::Dict(_)
                | Ty::Set(_)
                | Ty::DictValues(_)
                | Ty::Instance(_)
                | Ty::Generator(_)
        )
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Double => write!(f, "double"),
            Ty::Bool => write!(f, "bool"),
            Ty::Void => write!(f, "void"),
            Ty::Str => write!(f, "str"),
            Ty::Char => write!(f, "char"),
            Ty::List(id) if id.is_empty() => write!(f, "list"),
            Ty::List(id) => write!(f, "list({id})"),
            Ty::Dict(id) => write!(f, "dict({id})"),
            Ty::Set(id) => write!(f, "set({id})"),
            Ty::DictValues(id) => write!(f, "dict_values({id})"),
            Ty::Tuple(elems) => {
                write!(f, "tuple(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Ty::Shape(id) => write!(f, "tup{id}"),
            Ty::Func(id) => write!(f, "unit({id})"),
            Ty::FuncPtr(id) => write!(f, "unit*({id})"),
            Ty::Generator(id) => write!(f, "generator({id})"),
            Ty::Class(id) => write!(f, "class({id})"),
            Ty::Instance(id) => write!(f, "instance({id})"),
            Ty::Interface(id) => write!(f, "interface({id})"),
            Ty::Module(id) => write!(f, "module({id})"),
            Ty::RangeCtor => write!(f, "range"),
            Ty::Ref => write!(f, "ref"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_idempotent() {
        let types = [
            Ty::Double,
            Ty::Str,
            Ty::Char,
            Ty::List("m:1".into()),
            Ty::Tuple(vec![Ty::Double, Ty::Str]),
            Ty::Ref,
        ];
        for t in &types {
            assert_eq!(t.join(t), Some(t.clone()));
        }
    }

    #[test]
    fn join_is_commutative() {
        let pairs = [
            (Ty::Char, Ty::Str),
            (Ty::Tuple(vec![Ty::Double]), Ty::List("m:3".into())),
            (Ty::Ref, Ty::Double),
            (
                Ty::Tuple(vec![Ty::Char, Ty::Double]),
                Ty::Tuple(vec![Ty::Str, Ty::Double]),
            ),
        ];
        for (a, b) in &pairs {
            assert_eq!(a.join(b), b.join(a));
        }
    }

    #[test]
    fn char_widens_to_str() {
        assert_eq!(Ty::Char.join(&Ty::Str), Some(Ty::Str));
    }

    #[test]
    fn tuples_join_elementwise() {
        let a = Ty::Tuple(vec![Ty::Char, Ty::Double]);
        let b = Ty::Tuple(vec![Ty::Str, Ty::Double]);
        assert_eq!(a.join(&b), Some(Ty::Tuple(vec![Ty::Str, Ty::Double])));
    }

    #[test]
    fn mismatched_arity_widens_to_list() {
        let a = Ty::Tuple(vec![Ty::Double]);
        let b = Ty::Tuple(vec![Ty::Double, Ty::Double]);
        assert_eq!(a.join(&b), Some(Ty::List(String::new())));
    }

    #[test]
    fn ref_dominates() {
        assert_eq!(Ty::Ref.join(&Ty::Instance("m:2".into())), Some(Ty::Ref));
        assert_eq!(Ty::Double.join(&Ty::Ref), Some(Ty::Ref));
    }

    #[test]
    fn incompatible_pairs_fail() {
        assert_eq!(Ty::Double.join(&Ty::Str), None);
        assert_eq!(
            Ty::List("m:1".into()).join(&Ty::List("m:2".into())),
            None
        );
    }
}
