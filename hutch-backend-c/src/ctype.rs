//! Mapping from inferred types to C type names, refcount classification and
//! the `union u` tag/cast tables.

use hutch_infer::{Registry, Ty};

use crate::names::mangle;

/// A type as the lowering sees it: either an inferred registry type or a
/// block-local tuple shape minted for a mixed-type expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CTy {
    Val(Ty),
    Minitup(usize),
}

impl CTy {
    pub fn val(&self) -> Option<&Ty> {
        match self {
            CTy::Val(t) => Some(t),
            CTy::Minitup(_) => None,
        }
    }
}

impl std::fmt::Display for CTy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CTy::Val(t) => write!(f, "{t}"),
            CTy::Minitup(id) => write!(f, "minitup{id}"),
        }
    }
}

/// C type name of a registry type, or `None` when the type has no C
/// representation (modules, interfaces, un-interned tuples).
pub fn ty_name(ty: &Ty) -> Option<String> {
    Some(match ty {
        Ty::Double => "double".into(),
        Ty::Bool => "bool".into(),
        Ty::Void => "void".into(),
        Ty::Str => "struct str_obj*".into(),
        Ty::Char => "unsigned char".into(),
        Ty::List(_) | Ty::DictValues(_) => "struct list*".into(),
        Ty::Dict(_) => "struct dict*".into(),
        Ty::Set(_) => "struct set*".into(),
        Ty::Shape(id) => format!("struct tup_{id}"),
        Ty::Func(id) | Ty::FuncPtr(id) => format!("func_{}", mangle(id)),
        Ty::Generator(id) => format!("struct g_{}*", mangle(id)),
        Ty::Class(id) => format!("struct static_{}", mangle(id)),
        Ty::Instance(id) => format!("struct o_{}*", mangle(id)),
        Ty::RangeCtor => "struct range".into(),
        Ty::Ref => "void *".into(),
        Ty::Module(_) | Ty::Interface(_) | Ty::Tuple(_) => return None,
    })
}

pub fn cty_name(ty: &CTy) -> Option<String> {
    match ty {
        CTy::Val(t) => ty_name(t),
        CTy::Minitup(id) => Some(format!("struct minitup_{id}")),
    }
}

/// Fields of an interned or block-local tuple shape.
pub fn fields(reg: &Registry, local: &[Vec<CTy>], ty: &CTy) -> Option<Vec<CTy>> {
    match ty {
        CTy::Val(Ty::Shape(id)) => reg
            .shape(*id)
            .map(|fs| fs.iter().cloned().map(CTy::Val).collect()),
        CTy::Minitup(id) => local.get(*id).cloned(),
        _ => None,
    }
}

fn is_counted(ty: &Ty) -> bool {
    ty.is_counted()
}

/// Does this type participate in reference counting, directly or through a
/// tuple field?
pub fn is_ref(reg: &Registry, local: &[Vec<CTy>], ty: &CTy) -> bool {
    if let Some(fs) = fields(reg, local, ty) {
        return fs.iter().any(|f| is_ref(reg, local, f));
    }
    matches!(ty, CTy::Val(t) if is_counted(t))
}

/// Refcount operations for one lvalue: tuple shapes expand into one line
/// per counted field.
pub fn ref_ops(reg: &Registry, local: &[Vec<CTy>], ty: &CTy, op: &str, lvalue: &str) -> Vec<String> {
    if let Some(fs) = fields(reg, local, ty) {
        let mut out = Vec::new();
        for (i, f) in fs.iter().enumerate() {
            out.extend(ref_ops(reg, local, f, op, &format!("{lvalue}.i{i}")));
        }
        return out;
    }
    match ty {
        CTy::Val(t) if is_counted(t) => vec![format!("{op}({lvalue})")],
        _ => Vec::new(),
    }
}

/// `union u` tag for a type storable in a runtime container.
pub fn union_tag(ty: &Ty) -> Option<&'static str> {
    Some(match ty {
        Ty::Double => "UNION_LF",
        Ty::Char => "UNION_CH",
        Ty::Str => "UNION_STR",
        Ty::Bool => "UNION_I",
        Ty::Instance(_) => "UNION_OBJ",
        Ty::List(_) | Ty::Dict(_) | Ty::Set(_) | Ty::DictValues(_) => "UNION_OBJ",
        _ => return None,
    })
}

/// Reads a typed value back out of a `union u` expression.
pub fn union_cast(code: &str, ty: &Ty) -> Option<String> {
    Some(match ty {
        Ty::Double => format!("({code}).lf"),
        Ty::Char => format!("({code}).ch"),
        Ty::Str => format!("({code}).str"),
        Ty::Bool => format!("(({code}).i != 0)"),
        Ty::Instance(id) => format!("((struct o_{}*)({code}).obj)", mangle(id)),
        Ty::List(_) | Ty::DictValues(_) => format!("((struct list*)({code}).obj)"),
        Ty::Dict(_) => format!("((struct dict*)({code}).obj)"),
        Ty::Set(_) => format!("((struct set*)({code}).obj)"),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_names() {
        assert_eq!(ty_name(&Ty::Double).as_deref(), Some("double"));
        assert_eq!(ty_name(&Ty::Char).as_deref(), Some("unsigned char"));
        assert_eq!(ty_name(&Ty::Str).as_deref(), Some("struct str_obj*"));
        assert!(ty_name(&Ty::Module("main".into())).is_none());
    }

    #[test]
    fn shape_ref_ops_expand_fields() {
        let mut reg = Registry::new();
        reg.update("main", "p", Ty::Tuple(vec![Ty::Double, Ty::Str]))
            .unwrap();
        reg.freeze();
        let shape = CTy::Val(Ty::Shape(0));
        assert!(is_ref(&reg, &[], &shape));
        assert_eq!(
            ref_ops(&reg, &[], &shape, "DEC_STACK", "v"),
            vec!["DEC_STACK(v.i1)".to_string()]
        );
    }

    #[test]
    fn union_round_trip_tags() {
        assert_eq!(union_tag(&Ty::Double), Some("UNION_LF"));
        assert_eq!(union_cast("x", &Ty::Double).as_deref(), Some("(x).lf"));
        assert_eq!(union_tag(&Ty::Func("main:0".into())), None);
    }
}
