//! Expression lowering: phrase trees to C expressions. Fresh values are
//! absorbed into block-scoped temporaries so the statement pass can balance
//! reference counts, and every runtime method call goes through a closed
//! per-receiver signature table.

use std::collections::HashMap;

use hutch_ast::{
    Group, GroupKind, Node, ScopeId, TokenKind, cast_slot, instance_class, instance_scope,
};
use hutch_infer::{ArgCast, Registry, Ty};
use hutch_lex::{string_body, unescape};

use crate::CodegenError;
use crate::ctype::{self, CTy, cty_name, ty_name, union_cast, union_tag};
use crate::names::{mangle, var};

/// A lowered expression. `deps` are side statements that must run first;
/// `final_code` splices them in with the comma operator. `components` keeps
/// the element expressions of a tuple literal for destructuring.
#[derive(Clone)]
pub(crate) struct CExpr {
    pub code: String,
    pub ty: CTy,
    pub is_new: bool,
    pub deps: Vec<String>,
    pub components: Vec<CExpr>,
}

impl CExpr {
    pub fn new(code: impl Into<String>, ty: CTy) -> Self {
        CExpr {
            code: code.into(),
            ty,
            is_new: false,
            deps: Vec::new(),
            components: Vec::new(),
        }
    }

    pub fn fresh(code: impl Into<String>, ty: CTy) -> Self {
        CExpr {
            is_new: true,
            ..CExpr::new(code, ty)
        }
    }

    pub fn final_code(&self) -> String {
        let mut parts = self.deps.clone();
        parts.push(self.code.clone());
        format!("({})", parts.join(", "))
    }
}

/// Interned literal-string table. Entries render as static `str_obj`
/// records in insertion order.
#[derive(Default)]
pub(crate) struct StringTable {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl StringTable {
    /// Literal body as written in the source (escape sequences intact).
    pub fn intern(&mut self, body: &str) -> String {
        if let Some(&i) = self.index.get(body) {
            return self.entries[i].1.clone();
        }
        let name = format!("str_{}", self.entries.len());
        self.index.insert(body.to_string(), self.entries.len());
        self.entries.push((body.to_string(), name.clone()));
        name
    }

    /// Fixed-name entry, used for the per-module `__name__` strings.
    pub fn intern_named(&mut self, body: &str, name: &str) {
        self.entries.push((body.to_string(), name.to_string()));
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (body, name) in &self.entries {
            let escaped = body.replace('"', "\\\"");
            // the stored length counts bytes after escapes collapse
            let n = escaped.replace('\\', "").len();
            out.push_str(&format!(
                "static struct str_obj {name} = {{.str = {{(unsigned char *)\"{escaped}\", {n}}}}};\n"
            ));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One statement's worth of temporaries and block-local tuple shapes.
#[derive(Default)]
pub(crate) struct Frame {
    vars: Vec<(String, CTy, bool)>,
    cleaned: usize,
    minted: Vec<usize>,
    inv: HashMap<String, usize>,
}

/// Declarations and cleanup a closed frame leaves behind. The caller prints
/// `structs` and `decls` at the block's insertion mark and `cleanup` at its
/// end.
pub(crate) struct FrameRender {
    pub structs: Vec<String>,
    pub decls: Vec<String>,
    pub cleanup: Vec<String>,
}

/// Lexical scope chain for name resolution. Stateless scopes (generator
/// bodies) repeat their prefix per lookup depth; cast blocks overlay
/// narrowed types onto `ref` bindings.
#[derive(Clone)]
pub(crate) struct CScope {
    pub id: ScopeId,
    pub module: String,
    prefix: String,
    stateless: bool,
    parent: Option<Box<CScope>>,
    casts: HashMap<String, (Ty, String)>,
    cast_stack: Vec<HashMap<String, (Ty, String)>>,
}

impl CScope {
    pub fn module_root(name: &str) -> CScope {
        CScope {
            id: name.to_string(),
            module: name.to_string(),
            prefix: format!("m_{}.", mangle(name)),
            stateless: false,
            parent: None,
            casts: HashMap::new(),
            cast_stack: Vec::new(),
        }
    }

    pub fn child(id: &str, parent: &CScope) -> CScope {
        CScope {
            id: id.to_string(),
            module: parent.module.clone(),
            prefix: String::new(),
            stateless: false,
            parent: Some(Box::new(parent.clone())),
            casts: HashMap::new(),
            cast_stack: Vec::new(),
        }
    }

    /// Generator body scope: every local lives behind `self->`.
    pub fn stateless(id: &str, parent: &CScope, prefix: &str) -> CScope {
        CScope {
            prefix: prefix.to_string(),
            stateless: true,
            ..CScope::child(id, parent)
        }
    }

    /// Scope whose bindings live in a named global record, like a class's
    /// static storage.
    pub fn stored(id: &str, parent: &CScope, prefix: &str) -> CScope {
        CScope {
            prefix: prefix.to_string(),
            ..CScope::child(id, parent)
        }
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    /// Does this name resolve into heap-owned storage (a generator frame)?
    pub fn is_heap(&self, reg: &Registry, name: &str) -> bool {
        if reg.ty_of(&self.id, name).is_some() {
            return self.stateless;
        }
        self.parent.as_ref().is_some_and(|p| p.is_heap(reg, name))
    }

    pub fn push_casts(
        &mut self,
        reg: &Registry,
        pid: &str,
        names: &[String],
    ) -> Result<(), CodegenError> {
        let mut layer = HashMap::new();
        for name in names {
            let slot = cast_slot(pid, name);
            let ty = reg
                .ty_of(&self.id, &slot)
                .ok_or_else(|| CodegenError::MissingName {
                    name: slot.clone(),
                    scope: self.id.clone(),
                })?
                .clone();
            let cname = ty_name(&ty).ok_or_else(|| CodegenError::Type {
                scope: self.id.clone(),
                ty: ty.to_string(),
            })?;
            layer.insert(name.clone(), (ty, cname));
        }
        self.cast_stack.push(self.casts.clone());
        self.casts.extend(layer);
        Ok(())
    }

    pub fn pop_casts(&mut self) {
        if let Some(prev) = self.cast_stack.pop() {
            self.casts = prev;
        }
    }

    pub fn find_full(&self, reg: &Registry, name: &str, depth: usize) -> Option<(String, Ty)> {
        if let Some(ty) = reg.ty_of(&self.id, name) {
            let wrapped = var(name);
            let full = if self.stateless {
                format!("{}{}", self.prefix.repeat(depth), wrapped)
            } else {
                format!("{}{}", self.prefix, wrapped)
            };
            if let Some((cast_ty, cast_c)) = self.casts.get(name) {
                return Some((format!("(*({cast_c} *){full})"), cast_ty.clone()));
            }
            return Some((full, ty.clone()));
        }
        self.parent.as_ref()?.find_full(reg, name, depth + 1)
    }
}

/// Call arguments plus the presence mask used by slice lowering.
pub(crate) struct Args {
    pub vals: Vec<CExpr>,
    kwmask: Option<Vec<bool>>,
}

impl Args {
    pub fn new(vals: Vec<CExpr>) -> Args {
        Args { vals, kwmask: None }
    }

    pub fn with_mask(vals: Vec<CExpr>, mask: Vec<bool>) -> Args {
        Args {
            vals,
            kwmask: Some(mask),
        }
    }

    pub fn prepend(&mut self, e: CExpr) {
        self.vals.insert(0, e);
    }
}

#[derive(Clone, Copy)]
enum Coerce {
    Skip,
    /// convert to a string object via `__str__` unless already one
    Str,
    /// box into `union u`
    Union,
    /// pass the address of the value as `void *`
    Ref,
}

enum Ret {
    Plain(Ty),
    /// the call returns `union u`; read the typed member back out
    Union(Ty),
}

struct RtCall {
    fname: &'static str,
    ret: Ret,
    coerce: Vec<Coerce>,
    /// default codes for trailing presence-flagged arguments
    kw: &'static [&'static str],
}

fn rtc(fname: &'static str, ret: Ret, coerce: Vec<Coerce>) -> RtCall {
    RtCall {
        fname,
        ret,
        coerce,
        kw: &[],
    }
}

pub(crate) struct Lowerer<'a> {
    pub reg: &'a Registry,
    pub strings: StringTable,
    /// block-local tuple shapes, globally numbered
    pub minitups: Vec<Vec<CTy>>,
    frames: Vec<Frame>,
}

impl<'a> Lowerer<'a> {
    pub fn new(reg: &'a Registry) -> Lowerer<'a> {
        Lowerer {
            reg,
            strings: StringTable::default(),
            minitups: Vec::new(),
            frames: Vec::new(),
        }
    }

    // ---- temporaries -----------------------------------------------------

    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn pop_frame(&mut self) -> Result<FrameRender, CodegenError> {
        let frame = match self.frames.pop() {
            Some(f) => f,
            Option::None => return Ok(FrameRender {
                structs: Vec::new(),
                decls: Vec::new(),
                cleanup: Vec::new(),
            }),
        };

        let mut structs = Vec::new();
        for id in &frame.minted {
            structs.push(format!("struct minitup_{id} {{"));
            for (i, f) in self.minitups[*id].iter().enumerate() {
                let tname = self.cname(f, "minitup")?;
                structs.push(format!("\t{tname} i{i};"));
            }
            structs.push("};".to_string());
        }

        let mut decls = Vec::new();
        for (name, ty, free) in &frame.vars {
            let tname = self.cname(ty, name)?;
            if *free && self.is_ref(ty) {
                decls.push(format!("{tname} {name} = ({tname})0"));
            } else {
                decls.push(format!("{tname} {name}"));
            }
        }

        let mut cleanup = Vec::new();
        for (name, ty, free) in frame.vars.iter().skip(frame.cleaned) {
            if *free {
                cleanup.extend(self.ref_ops(ty, "DEC_STACK_EXPR", name));
            }
        }
        Ok(FrameRender {
            structs,
            decls,
            cleanup,
        })
    }

    /// Cleanup for temporaries created so far in the open frame; used to
    /// release condition temporaries inside loop headers.
    pub fn forward(&mut self) -> Vec<String> {
        let Some(frame) = self.frames.last_mut() else {
            return Vec::new();
        };
        let pending: Vec<(String, CTy, bool)> =
            frame.vars.iter().skip(frame.cleaned).cloned().collect();
        frame.cleaned = frame.vars.len();
        let mut out = Vec::new();
        for (name, ty, free) in pending {
            if free {
                out.extend(self.ref_ops(&ty, "DEC_STACK_EXPR", &name));
            }
        }
        out
    }

    pub fn temp(&mut self, ty: &CTy, free: bool) -> String {
        let frame = self.frames.last_mut().unwrap_or_else(|| {
            unreachable!("temporary requested outside a statement frame")
        });
        let name = format!("tmp_{}", frame.vars.len());
        frame.vars.push((name.clone(), ty.clone(), free));
        name
    }

    /// Shape for a tuple literal: an interned shape when the registry knows
    /// this field list, otherwise a block-local record.
    pub fn tuple_ty(&mut self, fields: Vec<CTy>) -> CTy {
        let plain: Option<Vec<Ty>> = fields.iter().map(|f| f.val().cloned()).collect();
        if let Some(plain) = plain
            && let Some(id) = self.reg.shapes().iter().position(|s| *s == plain)
        {
            return CTy::Val(Ty::Shape(id));
        }
        let desc = fields
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("&");
        for frame in self.frames.iter().rev() {
            if let Some(&id) = frame.inv.get(&desc) {
                return CTy::Minitup(id);
            }
        }
        let id = self.minitups.len();
        self.minitups.push(fields);
        if let Some(frame) = self.frames.last_mut() {
            frame.minted.push(id);
            frame.inv.insert(desc, id);
        }
        CTy::Minitup(id)
    }

    pub fn absorb(&mut self, e: CExpr) -> CExpr {
        if !e.is_new {
            return e;
        }
        let tmp = self.temp(&e.ty, true);
        let dep = format!("{tmp} = {}", e.final_code());
        CExpr {
            code: tmp.clone(),
            ty: e.ty,
            is_new: false,
            deps: vec![dep],
            components: Vec::new(),
        }
    }

    pub fn is_ref(&self, ty: &CTy) -> bool {
        ctype::is_ref(self.reg, &self.minitups, ty)
    }

    pub fn ref_ops(&self, ty: &CTy, op: &str, lvalue: &str) -> Vec<String> {
        ctype::ref_ops(self.reg, &self.minitups, ty, op, lvalue)
    }

    pub fn fields_of(&self, ty: &CTy) -> Option<Vec<CTy>> {
        ctype::fields(self.reg, &self.minitups, ty)
    }

    fn cname(&self, ty: &CTy, at: &str) -> Result<String, CodegenError> {
        cty_name(ty).ok_or_else(|| CodegenError::Type {
            scope: at.to_string(),
            ty: ty.to_string(),
        })
    }

    // ---- arguments -------------------------------------------------------

    fn cast_args(
        &mut self,
        args: &mut Args,
        coerce: &[Coerce],
        err: &str,
    ) -> Result<(), CodegenError> {
        for (i, c) in coerce.iter().enumerate() {
            if i >= args.vals.len() {
                break;
            }
            match c {
                Coerce::Skip => {}
                Coerce::Str => {
                    if args.vals[i].ty != CTy::Val(Ty::Str) {
                        let v = args.vals[i].clone();
                        let ty = v.ty.clone();
                        args.vals[i] = self.call_on(err, &ty, "__str__", Args::new(vec![v]))?;
                    }
                }
                Coerce::Union => {
                    let v = std::mem::replace(&mut args.vals[i], CExpr::new("", CTy::Val(Ty::Void)));
                    let mut v = self.absorb(v);
                    v.code = format!("((union u)({}))", v.code);
                    args.vals[i] = v;
                }
                Coerce::Ref => {
                    let v = &args.vals[i];
                    let tmp = self.temp(&v.ty, false);
                    let mut deps = vec![format!("{tmp} = {}", v.final_code())];
                    let out = CExpr {
                        code: format!("((void *)&{tmp})"),
                        ty: CTy::Val(Ty::Ref),
                        is_new: false,
                        deps: std::mem::take(&mut deps),
                        components: Vec::new(),
                    };
                    args.vals[i] = out;
                }
            }
        }
        Ok(())
    }

    /// Rewrites trailing arguments into presence-flag pairs, filling gaps
    /// with defaults. `start` positional arguments stay as they are.
    fn set_kwords(&mut self, args: &mut Args, start: usize, defaults: &[&str]) {
        let olds: Vec<CExpr> = args.vals.split_off(start.min(args.vals.len()));
        for (k, default) in defaults.iter().enumerate() {
            let present = olds
                .get(k)
                .is_some_and(|_| args.kwmask.as_ref().is_none_or(|m| m[start + k]));
            if present {
                args.vals.push(CExpr::new("true", CTy::Val(Ty::Bool)));
                args.vals.push(olds[k].clone());
            } else {
                args.vals.push(CExpr::new("false", CTy::Val(Ty::Bool)));
                args.vals.push(CExpr::new(*default, CTy::Val(Ty::Double)));
            }
        }
        args.kwmask = None;
    }

    fn finalize_args(&mut self, args: Args) -> String {
        let mut parts = vec!["thread".to_string()];
        for v in args.vals {
            let v = if v.deps.is_empty() && !self.is_ref(&v.ty) {
                v
            } else {
                self.absorb(v)
            };
            parts.push(v.final_code());
        }
        parts.join(", ")
    }

    fn union_array(&mut self, values: Vec<CExpr>) -> String {
        let items: Vec<String> = values
            .into_iter()
            .map(|v| format!("(union u)({})", v.final_code()))
            .collect();
        format!("((union u[]){{{}}})", items.join(", "))
    }

    // ---- calls -----------------------------------------------------------

    fn elem(&self, slot: String, err: &str) -> Result<Ty, CodegenError> {
        self.reg
            .container(&slot)
            .cloned()
            .ok_or_else(|| CodegenError::Type {
                scope: err.to_string(),
                ty: slot,
            })
    }

    /// Runtime signature for a method on a builtin receiver.
    fn rt_method(&self, err: &str, recv: &Ty, name: &str) -> Result<RtCall, CodegenError> {
        use Coerce::{Skip, Str, Union};
        let missing = || CodegenError::MissingName {
            name: name.to_string(),
            scope: recv.to_string(),
        };
        Ok(match (recv, name) {
            (Ty::Str, "isspace") => rtc("rt_str_isspace", Ret::Plain(Ty::Bool), vec![]),
            (Ty::Str, "isdigit") => rtc("rt_str_isdigit", Ret::Plain(Ty::Bool), vec![]),
            (Ty::Str, "lower") => rtc("rt_str_lower", Ret::Plain(Ty::Str), vec![]),
            (Ty::Str, "startswith") => {
                rtc("rt_str_startswith", Ret::Plain(Ty::Bool), vec![Str, Str])
            }
            (Ty::Str, "__eq__") => rtc("rt_str_eq", Ret::Plain(Ty::Bool), vec![Str, Str]),
            (Ty::Str, "__neq__") => rtc("rt_str_neq", Ret::Plain(Ty::Bool), vec![Str, Str]),
            (Ty::Str, "__isin__") | (Ty::Str, "contains") => {
                rtc("rt_str_isin", Ret::Plain(Ty::Bool), vec![Str, Skip])
            }
            (Ty::Str, "__len__") => rtc("RT_STR_LEN", Ret::Plain(Ty::Double), vec![]),
            (Ty::Str, "__at__") => rtc("RT_STR_AT", Ret::Plain(Ty::Char), vec![]),
            (Ty::Str, "__range__") => RtCall {
                fname: "rt_str_range",
                ret: Ret::Plain(Ty::Str),
                coerce: vec![Str],
                kw: &["(ssize_t)0", "(ssize_t)0", "(ssize_t)0"],
            },
            (Ty::Str, "__plus__") => rtc("rt_str_plus", Ret::Plain(Ty::Str), vec![Str, Str]),
            (Ty::Str, "__pluseq__") => {
                rtc("rt_str_plus_equals", Ret::Plain(Ty::Str), vec![Str, Str])
            }

            (Ty::Char, "isspace") => rtc("RT_CHAR_ISSPACE", Ret::Plain(Ty::Bool), vec![]),
            (Ty::Char, "isdigit") => rtc("RT_CHAR_ISDIGIT", Ret::Plain(Ty::Bool), vec![]),
            (Ty::Char, "lower") => rtc("RT_CHAR_LOWER", Ret::Plain(Ty::Char), vec![]),
            (Ty::Char, "__str__") => rtc("rt_char_str", Ret::Plain(Ty::Str), vec![]),
            (Ty::Char, "__eq__") => rtc("rt_str_eq", Ret::Plain(Ty::Bool), vec![Str, Str]),
            (Ty::Char, "__neq__") => rtc("rt_str_neq", Ret::Plain(Ty::Bool), vec![Str, Str]),
            (Ty::Char, "__len__") => rtc("RT_CHAR_LEN", Ret::Plain(Ty::Double), vec![]),
            (Ty::Char, "__plus__") => rtc("rt_char_plus", Ret::Plain(Ty::Str), vec![Skip, Str]),

            (Ty::Double, "__str__") => rtc("rt_float_str", Ret::Plain(Ty::Str), vec![]),
            (Ty::Bool, "__str__") => rtc("rt_bool_str", Ret::Plain(Ty::Str), vec![]),

            (Ty::List(id), _) => {
                let vt = self.elem(format!("list_items:{id}"), err)?;
                match name {
                    "append" => rtc("rt_list_push", Ret::Plain(Ty::Void), vec![Skip, Union]),
                    "pop" => rtc("rt_list_pop", Ret::Union(vt), vec![Skip]),
                    "__isin__" | "contains" => {
                        rtc("rt_list_isin", Ret::Plain(Ty::Bool), vec![Skip, Union])
                    }
                    "__len__" => rtc("RT_LIST_LEN", Ret::Plain(Ty::Double), vec![]),
                    "__at__" => rtc("RT_LIST_AT", Ret::Union(vt), vec![]),
                    "__setat__" => rtc("rt_list_set", Ret::Plain(Ty::Void), vec![Skip, Skip, Union]),
                    _ => return Err(missing()),
                }
            }
            (Ty::Dict(id), _) => match name {
                "__isin__" | "contains" => {
                    rtc("rt_dict_isin", Ret::Plain(Ty::Bool), vec![Skip, Union])
                }
                "__at__" => {
                    let vt = self.elem(format!("dict_values:{id}"), err)?;
                    rtc("rt_dict_at", Ret::Union(vt), vec![Skip, Union])
                }
                "__len__" => rtc("RT_DICT_LEN", Ret::Plain(Ty::Double), vec![]),
                "__setat__" => rtc("rt_dict_set", Ret::Plain(Ty::Void), vec![Skip, Union, Union]),
                _ => return Err(missing()),
            },
            (Ty::Set(_), "__isin__") | (Ty::Set(_), "contains") => {
                rtc("rt_set_isin", Ret::Plain(Ty::Bool), vec![Skip, Union])
            }
            (Ty::Set(_), "__len__") => rtc("RT_SET_LEN", Ret::Plain(Ty::Double), vec![]),
            (Ty::DictValues(_), "__isin__") | (Ty::DictValues(_), "contains") => {
                rtc("rt_dict_values_isin", Ret::Plain(Ty::Bool), vec![Skip, Union])
            }
            (Ty::DictValues(_), "__len__") => rtc("RT_LIST_LEN", Ret::Plain(Ty::Double), vec![]),

            (Ty::RangeCtor, "__init__") => RtCall {
                fname: "RT_RANGE_INIT",
                ret: Ret::Plain(Ty::Void),
                coerce: vec![Skip, Skip],
                kw: &["0", "0"],
            },
            (Ty::RangeCtor, "__notdone__") => {
                rtc("RT_RANGE_NOTDONE", Ret::Plain(Ty::Bool), vec![])
            }
            (Ty::RangeCtor, "__promote__") => {
                rtc("RT_RANGE_PROMOTE", Ret::Plain(Ty::Void), vec![])
            }
            (Ty::RangeCtor, "__current__") => {
                rtc("RT_RANGE_CURRENT", Ret::Plain(Ty::Double), vec![])
            }
            _ => return Err(missing()),
        })
    }

    fn rt_call(&mut self, err: &str, call: RtCall, mut args: Args) -> Result<CExpr, CodegenError> {
        self.cast_args(&mut args, &call.coerce, err)?;
        if !call.kw.is_empty() {
            self.set_kwords(&mut args, call.coerce.len(), call.kw);
        }
        let code = format!("{}({})", call.fname, self.finalize_args(args));
        match call.ret {
            Ret::Plain(t) => Ok(CExpr::fresh(code, CTy::Val(t))),
            Ret::Union(t) => {
                let cast = union_cast(&code, &t).ok_or_else(|| CodegenError::Type {
                    scope: err.to_string(),
                    ty: t.to_string(),
                })?;
                Ok(CExpr::fresh(cast, CTy::Val(t)))
            }
        }
    }

    fn user_call(&mut self, fid: &str, mut args: Args) -> Result<CExpr, CodegenError> {
        let reg = self.reg;
        if reg.is_generator(fid) {
            let code = format!("f_{}({})", mangle(fid), self.finalize_args(args));
            return Ok(CExpr::fresh(code, CTy::Val(Ty::Generator(fid.to_string()))));
        }
        if let Some(casts) = reg.args_cast(fid) {
            let coerce: Vec<Coerce> = casts.iter().map(coerce_of).collect();
            self.cast_args(&mut args, &coerce, fid)?;
        }
        let ret = reg.ty_of(fid, "").cloned().unwrap_or(Ty::Void);
        let code = format!("f_{}({})", mangle(fid), self.finalize_args(args));
        Ok(CExpr::fresh(code, CTy::Val(ret)))
    }

    fn construct(&mut self, cid: &str, mut args: Args) -> Result<CExpr, CodegenError> {
        let reg = self.reg;
        if let Some(Ty::Func(init)) = reg.ty_of(cid, "__init__")
            && !reg.is_generator(init)
            && let Some(casts) = reg.args_cast(init)
        {
            // the implicit self argument is supplied by the constructor
            let coerce: Vec<Coerce> = casts.iter().skip(1).map(coerce_of).collect();
            self.cast_args(&mut args, &coerce, cid)?;
        }
        let code = format!("f_{}({})", mangle(cid), self.finalize_args(args));
        Ok(CExpr::fresh(code, CTy::Val(Ty::Instance(instance_scope(cid)))))
    }

    /// Method dispatch on a receiver type: user units on instances and
    /// modules, the runtime tables for everything else.
    pub(crate) fn call_on(
        &mut self,
        err: &str,
        recv: &CTy,
        name: &str,
        args: Args,
    ) -> Result<CExpr, CodegenError> {
        let reg = self.reg;
        let Some(t) = recv.val() else {
            return Err(CodegenError::Unsupported {
                scope: err.to_string(),
                construct: format!("method `{name}` on a block-local tuple"),
            });
        };
        match t {
            Ty::Instance(iid) => {
                let cid = instance_class(iid);
                let m = reg.ty_of(iid, name).or_else(|| reg.ty_of(cid, name));
                match m {
                    Some(Ty::Func(fid)) => {
                        let fid = fid.clone();
                        self.user_call(&fid, args)
                    }
                    Some(other) => Err(CodegenError::Unsupported {
                        scope: err.to_string(),
                        construct: format!("calling a {other} member"),
                    }),
                    Option::None => Err(CodegenError::MissingName {
                        name: name.to_string(),
                        scope: iid.clone(),
                    }),
                }
            }
            Ty::Module(mid) => match reg.ty_of(mid, name) {
                Some(Ty::Func(fid)) => {
                    let fid = fid.clone();
                    self.user_call(&fid, args)
                }
                _ => Err(CodegenError::MissingName {
                    name: name.to_string(),
                    scope: mid.clone(),
                }),
            },
            _ => {
                let call = self.rt_method(err, t, name)?;
                self.rt_call(err, call, args)
            }
        }
    }

    fn builtin_call(
        &mut self,
        err: &str,
        name: &str,
        mut argvals: Vec<CExpr>,
    ) -> Result<CExpr, CodegenError> {
        let arity = |n: usize| -> Result<(), CodegenError> {
            if argvals.len() == n {
                Ok(())
            } else {
                Err(CodegenError::Unsupported {
                    scope: err.to_string(),
                    construct: format!("`{name}` takes {n} argument(s), got {}", argvals.len()),
                })
            }
        };
        match name {
            "print" => {
                let n = argvals.len();
                let mut args = Args::new(argvals);
                self.cast_args(&mut args, &vec![Coerce::Str; n], err)?;
                args.prepend(CExpr::new(format!("(size_t){n}"), CTy::Val(Ty::Double)));
                let code = format!("rt_print_strings({})", self.finalize_args(args));
                Ok(CExpr::fresh(code, CTy::Val(Ty::Void)))
            }
            "len" => {
                arity(1)?;
                let recv = argvals.remove(0);
                let ty = recv.ty.clone();
                self.call_on(err, &ty, "__len__", Args::new(vec![recv]))
            }
            "str" => {
                arity(1)?;
                let recv = argvals.remove(0);
                if recv.ty == CTy::Val(Ty::Str) {
                    return Ok(recv);
                }
                let ty = recv.ty.clone();
                self.call_on(err, &ty, "__str__", Args::new(vec![recv]))
            }
            "ord" => {
                arity(1)?;
                let mut args = Args::new(argvals);
                self.cast_args(&mut args, &[Coerce::Str], err)?;
                let code = format!("rt_ord({})", self.finalize_args(args));
                Ok(CExpr::fresh(code, CTy::Val(Ty::Double)))
            }
            "chr" => {
                arity(1)?;
                let code = format!("rt_chr({})", self.finalize_args(Args::new(argvals)));
                Ok(CExpr::fresh(code, CTy::Val(Ty::Char)))
            }
            "range" => Err(CodegenError::Unsupported {
                scope: err.to_string(),
                construct: "range constructor outside a for header".into(),
            }),
            _ => Err(CodegenError::MissingName {
                name: name.to_string(),
                scope: err.to_string(),
            }),
        }
    }

    // ---- expressions -----------------------------------------------------

    fn name_expr(&mut self, scope: &CScope, name: &str) -> Result<CExpr, CodegenError> {
        if let Some((code, ty)) = scope.find_full(self.reg, name, 1) {
            return Ok(CExpr::new(code, CTy::Val(ty)));
        }
        match name {
            "__main__" => Ok(CExpr::new("__main__", CTy::Val(Ty::Str))),
            "__name__" => Ok(CExpr::new(
                format!("&module_name_str_{}", mangle(&scope.module)),
                CTy::Val(Ty::Str),
            )),
            _ => Err(CodegenError::MissingName {
                name: name.to_string(),
                scope: scope.id.clone(),
            }),
        }
    }

    pub(crate) fn args_from_paren(
        &mut self,
        scope: &CScope,
        paren: &Node,
        pid: &str,
    ) -> Result<Vec<CExpr>, CodegenError> {
        let inner = paren.inner();
        if inner.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<&Node> = if inner[0].is_group(GroupKind::List) {
            inner[0].inner().iter().collect()
        } else {
            vec![&inner[0]]
        };
        items
            .into_iter()
            .map(|n| self.val(scope, n, pid))
            .collect()
    }

    pub(crate) fn val(
        &mut self,
        scope: &CScope,
        tree: &Node,
        pid: &str,
    ) -> Result<CExpr, CodegenError> {
        match tree {
            Node::Leaf(t) => match t.kind {
                TokenKind::Name => self.name_expr(scope, &t.text),
                TokenKind::Digit => {
                    let v: f64 = t.text.parse().map_err(|_| CodegenError::Unsupported {
                        scope: scope.id.clone(),
                        construct: format!("numeric literal `{}`", t.text),
                    })?;
                    Ok(CExpr::new(format!("{v:?}"), CTy::Val(Ty::Double)))
                }
                TokenKind::Str => Ok(self.string_literal(&t.text)),
                TokenKind::Keyword => match t.text.as_str() {
                    "True" => Ok(CExpr::new("true", CTy::Val(Ty::Bool))),
                    "False" => Ok(CExpr::new("false", CTy::Val(Ty::Bool))),
                    "None" => Ok(CExpr::new("NULL", CTy::Val(Ty::Ref))),
                    other => Err(CodegenError::Unsupported {
                        scope: scope.id.clone(),
                        construct: format!("keyword `{other}` in an expression"),
                    }),
                },
                _ => Err(CodegenError::Unsupported {
                    scope: scope.id.clone(),
                    construct: format!("token {}", tree.describe()),
                }),
            },
            Node::Group(g) => self.group(scope, g, pid),
        }
    }

    fn string_literal(&mut self, text: &str) -> CExpr {
        let body = string_body(text);
        let unescaped = unescape(body);
        if unescaped.chars().count() == 1 {
            let quoted = body.replace('\'', "\\'");
            return CExpr::new(format!("(unsigned char)'{quoted}'"), CTy::Val(Ty::Char));
        }
        let name = self.strings.intern(body);
        CExpr::new(format!("&{name}"), CTy::Val(Ty::Str))
    }

    fn group(&mut self, scope: &CScope, g: &Group, pid: &str) -> Result<CExpr, CodegenError> {
        let err = scope.id.clone();
        match g.kind {
            GroupKind::Binary | GroupKind::Compare => self.binary(scope, g, pid),
            GroupKind::Assignment => {
                if g.inner[1].is_keyword("in") {
                    return Err(CodegenError::Unsupported {
                        scope: err,
                        construct: "`in` binding outside a for header".into(),
                    });
                }
                let sign = g.inner[1]
                    .as_leaf()
                    .map(|t| t.text.clone())
                    .unwrap_or_default();
                let left = self.val(scope, &g.inner[0], pid)?;
                let right = self.val(scope, &g.inner[2], pid)?;
                if !matches!(left.ty.val(), Some(Ty::Double | Ty::Bool)) {
                    return Err(CodegenError::Unsupported {
                        scope: err,
                        construct: "expression assignment of a non-scalar".into(),
                    });
                }
                let mut deps = left.deps.clone();
                deps.push(format!("{} {sign} {}", left.code, right.final_code()));
                Ok(CExpr {
                    code: left.code,
                    ty: right.ty,
                    is_new: false,
                    deps,
                    components: Vec::new(),
                })
            }
            GroupKind::Attr => {
                let owner = self.val(scope, &g.inner[0], pid)?;
                let member = g.inner[2].leaf_text(TokenKind::Name).ok_or_else(|| {
                    CodegenError::Unsupported {
                        scope: err.clone(),
                        construct: "computed attribute access".into(),
                    }
                })?;
                self.attr_expr(&err, owner, member)
            }
            GroupKind::Call => self.call_group(scope, g, pid),
            GroupKind::Index => {
                let owner = self.val(scope, &g.inner[0], pid)?;
                let bracket = g.inner[1].inner();
                let idx = bracket.first().ok_or_else(|| CodegenError::Unsupported {
                    scope: err.clone(),
                    construct: "empty subscript".into(),
                })?;
                self.index_expr(scope, owner, idx, pid)
            }
            GroupKind::List => {
                let mut exprs = Vec::with_capacity(g.inner.len());
                for n in &g.inner {
                    exprs.push(self.val(scope, n, pid)?);
                }
                let types: Vec<CTy> = exprs.iter().map(|e| e.ty.clone()).collect();
                let tup = self.tuple_ty(types);
                let tname = self.cname(&tup, &err)?;
                let sval = exprs
                    .iter()
                    .map(CExpr::final_code)
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(CExpr {
                    code: format!("(({tname}){{{sval}}})"),
                    ty: tup,
                    is_new: false,
                    deps: Vec::new(),
                    components: exprs,
                })
            }
            GroupKind::Paren => match g.inner.len() {
                0 => Err(CodegenError::Unsupported {
                    scope: err,
                    construct: "empty tuple".into(),
                }),
                1 => self.val(scope, &g.inner[0], pid),
                _ => Err(CodegenError::Unsupported {
                    scope: err,
                    construct: "adhoc generator expression".into(),
                }),
            },
            GroupKind::Bracket => match g.inner.len() {
                0 => {
                    let vt = self.elem(format!("list_items:{pid}"), &err)?;
                    let ut = union_tag(&vt).ok_or_else(|| CodegenError::Type {
                        scope: err.clone(),
                        ty: vt.to_string(),
                    })?;
                    Ok(CExpr::fresh(
                        format!("new_list(thread, NULL, 0, {ut})"),
                        CTy::Val(Ty::List(pid.to_string())),
                    ))
                }
                1 => self.val(scope, &g.inner[0], pid),
                _ => Err(CodegenError::Unsupported {
                    scope: err,
                    construct: "list comprehension".into(),
                }),
            },
            GroupKind::Brace => self.brace_literal(scope, g, pid),
            GroupKind::Range => Err(CodegenError::Unsupported {
                scope: err,
                construct: "slice outside a subscript".into(),
            }),
            GroupKind::Unary => {
                let e = self.val(scope, &g.inner[1], pid)?;
                let sign = if g.inner[0].is_keyword("not") {
                    "!"
                } else if g.inner[0].is_sign("-") {
                    "-"
                } else if g.inner[0].is_sign("~") {
                    "~"
                } else {
                    return Err(CodegenError::Unsupported {
                        scope: err,
                        construct: format!("unary {}", g.inner[0].describe()),
                    });
                };
                Ok(CExpr {
                    code: format!("{sign}({})", e.code),
                    ty: e.ty,
                    is_new: true,
                    deps: e.deps,
                    components: Vec::new(),
                })
            }
            GroupKind::Pair => Err(CodegenError::Unsupported {
                scope: err,
                construct: "typed pair outside a unit header".into(),
            }),
        }
    }

    fn binary(&mut self, scope: &CScope, g: &Group, pid: &str) -> Result<CExpr, CodegenError> {
        let err = scope.id.clone();
        let sign = g.inner[1]
            .as_leaf()
            .map(|t| t.text.clone())
            .unwrap_or_default();
        let mut left = self.val(scope, &g.inner[0], pid)?;
        let mut right = self.val(scope, &g.inner[2], pid)?;

        let native = |e: &CExpr| matches!(e.ty.val(), Some(Ty::Double | Ty::Bool));
        let chars = left.ty == CTy::Val(Ty::Char) && right.ty == CTy::Val(Ty::Char);
        if (native(&left) && native(&right)) || chars {
            let c_sign = match sign.as_str() {
                "and" => "&&",
                "or" => "||",
                s => s,
            };
            let ty = if sign.len() == 1 && "+-/*%&^|".contains(&sign) {
                left.ty.clone()
            } else {
                CTy::Val(Ty::Bool)
            };
            return Ok(CExpr::fresh(
                format!("({}) {c_sign} ({})", left.final_code(), right.final_code()),
                ty,
            ));
        }

        let negate = sign == "is not in";
        if sign == "is in" || sign == "is not in" {
            std::mem::swap(&mut left, &mut right);
        }
        let method = match sign.as_str() {
            "and" => "__and__",
            "or" => "__or__",
            "+" => "__plus__",
            "-" => "__minus__",
            "/" => "__div__",
            "*" => "__mult__",
            "%" => "__mod__",
            "&" => "__band__",
            "|" => "__bor__",
            "^" => "__bxor__",
            "is in" | "is not in" => "__isin__",
            "==" => "__eq__",
            "!=" => "__neq__",
            _ => {
                return Err(CodegenError::Unsupported {
                    scope: err,
                    construct: format!("operator `{sign}` on {} and {}", left.ty, right.ty),
                });
            }
        };
        let recv = left.ty.clone();
        let mut out = self.call_on(&err, &recv, method, Args::new(vec![left, right]))?;
        if negate {
            out.code = format!("!({})", out.code);
        }
        Ok(out)
    }

    fn attr_expr(&mut self, err: &str, owner: CExpr, member: &str) -> Result<CExpr, CodegenError> {
        let reg = self.reg;
        match owner.ty.val() {
            Some(Ty::Instance(iid)) => {
                let ty = reg
                    .ty_of(iid, member)
                    .cloned()
                    .ok_or_else(|| CodegenError::MissingName {
                        name: member.to_string(),
                        scope: iid.clone(),
                    })?;
                let owner = self.absorb(owner);
                Ok(CExpr::new(
                    format!("({})->{}", owner.final_code(), var(member)),
                    CTy::Val(ty),
                ))
            }
            Some(Ty::Module(m)) => {
                let ty = reg
                    .ty_of(m, member)
                    .cloned()
                    .ok_or_else(|| CodegenError::MissingName {
                        name: member.to_string(),
                        scope: m.clone(),
                    })?;
                match ty {
                    Ty::Func(_) => Ok(CExpr::new(
                        format!("module_{}.{member}", mangle(m)),
                        CTy::Val(ty),
                    )),
                    other => Err(CodegenError::Unsupported {
                        scope: err.to_string(),
                        construct: format!("module attribute of type {other}"),
                    }),
                }
            }
            _ => Err(CodegenError::Unsupported {
                scope: err.to_string(),
                construct: format!("attribute `{member}` on a {} value", owner.ty),
            }),
        }
    }

    fn call_group(&mut self, scope: &CScope, g: &Group, pid: &str) -> Result<CExpr, CodegenError> {
        let err = scope.id.clone();
        let argvals = self.args_from_paren(scope, &g.inner[1], pid)?;

        if let Some(attr) = g.inner[0].as_group().filter(|a| a.kind == GroupKind::Attr)
            && let Some(member) = attr.inner.last().and_then(|n| n.leaf_text(TokenKind::Name))
        {
            if member == "read" && self.is_stdin_chain(scope, &attr.inner[0]) {
                return Ok(CExpr::fresh("rt_read_input(thread)", CTy::Val(Ty::Str)));
            }
            let member = member.to_string();
            let owner = self.val(scope, &attr.inner[0], pid)?;

            // a dict's value view aliases its backing storage
            if member == "values"
                && let Some(Ty::Dict(did)) = owner.ty.val()
            {
                let did = did.clone();
                let owner = self.absorb(owner);
                return Ok(CExpr::new(
                    format!("(&({})->values)", owner.final_code()),
                    CTy::Val(Ty::DictValues(did)),
                ));
            }

            let mut args = Args::new(argvals);
            let recv = owner.ty.clone();
            if !matches!(owner.ty.val(), Some(Ty::Module(_))) {
                args.prepend(owner);
            }
            return self.call_on(&err, &recv, &member, args);
        }

        if let Some(name) = g.inner[0].leaf_text(TokenKind::Name) {
            if let Some((_, ty)) = scope.find_full(self.reg, name, 1) {
                return match ty {
                    Ty::Func(fid) => self.user_call(&fid, Args::new(argvals)),
                    Ty::Class(cid) => self.construct(&cid, Args::new(argvals)),
                    Ty::Interface(_) => {
                        // registering a conformance is free at runtime
                        let mut argvals = argvals;
                        if argvals.len() != 1 {
                            return Err(CodegenError::Unsupported {
                                scope: err,
                                construct: "interface call without exactly one argument".into(),
                            });
                        }
                        Ok(argvals.remove(0))
                    }
                    other => Err(CodegenError::Unsupported {
                        scope: err,
                        construct: format!("calling a {other} value"),
                    }),
                };
            }
            return self.builtin_call(&err, name, argvals);
        }

        Err(CodegenError::Unsupported {
            scope: err,
            construct: "call of a computed callee".into(),
        })
    }

    fn is_stdin_chain(&self, scope: &CScope, node: &Node) -> bool {
        let Some(attr) = node.as_group().filter(|a| a.kind == GroupKind::Attr) else {
            return false;
        };
        attr.inner[0].leaf_text(TokenKind::Name) == Some("sys")
            && attr
                .inner
                .last()
                .and_then(|n| n.leaf_text(TokenKind::Name))
                == Some("stdin")
            && scope.find_full(self.reg, "sys", 1).is_none()
    }

    pub(crate) fn index_expr(
        &mut self,
        scope: &CScope,
        owner: CExpr,
        idx: &Node,
        pid: &str,
    ) -> Result<CExpr, CodegenError> {
        let err = scope.id.clone();

        if let Some(range) = idx.as_group().filter(|r| r.kind == GroupKind::Range) {
            if owner.ty != CTy::Val(Ty::Str) {
                return Err(CodegenError::Unsupported {
                    scope: err,
                    construct: format!("slicing a {} value", owner.ty),
                });
            }
            let parts = slice_parts(range);
            let mut mask = vec![true];
            let mut vals = vec![owner];
            for part in parts {
                mask.push(part.is_some());
                match part {
                    Some(t) => vals.push(self.val(scope, t, pid)?),
                    Option::None => vals.push(CExpr::new("0", CTy::Val(Ty::Double))),
                }
            }
            let call = self.rt_method(&err, &Ty::Str, "__range__")?;
            return self.rt_call(&err, call, Args::with_mask(vals, mask));
        }

        // interned and block-local tuples index by constant field
        if self.fields_of(&owner.ty).is_some() {
            let n: usize = idx
                .leaf_text(TokenKind::Digit)
                .and_then(|d| d.parse().ok())
                .ok_or_else(|| CodegenError::Unsupported {
                    scope: err.clone(),
                    construct: "tuple subscript with a computed index".into(),
                })?;
            let fields = self.fields_of(&owner.ty).unwrap_or_default();
            let ty = fields.get(n).cloned().ok_or_else(|| CodegenError::Type {
                scope: err.clone(),
                ty: format!("{} field {n}", owner.ty),
            })?;
            return Ok(CExpr {
                code: format!("({}).i{n}", owner.code),
                ty,
                is_new: false,
                deps: owner.deps,
                components: Vec::new(),
            });
        }

        let iv = self.val(scope, idx, pid)?;
        let recv = owner.ty.clone();
        self.call_on(&err, &recv, "__at__", Args::new(vec![owner, iv]))
    }

    fn brace_literal(
        &mut self,
        scope: &CScope,
        g: &Group,
        pid: &str,
    ) -> Result<CExpr, CodegenError> {
        let err = scope.id.clone();
        let reg = self.reg;

        // a recorded element slot marks this literal as a set
        if reg.container(&format!("set_elements:{pid}")).is_some() && !g.inner.is_empty() {
            let et = self.elem(format!("set_elements:{pid}"), &err)?;
            let ut = union_tag(&et).ok_or_else(|| CodegenError::Type {
                scope: err.clone(),
                ty: et.to_string(),
            })?;
            let items: Vec<&Node> = if g.inner[0].is_group(GroupKind::List) {
                g.inner[0].inner().iter().collect()
            } else {
                vec![&g.inner[0]]
            };
            let mut flat = Vec::with_capacity(items.len());
            for item in items {
                flat.push(self.val(scope, item, pid)?);
            }
            let n = flat.len();
            let arr = self.union_array(flat);
            return Ok(CExpr::fresh(
                format!("new_set(thread, {arr}, {n}, {ut})"),
                CTy::Val(Ty::Set(pid.to_string())),
            ));
        }

        let kt = self.elem(format!("dict_keys:{pid}"), &err)?;
        let vt = self.elem(format!("dict_values:{pid}"), &err)?;
        let (kut, vut) = match (union_tag(&kt), union_tag(&vt)) {
            (Some(k), Some(v)) => (k, v),
            _ => {
                return Err(CodegenError::Type {
                    scope: err,
                    ty: format!("dict of {kt} to {vt}"),
                });
            }
        };
        if g.inner.is_empty() {
            return Ok(CExpr::fresh(
                format!("new_dict(thread, NULL, NULL, 0, {kut}, {vut})"),
                CTy::Val(Ty::Dict(pid.to_string())),
            ));
        }

        let entries: Vec<&Node> = if g.inner[0].is_group(GroupKind::List) {
            g.inner[0].inner().iter().collect()
        } else {
            vec![&g.inner[0]]
        };
        let mut keys = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        for entry in &entries {
            let pair = entry
                .as_group()
                .filter(|p| p.kind == GroupKind::Range && p.inner.len() >= 3)
                .ok_or_else(|| CodegenError::Unsupported {
                    scope: err.clone(),
                    construct: "dict entry without key and value".into(),
                })?;
            keys.push(self.val(scope, &pair.inner[0], pid)?);
            values.push(self.val(scope, &pair.inner[2], pid)?);
        }
        let n = entries.len();
        let karr = self.union_array(keys);
        let varr = self.union_array(values);
        Ok(CExpr::fresh(
            format!("new_dict(thread, {karr}, {varr}, {n}, {kut}, {vut})"),
            CTy::Val(Ty::Dict(pid.to_string())),
        ))
    }
}

fn coerce_of(cast: &Option<ArgCast>) -> Coerce {
    match cast {
        Option::None => Coerce::Skip,
        Some(ArgCast::Ref) => Coerce::Ref,
        Some(ArgCast::Str) => Coerce::Str,
    }
}

/// The `i:j:k` bounds of a slice group, `None` where a bound is omitted.
pub(crate) fn slice_parts(g: &Group) -> [Option<&Node>; 3] {
    let mut parts: [Option<&Node>; 3] = [None, None, None];
    let mut token = 0usize;
    for part in parts.iter_mut() {
        if token >= g.inner.len() {
            break;
        }
        if g.inner[token].is_sign(":") {
            token += 1;
        } else {
            *part = Some(&g.inner[token]);
            token += 2;
        }
    }
    parts
}
