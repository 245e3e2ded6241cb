//! Declarations pass: tuple-shape structs, function prototypes, generator
//! state records, class static/instance records and per-module function
//! tables, all derived from the frozen registry.

use hutch_ast::{Phrase, PhraseKind, phrase_id};
use hutch_infer::{Registry, Session, Ty};

use crate::CodegenError;
use crate::ctype::ty_name;
use crate::names::{field, mangle, var};

/// Lexical chain of scope ids used to resolve a name's recorded type.
pub(crate) struct TypeChain<'a> {
    pub reg: &'a Registry,
    pub ids: Vec<String>,
}

impl TypeChain<'_> {
    pub fn push(&self, id: &str) -> TypeChain<'_> {
        let mut ids = self.ids.clone();
        ids.push(id.to_string());
        TypeChain { reg: self.reg, ids }
    }

    pub fn find(&self, name: &str) -> Option<&Ty> {
        self.ids
            .iter()
            .rev()
            .find_map(|id| self.reg.ty_of(id, name))
    }
}

pub fn declare(session: &Session) -> Result<String, CodegenError> {
    let mut d = Definer {
        reg: &session.registry,
        structs: Vec::new(),
        typedefs: Vec::new(),
        body: String::new(),
    };
    d.tuple_structs()?;

    for name in &session.order {
        let code = &session.modules[name];
        let chain = TypeChain {
            reg: d.reg,
            ids: vec![name.clone()],
        };
        d.block(name, &code.phrases, 0, &chain)?;
        d.module_struct(name)?;
    }

    let mut text = String::new();
    for s in &d.structs {
        text.push_str(&format!("struct {s};\n"));
    }
    for (name, ret, args) in &d.typedefs {
        text.push_str(&format!("typedef {ret} (*func_{name})({args});\n"));
    }
    text.push_str(&d.body);
    Ok(text)
}

struct Definer<'a> {
    reg: &'a Registry,
    structs: Vec<String>,
    typedefs: Vec<(String, String, String)>,
    body: String,
}

impl Definer<'_> {
    fn named(&self, scope: &str, ty: &Ty) -> Result<String, CodegenError> {
        ty_name(ty).ok_or_else(|| CodegenError::Type {
            scope: scope.to_string(),
            ty: ty.to_string(),
        })
    }

    fn tuple_structs(&mut self) -> Result<(), CodegenError> {
        // interning is bottom-up, so value fields always refer backwards
        for (id, fields) in self.reg.shapes().iter().enumerate() {
            self.structs.push(format!("tup_{id}"));
            self.body.push_str(&format!("struct tup_{id} {{\n"));
            for (i, ty) in fields.iter().enumerate() {
                let name = self.named(&format!("tup_{id}"), ty)?;
                self.body.push_str(&format!("\t{name} i{i};\n"));
            }
            self.body.push_str("};\n");
        }
        Ok(())
    }

    /// Return type recorded under the empty name; units that were never
    /// observed returning default to void.
    fn return_ty(&self, scope: &str) -> Ty {
        self.reg.ty_of(scope, "").cloned().unwrap_or(Ty::Void)
    }

    fn arg_list(&self, scope: &str, chain: &TypeChain, skip: usize) -> Result<String, CodegenError> {
        let args = self.reg.func_args(scope).unwrap_or(&[]);
        let inner = chain.push(scope);
        let mut parts = vec!["struct thread *thread".to_string()];
        for arg in args.iter().skip(skip) {
            let ty = inner.find(arg).ok_or_else(|| CodegenError::MissingName {
                name: arg.clone(),
                scope: scope.to_string(),
            })?;
            parts.push(format!("{} {}", self.named(scope, ty)?, var(arg)));
        }
        Ok(parts.join(", "))
    }

    fn declare_unit(&mut self, sid: &str, chain: &TypeChain) -> Result<(), CodegenError> {
        let name = mangle(sid);
        if !self.reg.is_generator(sid) {
            let ret = self.named(sid, &self.return_ty(sid))?;
            let args = self.arg_list(sid, chain, 0)?;
            self.body.push_str(&format!("{ret} f_{name}({args});\n"));
            self.typedefs.push((name, ret, args));
            return Ok(());
        }

        // generator: the state record carries every surviving local
        let ret = match self.reg.ty_of(sid, "") {
            Some(ty) => self.named(sid, ty)?,
            None => {
                return Err(CodegenError::Unsupported {
                    scope: sid.to_string(),
                    construct: "generator never advanced on the samples".into(),
                });
            }
        };
        let record = format!("g_{name}");
        self.body.push_str(&format!("struct {record} {{\n"));
        self.body.push_str("\tstruct object obj;\n");
        for (n, ty) in self.reg.names_in(sid) {
            if n.is_empty() || n.starts_with("(cast)") {
                continue;
            }
            let tname = self.named(sid, ty)?;
            self.body.push_str(&format!("\t{tname} {};\n", field(n)));
        }
        self.body.push_str(&format!("\t{ret} value;\n"));
        self.body.push_str("\tunsigned int jump;\n");
        self.body.push_str("};\n");
        self.structs.push(record.clone());

        let args = self.arg_list(sid, chain, 0)?;
        self.body
            .push_str(&format!("struct {record} *f_{name}({args});\n"));
        self.typedefs
            .push((name.clone(), format!("struct {record}*"), args));
        self.body.push_str(&format!(
            "bool loop_{name}(struct thread *thread, struct {record} *self);\n"
        ));
        Ok(())
    }

    fn init_id(&self, class_id: &str) -> Option<String> {
        match self.reg.ty_of(class_id, "__init__") {
            Some(Ty::Func(id)) if !self.reg.is_generator(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn constructor_decl(&mut self, class_id: &str, chain: &TypeChain) -> Result<(), CodegenError> {
        let name = mangle(class_id);
        let args = match self.init_id(class_id) {
            // the implicit self argument never appears in the signature
            Some(init) => self.arg_list(&init, chain, 1)?,
            None => "struct thread *thread".to_string(),
        };
        self.body
            .push_str(&format!("struct o_{name}* f_{name}({args});\n"));
        self.typedefs
            .push((name.clone(), format!("struct o_{name}*"), args));
        Ok(())
    }

    fn record_struct(&mut self, tag: &str, scope: &str, header: bool) -> Result<(), CodegenError> {
        self.body.push_str(&format!("struct {tag} {{\n"));
        if header {
            self.body.push_str("\tstruct object obj;\n");
        }
        for (n, ty) in self.reg.names_in(scope) {
            if n.is_empty()
                || n.starts_with("(cast)")
                || matches!(ty, Ty::Module(_) | Ty::Interface(_))
            {
                continue;
            }
            let tname = self.named(scope, ty)?;
            self.body.push_str(&format!("\t{tname} {};\n", field(n)));
        }
        self.body.push_str("};\n");
        self.structs.push(tag.to_string());
        Ok(())
    }

    fn declare_class(
        &mut self,
        module: &str,
        phrases: &[Phrase],
        sid: &str,
        body_at: usize,
        chain: &TypeChain,
    ) -> Result<usize, CodegenError> {
        let name = mangle(sid);
        self.record_struct(&format!("static_{name}"), sid, false)?;
        self.body
            .push_str(&format!("void static_init_{name}(struct thread *thread);\n"));

        let inner = chain.push(sid);
        let j = self.block(module, phrases, body_at, &inner)?;

        let instance = format!("{sid}[instance]");
        self.record_struct(&format!("o_{name}"), &instance, true)?;
        self.constructor_decl(sid, chain)?;
        Ok(j)
    }

    fn block(
        &mut self,
        module: &str,
        phrases: &[Phrase],
        i: usize,
        chain: &TypeChain,
    ) -> Result<usize, CodegenError> {
        let mut level: Option<usize> = None;
        let mut j = i as isize - 1;
        while ((j + 1) as usize) < phrases.len() {
            j += 1;
            let jj = j as usize;
            let s = &phrases[jj];
            match level {
                None => level = Some(s.level),
                Some(l) if l > s.level => {
                    j -= 1;
                    break;
                }
                Some(_) => {}
            }
            let sid = phrase_id(module, jj);
            match s.kind {
                PhraseKind::Unit if self.reg.has_scope(&sid) => {
                    self.body.push_str(&format!("// {}\n", s.text.trim()));
                    self.declare_unit(&sid, chain)?;
                    let inner = chain.push(&sid);
                    j = self.block(module, phrases, jj + 1, &inner)? as isize;
                }
                PhraseKind::Class if self.reg.has_scope(&sid) => {
                    self.body.push_str(&format!("// {}\n", s.text.trim()));
                    j = self.declare_class(module, phrases, &sid, jj + 1, chain)? as isize;
                }
                _ => {}
            }
        }
        Ok(j.max(0) as usize)
    }

    /// Per-module function table: one pointer per module-level unit.
    fn module_struct(&mut self, name: &str) -> Result<(), CodegenError> {
        self.body.push_str(&format!("struct module_{} {{\n", mangle(name)));
        for (n, ty) in self.reg.names_in(name) {
            if n.starts_with('@') {
                continue;
            }
            if let Ty::Func(_) = ty {
                let tname = self.named(name, ty)?;
                self.body.push_str(&format!("\t{tname} {n};\n"));
            }
        }
        self.body.push_str("};\n");
        self.body.push_str(&format!(
            "extern struct module_{m} module_{m};\n",
            m = mangle(name)
        ));
        Ok(())
    }
}
