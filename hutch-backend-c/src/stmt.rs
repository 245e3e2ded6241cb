//! Statement lowering: walks each module's phrase list and prints one C
//! function per unit, a loop/switch pair per generator, static storage and
//! constructors per class, and `load_`/`clean_` entry points per module.
//!
//! Every compound statement is wrapped in its own brace block so the
//! temporaries its expressions absorb can be declared at the top of the
//! block and released at its end.

use std::mem;

use hutch_ast::{
    Group, GroupKind, Node, Phrase, PhraseKind, TokenKind, anon_slot, instance_scope, phrase_id,
};
use hutch_infer::{ModuleCode, Session, Ty};

use crate::CodegenError;
use crate::ctype::{CTy, cty_name, ty_name, union_cast};
use crate::expr::{Args, CExpr, CScope, FrameRender, Lowerer};
use crate::names::{field, mangle, var};

pub(crate) fn compile(session: &Session) -> Result<String, CodegenError> {
    let mut c = Compiler {
        session,
        low: Lowerer::new(&session.registry),
        out: String::new(),
        head: String::new(),
        tabs: 0,
        original_tabs: 0,
        cleanup: Vec::new(),
        yields: 0,
        in_generator: false,
    };
    for name in &session.order {
        c.module(name)?;
    }
    c.export_modules();

    let mut program = String::from("struct str_obj *__main__;\n\n");
    program.push_str(&c.head);
    if !c.low.strings.is_empty() {
        program.push('\n');
        program.push_str(&c.low.strings.render());
    }
    program.push('\n');
    program.push_str(&c.out);
    Ok(program)
}

/// Standalone entry point: builds `__main__` from argv, loads every module
/// in dependency order and unloads in the same order.
pub(crate) fn print_main(order: &[String]) -> String {
    let mut out = String::from("#include \"runtime.h\"\n\n");
    out.push_str("extern struct str_obj *__main__;\n");
    for name in order {
        let m = mangle(name);
        out.push_str(&format!("void load_{m}(struct thread *thread);\n"));
        out.push_str(&format!("void clean_{m}(struct thread *thread);\n"));
    }
    out.push_str("\nint main(int argc, char **argv) {\n");
    out.push_str("\tstruct thread main_thread;\n");
    out.push_str("\tstruct thread *thread = &main_thread;\n");
    out.push_str("\trt_thread_init(thread);\n");
    out.push_str(
        "\t__main__ = rt_chars_to_str(thread, \
         (unsigned char *)(argc > 1 ? argv[1] : \"__main__\"), \
         argc > 1 ? strlen(argv[1]) : 8);\n",
    );
    for name in order {
        out.push_str(&format!("\tload_{}(thread);\n", mangle(name)));
    }
    for name in order {
        out.push_str(&format!("\tclean_{}(thread);\n", mangle(name)));
    }
    out.push_str("\trt_str_free(thread, __main__);\n");
    out.push_str("\treturn 0;\n}\n");
    out
}

/// Names that never become storage: the return slot, loop iterators, cast
/// overlays and compile-time-only bindings.
fn phantom(n: &str, ty: &Ty) -> bool {
    n.is_empty()
        || n.starts_with('@')
        || n.starts_with("(cast)")
        || matches!(
            ty,
            Ty::Func(_) | Ty::FuncPtr(_) | Ty::Class(_) | Ty::Module(_) | Ty::Interface(_)
        )
}

/// Last index of the indented block under the header at `at`.
fn skip_block(phrases: &[Phrase], at: usize) -> usize {
    let level = phrases[at].level;
    let mut k = at;
    while k + 1 < phrases.len() && phrases[k + 1].level > level {
        k += 1;
    }
    k
}

struct Compiler<'a> {
    session: &'a Session,
    low: Lowerer<'a>,
    /// compiled function bodies
    out: String,
    /// module and class storage records, printed before the bodies
    head: String,
    tabs: usize,
    /// indentation of the enclosing function body, where resume labels go
    original_tabs: usize,
    /// queued release statements for the current unit's locals
    cleanup: Vec<String>,
    yields: usize,
    in_generator: bool,
}

impl Compiler<'_> {
    fn line(&mut self, s: &str) {
        for _ in 0..self.tabs {
            self.out.push('\t');
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    fn named(&self, scope: &str, ty: &Ty) -> Result<String, CodegenError> {
        ty_name(ty).ok_or_else(|| CodegenError::Type {
            scope: scope.to_string(),
            ty: ty.to_string(),
        })
    }

    /// Splices a closed frame's declarations back in at `mark`, the point
    /// just inside the statement's brace.
    fn insert_render(&mut self, mark: usize, frame: &FrameRender) {
        if frame.structs.is_empty() && frame.decls.is_empty() {
            return;
        }
        let ind = "\t".repeat(self.tabs + 1);
        let mut pre = String::new();
        for l in &frame.structs {
            pre.push_str(&format!("{ind}{l}\n"));
        }
        for d in &frame.decls {
            pre.push_str(&format!("{ind}{d};\n"));
        }
        self.out.insert_str(mark, &pre);
    }

    /// Runs one simple statement inside its own frame; the produced lines
    /// get brace-wrapped only when the frame minted something.
    fn stmt_frame<F>(&mut self, f: F) -> Result<(), CodegenError>
    where
        F: FnOnce(&mut Self) -> Result<Vec<String>, CodegenError>,
    {
        self.low.push_frame();
        let body = f(self);
        let frame = self.low.pop_frame()?;
        let body = body?;
        if frame.structs.is_empty() && frame.decls.is_empty() && frame.cleanup.is_empty() {
            for l in &body {
                self.line(l);
            }
            return Ok(());
        }
        self.line("{");
        self.tabs += 1;
        for l in &frame.structs {
            self.line(l);
        }
        for d in &frame.decls {
            let d = format!("{d};");
            self.line(&d);
        }
        for l in &body {
            self.line(l);
        }
        for op in &frame.cleanup {
            let op = format!("{op};");
            self.line(&op);
        }
        self.tabs -= 1;
        self.line("}");
        Ok(())
    }

    /// Condition text for a loop or branch header. Temporaries the condition
    /// absorbed are released inline so re-evaluation stays balanced.
    fn cond_code(
        &mut self,
        scope: &CScope,
        tree: &Node,
        pid: &str,
    ) -> Result<String, CodegenError> {
        let e = self.low.val(scope, tree, pid)?;
        if self.low.is_ref(&e.ty) {
            return Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: format!("condition holding a {} value", e.ty),
            });
        }
        let fwd = self.low.forward();
        if fwd.is_empty() {
            return Ok(e.final_code());
        }
        let v = self.low.temp(&CTy::Val(Ty::Bool), false);
        Ok(format!(
            "((({v} = ({})), 0) || ({}, 0) || {v})",
            e.final_code(),
            fwd.join(", ")
        ))
    }

    // ---- modules ---------------------------------------------------------

    fn module(&mut self, name: &str) -> Result<(), CodegenError> {
        let code = self
            .session
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| CodegenError::MissingName {
                name: name.to_string(),
                scope: "session".to_string(),
            })?;
        let m = mangle(name);
        self.low
            .strings
            .intern_named(name, &format!("module_name_str_{m}"));

        // module storage: one record per module, zero at program start
        let mut storage = String::from("struct {\n\tstruct object obj;\n");
        let mut releases = Vec::new();
        for (n, ty) in self.session.registry.names_in(name) {
            if phantom(n, ty) {
                continue;
            }
            storage.push_str(&format!("\t{} {};\n", self.named(name, ty)?, field(n)));
            for op in self
                .low
                .ref_ops(&CTy::Val(ty.clone()), "DEC_STACK", &format!("m_{m}.{}", field(n)))
            {
                releases.push(format!("\t{op};\n"));
            }
        }
        storage.push_str(&format!("}} m_{m} = {{0}};\n"));
        self.head.push_str(&storage);

        let root = CScope::module_root(name);
        self.tops(&code, 0, &root)?;

        self.line(&format!("void load_{m}(struct thread *thread) {{"));
        self.tabs = 1;
        self.original_tabs = 1;
        self.in_generator = false;
        self.cleanup = Vec::new();
        let mut scope = root.clone();
        self.segment(&code, 0, &mut scope)?;
        self.tabs = 0;
        self.line("}");

        self.line(&format!("void clean_{m}(struct thread *thread) {{"));
        self.line("\t(void)thread;");
        for r in &releases {
            self.out.push_str(r);
        }
        self.line("}");
        Ok(())
    }

    /// Per-module function tables, filled with the compiled units.
    fn export_modules(&mut self) {
        let mut text = String::new();
        for name in &self.session.order {
            let m = mangle(name);
            let mut entries = Vec::new();
            for (n, ty) in self.session.registry.names_in(name) {
                if n.starts_with('@') {
                    continue;
                }
                if let Ty::Func(fid) = ty {
                    entries.push(format!("\t.{n} = f_{},\n", mangle(fid)));
                }
            }
            if entries.is_empty() {
                text.push_str(&format!("struct module_{m} module_{m};\n"));
                continue;
            }
            text.push_str(&format!("struct module_{m} module_{m} = {{\n"));
            for e in entries {
                text.push_str(&e);
            }
            text.push_str("};\n");
        }
        self.out.push_str(&text);
    }

    /// Compiles the units and classes of one block, recursing into nested
    /// definitions. Statements are left for `segment`.
    fn tops(&mut self, code: &ModuleCode, i: usize, scope: &CScope) -> Result<usize, CodegenError> {
        let mut level: Option<usize> = None;
        let mut j = i as isize - 1;
        while ((j + 1) as usize) < code.phrases.len() {
            j += 1;
            let jj = j as usize;
            let s = &code.phrases[jj];
            match level {
                None => level = Some(s.level),
                Some(l) if l > s.level => {
                    j -= 1;
                    break;
                }
                Some(_) => {}
            }
            let sid = phrase_id(&code.name, jj);
            match s.kind {
                PhraseKind::Unit if self.session.registry.has_scope(&sid) => {
                    self.unit(code, jj, scope, &sid)?;
                    let inner = CScope::child(&sid, scope);
                    j = self.tops(code, jj + 1, &inner)? as isize;
                }
                PhraseKind::Class if self.session.registry.has_scope(&sid) => {
                    j = self.class(code, jj, scope, &sid)? as isize;
                }
                PhraseKind::Unit | PhraseKind::Class | PhraseKind::Interface => {
                    j = skip_block(&code.phrases, jj) as isize;
                }
                _ => {}
            }
        }
        Ok(j.max(0) as usize)
    }

    // ---- units -----------------------------------------------------------

    fn unit(
        &mut self,
        code: &ModuleCode,
        at: usize,
        parent: &CScope,
        sid: &str,
    ) -> Result<(), CodegenError> {
        let text = code.phrases[at].text.trim().to_string();
        self.line(&format!("// {text}"));
        if self.session.registry.is_generator(sid) {
            self.generator(code, at, parent, sid)
        } else {
            self.plain_unit(code, at, parent, sid)
        }
    }

    fn signature(&self, sid: &str, skip: usize) -> Result<(Vec<String>, String), CodegenError> {
        let reg = &self.session.registry;
        let args: Vec<String> = reg.func_args(sid).unwrap_or(&[]).to_vec();
        let mut params = vec!["struct thread *thread".to_string()];
        for a in args.iter().skip(skip) {
            let ty = reg.ty_of(sid, a).ok_or_else(|| CodegenError::MissingName {
                name: a.clone(),
                scope: sid.to_string(),
            })?;
            params.push(format!("{} {}", self.named(sid, ty)?, var(a)));
        }
        Ok((args, params.join(", ")))
    }

    /// Declares the unit's surviving locals and queues their release.
    fn put_vars(&mut self, sid: &str, args: &[String]) -> Result<(), CodegenError> {
        let locals: Vec<(String, Ty)> = self
            .session
            .registry
            .names_in(sid)
            .filter(|&(n, ty)| !phantom(n, ty) && !args.contains(n))
            .map(|(n, ty)| (n.clone(), ty.clone()))
            .collect();
        for (n, ty) in locals {
            let tname = self.named(sid, &ty)?;
            let cty = CTy::Val(ty.clone());
            let init = if !self.low.is_ref(&cty) {
                String::new()
            } else if matches!(ty, Ty::Shape(_)) {
                " = {0}".to_string()
            } else {
                format!(" = ({tname})0")
            };
            self.line(&format!("{tname} {}{init};", var(&n)));
            for op in self.low.ref_ops(&cty, "DEC_STACK", &var(&n)) {
                self.cleanup.push(format!("{op};"));
            }
        }
        Ok(())
    }

    fn plain_unit(
        &mut self,
        code: &ModuleCode,
        at: usize,
        parent: &CScope,
        sid: &str,
    ) -> Result<(), CodegenError> {
        let ret = self
            .session
            .registry
            .ty_of(sid, "")
            .cloned()
            .unwrap_or(Ty::Void);
        let rname = self.named(sid, &ret)?;
        let (args, params) = self.signature(sid, 0)?;
        self.line(&format!("{rname} f_{}({params}) {{", mangle(sid)));

        let saved_cleanup = mem::take(&mut self.cleanup);
        let saved_gen = self.in_generator;
        self.in_generator = false;
        self.tabs = 1;
        self.original_tabs = 1;

        self.put_vars(sid, &args)?;
        let mut scope = CScope::child(sid, parent);
        self.segment(code, at + 1, &mut scope)?;
        for op in self.cleanup.clone() {
            self.line(&op);
        }

        self.cleanup = saved_cleanup;
        self.in_generator = saved_gen;
        self.tabs = 0;
        self.line("}");
        Ok(())
    }

    fn generator(
        &mut self,
        code: &ModuleCode,
        at: usize,
        parent: &CScope,
        sid: &str,
    ) -> Result<(), CodegenError> {
        let m = mangle(sid);
        let (args, params) = self.signature(sid, 0)?;
        let fields: Vec<(String, Ty)> = self
            .session
            .registry
            .names_in(sid)
            .filter(|(n, _)| !n.is_empty() && !n.starts_with("(cast)"))
            .map(|(n, ty)| (n.clone(), ty.clone()))
            .collect();

        self.line(&format!(
            "static void free_{m}(struct thread *thread, struct object *obj) {{"
        ));
        self.line(&format!("\tstruct g_{m} *self = (struct g_{m} *)obj;"));
        for (n, ty) in &fields {
            for op in self.low.ref_ops(
                &CTy::Val(ty.clone()),
                "DEC_HEAP",
                &format!("self->{}", field(n)),
            ) {
                self.line(&format!("\t{op};"));
            }
        }
        self.line("\tfree(self);");
        self.line("}");

        self.line(&format!("struct g_{m} *f_{m}({params}) {{"));
        self.line(&format!("\tstruct g_{m} *self = NEWZ(g_{m});"));
        self.line(&format!("\tself->obj.free = (delete)free_{m};"));
        for a in &args {
            let ty = self
                .session
                .registry
                .ty_of(sid, a)
                .cloned()
                .ok_or_else(|| CodegenError::MissingName {
                    name: a.clone(),
                    scope: sid.to_string(),
                })?;
            self.line(&format!("\tself->{} = {};", field(a), var(a)));
            for op in self.low.ref_ops(
                &CTy::Val(ty),
                "INC_HEAP",
                &format!("self->{}", field(a)),
            ) {
                self.line(&format!("\t{op};"));
            }
        }
        self.line("\treturn self;");
        self.line("}");

        self.line(&format!(
            "bool loop_{m}(struct thread *thread, struct g_{m} *self) {{"
        ));
        self.line("\tswitch (self->jump) {");
        self.line("\tcase 0:;");

        let saved_cleanup = mem::take(&mut self.cleanup);
        let saved_yields = self.yields;
        let saved_gen = self.in_generator;
        self.yields = 0;
        self.in_generator = true;
        self.tabs = 1;
        self.original_tabs = 1;
        let mut scope = CScope::stateless(sid, parent, "self->");
        self.segment(code, at + 1, &mut scope)?;
        let done = self.yields + 1;
        self.yields = saved_yields;
        self.in_generator = saved_gen;
        self.cleanup = saved_cleanup;

        self.line("\tdefault:;");
        self.line(&format!("\t\tself->jump = {done}u;"));
        self.line("\t}");
        self.line("\treturn false;");
        self.tabs = 0;
        self.line("}");
        Ok(())
    }

    // ---- classes ---------------------------------------------------------

    fn class(
        &mut self,
        code: &ModuleCode,
        at: usize,
        parent: &CScope,
        sid: &str,
    ) -> Result<usize, CodegenError> {
        let m = mangle(sid);
        let text = code.phrases[at].text.trim().to_string();
        self.head
            .push_str(&format!("struct static_{m} s_{m} = {{0}};\n"));

        self.line(&format!("// {text}"));
        let mut store = CScope::stored(sid, parent, &format!("s_{m}."));
        self.line(&format!("void static_init_{m}(struct thread *thread) {{"));
        self.line("\t(void)thread;");
        self.tabs = 1;
        self.original_tabs = 1;
        let end = self.segment(code, at + 1, &mut store)?;
        self.tabs = 0;
        self.line("}");

        self.tops(code, at + 1, &store)?;
        self.destructor(sid)?;
        self.maker(sid)?;
        Ok(end)
    }

    fn destructor(&mut self, cid: &str) -> Result<(), CodegenError> {
        let m = mangle(cid);
        let inst = instance_scope(cid);
        let fields: Vec<(String, Ty)> = self
            .session
            .registry
            .names_in(&inst)
            .filter(|&(n, ty)| !phantom(n, ty))
            .map(|(n, ty)| (n.clone(), ty.clone()))
            .collect();
        self.line(&format!(
            "static void unmake_{m}(struct thread *thread, struct object *obj) {{"
        ));
        self.line(&format!("\tstruct o_{m} *self = (struct o_{m} *)obj;"));
        for (n, ty) in &fields {
            for op in self.low.ref_ops(
                &CTy::Val(ty.clone()),
                "DEC_HEAP",
                &format!("self->{}", field(n)),
            ) {
                self.line(&format!("\t{op};"));
            }
        }
        self.line("\tfree(self);");
        self.line("}");
        Ok(())
    }

    fn maker(&mut self, cid: &str) -> Result<(), CodegenError> {
        let reg = &self.session.registry;
        let m = mangle(cid);
        let init = match reg.ty_of(cid, "__init__") {
            Some(Ty::Func(f)) if !reg.is_generator(f) => Some(f.clone()),
            _ => None,
        };
        let (params, forwarded, init_m) = match &init {
            Some(init) => {
                let (args, params) = self.signature(init, 1)?;
                let forwarded: Vec<String> = args.iter().skip(1).map(|a| var(a)).collect();
                (params, forwarded, Some(mangle(init)))
            }
            None => ("struct thread *thread".to_string(), Vec::new(), None),
        };
        self.line(&format!("struct o_{m}* f_{m}({params}) {{"));
        self.line(&format!("\tstruct o_{m} *obj = NEWZ(o_{m});"));
        self.line(&format!("\tobj->obj.free = (delete)unmake_{m};"));
        if let Some(init_m) = init_m {
            let mut call = vec!["thread".to_string(), "obj".to_string()];
            call.extend(forwarded);
            self.line(&format!("\tf_{init_m}({});", call.join(", ")));
        }
        self.line("\treturn obj;");
        self.line("}");
        Ok(())
    }

    // ---- statements ------------------------------------------------------

    fn segment(
        &mut self,
        code: &ModuleCode,
        i: usize,
        scope: &mut CScope,
    ) -> Result<usize, CodegenError> {
        let mut level: Option<usize> = None;
        let mut j = i as isize - 1;
        while ((j + 1) as usize) < code.phrases.len() {
            j += 1;
            let jj = j as usize;
            let s = &code.phrases[jj];
            match level {
                None => level = Some(s.level),
                Some(l) if l > s.level => {
                    j -= 1;
                    break;
                }
                Some(_) => {}
            }
            let pid = phrase_id(&code.name, jj);
            match s.kind {
                PhraseKind::Unit | PhraseKind::Interface => {
                    j = skip_block(&code.phrases, jj) as isize;
                }
                PhraseKind::Class => {
                    if self.session.registry.has_scope(&pid) {
                        self.line(&format!("static_init_{}(thread);", mangle(&pid)));
                    }
                    j = skip_block(&code.phrases, jj) as isize;
                }
                PhraseKind::InterfaceUnit | PhraseKind::Pass => {}
                PhraseKind::Import | PhraseKind::ImportFrom => {
                    self.line(&format!("// {}", s.text.trim()));
                }
                PhraseKind::Return => self.return_stmt(scope, s.tree(), &pid)?,
                PhraseKind::Yield => self.yield_stmt(scope, s.tree(), &pid)?,
                PhraseKind::YieldFrom => {
                    return Err(CodegenError::Unsupported {
                        scope: scope.id.clone(),
                        construct: "yield from".into(),
                    });
                }
                PhraseKind::Raise => self.line("RAISE_TRAP();"),
                PhraseKind::Break => self.line("break;"),
                PhraseKind::Continue => self.line("continue;"),
                PhraseKind::Assert => self.assert_stmt(scope, s.tree(), &pid)?,
                PhraseKind::For => j = self.for_stmt(code, jj, scope, &pid)? as isize,
                PhraseKind::While => j = self.while_stmt(code, jj, scope, &pid)? as isize,
                PhraseKind::If => j = self.if_chain(code, jj, s.level, scope)? as isize,
                PhraseKind::Cast => j = self.cast_stmt(code, jj, scope, &pid)? as isize,
                PhraseKind::Expr => self.expr_stmt(scope, s.tree(), &pid)?,
                PhraseKind::Elif
                | PhraseKind::Else
                | PhraseKind::Try
                | PhraseKind::Except
                | PhraseKind::With => {
                    return Err(CodegenError::Unsupported {
                        scope: scope.id.clone(),
                        construct: format!("statement `{}`", s.text.trim()),
                    });
                }
            }
        }
        Ok(j.max(0) as usize)
    }

    fn expr_stmt(
        &mut self,
        scope: &CScope,
        tree: Option<&Node>,
        pid: &str,
    ) -> Result<(), CodegenError> {
        let Some(tree) = tree else {
            return Ok(());
        };
        if let Some(g) = tree.as_group().filter(|g| g.kind == GroupKind::Assignment)
            && !g.inner[1].is_keyword("in")
        {
            return self.assign_stmt(scope, g, pid);
        }
        self.stmt_frame(|c| {
            let e = c.low.val(scope, tree, pid)?;
            if e.is_new && c.low.is_ref(&e.ty) {
                let tmp = c.low.temp(&e.ty, true);
                Ok(vec![format!("{tmp} = {};", e.final_code())])
            } else {
                Ok(vec![format!("(void)({});", e.final_code())])
            }
        })
    }

    // ---- assignment ------------------------------------------------------

    fn assign_stmt(&mut self, scope: &CScope, g: &Group, pid: &str) -> Result<(), CodegenError> {
        let sign = g.inner[1]
            .as_leaf()
            .map(|t| t.text.clone())
            .unwrap_or_default();
        self.stmt_frame(|c| {
            let right = c.low.val(scope, &g.inner[2], pid)?;
            let mut lines = Vec::new();
            c.assign_to(scope, &g.inner[0], &sign, right, pid, &mut lines)?;
            Ok(lines)
        })
    }

    fn assign_to(
        &mut self,
        scope: &CScope,
        target: &Node,
        sign: &str,
        right: CExpr,
        pid: &str,
        lines: &mut Vec<String>,
    ) -> Result<(), CodegenError> {
        match target {
            Node::Leaf(t) if t.kind == TokenKind::Name => {
                let (lvalue, lty) = scope
                    .find_full(self.low.reg, &t.text, 1)
                    .ok_or_else(|| CodegenError::MissingName {
                        name: t.text.clone(),
                        scope: scope.id.clone(),
                    })?;
                let heap = scope.is_heap(self.low.reg, &t.text);
                self.assign_lvalue(scope, &lvalue, CTy::Val(lty), sign, right, heap, lines)
            }
            Node::Group(tg)
                if matches!(tg.kind, GroupKind::List | GroupKind::Paren | GroupKind::Bracket) =>
            {
                self.destructure(scope, tg, sign, right, pid, lines)
            }
            Node::Group(tg) if tg.kind == GroupKind::Index => {
                self.index_assign(scope, tg, sign, right, pid, lines)
            }
            Node::Group(tg) if tg.kind == GroupKind::Attr => {
                let member = tg.inner[2].leaf_text(TokenKind::Name).ok_or_else(|| {
                    CodegenError::Unsupported {
                        scope: scope.id.clone(),
                        construct: "computed attribute target".into(),
                    }
                })?;
                let owner = self.low.val(scope, &tg.inner[0], pid)?;
                match owner.ty.val().cloned() {
                    Some(Ty::Instance(iid)) => {
                        let lty = self
                            .low
                            .reg
                            .ty_of(&iid, member)
                            .cloned()
                            .ok_or_else(|| CodegenError::MissingName {
                                name: member.to_string(),
                                scope: iid.clone(),
                            })?;
                        let owner = self.low.absorb(owner);
                        let lvalue = format!("({})->{}", owner.final_code(), var(member));
                        self.assign_lvalue(scope, &lvalue, CTy::Val(lty), sign, right, true, lines)
                    }
                    Some(Ty::Module(mid)) => {
                        let lty = self
                            .low
                            .reg
                            .ty_of(&mid, member)
                            .cloned()
                            .ok_or_else(|| CodegenError::MissingName {
                                name: member.to_string(),
                                scope: mid.clone(),
                            })?;
                        let lvalue = format!("m_{}.{}", mangle(&mid), var(member));
                        self.assign_lvalue(scope, &lvalue, CTy::Val(lty), sign, right, false, lines)
                    }
                    other => Err(CodegenError::Unsupported {
                        scope: scope.id.clone(),
                        construct: format!(
                            "attribute target on a {} value",
                            other.map(|t| t.to_string()).unwrap_or_default()
                        ),
                    }),
                }
            }
            other => Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: format!("assignment target {}", other.describe()),
            }),
        }
    }

    fn destructure(
        &mut self,
        scope: &CScope,
        tg: &Group,
        sign: &str,
        right: CExpr,
        pid: &str,
        lines: &mut Vec<String>,
    ) -> Result<(), CodegenError> {
        if sign != "=" {
            return Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: format!("`{sign}` with a destructuring target"),
            });
        }
        let targets: Vec<Node> = if tg.inner.len() == 1 && tg.inner[0].is_group(GroupKind::List) {
            tg.inner[0].inner().to_vec()
        } else {
            tg.inner.clone()
        };
        let arity = |n: usize| -> Result<(), CodegenError> {
            if n == targets.len() {
                Ok(())
            } else {
                Err(CodegenError::Unsupported {
                    scope: scope.id.clone(),
                    construct: format!("destructuring {n} values into {} names", targets.len()),
                })
            }
        };

        // a tuple literal on the right assigns element by element
        if !right.components.is_empty() {
            arity(right.components.len())?;
            for (t, comp) in targets.iter().zip(right.components.clone()) {
                self.assign_to(scope, t, "=", comp, pid, lines)?;
            }
            return Ok(());
        }

        if let Some(fields) = self.low.fields_of(&right.ty) {
            arity(fields.len())?;
            let tmp = self.low.temp(&right.ty, false);
            lines.push(format!("{tmp} = {};", right.final_code()));
            for (i, (t, fty)) in targets.iter().zip(fields).enumerate() {
                self.assign_to(scope, t, "=", CExpr::new(format!("{tmp}.i{i}"), fty), pid, lines)?;
            }
            return Ok(());
        }

        if let Some(Ty::List(id)) = right.ty.val().cloned() {
            let vt = self
                .low
                .reg
                .container(&format!("list_items:{id}"))
                .cloned()
                .ok_or_else(|| CodegenError::Type {
                    scope: scope.id.clone(),
                    ty: format!("list `{id}` without an element record"),
                })?;
            let owner = self.low.absorb(right);
            for d in &owner.deps {
                lines.push(format!("{d};"));
            }
            for (i, t) in targets.iter().enumerate() {
                let item = union_cast(
                    &format!("RT_LIST_AT(thread, {}, {i})", owner.code),
                    &vt,
                )
                .ok_or_else(|| CodegenError::Type {
                    scope: scope.id.clone(),
                    ty: vt.to_string(),
                })?;
                self.assign_to(scope, t, "=", CExpr::new(item, CTy::Val(vt.clone())), pid, lines)?;
            }
            return Ok(());
        }

        Err(CodegenError::Unsupported {
            scope: scope.id.clone(),
            construct: format!("destructuring a {} value", right.ty),
        })
    }

    fn index_assign(
        &mut self,
        scope: &CScope,
        tg: &Group,
        sign: &str,
        right: CExpr,
        pid: &str,
        lines: &mut Vec<String>,
    ) -> Result<(), CodegenError> {
        let owner = self.low.val(scope, &tg.inner[0], pid)?;
        let bracket = tg.inner[1].inner();
        let idx = bracket.first().ok_or_else(|| CodegenError::Unsupported {
            scope: scope.id.clone(),
            construct: "empty subscript target".into(),
        })?;

        // tuple elements are plain struct fields
        if let Some(fields) = self.low.fields_of(&owner.ty) {
            let n: usize = idx
                .leaf_text(TokenKind::Digit)
                .and_then(|d| d.parse().ok())
                .ok_or_else(|| CodegenError::Unsupported {
                    scope: scope.id.clone(),
                    construct: "tuple target with a computed index".into(),
                })?;
            let fty = fields.get(n).cloned().ok_or_else(|| CodegenError::Type {
                scope: scope.id.clone(),
                ty: format!("{} field {n}", owner.ty),
            })?;
            for d in &owner.deps {
                lines.push(format!("{d};"));
            }
            let lvalue = format!("{}.i{n}", owner.code);
            return self.assign_lvalue(scope, &lvalue, fty, sign, right, false, lines);
        }

        if sign != "=" {
            return Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: format!("`{sign}` with a subscript target"),
            });
        }
        let iv = self.low.val(scope, idx, pid)?;
        let recv = owner.ty.clone();
        let call = self
            .low
            .call_on(&scope.id, &recv, "__setat__", Args::new(vec![owner, iv, right]))?;
        lines.push(format!("{};", call.final_code()));
        Ok(())
    }

    /// Stores `right` into a resolved lvalue, balancing reference counts.
    /// `heap` marks storage that outlives the current activation.
    fn assign_lvalue(
        &mut self,
        scope: &CScope,
        lvalue: &str,
        lty: CTy,
        sign: &str,
        right: CExpr,
        heap: bool,
        lines: &mut Vec<String>,
    ) -> Result<(), CodegenError> {
        if !self.low.is_ref(&lty) {
            lines.push(format!("{lvalue} {sign} {};", right.final_code()));
            return Ok(());
        }

        if sign != "=" {
            if sign != "+=" {
                return Err(CodegenError::Unsupported {
                    scope: scope.id.clone(),
                    construct: format!("`{sign}` on a {lty} value"),
                });
            }
            let left = CExpr::new(lvalue.to_string(), lty.clone());
            let grown = self
                .low
                .call_on(&scope.id, &lty.clone(), "__pluseq__", Args::new(vec![left, right]))?;
            return self.assign_lvalue(scope, lvalue, lty, "=", grown, heap, lines);
        }

        let right = if lty == CTy::Val(Ty::Str) && right.ty == CTy::Val(Ty::Char) {
            self.low
                .call_on(&scope.id, &CTy::Val(Ty::Char), "__str__", Args::new(vec![right]))?
        } else {
            right
        };

        let (inc, dec) = if heap {
            ("INC_HEAP", "DEC_HEAP")
        } else {
            ("INC_STACK", "DEC_STACK")
        };
        let tmp = self.low.temp(&right.ty, false);
        lines.push(format!("{tmp} = {};", right.final_code()));
        if !right.is_new {
            for op in self.low.ref_ops(&right.ty, inc, &tmp) {
                lines.push(format!("{op};"));
            }
        }
        for op in self.low.ref_ops(&lty, dec, lvalue) {
            lines.push(format!("{op};"));
        }
        lines.push(format!("{lvalue} = {tmp};"));
        Ok(())
    }

    // ---- control flow ----------------------------------------------------

    fn return_stmt(
        &mut self,
        scope: &CScope,
        tree: Option<&Node>,
        pid: &str,
    ) -> Result<(), CodegenError> {
        if self.in_generator {
            // a generator's return just ends the iteration
            self.line("return false;");
            return Ok(());
        }
        self.low.push_frame();
        let built = self.build_return(scope, tree, pid);
        let frame = self.low.pop_frame()?;
        let lines = built?;
        if frame.structs.is_empty() && frame.decls.is_empty() {
            for l in &lines {
                self.line(l);
            }
            return Ok(());
        }
        self.line("{");
        self.tabs += 1;
        for l in &frame.structs {
            self.line(l);
        }
        for d in &frame.decls {
            let d = format!("{d};");
            self.line(&d);
        }
        for l in &lines {
            self.line(l);
        }
        self.tabs -= 1;
        self.line("}");
        Ok(())
    }

    fn build_return(
        &mut self,
        scope: &CScope,
        tree: Option<&Node>,
        pid: &str,
    ) -> Result<Vec<String>, CodegenError> {
        let mut lines = Vec::new();
        let Some(tree) = tree else {
            lines.extend(self.cleanup.iter().cloned());
            lines.push("return;".to_string());
            return Ok(lines);
        };
        let e = self.low.val(scope, tree, pid)?;

        if self.low.is_ref(&e.ty) && !e.is_new && e.deps.is_empty() {
            // returning a live binding: take one reference for the caller
            for op in self.low.ref_ops(&e.ty, "INC_STACK", &e.code) {
                lines.push(format!("{op};"));
            }
            lines.extend(self.cleanup.iter().cloned());
            lines.push(format!("return {};", e.code));
            return Ok(lines);
        }

        let fwd = self.low.forward();
        if e.ty == CTy::Val(Ty::Void) {
            lines.push(format!("(void)({});", e.final_code()));
            for op in fwd {
                lines.push(format!("{op};"));
            }
            lines.extend(self.cleanup.iter().cloned());
            lines.push("return;".to_string());
            return Ok(lines);
        }
        if fwd.is_empty() && self.cleanup.is_empty() && !self.low.is_ref(&e.ty) {
            lines.push(format!("return {};", e.final_code()));
            return Ok(lines);
        }

        let tname = cty_name(&e.ty).ok_or_else(|| CodegenError::Type {
            scope: scope.id.clone(),
            ty: e.ty.to_string(),
        })?;
        lines.push("{".to_string());
        let mut inner = vec![format!("{tname} return_value = {};", e.final_code())];
        if !e.is_new {
            for op in self.low.ref_ops(&e.ty, "INC_STACK", "return_value") {
                inner.push(format!("{op};"));
            }
        }
        for op in fwd {
            inner.push(format!("{op};"));
        }
        inner.extend(self.cleanup.iter().cloned());
        inner.push("return return_value;".to_string());
        for l in inner {
            lines.push(format!("\t{l}"));
        }
        lines.push("}".to_string());
        Ok(lines)
    }

    fn yield_stmt(
        &mut self,
        scope: &CScope,
        tree: Option<&Node>,
        pid: &str,
    ) -> Result<(), CodegenError> {
        if !self.in_generator {
            return Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "yield outside a generator".into(),
            });
        }
        let tree = tree.ok_or_else(|| CodegenError::Unsupported {
            scope: scope.id.clone(),
            construct: "yield without a value".into(),
        })?;
        self.yields += 1;
        let n = self.yields;
        self.stmt_frame(|c| {
            let e = c.low.val(scope, tree, pid)?;
            let mut lines = vec![format!("self->value = {};", e.final_code())];
            if !e.is_new {
                for op in c.low.ref_ops(&e.ty, "INC_STACK", "self->value") {
                    lines.push(format!("{op};"));
                }
            }
            for op in c.low.forward() {
                lines.push(format!("{op};"));
            }
            lines.push(format!("self->jump = {n};"));
            lines.push("return true;".to_string());
            Ok(lines)
        })?;
        // the resume label lands after the statement's own block
        let ind = "\t".repeat(self.original_tabs);
        self.out.push_str(&format!("{ind}case {n}:;\n"));
        Ok(())
    }

    fn assert_stmt(
        &mut self,
        scope: &CScope,
        tree: Option<&Node>,
        pid: &str,
    ) -> Result<(), CodegenError> {
        let Some(tree) = tree else {
            return Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "assert without a condition".into(),
            });
        };
        self.stmt_frame(|c| {
            if tree.is_group(GroupKind::List) {
                let inner = tree.inner();
                let cond = c.low.val(scope, &inner[0], pid)?;
                let msg = c.low.val(scope, &inner[1], pid)?;
                let msg = if msg.ty == CTy::Val(Ty::Str) {
                    msg
                } else {
                    let ty = msg.ty.clone();
                    c.low.call_on(&scope.id, &ty, "__str__", Args::new(vec![msg]))?
                };
                Ok(vec![
                    format!("if (!({})) {{", cond.final_code()),
                    format!(
                        "\trt_print_str(thread, \"BUG (assert failed)! %s\\n\", {}, true);",
                        msg.final_code()
                    ),
                    "\tEXIT();".to_string(),
                    "}".to_string(),
                ])
            } else {
                let cond = c.low.val(scope, tree, pid)?;
                Ok(vec![
                    format!("if (!({})) {{", cond.final_code()),
                    "\tfprintf(stderr, \"BUG (assert failed)!\\n\");".to_string(),
                    "\tEXIT();".to_string(),
                    "}".to_string(),
                ])
            }
        })
    }

    fn cast_stmt(
        &mut self,
        code: &ModuleCode,
        at: usize,
        scope: &mut CScope,
        pid: &str,
    ) -> Result<usize, CodegenError> {
        let tree = code.phrases[at]
            .tree()
            .ok_or_else(|| CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "cast without names".into(),
            })?;
        let names: Vec<String> = if tree.is_group(GroupKind::List) {
            tree.inner()
                .iter()
                .filter_map(|n| n.leaf_text(TokenKind::Name))
                .map(str::to_string)
                .collect()
        } else {
            tree.leaf_text(TokenKind::Name)
                .map(str::to_string)
                .into_iter()
                .collect()
        };
        scope.push_casts(&self.session.registry, pid, &names)?;
        let end = self.segment(code, at + 1, scope);
        scope.pop_casts();
        end
    }

    fn while_stmt(
        &mut self,
        code: &ModuleCode,
        at: usize,
        scope: &mut CScope,
        pid: &str,
    ) -> Result<usize, CodegenError> {
        let tree = code.phrases[at]
            .tree()
            .ok_or_else(|| CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "while without a condition".into(),
            })?;
        self.line("{");
        self.low.push_frame();
        let mark = self.out.len();
        self.tabs += 1;
        let cond = self.cond_code(scope, tree, pid)?;
        self.line(&format!("while ({cond}) {{"));
        self.tabs += 1;
        let end = self.segment(code, at + 1, scope)?;
        self.tabs -= 1;
        self.line("}");
        let frame = self.low.pop_frame()?;
        self.tabs -= 1;
        self.insert_render(mark, &frame);
        self.tabs += 1;
        for op in &frame.cleanup {
            let op = format!("{op};");
            self.line(&op);
        }
        self.tabs -= 1;
        self.line("}");
        Ok(end)
    }

    fn if_chain(
        &mut self,
        code: &ModuleCode,
        at: usize,
        level: usize,
        scope: &mut CScope,
    ) -> Result<usize, CodegenError> {
        self.line("{");
        self.low.push_frame();
        let mark = self.out.len();
        self.tabs += 1;

        let pid = phrase_id(&code.name, at);
        let tree = code.phrases[at]
            .tree()
            .ok_or_else(|| CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "branch without a condition".into(),
            })?;
        let cond = self.cond_code(scope, tree, &pid)?;
        self.line(&format!("if ({cond}) {{"));
        self.tabs += 1;
        let mut end = self.segment(code, at + 1, scope)?;
        self.tabs -= 1;

        let mut i = end + 1;
        while i < code.phrases.len() {
            let s = &code.phrases[i];
            if s.level != level || !matches!(s.kind, PhraseKind::Elif | PhraseKind::Else) {
                break;
            }
            let is_else = s.kind == PhraseKind::Else;
            if is_else {
                self.line("} else {");
            } else {
                let pid = phrase_id(&code.name, i);
                let tree = s.tree().ok_or_else(|| CodegenError::Unsupported {
                    scope: scope.id.clone(),
                    construct: "branch without a condition".into(),
                })?;
                let cond = self.cond_code(scope, tree, &pid)?;
                self.line(&format!("}} else if ({cond}) {{"));
            }
            self.tabs += 1;
            end = self.segment(code, i + 1, scope)?;
            self.tabs -= 1;
            i = end + 1;
            if is_else {
                break;
            }
        }
        self.line("}");

        let frame = self.low.pop_frame()?;
        self.tabs -= 1;
        self.insert_render(mark, &frame);
        self.tabs += 1;
        for op in &frame.cleanup {
            let op = format!("{op};");
            self.line(&op);
        }
        self.tabs -= 1;
        self.line("}");
        Ok(end)
    }

    // ---- for loops -------------------------------------------------------

    fn for_stmt(
        &mut self,
        code: &ModuleCode,
        at: usize,
        scope: &mut CScope,
        pid: &str,
    ) -> Result<usize, CodegenError> {
        let header = code.phrases[at]
            .tree()
            .and_then(Node::as_group)
            .filter(|g| g.kind == GroupKind::Assignment && g.inner[1].is_keyword("in"))
            .ok_or_else(|| CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "malformed for header".into(),
            })?;
        let target = &header.inner[0];
        let iterable = &header.inner[2];
        let anon = anon_slot(pid);
        let anon_ty = self
            .session
            .registry
            .ty_of(&scope.id, &anon)
            .cloned()
            .ok_or_else(|| CodegenError::MissingName {
                name: anon,
                scope: scope.id.clone(),
            })?;

        self.line("{");
        self.low.push_frame();
        let mark = self.out.len();
        self.tabs += 1;
        let end = match &anon_ty {
            Ty::Generator(fid) => {
                let fid = fid.clone();
                self.for_generator(code, at, scope, pid, target, iterable, &fid)?
            }
            Ty::RangeCtor => self.for_range(code, at, scope, pid, target, iterable)?,
            Ty::List(_) | Ty::DictValues(_) => {
                self.for_list(code, at, scope, pid, target, iterable, &anon_ty)?
            }
            other => {
                return Err(CodegenError::Unsupported {
                    scope: scope.id.clone(),
                    construct: format!("iterating a {other} value"),
                });
            }
        };
        let frame = self.low.pop_frame()?;
        self.tabs -= 1;
        self.insert_render(mark, &frame);
        self.tabs += 1;
        for op in &frame.cleanup {
            let op = format!("{op};");
            self.line(&op);
        }
        self.tabs -= 1;
        self.line("}");
        Ok(end)
    }

    fn for_generator(
        &mut self,
        code: &ModuleCode,
        at: usize,
        scope: &mut CScope,
        pid: &str,
        target: &Node,
        iterable: &Node,
        fid: &str,
    ) -> Result<usize, CodegenError> {
        let m = mangle(fid);
        let elem = self
            .session
            .registry
            .ty_of(fid, "")
            .cloned()
            .unwrap_or(Ty::Void);
        let source = self.low.val(scope, iterable, pid)?;
        // inside a generator the iterator must survive suspension
        let it = if scope.is_stateless() {
            format!("self->{}", field(&anon_slot(pid)))
        } else {
            self.line(&format!("struct g_{m} *it = (struct g_{m} *)0;"));
            "it".to_string()
        };
        self.line(&format!("{it} = {};", source.final_code()));
        for op in self.low.forward() {
            self.line(&format!("{op};"));
        }
        self.line(&format!("while (loop_{m}(thread, {it})) {{"));
        self.tabs += 1;

        let mut lines = Vec::new();
        self.assign_to(
            scope,
            target,
            "=",
            CExpr::new(format!("({it})->value"), CTy::Val(elem.clone())),
            pid,
            &mut lines,
        )?;
        for op in self
            .low
            .ref_ops(&CTy::Val(elem), "DEC_STACK", &format!("({it})->value"))
        {
            lines.push(format!("{op};"));
        }
        for l in &lines {
            self.line(l);
        }
        let end = self.segment(code, at + 1, scope)?;
        self.tabs -= 1;
        self.line("}");
        // only the fall-through exit releases the handle; a return inside
        // the body skips this
        self.line(&format!("DEC_HEAP({it});"));
        self.line(&format!("{it} = (struct g_{m} *)0;"));
        Ok(end)
    }

    fn for_range(
        &mut self,
        code: &ModuleCode,
        at: usize,
        scope: &mut CScope,
        pid: &str,
        target: &Node,
        iterable: &Node,
    ) -> Result<usize, CodegenError> {
        let paren = iterable
            .as_group()
            .filter(|g| g.kind == GroupKind::Call)
            .map(|g| &g.inner[1])
            .ok_or_else(|| CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "range outside a direct for header".into(),
            })?;
        let bounds = self.low.args_from_paren(scope, paren, pid)?;
        let r = if scope.is_stateless() {
            format!("(&self->{})", field(&anon_slot(pid)))
        } else {
            self.line("struct range it;");
            "(&it)".to_string()
        };
        let mut vals = vec![CExpr::new(r.clone(), CTy::Val(Ty::RangeCtor))];
        vals.extend(bounds);
        let init = self
            .low
            .call_on(&scope.id, &CTy::Val(Ty::RangeCtor), "__init__", Args::new(vals))?;
        self.line(&format!(
            "for ({}; RT_RANGE_NOTDONE(thread, {r}); RT_RANGE_PROMOTE(thread, {r})) {{",
            init.final_code()
        ));
        self.tabs += 1;
        let mut lines = Vec::new();
        self.assign_to(
            scope,
            target,
            "=",
            CExpr::new(format!("RT_RANGE_CURRENT(thread, {r})"), CTy::Val(Ty::Double)),
            pid,
            &mut lines,
        )?;
        for l in &lines {
            self.line(l);
        }
        let end = self.segment(code, at + 1, scope)?;
        self.tabs -= 1;
        self.line("}");
        Ok(end)
    }

    fn for_list(
        &mut self,
        code: &ModuleCode,
        at: usize,
        scope: &mut CScope,
        pid: &str,
        target: &Node,
        iterable: &Node,
        anon_ty: &Ty,
    ) -> Result<usize, CodegenError> {
        if scope.is_stateless() {
            // a size_t cursor cannot survive suspension in the state record
            return Err(CodegenError::Unsupported {
                scope: scope.id.clone(),
                construct: "loop over a container inside a generator".into(),
            });
        }
        let slot = match anon_ty {
            Ty::List(id) => format!("list_items:{id}"),
            Ty::DictValues(id) => format!("dict_values:{id}"),
            _ => String::new(),
        };
        let vt = self
            .low
            .reg
            .container(&slot)
            .cloned()
            .ok_or_else(|| CodegenError::Type {
                scope: scope.id.clone(),
                ty: format!("container `{slot}` without an element record"),
            })?;
        let source = self.low.val(scope, iterable, pid)?;
        let source = self.low.absorb(source);
        for d in &source.deps {
            let d = format!("{d};");
            self.line(&d);
        }
        // a dict's values view is already a pointer to its backing list
        self.line(&format!("struct list *it_list = {};", source.code));
        self.line("for (size_t it_i = 0; it_i < it_list->n; it_i++) {");
        self.tabs += 1;
        let item = union_cast("RT_LIST_AT(thread, it_list, it_i)", &vt).ok_or_else(|| {
            CodegenError::Type {
                scope: scope.id.clone(),
                ty: vt.to_string(),
            }
        })?;
        let mut lines = Vec::new();
        self.assign_to(
            scope,
            target,
            "=",
            CExpr::new(item, CTy::Val(vt.clone())),
            pid,
            &mut lines,
        )?;
        for l in &lines {
            self.line(l);
        }
        let end = self.segment(code, at + 1, scope)?;
        self.tabs -= 1;
        self.line("}");
        Ok(end)
    }
}
