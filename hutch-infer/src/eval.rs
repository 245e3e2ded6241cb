//! The sample-driven evaluator. Runs each module once as a real interpreted
//! program and records, as a side effect, the merged runtime type of every
//! binding and synthetic slot in the registry.

use std::collections::VecDeque;
use std::rc::Rc;

use hutch_ast::{
    Group, GroupKind, Node, Phrase, PhraseKind, TokenKind, anon_slot, cast_slot,
    comprehension_scope, instance_scope, phrase_id,
};
use hutch_lex::{string_body, unescape};

use crate::builtins;
use crate::scope::{ScopeRef, find, new_scope};
use crate::ty::Ty;
use crate::value::{
    ArgCast, Builtin, ClassObj, DictObj, FuncObj, GenObj, IfaceObj, InstanceObj, ListObj, Method,
    MethodOp, ModuleVal, SetObj, SliceVal, Value, describe, display_value, truthy, type_of,
    value_eq,
};
use crate::{InferError, ModuleCode, ModuleSource, Session};

/// Tagged exit of one block walk; `at` is the index of the last phrase the
/// walk consumed.
pub struct Flow {
    pub exit: Exit,
    pub at: usize,
}

pub enum Exit {
    End,
    Break,
    Continue,
    Return(Value),
}

impl Flow {
    fn end(at: usize) -> Self {
        Flow {
            exit: Exit::End,
            at,
        }
    }

    fn is_end(&self) -> bool {
        matches!(self.exit, Exit::End)
    }
}

/// Index of the last phrase of the block starting at `i`, where the block's
/// own level must be at least `min_level`.
fn skip_block(code: &ModuleCode, i: usize, min_level: usize) -> Result<usize, InferError> {
    let mut level: Option<usize> = None;
    let mut last: Option<usize> = None;
    for (j, phrase) in code.phrases.iter().enumerate().skip(i) {
        match level {
            None => {
                if phrase.level < min_level {
                    return Err(InferError::Indent {
                        module: code.name.clone(),
                        index: j,
                    });
                }
                level = Some(phrase.level);
                last = Some(j);
            }
            Some(l) if phrase.level < l => break,
            Some(_) => last = Some(j),
        }
    }
    last.ok_or(InferError::Indent {
        module: code.name.clone(),
        index: i,
    })
}

/// Does the body `i..=j` contain a `yield` that is not nested inside another
/// unit or class?
fn yield_lookup(code: &ModuleCode, i: usize, j: usize) -> Result<bool, InferError> {
    let mut k = i;
    while k <= j {
        match code.phrases[k].kind {
            PhraseKind::Unit | PhraseKind::Class => {
                k = skip_block(code, k + 1, 0)? + 1;
            }
            PhraseKind::Yield | PhraseKind::YieldFrom => return Ok(true),
            _ => k += 1,
        }
    }
    Ok(false)
}

struct ArgSpec {
    cast: Option<ArgCast>,
    name: String,
}

fn parse_arg(tree: &Node, scope_id: &str) -> Result<ArgSpec, InferError> {
    let cast_of = |word: &str| -> Result<ArgCast, InferError> {
        match word {
            "ref" => Ok(ArgCast::Ref),
            "str" => Ok(ArgCast::Str),
            other => Err(InferError::Unsupported {
                scope: scope_id.to_string(),
                construct: format!("parameter cast `{other}`"),
            }),
        }
    };
    if let Some(name) = tree.leaf_text(TokenKind::Name) {
        return Ok(ArgSpec {
            cast: None,
            name: name.to_string(),
        });
    }
    if tree.is_group(GroupKind::Pair) {
        let inner = tree.inner();
        let (Some(cast), Some(name)) = (
            inner[0].leaf_text(TokenKind::Name),
            inner[1].leaf_text(TokenKind::Name),
        ) else {
            return Err(malformed_header(scope_id));
        };
        return Ok(ArgSpec {
            cast: Some(cast_of(cast)?),
            name: name.to_string(),
        });
    }
    // defaulted parameter: the default expression only matters at call sites
    // in the source language, never during inference
    if tree.is_group(GroupKind::Assignment) && tree.inner()[1].is_sign("=") {
        return parse_arg(&tree.inner()[0], scope_id);
    }
    Err(malformed_header(scope_id))
}

fn parse_args(paren: &Node, scope_id: &str) -> Result<Vec<ArgSpec>, InferError> {
    let inner = paren.inner();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    if inner.len() != 1 {
        return Err(malformed_header(scope_id));
    }
    if inner[0].is_group(GroupKind::List) {
        inner[0]
            .inner()
            .iter()
            .map(|t| parse_arg(t, scope_id))
            .collect()
    } else {
        Ok(vec![parse_arg(&inner[0], scope_id)?])
    }
}

fn malformed_header(scope_id: &str) -> InferError {
    InferError::Unsupported {
        scope: scope_id.to_string(),
        construct: "malformed unit header".into(),
    }
}

pub struct Interp<'a> {
    pub session: &'a mut Session,
    source: &'a dyn ModuleSource,
    /// yield sinks of generator bodies currently collecting, innermost last
    yields: Vec<VecDeque<Value>>,
}

impl<'a> Interp<'a> {
    pub fn new(session: &'a mut Session, source: &'a dyn ModuleSource) -> Self {
        Interp {
            session,
            source,
            yields: Vec::new(),
        }
    }

    /// Loads, executes and records a module; returns its root scope. Already
    /// loaded modules are returned as-is, which also guards import cycles.
    pub fn load_module(&mut self, name: &str) -> Result<ScopeRef, InferError> {
        if let Some(scope) = self.session.scopes.get(name) {
            return Ok(scope.clone());
        }
        let input = self.source.load(name)?;
        let code = Rc::new(ModuleCode {
            name: name.to_string(),
            phrases: input.phrases,
        });
        let scope = new_scope(None, false, name.to_string());
        builtins::install(&scope, &input.sample);
        self.session.scopes.insert(name.to_string(), scope.clone());
        self.session.modules.insert(name.to_string(), code.clone());
        self.session.registry.add_scope(name);

        if !code.phrases.is_empty() {
            self.block(&code, 0, 0, &scope)?;
        }
        // dependencies executed during the body land first
        self.session.order.push(name.to_string());
        Ok(scope)
    }

    fn record(&mut self, scope: &str, name: &str, ty: Ty) -> Result<(), InferError> {
        self.session
            .registry
            .update(scope, name, ty)
            .map_err(|e| InferError::Join {
                scope: scope.to_string(),
                name: name.to_string(),
                left: e.left.to_string(),
                right: e.right.to_string(),
            })
    }

    fn record_container(&mut self, slot: &str, ty: Ty) -> Result<(), InferError> {
        self.session
            .registry
            .update_container(slot, ty)
            .map_err(|e| InferError::Join {
                scope: slot.to_string(),
                name: String::new(),
                left: e.left.to_string(),
                right: e.right.to_string(),
            })
    }

    /// Binds a name and records its observed type in the defining scope.
    fn bind(&mut self, scope: &ScopeRef, name: &str, value: Value) -> Result<(), InferError> {
        let sid = scope.borrow().scope_id.clone();
        let ty = type_of(&value).ok_or_else(|| InferError::Unsupported {
            scope: sid.clone(),
            construct: format!("binding a {} value to `{name}`", describe(&value)),
        })?;
        self.record(&sid, name, ty)?;
        scope.borrow_mut().vars.insert(name.to_string(), value);
        Ok(())
    }

    // ---- containers ----------------------------------------------------

    fn list_slot(id: &str) -> String {
        let id = id.strip_prefix("dict_values:").unwrap_or(id);
        format!("list_items:{id}")
    }

    fn new_list(&mut self, items: Vec<Value>, id: &str) -> Result<Value, InferError> {
        let slot = Self::list_slot(id);
        for item in &items {
            if let Some(ty) = type_of(item) {
                self.record_container(&slot, ty)?;
            }
        }
        Ok(Value::List(Rc::new(ListObj {
            items: std::cell::RefCell::new(items),
            id: id.to_string(),
        })))
    }

    fn new_dict(&mut self, entries: Vec<(Value, Value)>, id: &str) -> Result<Value, InferError> {
        for (k, v) in &entries {
            if let (Some(kt), Some(vt)) = (type_of(k), type_of(v)) {
                self.record_container(&format!("dict_keys:{id}"), kt)?;
                self.record_container(&format!("dict_values:{id}"), vt)?;
            }
        }
        Ok(Value::Dict(Rc::new(DictObj {
            entries: std::cell::RefCell::new(entries),
            id: id.to_string(),
        })))
    }

    fn new_set(&mut self, elems: Vec<Value>, id: &str) -> Result<Value, InferError> {
        for e in &elems {
            if let Some(ty) = type_of(e) {
                self.record_container(&format!("set_elements:{id}"), ty)?;
            }
        }
        let mut unique: Vec<Value> = Vec::new();
        for e in elems {
            if !unique.iter().any(|u| value_eq(u, &e)) {
                unique.push(e);
            }
        }
        Ok(Value::Set(Rc::new(SetObj {
            elems: std::cell::RefCell::new(unique),
            id: id.to_string(),
        })))
    }

    // ---- block walking -------------------------------------------------

    pub fn block(
        &mut self,
        code: &Rc<ModuleCode>,
        i: usize,
        min_level: usize,
        scope: &ScopeRef,
    ) -> Result<Flow, InferError> {
        let mut level: Option<usize> = None;
        let mut j = i as isize - 1;
        while ((j + 1) as usize) < code.phrases.len() {
            j += 1;
            let jj = j as usize;
            let s = &code.phrases[jj];

            match level {
                None => {
                    if s.level < min_level {
                        return Err(InferError::Indent {
                            module: code.name.clone(),
                            index: jj,
                        });
                    }
                    level = Some(s.level);
                }
                Some(l) if l > s.level => {
                    j -= 1;
                    break;
                }
                Some(_) => {}
            }
            let l = level.unwrap_or(min_level);
            let pid = phrase_id(&code.name, jj);
            let sid = scope.borrow().scope_id.clone();

            match s.kind {
                PhraseKind::Unit => {
                    j = self.define_func(s, code, jj + 1, l + 1, scope)? as isize;
                }
                PhraseKind::Class => {
                    j = self.define_class(s, code, jj + 1, l + 1, scope)? as isize;
                }
                PhraseKind::Interface => {
                    j = self.define_iface(s, code, jj + 1, l + 1, scope)? as isize;
                }
                PhraseKind::InterfaceUnit => {
                    self.iface_unit(s, &pid, scope)?;
                }
                PhraseKind::Import => {
                    let name = s
                        .tree()
                        .and_then(|t| t.leaf_text(TokenKind::Name))
                        .ok_or_else(|| InferError::Import {
                            module: code.name.clone(),
                            message: "malformed import".into(),
                        })?
                        .to_string();
                    let module = self.load_module(&name)?;
                    self.bind(
                        scope,
                        &name,
                        Value::Module(Rc::new(ModuleVal { scope: module })),
                    )?;
                }
                PhraseKind::ImportFrom => {
                    let [name, from] = &s.holes[..] else {
                        return Err(InferError::Import {
                            module: code.name.clone(),
                            message: "malformed import".into(),
                        });
                    };
                    let fullname = format!("{from}.{name}");
                    let module = self.load_module(&fullname)?;
                    self.bind(
                        scope,
                        name,
                        Value::Module(Rc::new(ModuleVal { scope: module })),
                    )?;
                }
                PhraseKind::Return => {
                    let value = match s.tree() {
                        Some(t) => self.eval(t, scope, &pid)?,
                        None => Value::None,
                    };
                    return Ok(Flow {
                        exit: Exit::Return(value),
                        at: jj,
                    });
                }
                PhraseKind::Yield => {
                    let value = match s.tree() {
                        Some(t) => self.eval(t, scope, &pid)?,
                        None => Value::None,
                    };
                    self.emit_yield(&sid, value)?;
                }
                PhraseKind::YieldFrom => {
                    let tree = s.tree().ok_or_else(|| InferError::Unsupported {
                        scope: sid.clone(),
                        construct: "bare yield from".into(),
                    })?;
                    let source = self.eval(tree, scope, &pid)?;
                    for value in self.iter_values(&source, &sid)? {
                        self.emit_yield(&sid, value)?;
                    }
                }
                PhraseKind::Raise => {
                    let message = match s.tree() {
                        Some(t) => display_value(&self.eval(t, scope, &pid)?),
                        None => "re-raise outside an except block".into(),
                    };
                    return Err(InferError::Sample { message });
                }
                PhraseKind::Break => {
                    return Ok(Flow {
                        exit: Exit::Break,
                        at: jj,
                    });
                }
                PhraseKind::Continue => {
                    return Ok(Flow {
                        exit: Exit::Continue,
                        at: jj,
                    });
                }
                PhraseKind::Pass => {}
                PhraseKind::Assert => {
                    let tree = s.tree().ok_or_else(|| InferError::Unsupported {
                        scope: sid.clone(),
                        construct: "bare assert".into(),
                    })?;
                    let (cond, message) = if tree.is_group(GroupKind::List) {
                        let inner = tree.inner();
                        let c = self.eval(&inner[0], scope, &pid)?;
                        let m = self.eval(&inner[1], scope, &pid)?;
                        (c, display_value(&m))
                    } else {
                        (self.eval(tree, scope, &pid)?, "Failure".to_string())
                    };
                    if !truthy(&cond) {
                        return Err(InferError::Sample {
                            message: format!("assertion failed: {message}"),
                        });
                    }
                }
                PhraseKind::For => {
                    let flow = self.for_loop(s, code, jj, l, scope, &pid, &sid)?;
                    if !flow.is_end() {
                        return Ok(flow);
                    }
                    j = flow.at as isize;
                }
                PhraseKind::While => {
                    let tree = s.tree().ok_or_else(|| InferError::Unsupported {
                        scope: sid.clone(),
                        construct: "while without a condition".into(),
                    })?;
                    loop {
                        let cond = self.eval(tree, scope, &pid)?;
                        if !truthy(&cond) {
                            break;
                        }
                        let flow = self.block(code, jj + 1, l + 1, scope)?;
                        match flow.exit {
                            Exit::Return(_) => return Ok(flow),
                            Exit::Break => break,
                            Exit::Continue | Exit::End => {}
                        }
                    }
                    j = skip_block(code, jj + 1, l + 1)? as isize;
                }
                PhraseKind::If => {
                    let flow = self.if_else(code, jj, l, scope)?;
                    if !flow.is_end() {
                        return Ok(flow);
                    }
                    j = flow.at as isize;
                }
                PhraseKind::Cast => {
                    let flow = self.cast_block(s, code, jj, l, scope, &pid, &sid)?;
                    return Ok(flow);
                }
                PhraseKind::Expr => {
                    let tree = s.tree().ok_or_else(|| InferError::Unsupported {
                        scope: sid.clone(),
                        construct: "empty statement".into(),
                    })?;
                    self.eval(tree, scope, &pid)?;
                }
                PhraseKind::Elif
                | PhraseKind::Else
                | PhraseKind::Try
                | PhraseKind::Except
                | PhraseKind::With => {
                    return Err(InferError::Unsupported {
                        scope: sid,
                        construct: format!("statement `{}`", s.text.trim()),
                    });
                }
            }
        }
        Ok(Flow::end(j.max(0) as usize))
    }

    fn emit_yield(&mut self, scope_id: &str, value: Value) -> Result<(), InferError> {
        let ty = type_of(&value).ok_or_else(|| InferError::Unsupported {
            scope: scope_id.to_string(),
            construct: format!("yielding a {} value", describe(&value)),
        })?;
        self.record(scope_id, "", ty)?;
        match self.yields.last_mut() {
            Some(sink) => {
                sink.push_back(value);
                Ok(())
            }
            None => Err(InferError::Unsupported {
                scope: scope_id.to_string(),
                construct: "yield outside a generator".into(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn for_loop(
        &mut self,
        s: &Phrase,
        code: &Rc<ModuleCode>,
        jj: usize,
        l: usize,
        scope: &ScopeRef,
        pid: &str,
        sid: &str,
    ) -> Result<Flow, InferError> {
        let tree = s.tree().filter(|t| t.is_group(GroupKind::Assignment));
        let tree = tree.ok_or_else(|| InferError::Unsupported {
            scope: sid.to_string(),
            construct: "malformed for header".into(),
        })?;
        let inner = tree.inner();
        if !inner[1].is_keyword("in") {
            return Err(InferError::Unsupported {
                scope: sid.to_string(),
                construct: "malformed for header".into(),
            });
        }
        let target = &inner[0];
        let value = self.eval(&inner[2], scope, pid)?;
        let ty = type_of(&value).ok_or_else(|| InferError::Unsupported {
            scope: sid.to_string(),
            construct: format!("iterating a {} value", describe(&value)),
        })?;
        self.record(sid, &anon_slot(pid), ty)?;

        for item in self.iter_values(&value, sid)? {
            self.assign(target, item, scope, pid)?;
            let flow = self.block(code, jj + 1, l + 1, scope)?;
            match flow.exit {
                Exit::Return(_) => return Ok(flow),
                Exit::Break => break,
                Exit::Continue | Exit::End => {}
            }
        }
        let at = skip_block(code, jj + 1, l + 1)?;
        Ok(Flow::end(at))
    }

    fn if_else(
        &mut self,
        code: &Rc<ModuleCode>,
        j: usize,
        level: usize,
        scope: &ScopeRef,
    ) -> Result<Flow, InferError> {
        let sid = scope.borrow().scope_id.clone();
        let eval_cond = |me: &mut Self, at: usize| -> Result<bool, InferError> {
            let pid = phrase_id(&code.name, at);
            let tree = code.phrases[at]
                .tree()
                .ok_or_else(|| InferError::Unsupported {
                    scope: sid.clone(),
                    construct: "branch without a condition".into(),
                })?;
            let v = me.eval(tree, scope, &pid)?;
            Ok(truthy(&v))
        };

        let mut taken = eval_cond(self, j)?;
        let mut i;
        if taken {
            let flow = self.block(code, j + 1, level + 1, scope)?;
            if !flow.is_end() {
                return Ok(flow);
            }
            i = flow.at + 1;
        } else {
            i = skip_block(code, j + 1, level + 1)? + 1;
        }

        while i < code.phrases.len() {
            let s = &code.phrases[i];
            if s.level > level {
                return Err(InferError::Indent {
                    module: code.name.clone(),
                    index: i,
                });
            }
            if s.level < level || !matches!(s.kind, PhraseKind::Else | PhraseKind::Elif) {
                return Ok(Flow::end(i - 1));
            }
            if taken {
                i = skip_block(code, i + 1, level + 1)? + 1;
                continue;
            }
            if s.kind == PhraseKind::Else {
                return self.block(code, i + 1, level + 1, scope);
            }
            taken = eval_cond(self, i)?;
            if taken {
                let flow = self.block(code, i + 1, level + 1, scope)?;
                if !flow.is_end() {
                    return Ok(flow);
                }
                i = flow.at + 1;
            } else {
                i = skip_block(code, i + 1, level + 1)? + 1;
            }
        }
        Ok(Flow::end(i - 1))
    }

    #[allow(clippy::too_many_arguments)]
    fn cast_block(
        &mut self,
        s: &Phrase,
        code: &Rc<ModuleCode>,
        jj: usize,
        l: usize,
        scope: &ScopeRef,
        pid: &str,
        sid: &str,
    ) -> Result<Flow, InferError> {
        let tree = s.tree().ok_or_else(|| InferError::Unsupported {
            scope: sid.to_string(),
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
        if names.is_empty() {
            return Err(InferError::Unsupported {
                scope: sid.to_string(),
                construct: "cast without names".into(),
            });
        }

        for name in &names {
            let value = find(scope, name).ok_or_else(|| InferError::MissingName {
                name: name.clone(),
                scope: sid.to_string(),
            })?;
            let payload = match &value {
                Value::Opaque(inner) => (**inner).clone(),
                other => other.clone(),
            };
            let ty = type_of(&payload).ok_or_else(|| InferError::Unsupported {
                scope: sid.to_string(),
                construct: format!("casting a {} value", describe(&payload)),
            })?;
            self.record(sid, &cast_slot(pid, name), ty)?;
        }

        scope.borrow_mut().push_casts(&names);
        let flow = self.block(code, jj + 1, l + 1, scope)?;
        scope.borrow_mut().pop_casts();
        match flow.exit {
            Exit::Return(_) => Ok(flow),
            _ => Err(InferError::Unsupported {
                scope: sid.to_string(),
                construct: "cast block must end in return".into(),
            }),
        }
    }

    // ---- definitions ---------------------------------------------------

    fn define_func(
        &mut self,
        header: &Phrase,
        code: &Rc<ModuleCode>,
        i: usize,
        min_level: usize,
        scope: &ScopeRef,
    ) -> Result<usize, InferError> {
        let scope_id = phrase_id(&code.name, i - 1);
        let tree = header.tree().filter(|t| t.is_group(GroupKind::Call));
        let tree = tree.ok_or_else(|| malformed_header(&scope_id))?;
        let inner = tree.inner();
        let name = inner[0]
            .leaf_text(TokenKind::Name)
            .ok_or_else(|| malformed_header(&scope_id))?
            .to_string();
        let specs = parse_args(&inner[1], &scope_id)?;

        let j = skip_block(code, i, min_level)?;
        let is_generator = yield_lookup(code, i, j)?;

        let args: Vec<String> = specs.iter().map(|a| a.name.clone()).collect();
        let cast_cols: Vec<Option<ArgCast>> = specs.iter().map(|a| a.cast).collect();
        let casts: Vec<(usize, ArgCast)> = specs
            .iter()
            .enumerate()
            .filter_map(|(k, a)| a.cast.map(|c| (k, c)))
            .collect();

        self.session
            .registry
            .set_func_args(&scope_id, args.clone(), cast_cols);
        if is_generator {
            self.session.registry.mark_generator(&scope_id);
        }

        let f = FuncObj {
            code: code.clone(),
            body: i,
            args,
            casts,
            parent: scope.clone(),
            is_generator,
            scope_id: scope_id.clone(),
        };
        self.bind(scope, &name, Value::Func(Rc::new(f)))?;
        Ok(j)
    }

    fn define_class(
        &mut self,
        header: &Phrase,
        code: &Rc<ModuleCode>,
        i: usize,
        min_level: usize,
        scope: &ScopeRef,
    ) -> Result<usize, InferError> {
        let scope_id = phrase_id(&code.name, i - 1);
        let pid = scope_id.clone();
        let tree = header.tree().ok_or_else(|| malformed_header(&scope_id))?;

        let name = if let Some(n) = tree.leaf_text(TokenKind::Name) {
            n.to_string()
        } else if tree.is_group(GroupKind::Call) {
            let inner = tree.inner();
            // base expressions run for their effects but carry no semantics
            self.eval(&inner[1], scope, &pid)?;
            inner[0]
                .leaf_text(TokenKind::Name)
                .ok_or_else(|| malformed_header(&scope_id))?
                .to_string()
        } else {
            return Err(malformed_header(&scope_id));
        };

        self.session.registry.add_scope(&scope_id);
        self.session.registry.add_scope(&instance_scope(&scope_id));

        let class_scope = new_scope(Some(scope.clone()), false, scope_id.clone());
        let class = ClassObj {
            code: code.clone(),
            body: i,
            scope: class_scope.clone(),
            scope_id,
        };
        self.bind(scope, &name, Value::Class(Rc::new(class)))?;

        let flow = self.block(code, i, min_level, &class_scope)?;
        Ok(flow.at)
    }

    fn define_iface(
        &mut self,
        header: &Phrase,
        code: &Rc<ModuleCode>,
        i: usize,
        min_level: usize,
        scope: &ScopeRef,
    ) -> Result<usize, InferError> {
        let scope_id = phrase_id(&code.name, i - 1);
        let name = header
            .tree()
            .and_then(|t| t.leaf_text(TokenKind::Name))
            .ok_or_else(|| malformed_header(&scope_id))?
            .to_string();

        self.session.registry.add_interface(&scope_id);
        let iface_scope = new_scope(Some(scope.clone()), false, scope_id.clone());
        let iface = IfaceObj {
            scope: iface_scope.clone(),
            scope_id,
        };
        self.bind(scope, &name, Value::Interface(Rc::new(iface)))?;

        let flow = self.block(code, i, min_level, &iface_scope)?;
        Ok(flow.at)
    }

    /// `unit name(args)` without a body, inside an interface: records the
    /// method slot as a function pointer.
    fn iface_unit(&mut self, s: &Phrase, pid: &str, scope: &ScopeRef) -> Result<(), InferError> {
        let tree = s.tree().filter(|t| t.is_group(GroupKind::Call));
        let tree = tree.ok_or_else(|| malformed_header(pid))?;
        let inner = tree.inner();
        let name = inner[0]
            .leaf_text(TokenKind::Name)
            .ok_or_else(|| malformed_header(pid))?
            .to_string();
        let specs = parse_args(&inner[1], pid)?;
        let args: Vec<String> = specs.iter().map(|a| a.name.clone()).collect();
        let casts: Vec<Option<ArgCast>> = specs.iter().map(|a| a.cast).collect();
        self.session.registry.set_func_args(pid, args, casts);

        let sid = scope.borrow().scope_id.clone();
        self.record(&sid, &name, Ty::FuncPtr(pid.to_string()))
    }

    // ---- calls ---------------------------------------------------------

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        pid: &str,
    ) -> Result<Value, InferError> {
        match callee {
            Value::Func(f) => self.call_func(&f, args),
            Value::Class(c) => self.construct(&c, args),
            Value::Interface(i) => self.iface_call(&i, args),
            Value::Builtin(b) => self.call_builtin(&b, args, pid),
            Value::Method(m) => self.call_method(*m, args, pid),
            other => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("calling a {} value", describe(&other)),
            }),
        }
    }

    fn call_func(&mut self, f: &Rc<FuncObj>, mut args: Vec<Value>) -> Result<Value, InferError> {
        if args.len() != f.args.len() {
            return Err(InferError::Arity {
                scope: f.scope_id.clone(),
                expected: f.args.len(),
                got: args.len(),
            });
        }
        for (i, cast) in &f.casts {
            match cast {
                ArgCast::Ref => {
                    let wrapped = Value::Opaque(Rc::new(args[*i].clone()));
                    args[*i] = wrapped;
                }
                ArgCast::Str => {
                    if !matches!(args[*i], Value::Str(_)) {
                        return Err(InferError::Unsupported {
                            scope: f.scope_id.clone(),
                            construct: format!(
                                "str parameter bound to a {} value",
                                describe(&args[*i])
                            ),
                        });
                    }
                }
            }
        }

        let call_scope = new_scope(Some(f.parent.clone()), false, f.scope_id.clone());
        let names = f.args.clone();
        for (name, value) in names.iter().zip(args) {
            self.bind(&call_scope, name, value)?;
        }

        if f.is_generator {
            return Ok(Value::Gen(Rc::new(GenObj {
                func: f.clone(),
                scope: call_scope,
                state: std::cell::RefCell::new(Default::default()),
            })));
        }

        let flow = self.block(&f.code, f.body, 0, &call_scope)?;
        let ret = match flow.exit {
            Exit::Return(v) => v,
            Exit::End => Value::None,
            Exit::Break | Exit::Continue => {
                return Err(InferError::Unsupported {
                    scope: f.scope_id.clone(),
                    construct: "break or continue escaping a unit".into(),
                });
            }
        };
        if let Some(ty) = type_of(&ret) {
            self.record(&f.scope_id, "", ty)?;
        }
        Ok(ret)
    }

    fn construct(&mut self, class: &Rc<ClassObj>, args: Vec<Value>) -> Result<Value, InferError> {
        let inst_scope = new_scope(
            Some(class.scope.clone()),
            true,
            instance_scope(&class.scope_id),
        );
        let instance = Value::Instance(Rc::new(InstanceObj {
            scope: inst_scope.clone(),
        }));
        if let Some(init) = find(&inst_scope, "__init__") {
            let Value::Func(f) = init else {
                return Err(InferError::Unsupported {
                    scope: class.scope_id.clone(),
                    construct: "__init__ is not a unit".into(),
                });
            };
            let mut with_self = Vec::with_capacity(args.len() + 1);
            with_self.push(instance.clone());
            with_self.extend(args);
            self.call_func(&f, with_self)?;
            self.session.registry.add_constructor(&f.scope_id);
        }
        Ok(instance)
    }

    fn iface_call(&mut self, iface: &Rc<IfaceObj>, args: Vec<Value>) -> Result<Value, InferError> {
        if args.len() != 1 {
            return Err(InferError::Arity {
                scope: iface.scope_id.clone(),
                expected: 1,
                got: args.len(),
            });
        }
        let arg = args.into_iter().next().unwrap_or(Value::None);
        let Value::Instance(inst) = &arg else {
            return Err(InferError::Unsupported {
                scope: iface.scope_id.clone(),
                construct: format!("interface check on a {} value", describe(&arg)),
            });
        };
        let inst_id = inst.scope.borrow().scope_id.clone();
        self.session
            .registry
            .add_implementation(&iface.scope_id, &inst_id);
        Ok(arg)
    }

    fn call_builtin(
        &mut self,
        b: &Builtin,
        args: Vec<Value>,
        pid: &str,
    ) -> Result<Value, InferError> {
        let sample_err = |m: String| InferError::Sample { message: m };
        match b {
            Builtin::Print => Ok(Value::None),
            Builtin::Len => {
                let v = args.first().ok_or_else(|| sample_err("len()".into()))?;
                let n = match v {
                    Value::Str(s) => s.chars().count(),
                    Value::List(l) => l.items.borrow().len(),
                    Value::Dict(d) => d.entries.borrow().len(),
                    Value::Set(s) => s.elems.borrow().len(),
                    Value::DictValues(d) => d.entries.borrow().len(),
                    Value::Tuple(t) => t.len(),
                    Value::RangeIter(r) => r.len(),
                    other => {
                        return Err(InferError::Unsupported {
                            scope: pid.to_string(),
                            construct: format!("len of a {} value", describe(other)),
                        });
                    }
                };
                Ok(Value::Num(n as f64))
            }
            Builtin::Range => {
                let mut bounds = Vec::with_capacity(3);
                for a in &args {
                    match a {
                        Value::Num(n) => bounds.push(*n as i64),
                        other => {
                            return Err(InferError::Unsupported {
                                scope: pid.to_string(),
                                construct: format!("range over a {} value", describe(other)),
                            });
                        }
                    }
                }
                let (start, stop, step) = match bounds[..] {
                    [stop] => (0, stop, 1),
                    [start, stop] => (start, stop, 1),
                    [start, stop, step] => (start, stop, step),
                    _ => return Err(sample_err("range() takes 1 to 3 arguments".into())),
                };
                if step == 0 {
                    return Err(sample_err("range() step must not be zero".into()));
                }
                let mut out = Vec::new();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    out.push(i as f64);
                    i += step;
                }
                Ok(Value::RangeIter(Rc::new(out)))
            }
            Builtin::Str => {
                let v = args.first().ok_or_else(|| sample_err("str()".into()))?;
                Ok(Value::Str(display_value(v).into()))
            }
            Builtin::Ord => match args.first() {
                Some(Value::Str(s)) => {
                    let c = s
                        .chars()
                        .next()
                        .ok_or_else(|| sample_err("ord of an empty string".into()))?;
                    Ok(Value::Num(c as u32 as f64))
                }
                _ => Err(sample_err("ord expects a string".into())),
            },
            Builtin::Chr => match args.first() {
                Some(Value::Num(n)) => {
                    let c = char::from_u32(*n as u32)
                        .ok_or_else(|| sample_err(format!("chr out of range: {n}")))?;
                    Ok(Value::Str(c.to_string().into()))
                }
                _ => Err(sample_err("chr expects a number".into())),
            },
            Builtin::StdinRead(sample) => Ok(Value::Str(sample.clone())),
        }
    }

    fn call_method(
        &mut self,
        m: Method,
        args: Vec<Value>,
        pid: &str,
    ) -> Result<Value, InferError> {
        let arg = |i: usize| -> Value { args.get(i).cloned().unwrap_or(Value::None) };
        match (&m.op, &m.recv) {
            (MethodOp::Append, Value::List(l)) => {
                let v = arg(0);
                if let Some(ty) = type_of(&v) {
                    self.record_container(&Self::list_slot(&l.id), ty)?;
                }
                l.items.borrow_mut().push(v);
                Ok(Value::None)
            }
            (MethodOp::Pop, Value::List(l)) => {
                l.items.borrow_mut().pop().ok_or(InferError::Sample {
                    message: "pop from an empty list".into(),
                })
            }
            (MethodOp::Contains, recv) => {
                let hit = self.contains(recv, &arg(0), pid)?;
                Ok(Value::Bool(hit))
            }
            (MethodOp::Values, Value::Dict(d)) => Ok(Value::DictValues(d.clone())),
            (MethodOp::Items, Value::Dict(d)) => {
                let pairs: Vec<Value> = d
                    .entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::Tuple(Rc::new(vec![k.clone(), v.clone()])))
                    .collect();
                self.new_list(pairs, &format!("dict_items:{}", d.id))
            }
            (MethodOp::Lower, Value::Str(s)) => Ok(Value::Str(s.to_lowercase().into())),
            (MethodOp::IsDigit, Value::Str(s)) => Ok(Value::Bool(
                !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
            )),
            (MethodOp::IsSpace, Value::Str(s)) => Ok(Value::Bool(
                !s.is_empty() && s.chars().all(char::is_whitespace),
            )),
            (MethodOp::StartsWith, Value::Str(s)) => match arg(0) {
                Value::Str(prefix) => Ok(Value::Bool(s.starts_with(&*prefix))),
                other => Err(InferError::Unsupported {
                    scope: pid.to_string(),
                    construct: format!("startswith with a {} value", describe(&other)),
                }),
            },
            (op, recv) => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("{op:?} on a {} value", describe(recv)),
            }),
        }
    }

    fn attr_lookup(&mut self, owner: &Value, name: &str, pid: &str) -> Result<Value, InferError> {
        let method = |op: MethodOp| -> Value {
            Value::Method(Box::new(Method {
                recv: owner.clone(),
                op,
            }))
        };
        let missing = || InferError::MissingName {
            name: name.to_string(),
            scope: pid.to_string(),
        };
        match owner {
            Value::Instance(i) => find(&i.scope, name).ok_or_else(missing),
            Value::Module(m) => find(&m.scope, name).ok_or_else(missing),
            Value::Class(c) => find(&c.scope, name).ok_or_else(missing),
            Value::Str(_) => match name {
                "lower" => Ok(method(MethodOp::Lower)),
                "isdigit" => Ok(method(MethodOp::IsDigit)),
                "isspace" => Ok(method(MethodOp::IsSpace)),
                "startswith" => Ok(method(MethodOp::StartsWith)),
                "contains" => Ok(method(MethodOp::Contains)),
                _ => Err(missing()),
            },
            Value::List(_) => match name {
                "append" => Ok(method(MethodOp::Append)),
                "pop" => Ok(method(MethodOp::Pop)),
                "contains" => Ok(method(MethodOp::Contains)),
                _ => Err(missing()),
            },
            Value::Dict(_) => match name {
                "values" => Ok(method(MethodOp::Values)),
                "items" => Ok(method(MethodOp::Items)),
                "contains" => Ok(method(MethodOp::Contains)),
                _ => Err(missing()),
            },
            Value::Set(_) | Value::DictValues(_) | Value::RangeIter(_) => match name {
                "contains" => Ok(method(MethodOp::Contains)),
                _ => Err(missing()),
            },
            other => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("attribute `{name}` of a {} value", describe(other)),
            }),
        }
    }

    fn contains(&mut self, container: &Value, item: &Value, pid: &str) -> Result<bool, InferError> {
        Ok(match container {
            Value::List(l) => l.items.borrow().iter().any(|v| value_eq(v, item)),
            Value::Tuple(t) => t.iter().any(|v| value_eq(v, item)),
            Value::Set(s) => s.elems.borrow().iter().any(|v| value_eq(v, item)),
            Value::Dict(d) => d.entries.borrow().iter().any(|(k, _)| value_eq(k, item)),
            Value::DictValues(d) => d.entries.borrow().iter().any(|(_, v)| value_eq(v, item)),
            Value::RangeIter(r) => match item {
                Value::Num(n) => r.contains(n),
                _ => false,
            },
            Value::Str(s) => match item {
                Value::Str(needle) => s.contains(&**needle),
                _ => false,
            },
            other => {
                return Err(InferError::Unsupported {
                    scope: pid.to_string(),
                    construct: format!("membership test on a {} value", describe(other)),
                });
            }
        })
    }

    // ---- generators / iteration ---------------------------------------

    /// First advance runs the whole body collecting yields in source order;
    /// later advances pop the queue. Sample inputs are finite, so eager
    /// collection observes the same types as a lazy producer.
    fn advance(&mut self, g: &Rc<GenObj>) -> Result<Option<Value>, InferError> {
        let started = g.state.borrow().started;
        if !started {
            g.state.borrow_mut().started = true;
            self.yields.push(VecDeque::new());
            let outcome = self.block(&g.func.code, g.func.body, 0, &g.scope);
            let sink = self.yields.pop().unwrap_or_default();
            let flow = outcome?;
            if let Exit::Break | Exit::Continue = flow.exit {
                return Err(InferError::Unsupported {
                    scope: g.func.scope_id.clone(),
                    construct: "break or continue escaping a generator".into(),
                });
            }
            g.state.borrow_mut().queue = sink;
        }
        Ok(g.state.borrow_mut().queue.pop_front())
    }

    fn iter_values(&mut self, v: &Value, scope_id: &str) -> Result<Vec<Value>, InferError> {
        match v {
            Value::Gen(g) => {
                let mut out = Vec::new();
                while let Some(item) = self.advance(g)? {
                    out.push(item);
                }
                Ok(out)
            }
            Value::List(l) => Ok(l.items.borrow().clone()),
            Value::Tuple(t) => Ok((**t).clone()),
            Value::DictValues(d) => {
                Ok(d.entries.borrow().iter().map(|(_, v)| v.clone()).collect())
            }
            Value::RangeIter(r) => Ok(r.iter().map(|n| Value::Num(*n)).collect()),
            other => Err(InferError::Unsupported {
                scope: scope_id.to_string(),
                construct: format!("iteration over a {} value", describe(other)),
            }),
        }
    }

    // ---- assignment ----------------------------------------------------

    fn assign(
        &mut self,
        target: &Node,
        value: Value,
        scope: &ScopeRef,
        pid: &str,
    ) -> Result<(), InferError> {
        match target {
            Node::Leaf(t) if t.kind == TokenKind::Name => self.bind(scope, &t.text, value),
            Node::Group(g)
                if matches!(
                    g.kind,
                    GroupKind::List | GroupKind::Paren | GroupKind::Bracket
                ) =>
            {
                let parts: Vec<Value> = match &value {
                    Value::Tuple(t) => (**t).clone(),
                    Value::List(l) => l.items.borrow().clone(),
                    other => {
                        return Err(InferError::Unsupported {
                            scope: pid.to_string(),
                            construct: format!("destructuring a {} value", describe(other)),
                        });
                    }
                };
                if parts.len() != g.inner.len() {
                    return Err(InferError::Arity {
                        scope: pid.to_string(),
                        expected: g.inner.len(),
                        got: parts.len(),
                    });
                }
                for (lt, v) in g.inner.iter().zip(parts) {
                    self.assign(lt, v, scope, pid)?;
                }
                Ok(())
            }
            Node::Group(g) if g.kind == GroupKind::Index => {
                let owner = self.eval(&g.inner[0], scope, pid)?;
                let bracket = g.inner[1].inner();
                let idx = bracket
                    .first()
                    .ok_or_else(|| InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: "assignment to an empty subscript".into(),
                    })
                    .cloned()?;
                let idx = self.eval(&idx, scope, pid)?;
                self.set_index(&owner, idx, value, pid)
            }
            Node::Group(g) if g.kind == GroupKind::Attr => {
                let owner = self.eval(&g.inner[0], scope, pid)?;
                let member = g.inner[2]
                    .leaf_text(TokenKind::Name)
                    .ok_or_else(|| InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: "assignment to a computed attribute".into(),
                    })?
                    .to_string();
                match owner {
                    Value::Instance(i) => self.bind(&i.scope, &member, value),
                    Value::Module(m) => self.bind(&m.scope, &member, value),
                    other => Err(InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: format!(
                            "attribute assignment on a {} value",
                            describe(&other)
                        ),
                    }),
                }
            }
            other => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("assignment target {}", other.describe()),
            }),
        }
    }

    fn set_index(
        &mut self,
        owner: &Value,
        idx: Value,
        value: Value,
        pid: &str,
    ) -> Result<(), InferError> {
        match owner {
            Value::List(l) => {
                let n = l.items.borrow().len();
                let at = int_index(&idx, n).ok_or_else(|| InferError::Sample {
                    message: format!("bad list index {}", display_value(&idx)),
                })?;
                if let Some(ty) = type_of(&value) {
                    self.record_container(&Self::list_slot(&l.id), ty)?;
                }
                l.items.borrow_mut()[at] = value;
                Ok(())
            }
            Value::Dict(d) => {
                if let (Some(kt), Some(vt)) = (type_of(&idx), type_of(&value)) {
                    self.record_container(&format!("dict_keys:{}", d.id), kt)?;
                    self.record_container(&format!("dict_values:{}", d.id), vt)?;
                }
                let mut entries = d.entries.borrow_mut();
                if let Some(slot) = entries.iter_mut().find(|(k, _)| value_eq(k, &idx)) {
                    slot.1 = value;
                } else {
                    entries.push((idx, value));
                }
                Ok(())
            }
            other => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("subscript assignment on a {} value", describe(other)),
            }),
        }
    }

    // ---- expressions ---------------------------------------------------

    pub fn eval(&mut self, tree: &Node, scope: &ScopeRef, pid: &str) -> Result<Value, InferError> {
        match tree {
            Node::Leaf(t) => match t.kind {
                TokenKind::Name => find(scope, &t.text).ok_or_else(|| InferError::MissingName {
                    name: t.text.clone(),
                    scope: scope.borrow().scope_id.clone(),
                }),
                TokenKind::Digit => {
                    t.text
                        .parse::<f64>()
                        .map(Value::Num)
                        .map_err(|_| InferError::Sample {
                            message: format!("bad numeric literal `{}`", t.text),
                        })
                }
                TokenKind::Str => Ok(Value::Str(unescape(string_body(&t.text)).into())),
                TokenKind::Keyword => match t.text.as_str() {
                    "True" => Ok(Value::Bool(true)),
                    "False" => Ok(Value::Bool(false)),
                    "None" => Ok(Value::None),
                    other => Err(InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: format!("keyword `{other}` in an expression"),
                    }),
                },
                _ => Err(InferError::Unsupported {
                    scope: pid.to_string(),
                    construct: format!("token {}", tree.describe()),
                }),
            },
            Node::Group(g) => self.eval_group(g, scope, pid),
        }
    }

    fn eval_group(
        &mut self,
        g: &Group,
        scope: &ScopeRef,
        pid: &str,
    ) -> Result<Value, InferError> {
        match g.kind {
            GroupKind::Binary | GroupKind::Compare => {
                let op = g.inner[1]
                    .as_leaf()
                    .map(|t| t.text.clone())
                    .unwrap_or_default();
                let left = self.eval(&g.inner[0], scope, pid)?;
                let right = self.eval(&g.inner[2], scope, pid)?;
                match op.as_str() {
                    // both sides already ran; pick by truthiness
                    "and" => Ok(if truthy(&left) { right } else { left }),
                    "or" => Ok(if truthy(&left) { left } else { right }),
                    _ => self.binary(&op, left, right, pid),
                }
            }
            GroupKind::Assignment => {
                let op = g.inner[1]
                    .as_leaf()
                    .map(|t| t.text.clone())
                    .unwrap_or_default();
                if g.inner[1].is_keyword("in") {
                    return Err(InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: "`in` binding outside a for header".into(),
                    });
                }
                let mut right = self.eval(&g.inner[2], scope, pid)?;
                if op != "=" {
                    let base = op.trim_end_matches('=');
                    let left = self.eval(&g.inner[0], scope, pid)?;
                    right = self.binary(base, left, right, pid)?;
                }
                self.assign(&g.inner[0], right.clone(), scope, pid)?;
                if g.inner[0].leaf_text(TokenKind::Name).is_some() {
                    Ok(right)
                } else {
                    Ok(Value::None)
                }
            }
            GroupKind::Attr => {
                let owner = self.eval(&g.inner[0], scope, pid)?;
                let member = g.inner[2]
                    .leaf_text(TokenKind::Name)
                    .ok_or_else(|| InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: "computed attribute access".into(),
                    })?;
                self.attr_lookup(&owner, member, pid)
            }
            GroupKind::Call => self.eval_call(g, scope, pid),
            GroupKind::Index => {
                let owner = self.eval(&g.inner[0], scope, pid)?;
                let bracket = g.inner[1].inner();
                let idx_tree = bracket.first().ok_or_else(|| InferError::Unsupported {
                    scope: pid.to_string(),
                    construct: "empty subscript".into(),
                })?;
                let idx = self.eval(idx_tree, scope, pid)?;
                self.index_value(&owner, &idx, pid)
            }
            GroupKind::List => {
                let mut items = Vec::with_capacity(g.inner.len());
                for n in &g.inner {
                    items.push(self.eval(n, scope, pid)?);
                }
                Ok(Value::Tuple(Rc::new(items)))
            }
            GroupKind::Paren => match g.inner.len() {
                0 => Ok(Value::Tuple(Rc::new(Vec::new()))),
                1 => self.eval(&g.inner[0], scope, pid),
                _ => Err(InferError::Unsupported {
                    scope: pid.to_string(),
                    construct: "adhoc generator expression".into(),
                }),
            },
            GroupKind::Bracket => match g.inner.len() {
                0 => self.new_list(Vec::new(), pid),
                1 => self.eval(&g.inner[0], scope, pid),
                _ => self.comprehension(g, scope, pid),
            },
            GroupKind::Brace => self.brace_literal(g, scope, pid),
            GroupKind::Range => {
                let mut bounds: [Option<Value>; 3] = [None, None, None];
                let mut token = 0usize;
                for bound in bounds.iter_mut() {
                    if token >= g.inner.len() {
                        break;
                    }
                    if g.inner[token].is_sign(":") {
                        token += 1;
                    } else {
                        *bound = Some(self.eval(&g.inner[token], scope, pid)?);
                        token += 2;
                    }
                }
                Ok(Value::Slice(Rc::new(SliceVal { bounds })))
            }
            GroupKind::Unary => {
                let operand = self.eval(&g.inner[1], scope, pid)?;
                if g.inner[0].is_sign("-") {
                    match operand {
                        Value::Num(n) => Ok(Value::Num(-n)),
                        other => Err(InferError::Unsupported {
                            scope: pid.to_string(),
                            construct: format!("negating a {} value", describe(&other)),
                        }),
                    }
                } else if g.inner[0].is_sign("~") {
                    match operand {
                        Value::Num(n) => Ok(Value::Num(!(n as i64) as f64)),
                        other => Err(InferError::Unsupported {
                            scope: pid.to_string(),
                            construct: format!("inverting a {} value", describe(&other)),
                        }),
                    }
                } else if g.inner[0].is_keyword("not") {
                    Ok(Value::Bool(!truthy(&operand)))
                } else {
                    Err(InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: format!("unary {}", g.inner[0].describe()),
                    })
                }
            }
            GroupKind::Pair => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: "typed pair outside a unit header".into(),
            }),
        }
    }

    fn eval_call(&mut self, g: &Group, scope: &ScopeRef, pid: &str) -> Result<Value, InferError> {
        let paren = &g.inner[1];
        // arguments run before the callee resolves
        let args_val = self.eval(paren, scope, pid)?;
        let paren_inner = paren.inner();
        let args: Vec<Value> = if paren_inner.is_empty() {
            Vec::new()
        } else if paren_inner[0].is_group(GroupKind::List) {
            match args_val {
                Value::Tuple(t) => (*t).clone(),
                other => vec![other],
            }
        } else {
            vec![args_val]
        };

        if let Some(attr) = g.inner[0].as_group().filter(|a| a.kind == GroupKind::Attr)
            && let Some(member) = attr.inner.last().and_then(|n| n.leaf_text(TokenKind::Name))
        {
            let member = member.to_string();
            let owner = self.eval(&attr.inner[0], scope, pid)?;
            let f = self.attr_lookup(&owner, &member, pid)?;
            return match f {
                Value::Method(m) => self.call_method(*m, args, pid),
                callee if matches!(owner, Value::Instance(_)) => {
                    let mut with_self = Vec::with_capacity(args.len() + 1);
                    with_self.push(owner);
                    with_self.extend(args);
                    self.call_value(callee, with_self, pid)
                }
                callee => self.call_value(callee, args, pid),
            };
        }

        let callee = self.eval(&g.inner[0], scope, pid)?;
        self.call_value(callee, args, pid)
    }

    fn brace_literal(
        &mut self,
        g: &Group,
        scope: &ScopeRef,
        pid: &str,
    ) -> Result<Value, InferError> {
        if g.inner.is_empty() {
            return self.new_dict(Vec::new(), pid);
        }
        if g.inner.len() > 1 {
            return Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: "dict comprehension".into(),
            });
        }
        let items: Vec<Value> = if g.inner[0].is_group(GroupKind::List) {
            match self.eval(&g.inner[0], scope, pid)? {
                Value::Tuple(t) => (*t).clone(),
                other => vec![other],
            }
        } else {
            vec![self.eval(&g.inner[0], scope, pid)?]
        };

        if matches!(items.first(), Some(Value::Slice(_))) {
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                let Value::Slice(s) = item else {
                    return Err(InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: "mixed dict and set literal".into(),
                    });
                };
                let (Some(k), Some(v)) = (s.bounds[0].clone(), s.bounds[1].clone()) else {
                    return Err(InferError::Unsupported {
                        scope: pid.to_string(),
                        construct: "dict entry without key or value".into(),
                    });
                };
                entries.push((k, v));
            }
            self.new_dict(entries, pid)
        } else {
            self.new_set(items, pid)
        }
    }

    fn comprehension(
        &mut self,
        g: &Group,
        scope: &ScopeRef,
        pid: &str,
    ) -> Result<Value, InferError> {
        let bad = || InferError::Unsupported {
            scope: pid.to_string(),
            construct: "malformed comprehension".into(),
        };
        if g.inner.len() != 3 && g.inner.len() != 5 {
            return Err(bad());
        }
        if !g.inner[1].is_keyword("for") {
            return Err(bad());
        }
        let header = g.inner[2].as_group().filter(|h| {
            h.kind == GroupKind::Assignment && h.inner[1].is_keyword("in")
        });
        let header = header.ok_or_else(bad)?;
        let cond = if g.inner.len() == 5 {
            if !g.inner[3].is_keyword("if") {
                return Err(bad());
            }
            Some(&g.inner[4])
        } else {
            None
        };

        let offset = g.inner[1].as_leaf().map(|t| t.offset).unwrap_or(0);
        let comp_scope = new_scope(
            Some(scope.clone()),
            false,
            comprehension_scope(pid, offset),
        );
        let container = self.eval(&header.inner[2], &comp_scope, pid)?;
        let comp_id = comp_scope.borrow().scope_id.clone();

        let mut out = Vec::new();
        for item in self.iter_values(&container, &comp_id)? {
            self.assign(&header.inner[0], item, &comp_scope, pid)?;
            if let Some(cond) = cond {
                let keep = self.eval(cond, &comp_scope, pid)?;
                if !truthy(&keep) {
                    continue;
                }
            }
            out.push(self.eval(&g.inner[0], &comp_scope, pid)?);
        }
        self.new_list(out, pid)
    }

    fn index_value(
        &mut self,
        owner: &Value,
        idx: &Value,
        pid: &str,
    ) -> Result<Value, InferError> {
        let bad_index = || InferError::Sample {
            message: format!(
                "bad index {} into a {} value",
                display_value(idx),
                describe(owner)
            ),
        };
        match (owner, idx) {
            (Value::List(l), Value::Num(_)) => {
                let items = l.items.borrow();
                let at = int_index(idx, items.len()).ok_or_else(bad_index)?;
                Ok(items[at].clone())
            }
            (Value::List(l), Value::Slice(s)) => {
                let items = l.items.borrow();
                let picked: Vec<Value> = s
                    .indices(items.len())
                    .ok_or_else(bad_index)?
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect();
                drop(items);
                self.new_list(picked, &l.id)
            }
            (Value::Tuple(t), Value::Num(_)) => {
                let at = int_index(idx, t.len()).ok_or_else(bad_index)?;
                Ok(t[at].clone())
            }
            (Value::Dict(d), key) => d
                .entries
                .borrow()
                .iter()
                .find(|(k, _)| value_eq(k, key))
                .map(|(_, v)| v.clone())
                .ok_or(InferError::Sample {
                    message: format!("missing dict key {}", display_value(key)),
                }),
            (Value::Str(s), Value::Num(_)) => {
                let chars: Vec<char> = s.chars().collect();
                let at = int_index(idx, chars.len()).ok_or_else(bad_index)?;
                Ok(Value::Str(chars[at].to_string().into()))
            }
            (Value::Str(s), Value::Slice(sl)) => {
                let chars: Vec<char> = s.chars().collect();
                let picked: String = sl
                    .indices(chars.len())
                    .ok_or_else(bad_index)?
                    .into_iter()
                    .map(|i| chars[i])
                    .collect();
                Ok(Value::Str(picked.into()))
            }
            (Value::RangeIter(r), Value::Num(_)) => {
                let at = int_index(idx, r.len()).ok_or_else(bad_index)?;
                Ok(Value::Num(r[at]))
            }
            (other, _) => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("subscript on a {} value", describe(other)),
            }),
        }
    }

    fn binary(
        &mut self,
        op: &str,
        left: Value,
        right: Value,
        pid: &str,
    ) -> Result<Value, InferError> {
        use Value::{Bool, List, Num, Str, Tuple};
        let unsupported = |l: &Value, r: &Value| InferError::Unsupported {
            scope: pid.to_string(),
            construct: format!("`{op}` between {} and {}", describe(l), describe(r)),
        };
        match op {
            "+" => match (&left, &right) {
                (Num(a), Num(b)) => Ok(Num(a + b)),
                (Str(a), Str(b)) => Ok(Str(format!("{a}{b}").into())),
                (Tuple(a), Tuple(b)) => {
                    let mut items = (**a).clone();
                    items.extend(b.iter().cloned());
                    Ok(Tuple(Rc::new(items)))
                }
                (List(a), List(b)) => {
                    let mut items = a.items.borrow().clone();
                    items.extend(b.items.borrow().iter().cloned());
                    self.new_list(items, &a.id)
                }
                _ => Err(unsupported(&left, &right)),
            },
            "-" => match (&left, &right) {
                (Num(a), Num(b)) => Ok(Num(a - b)),
                _ => Err(unsupported(&left, &right)),
            },
            "*" => match (&left, &right) {
                (Num(a), Num(b)) => Ok(Num(a * b)),
                _ => Err(unsupported(&left, &right)),
            },
            "/" => match (&left, &right) {
                (Num(_), Num(b)) if *b == 0.0 => Err(InferError::Sample {
                    message: "division by zero".into(),
                }),
                (Num(a), Num(b)) => Ok(Num(a / b)),
                _ => Err(unsupported(&left, &right)),
            },
            "%" => match (&left, &right) {
                (Num(_), Num(b)) if *b == 0.0 => Err(InferError::Sample {
                    message: "modulo by zero".into(),
                }),
                (Num(a), Num(b)) => Ok(Num(a - b * (a / b).floor())),
                _ => Err(unsupported(&left, &right)),
            },
            "&" => match (&left, &right) {
                (Bool(a), Bool(b)) => Ok(Bool(*a && *b)),
                _ => Err(unsupported(&left, &right)),
            },
            "|" => match (&left, &right) {
                (Bool(a), Bool(b)) => Ok(Bool(*a || *b)),
                _ => Err(unsupported(&left, &right)),
            },
            "^" => match (&left, &right) {
                (Bool(a), Bool(b)) => Ok(Bool(a != b)),
                _ => Err(unsupported(&left, &right)),
            },
            "==" => Ok(Bool(value_eq(&left, &right))),
            "!=" => Ok(Bool(!value_eq(&left, &right))),
            "<" | "<=" | ">" | ">=" => {
                let ord = match (&left, &right) {
                    (Num(a), Num(b)) => a.partial_cmp(b),
                    (Str(a), Str(b)) => Some(a.cmp(b)),
                    _ => return Err(unsupported(&left, &right)),
                };
                let ord = ord.ok_or(InferError::Sample {
                    message: "unordered comparison".into(),
                })?;
                Ok(Bool(match op {
                    "<" => ord.is_lt(),
                    "<=" => ord.is_le(),
                    ">" => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            "is in" => Ok(Bool(self.contains(&right, &left, pid)?)),
            "is not in" => Ok(Bool(!self.contains(&right, &left, pid)?)),
            _ => Err(InferError::Unsupported {
                scope: pid.to_string(),
                construct: format!("operator `{op}`"),
            }),
        }
    }
}

/// Integer index with the language's negative-index convention.
fn int_index(idx: &Value, len: usize) -> Option<usize> {
    let Value::Num(n) = idx else { return None };
    if n.fract() != 0.0 {
        return None;
    }
    let mut i = *n as i64;
    if i < 0 {
        i += len as i64;
    }
    if i < 0 || i as usize >= len {
        return None;
    }
    Some(i as usize)
}
