//! End-to-end inference over small scanned programs.

use std::collections::HashMap;

use hutch_ast::{anon_slot, cast_slot};
use hutch_infer::{ArgCast, InferError, ModuleInput, ModuleSource, Session, Ty};

struct MapSource {
    modules: HashMap<String, (String, String)>,
}

impl MapSource {
    fn with(mods: &[(&str, &str, &str)]) -> Self {
        let modules = mods
            .iter()
            .map(|(name, src, sample)| {
                (name.to_string(), (src.to_string(), sample.to_string()))
            })
            .collect();
        MapSource { modules }
    }

    fn single(src: &str) -> Self {
        Self::with(&[("main", src, "")])
    }
}

impl ModuleSource for MapSource {
    fn load(&self, name: &str) -> Result<ModuleInput, InferError> {
        let (src, sample) = self.modules.get(name).ok_or_else(|| InferError::Import {
            module: name.to_string(),
            message: "unknown module".into(),
        })?;
        let phrases = hutch_parse::scan_text(src).map_err(|e| InferError::Import {
            module: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(ModuleInput {
            phrases,
            sample: sample.clone(),
        })
    }
}

fn infer(src: &str) -> Session {
    let mut session = Session::new();
    session
        .infer(&MapSource::single(src), "main")
        .expect("inference failed");
    session
}

fn infer_err(src: &str) -> InferError {
    let mut session = Session::new();
    session
        .infer(&MapSource::single(src), "main")
        .expect_err("inference unexpectedly succeeded")
}

#[test]
fn arithmetic_binding_is_double() {
    let s = infer("x = 1 + 2\n");
    assert_eq!(s.registry.ty_of("main", "x"), Some(&Ty::Double));
}

#[test]
fn rebinding_widens_char_to_str() {
    let s = infer("x = \"a\"\nx = \"ab\"\n");
    assert_eq!(s.registry.ty_of("main", "x"), Some(&Ty::Str));
}

#[test]
fn incompatible_rebinding_fails() {
    let err = infer_err("x = 1\nx = \"hello\"\n");
    assert!(matches!(err, InferError::Join { .. }));
}

#[test]
fn while_and_if_run_on_sample_values() {
    let s = infer(concat!(
        "i = 0\n",
        "hits = 0\n",
        "while i < 5:\n",
        "    i = i + 1\n",
        "    if i % 2 == 0:\n",
        "        hits = hits + 1\n",
        "    elif i == 3:\n",
        "        hits = hits + 10\n",
        "    else:\n",
        "        pass\n",
    ));
    assert_eq!(s.registry.ty_of("main", "hits"), Some(&Ty::Double));
}

#[test]
fn unit_records_args_and_return_slot() {
    let s = infer(concat!(
        "unit add(a, b):\n",
        "    return a + b\n",
        "r = add(1, 2)\n",
    ));
    assert_eq!(s.registry.ty_of("main:0", "a"), Some(&Ty::Double));
    assert_eq!(s.registry.ty_of("main:0", "b"), Some(&Ty::Double));
    assert_eq!(s.registry.ty_of("main:0", ""), Some(&Ty::Double));
    assert_eq!(s.registry.ty_of("main", "r"), Some(&Ty::Double));
    assert_eq!(
        s.registry.func_args("main:0"),
        Some(&["a".to_string(), "b".to_string()][..])
    );
}

#[test]
fn generator_is_classified_and_yield_types_recorded() {
    let s = infer(concat!(
        "unit firsts(n):\n",
        "    i = 0\n",
        "    while i < n:\n",
        "        yield i\n",
        "        i = i + 1\n",
        "for v in firsts(3):\n",
        "    x = v\n",
    ));
    assert!(s.registry.is_generator("main:0"));
    assert_eq!(s.registry.ty_of("main:0", ""), Some(&Ty::Double));
    assert_eq!(s.registry.ty_of("main", "x"), Some(&Ty::Double));
    // the iterated value of the for phrase gets an anonymous slot
    assert_eq!(
        s.registry.ty_of("main", &anon_slot("main:5")),
        Some(&Ty::Generator("main:0".into()))
    );
}

#[test]
fn generator_drains_in_source_order() {
    let s = infer(concat!(
        "unit gen():\n",
        "    yield 1\n",
        "    yield 2\n",
        "out = []\n",
        "for v in gen():\n",
        "    out.append(v)\n",
        "n = len(out)\n",
    ));
    assert_eq!(
        s.registry.ty_of("main", "out"),
        Some(&Ty::List("main:3".into()))
    );
    assert_eq!(
        s.registry.container("list_items:main:3"),
        Some(&Ty::Double)
    );
    assert_eq!(s.registry.ty_of("main", "n"), Some(&Ty::Double));
}

#[test]
fn identical_tuples_share_a_shape_after_freeze() {
    let mut s = infer("a = (1, 2)\nb = (3, 4)\nc = (1, \"xy\")\n");
    s.freeze();
    assert_eq!(s.registry.ty_of("main", "a"), s.registry.ty_of("main", "b"));
    assert_ne!(s.registry.ty_of("main", "a"), s.registry.ty_of("main", "c"));
    assert_eq!(s.registry.shapes().len(), 2);
}

#[test]
fn class_records_instance_fields_and_constructor() {
    let s = infer(concat!(
        "class Point:\n",
        "    unit __init__(self, x):\n",
        "        self.x = x\n",
        "p = Point(5)\n",
        "y = p.x\n",
    ));
    assert!(s.registry.is_constructor("main:1"));
    assert_eq!(
        s.registry.ty_of("main", "p"),
        Some(&Ty::Instance("main:0[instance]".into()))
    );
    assert_eq!(
        s.registry.ty_of("main:0[instance]", "x"),
        Some(&Ty::Double)
    );
    assert_eq!(s.registry.ty_of("main", "y"), Some(&Ty::Double));
}

#[test]
fn instance_method_call_passes_self() {
    let s = infer(concat!(
        "class Counter:\n",
        "    unit __init__(self):\n",
        "        self.n = 0\n",
        "    unit bump(self):\n",
        "        self.n = self.n + 1\n",
        "c = Counter()\n",
        "c.bump()\n",
        "m = c.n\n",
    ));
    assert_eq!(
        s.registry.ty_of("main:0[instance]", "n"),
        Some(&Ty::Double)
    );
    assert_eq!(s.registry.ty_of("main", "m"), Some(&Ty::Double));
}

#[test]
fn interface_registers_implementor_and_method_slot() {
    let s = infer(concat!(
        "interface Shape:\n",
        "    unit area(self)\n",
        "class Circle:\n",
        "    unit area(self):\n",
        "        return 3\n",
        "c = Shape(Circle())\n",
        "a = c.area()\n",
    ));
    assert_eq!(
        s.registry.ty_of("main:0", "area"),
        Some(&Ty::FuncPtr("main:1".into()))
    );
    let implementors: Vec<_> = s
        .registry
        .interfaces()
        .map(|(iface, insts)| (iface.clone(), insts.clone()))
        .collect();
    assert_eq!(implementors.len(), 1);
    assert_eq!(implementors[0].0, "main:0");
    assert!(implementors[0].1.contains("main:2[instance]"));
    assert_eq!(s.registry.ty_of("main", "a"), Some(&Ty::Double));
}

#[test]
fn ref_parameter_narrowed_by_cast() {
    let s = infer(concat!(
        "unit use(ref p):\n",
        "    cast p:\n",
        "        return p + 1\n",
        "u = use(7)\n",
    ));
    assert_eq!(s.registry.ty_of("main:0", "p"), Some(&Ty::Ref));
    assert_eq!(
        s.registry.ty_of("main:0", &cast_slot("main:1", "p")),
        Some(&Ty::Double)
    );
    assert_eq!(s.registry.ty_of("main", "u"), Some(&Ty::Double));
    assert_eq!(
        s.registry.args_cast("main:0"),
        Some(&[Some(ArgCast::Ref)][..])
    );
}

#[test]
fn imports_execute_dependencies_first() {
    let source = MapSource::with(&[
        ("main", "import helper\nz = helper.twice(4)\n", ""),
        ("helper", "unit twice(x):\n    return x + x\n", ""),
    ]);
    let mut s = Session::new();
    s.infer(&source, "main").expect("inference failed");
    assert_eq!(s.order, vec!["helper".to_string(), "main".to_string()]);
    assert_eq!(s.registry.ty_of("main", "z"), Some(&Ty::Double));
    assert_eq!(s.registry.ty_of("helper:0", ""), Some(&Ty::Double));
}

#[test]
fn missing_module_reports_import_error() {
    let err = infer_err("import nowhere\n");
    assert!(matches!(err, InferError::Import { .. }));
}

#[test]
fn destructuring_arity_mismatch_fails() {
    let err = infer_err("a, b = (1, 2, 3)\n");
    assert!(matches!(err, InferError::Arity { .. }));
}

#[test]
fn call_arity_mismatch_fails() {
    let err = infer_err(concat!(
        "unit one(a):\n",
        "    return a\n",
        "r = one(1, 2)\n",
    ));
    assert!(matches!(
        err,
        InferError::Arity {
            expected: 1,
            got: 2,
            ..
        }
    ));
}

#[test]
fn dict_values_iteration_types_the_loop_variable() {
    let s = infer(concat!(
        "d = {1: \"aa\", 2: \"bb\"}\n",
        "for v in d.values():\n",
        "    t = v\n",
    ));
    assert_eq!(
        s.registry.container("dict_keys:main:0"),
        Some(&Ty::Double)
    );
    assert_eq!(s.registry.container("dict_values:main:0"), Some(&Ty::Str));
    assert_eq!(s.registry.ty_of("main", "t"), Some(&Ty::Str));
    assert_eq!(
        s.registry.ty_of("main", &anon_slot("main:1")),
        Some(&Ty::DictValues("main:0".into()))
    );
}

#[test]
fn comprehension_builds_a_typed_list() {
    let s = infer(concat!(
        "xs = (1, 2, 3)\n",
        "ys = [x + 1 for x in xs if x > 1]\n",
    ));
    assert_eq!(
        s.registry.ty_of("main", "ys"),
        Some(&Ty::List("main:1".into()))
    );
    assert_eq!(
        s.registry.container("list_items:main:1"),
        Some(&Ty::Double)
    );
}

#[test]
fn string_builtins_and_stdin_sample() {
    let source = MapSource::with(&[(
        "main",
        concat!(
            "s = sys.stdin.read()\n",
            "t = s.lower()\n",
            "d = s.isdigit()\n",
            "o = ord(\"A\")\n",
            "c = chr(66)\n",
            "n = len(s)\n",
        ),
        "Hello",
    )]);
    let mut s = Session::new();
    s.infer(&source, "main").expect("inference failed");
    assert_eq!(s.registry.ty_of("main", "s"), Some(&Ty::Str));
    assert_eq!(s.registry.ty_of("main", "t"), Some(&Ty::Str));
    assert_eq!(s.registry.ty_of("main", "d"), Some(&Ty::Bool));
    assert_eq!(s.registry.ty_of("main", "o"), Some(&Ty::Double));
    assert_eq!(s.registry.ty_of("main", "c"), Some(&Ty::Char));
    assert_eq!(s.registry.ty_of("main", "n"), Some(&Ty::Double));
}

#[test]
fn range_loop_with_augmented_assignment() {
    let s = infer(concat!(
        "total = 0\n",
        "for i in range(1, 4):\n",
        "    total += i\n",
    ));
    assert_eq!(s.registry.ty_of("main", "total"), Some(&Ty::Double));
    assert_eq!(
        s.registry.ty_of("main", &anon_slot("main:1")),
        Some(&Ty::RangeCtor)
    );
}

#[test]
fn break_leaves_the_loop() {
    let s = infer(concat!(
        "i = 0\n",
        "while True:\n",
        "    i = i + 1\n",
        "    if i > 2:\n",
        "        break\n",
        "after = i\n",
    ));
    assert_eq!(s.registry.ty_of("main", "after"), Some(&Ty::Double));
}

#[test]
fn inference_is_deterministic_across_runs() {
    let src = concat!(
        "unit gen(n):\n",
        "    i = 0\n",
        "    while i < n:\n",
        "        yield (i, \"x\")\n",
        "        i = i + 1\n",
        "pairs = []\n",
        "for p in gen(3):\n",
        "    pairs.append(p)\n",
    );
    let mut a = infer(src);
    let mut b = infer(src);
    a.freeze();
    b.freeze();
    assert_eq!(a.registry.dump(), b.registry.dump());
}

#[test]
fn undefined_name_is_reported_with_its_scope() {
    let err = infer_err("x = missing + 1\n");
    let InferError::MissingName { name, scope } = err else {
        panic!("expected a missing-name error");
    };
    assert_eq!(name, "missing");
    assert_eq!(scope, "main");
}
