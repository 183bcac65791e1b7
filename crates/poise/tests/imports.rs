//! Import, namespace, and standard-library integration tests.
//!
//! Multi-file programs live in per-test temp directories. The std tests
//! share one miniature standard library whose extension functions bind the
//! core natives, with `POISE_STD_PATH` set once for the whole test binary.

use std::{
    fs,
    path::PathBuf,
    sync::{
        OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use poise::{CollectStringPrint, CompileResult, Compiler, RunOutcome, Vm};
use pretty_assertions::assert_eq;

const LIST_STD: &str = concat!(
    "export func append(this List l, value) => __NATIVE_LIST_APPEND(l, value);\n",
    "export func size(this List l) => __NATIVE_LIST_SIZE(l);\n",
    "export func clear(this List l) => __NATIVE_LIST_CLEAR(l);\n",
    "export func removeFirst(this List l, value) => __NATIVE_LIST_REMOVE_FIRST(l, value);\n",
);

const DICT_STD: &str = concat!(
    "export func containsKey(this Dict d, key) => __NATIVE_DICT_CONTAINS_KEY(d, key);\n",
    "export func tryInsert(this Dict d, key, value) => __NATIVE_DICT_TRY_INSERT(d, key, value);\n",
    "export func insertOrUpdate(this Dict d, key, value) => __NATIVE_DICT_INSERT_OR_UPDATE(d, key, value);\n",
    "export func size(this Dict d) => __NATIVE_DICT_SIZE(d);\n",
);

const SET_STD: &str = concat!(
    "export func contains(this Set s, value) => __NATIVE_SET_CONTAINS(s, value);\n",
    "export func tryInsert(this Set s, value) => __NATIVE_SET_TRY_INSERT(s, value);\n",
    "export func remove(this Set s, value) => __NATIVE_SET_REMOVE(s, value);\n",
    "export func unionWith(this Set s, other) => __NATIVE_SET_UNION(s, other);\n",
);

fn std_root() -> PathBuf {
    static STD_DIR: OnceLock<PathBuf> = OnceLock::new();
    STD_DIR
        .get_or_init(|| {
            let dir = std::env::temp_dir().join(format!("poise-std-{}", std::process::id()));
            fs::create_dir_all(&dir).expect("create std dir");
            fs::write(dir.join("list.poise"), LIST_STD).expect("write std list");
            fs::write(dir.join("dict.poise"), DICT_STD).expect("write std dict");
            fs::write(dir.join("set.poise"), SET_STD).expect("write std set");
            // tests in this binary all share the same std tree
            unsafe { std::env::set_var("POISE_STD_PATH", &dir) };
            dir
        })
        .clone()
}

fn temp_dir() -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "poise-imports-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Writes (name, source) files into one directory and compiles `main.poise`.
fn compile_files(files: &[(&str, &str)]) -> (Vm, CompileResult) {
    let dir = temp_dir();
    for (name, source) in files {
        fs::write(dir.join(name), source).expect("write source file");
    }
    let mut vm = Vm::new();
    let result = Compiler::compile_file(&mut vm, &dir.join("main.poise"));
    (vm, result)
}

fn run_files(files: &[(&str, &str)]) -> (RunOutcome, String, String) {
    let (mut vm, result) = compile_files(files);
    assert_eq!(result, CompileResult::Success, "program failed to compile");
    let mut writer = CollectStringPrint::new();
    let outcome = vm.run(&mut writer);
    let err = writer.error_output().to_owned();
    (outcome, writer.into_output(), err)
}

#[test]
fn imported_constant_is_visible_through_the_namespace() {
    let (outcome, out, err) = run_files(&[
        ("module.poise", "export const PI = 3;\n"),
        (
            "main.poise",
            "import module;\nfunc main() {\n    println(module::PI);\n}\n",
        ),
    ]);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, "3\n");
}

#[test]
fn exported_functions_are_callable_across_namespaces() {
    let (outcome, out, err) = run_files(&[
        ("module.poise", "export func double(x) => x * 2;\n"),
        (
            "main.poise",
            "import module;\nfunc main() {\n    println(module::double(21));\n}\n",
        ),
    ]);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, "42\n");
}

#[test]
fn non_exported_functions_are_invisible_across_namespaces() {
    let (outcome, _, err) = run_files(&[
        ("module.poise", "func secret() => 1;\n"),
        (
            "main.poise",
            "import module;\nfunc main() {\n    println(module::secret());\n}\n",
        ),
    ]);
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("not exported"), "stderr was: {err}");
}

#[test]
fn non_exported_constants_are_a_compile_error() {
    let (_, result) = compile_files(&[
        ("module.poise", "const HIDDEN = 7;\n"),
        (
            "main.poise",
            "import module;\nfunc main() {\n    println(module::HIDDEN);\n}\n",
        ),
    ]);
    assert_eq!(result, CompileResult::CompileError);
}

#[test]
fn referencing_an_unimported_namespace_is_a_compile_error() {
    let (_, result) = compile_files(&[
        ("module.poise", "export const PI = 3;\n"),
        ("main.poise", "func main() {\n    println(module::PI);\n}\n"),
    ]);
    assert_eq!(result, CompileResult::CompileError);
}

#[test]
fn imports_must_precede_other_declarations() {
    let (_, result) = compile_files(&[
        ("module.poise", "export const PI = 3;\n"),
        (
            "main.poise",
            "func main() {\n    println(1);\n}\nimport module;\n",
        ),
    ]);
    assert_eq!(result, CompileResult::CompileError);
}

#[test]
fn a_file_imported_through_two_parents_compiles_once() {
    let (outcome, out, err) = run_files(&[
        ("shared.poise", "export const VALUE = 5;\n"),
        (
            "left.poise",
            "import shared;\nexport func left() => shared::VALUE + 1;\n",
        ),
        (
            "right.poise",
            "import shared;\nexport func right() => shared::VALUE + 2;\n",
        ),
        (
            "main.poise",
            concat!(
                "import left;\n",
                "import right;\n",
                "func main() {\n",
                "    println(left::left() + right::right());\n",
                "}\n",
            ),
        ),
    ]);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, "13\n");
}

#[test]
fn import_aliases_rename_the_namespace() {
    let dir = temp_dir();
    fs::create_dir_all(dir.join("nested")).expect("create nested dir");
    fs::write(dir.join("nested/module.poise"), "export const X = 9;\n").expect("write module");
    fs::write(
        dir.join("main.poise"),
        "import nested::module as m;\nfunc main() {\n    println(m::X);\n}\n",
    )
    .expect("write main");

    let mut vm = Vm::new();
    let result = Compiler::compile_file(&mut vm, &dir.join("main.poise"));
    assert_eq!(result, CompileResult::Success);

    let mut writer = CollectStringPrint::new();
    let outcome = vm.run(&mut writer);
    assert_eq!(outcome, RunOutcome::Success);
    assert_eq!(writer.output(), "9\n");
}

#[test]
fn missing_import_file_is_a_compile_error() {
    let (_, result) = compile_files(&[(
        "main.poise",
        "import nothing_here;\nfunc main() {\n}\n",
    )]);
    assert_eq!(result, CompileResult::CompileError);
}

// ---- standard library extension functions ----

#[test]
fn std_list_append_mutates_through_the_extension() {
    std_root();
    let (outcome, out, err) = run_files(&[(
        "main.poise",
        concat!(
            "import std::list;\n",
            "func main() {\n",
            "    var l = [1];\n",
            "    l.append(2);\n",
            "    l.append(3);\n",
            "    println(l);\n",
            "    println(l.size());\n",
            "}\n",
        ),
    )]);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, "[1, 2, 3]\n3\n");
}

#[test]
fn mutation_during_iteration_raises_invalid_iterator() {
    std_root();
    let (outcome, _, err) = run_files(&[(
        "main.poise",
        concat!(
            "import std::list;\n",
            "func main() {\n",
            "    var l = [1, 2, 3];\n",
            "    for x in l {\n",
            "        l.append(4);\n",
            "    }\n",
            "}\n",
        ),
    )]);
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("InvalidIterator"), "stderr was: {err}");
}

#[test]
fn std_dict_insert_semantics() {
    std_root();
    let (outcome, out, err) = run_files(&[(
        "main.poise",
        concat!(
            "import std::dict;\n",
            "func main() {\n",
            "    var d = {(\"k\", 1)};\n",
            "    println(d.tryInsert(\"k\", 2));\n",
            "    println(d[\"k\"]);\n",
            "    d.insertOrUpdate(\"k\", 3);\n",
            "    println(d[\"k\"]);\n",
            "    println(d.size());\n",
            "}\n",
        ),
    )]);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, "false\n1\n3\n1\n");
}

#[test]
fn std_set_operations() {
    std_root();
    let (outcome, out, err) = run_files(&[(
        "main.poise",
        concat!(
            "import std::set;\n",
            "func main() {\n",
            "    var s = Set(1, 2);\n",
            "    println(s.contains(2));\n",
            "    println(s.tryInsert(2));\n",
            "    println(s.tryInsert(3));\n",
            "    println(s.remove(1));\n",
            "    println(s.contains(1));\n",
            "}\n",
        ),
    )]);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, "true\nfalse\ntrue\ntrue\nfalse\n");
}

#[test]
fn natives_remain_gated_to_std_files() {
    std_root();
    let (_, result) = compile_files(&[(
        "main.poise",
        "import std::list;\nfunc main() {\n    __NATIVE_LIST_SIZE([1]);\n}\n",
    )]);
    assert_eq!(result, CompileResult::CompileError);
}
