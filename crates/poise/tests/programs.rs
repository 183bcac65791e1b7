//! Black-box program tests: compile a source string written to a temp file,
//! run it, and check the captured output and outcome.

use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use poise::{CollectStringPrint, CompileResult, Compiler, RunOutcome, Vm};
use pretty_assertions::assert_eq;

fn temp_program_dir() -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "poise-programs-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_program(dir: &PathBuf, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).expect("write program");
    path
}

/// Compiles and runs `source`, returning (outcome, stdout, stderr).
fn run_program(source: &str) -> (RunOutcome, String, String) {
    let dir = temp_program_dir();
    let path = write_program(&dir, "main.poise", source);

    let mut vm = Vm::new();
    let result = Compiler::compile_file(&mut vm, &path);
    assert_eq!(result, CompileResult::Success, "program failed to compile");

    let mut writer = CollectStringPrint::new();
    let outcome = vm.run(&mut writer);
    let err = writer.error_output().to_owned();
    (outcome, writer.into_output(), err)
}

fn expect_output(source: &str, expected: &str) {
    let (outcome, out, err) = run_program(source);
    assert_eq!(outcome, RunOutcome::Success, "runtime error: {err}");
    assert_eq!(out, expected);
}

fn compile_result(source: &str) -> CompileResult {
    let dir = temp_program_dir();
    let path = write_program(&dir, "main.poise", source);
    let mut vm = Vm::new();
    Compiler::compile_file(&mut vm, &path)
}

#[test]
fn primitive_arithmetic() {
    expect_output("func main() {\n    println(1 + 2 * 3);\n}\n", "7\n");
}

#[test]
fn locals_and_lambdas() {
    expect_output(
        "func main() {\n    var x = 10;\n    var f = |x|() => x * 2;\n    println(f());\n}\n",
        "20\n",
    );
}

#[test]
fn lambda_captures_are_snapshots() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var x = 1;\n",
            "    var f = |x|() => x + 10;\n",
            "    x = 5;\n",
            "    println(f());\n",
            "    println(x);\n",
            "}\n",
        ),
        "11\n5\n",
    );
}

#[test]
fn lambda_with_params_and_captures() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var base = 100;\n",
            "    var add = |base|(a, b) => a + b + base;\n",
            "    println(add(1, 2));\n",
            "}\n",
        ),
        "103\n",
    );
}

#[test]
fn for_over_inclusive_range() {
    expect_output(
        "func main() {\n    var s = 0;\n    for i in 0..=5 {\n        s = s + i;\n    }\n    println(s);\n}\n",
        "15\n",
    );
}

#[test]
fn for_over_descending_range() {
    expect_output(
        "func main() {\n    for i in 10..0 by -2 {\n        print(i);\n    }\n}\n",
        "108642",
    );
}

#[test]
fn infinite_direction_range_iterates_zero_times() {
    expect_output(
        "func main() {\n    for i in 0..-5 {\n        println(i);\n    }\n    println(\"done\");\n}\n",
        "done\n",
    );
}

#[test]
fn try_catch_binds_the_thrown_value() {
    expect_output(
        "func main() {\n    try {\n        throw \"oops\";\n    } catch e {\n        println(e);\n    }\n}\n",
        "Exception: oops\n",
    );
}

#[test]
fn try_catch_across_frames() {
    expect_output(
        concat!(
            "func boom() {\n",
            "    throw \"kaboom\";\n",
            "}\n",
            "func main() {\n",
            "    try {\n",
            "        boom();\n",
            "        println(\"unreachable\");\n",
            "    } catch e {\n",
            "        println(e);\n",
            "    }\n",
            "}\n",
        ),
        "Exception: kaboom\n",
    );
}

#[test]
fn try_expression_yields_the_exception() {
    expect_output(
        "func main() {\n    var x = try 1 / 0;\n    println(x);\n}\n",
        "DivisionByZero: Division by zero\n",
    );
}

#[test]
fn dict_literal_and_index() {
    expect_output(
        "func main() {\n    var d = {(\"a\", 1), (\"b\", 2)};\n    println(d[\"b\"]);\n}\n",
        "2\n",
    );
}

#[test]
fn dict_index_assignment_updates() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var d = {(\"a\", 1)};\n",
            "    d[\"a\"] = 5;\n",
            "    d[\"b\"] = 6;\n",
            "    println(d[\"a\"] + d[\"b\"]);\n",
            "}\n",
        ),
        "11\n",
    );
}

#[test]
fn missing_dict_key_is_a_runtime_error() {
    let (outcome, _, err) = run_program("func main() {\n    var d = {(\"a\", 1)};\n    println(d[\"z\"]);\n}\n");
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("KeyNotFound"), "stderr was: {err}");
}

#[test]
fn division_by_zero_is_unhandled() {
    let (outcome, _, err) = run_program("func main() {\n    var x = 1 / 0;\n    println(x);\n}\n");
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("DivisionByZero"), "stderr was: {err}");
}

#[test]
fn float_division_by_zero_is_infinite() {
    expect_output("func main() {\n    println(1.0 / 0);\n}\n", "inf\n");
}

#[test]
fn while_loop_with_break() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var i = 0;\n",
            "    while true {\n",
            "        i = i + 1;\n",
            "        if i == 5 {\n",
            "            break;\n",
            "        }\n",
            "    }\n",
            "    println(i);\n",
            "}\n",
        ),
        "5\n",
    );
}

#[test]
fn break_leaves_the_for_loop_iterator_cleanly() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var total = 0;\n",
            "    for i in 0..100 {\n",
            "        if i == 3 {\n",
            "            break;\n",
            "        }\n",
            "        total = total + i;\n",
            "    }\n",
            "    println(total);\n",
            "}\n",
        ),
        "3\n",
    );
}

#[test]
fn return_from_inside_a_loop() {
    expect_output(
        concat!(
            "func first_even(limit) {\n",
            "    for i in 1..limit {\n",
            "        if i % 2 == 0 {\n",
            "            return i;\n",
            "        }\n",
            "    }\n",
            "    return none;\n",
            "}\n",
            "func main() {\n",
            "    for x in 0..2 {\n",
            "        println(first_even(10));\n",
            "    }\n",
            "}\n",
        ),
        "2\n2\n",
    );
}

#[test]
fn recursion() {
    expect_output(
        concat!(
            "func fib(n) {\n",
            "    if n < 2 {\n",
            "        return n;\n",
            "    }\n",
            "    return fib(n - 1) + fib(n - 2);\n",
            "}\n",
            "func main() {\n",
            "    println(fib(10));\n",
            "}\n",
        ),
        "55\n",
    );
}

#[test]
fn variadic_pack_collects_surplus_arguments() {
    expect_output(
        concat!(
            "func sum(values...) {\n",
            "    var total = 0;\n",
            "    for v in values {\n",
            "        total = total + v;\n",
            "    }\n",
            "    return total;\n",
            "}\n",
            "func main() {\n",
            "    println(sum(1, 2, 3));\n",
            "    println(sum());\n",
            "}\n",
        ),
        "6\n0\n",
    );
}

#[test]
fn unpack_into_multiple_locals() {
    expect_output(
        "func main() {\n    var a, b, c = ...[1, 2, 3];\n    println(a + b + c);\n}\n",
        "6\n",
    );
}

#[test]
fn unpack_count_mismatch_raises() {
    let (outcome, _, err) = run_program("func main() {\n    var a, b = ...[1, 2, 3];\n    println(a);\n}\n");
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("InvalidArgument"), "stderr was: {err}");
}

#[test]
fn unpack_as_call_arguments() {
    expect_output(
        concat!(
            "func add(a, b) => a + b;\n",
            "func main() {\n",
            "    var args = (1, 2);\n",
            "    println(add(...args));\n",
            "}\n",
        ),
        "3\n",
    );
}

#[test]
fn struct_construction_and_member_access() {
    expect_output(
        concat!(
            "struct Point {\n",
            "    x = 1;\n",
            "    y;\n",
            "}\n",
            "func main() {\n",
            "    var p = Point(5);\n",
            "    println(p.x);\n",
            "    println(p.y);\n",
            "    println(p);\n",
            "}\n",
        ),
        "5\nnone\n<struct Point>\n",
    );
}

#[test]
fn const_expressions_fold_at_compile_time() {
    expect_output(
        concat!(
            "const ANSWER = 6 * 7;\n",
            "const GREETING = \"hello \" + \"world\";\n",
            "func main() {\n",
            "    println(ANSWER);\n",
            "    println(GREETING);\n",
            "}\n",
        ),
        "42\nhello world\n",
    );
}

#[test]
fn string_operators() {
    expect_output(
        "func main() {\n    println(\"ab\" * 3);\n    println(\"x = \" + 1);\n}\n",
        "ababab\nx = 1\n",
    );
}

#[test]
fn logical_operators_short_circuit_to_values() {
    expect_output(
        "func main() {\n    println(true and false);\n    println(1 or 0);\n}\n",
        "false\n1\n",
    );
}

#[test]
fn typeof_returns_shared_type_objects() {
    expect_output(
        "func main() {\n    println(typeof(5) == typeof(6));\n    println(typeof(5) == typeof(5.0));\n}\n",
        "true\nfalse\n",
    );
}

#[test]
fn eprintln_goes_to_the_error_channel() {
    let (outcome, out, err) = run_program("func main() {\n    eprintln(\"warn\");\n    println(\"ok\");\n}\n");
    assert_eq!(outcome, RunOutcome::Success);
    assert_eq!(out, "ok\n");
    assert_eq!(err, "warn\n");
}

#[test]
fn list_literal_concat_and_repeat() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var l = [1, 2] + [3];\n",
            "    println(l);\n",
            "    println([0] * 3);\n",
            "}\n",
        ),
        "[1, 2, 3]\n[0, 0, 0]\n",
    );
}

#[test]
fn tuples_display_and_index() {
    expect_output(
        "func main() {\n    var t = (1, \"two\", 3.5);\n    println(t);\n    println(t[1]);\n}\n",
        "(1, two, 3.5)\ntwo\n",
    );
}

#[test]
fn two_variable_loop_over_dict() {
    expect_output(
        "func main() {\n    var d = {(\"a\", 1)};\n    for k, v in d {\n        print(k);\n        print(v);\n    }\n}\n",
        "a1",
    );
}

#[test]
fn two_variable_loop_over_list_binds_none() {
    expect_output(
        "func main() {\n    for x, y in [7] {\n        print(x);\n        print(y);\n    }\n}\n",
        "7none",
    );
}

#[test]
fn string_indexing() {
    expect_output("func main() {\n    println(\"hello\"[1]);\n}\n", "e\n");
}

#[test]
fn builtin_constructors() {
    expect_output(
        concat!(
            "func main() {\n",
            "    println(Int(\"42\"));\n",
            "    println(Float(2));\n",
            "    println(String(17));\n",
            "    println(Bool(3));\n",
            "}\n",
        ),
        "42\n2\n17\ntrue\n",
    );
}

#[test]
fn number_literal_forms() {
    expect_output(
        "func main() {\n    println(0xFF);\n    println(0b1010);\n    println(1_000_000);\n}\n",
        "255\n10\n1000000\n",
    );
}

#[test]
fn nested_list_display() {
    expect_output(
        concat!(
            "func main() {\n",
            "    var inner = [2];\n",
            "    var l = [1, inner];\n",
            "    println(l);\n",
            "}\n",
        ),
        "[1, [2]]\n",
    );
}

// ---- compile-time error surface ----

#[test]
fn statements_at_top_level_are_rejected() {
    assert_eq!(compile_result("var x = 1;\n"), CompileResult::CompileError);
}

#[test]
fn missing_main_is_a_compile_error() {
    assert_eq!(compile_result("func helper() {\n    return 1;\n}\n"), CompileResult::CompileError);
}

#[test]
fn duplicate_locals_are_rejected() {
    assert_eq!(
        compile_result("func main() {\n    var x = 1;\n    var x = 2;\n}\n"),
        CompileResult::CompileError
    );
}

#[test]
fn assigning_to_final_is_rejected() {
    assert_eq!(
        compile_result("func main() {\n    final x = 1;\n    x = 2;\n}\n"),
        CompileResult::CompileError
    );
}

#[test]
fn final_requires_an_initializer() {
    assert_eq!(compile_result("func main() {\n    final x;\n}\n"), CompileResult::CompileError);
}

#[test]
fn break_outside_a_loop_is_rejected() {
    assert_eq!(compile_result("func main() {\n    break;\n}\n"), CompileResult::CompileError);
}

#[test]
fn unterminated_string_is_a_parse_error() {
    assert_eq!(compile_result("func main() {\n    println(\"oops);\n}\n"), CompileResult::ParseError);
}

#[test]
fn reserved_double_underscore_names_are_rejected() {
    assert_eq!(
        compile_result("func __secret() {\n    return 1;\n}\nfunc main() {\n}\n"),
        CompileResult::CompileError
    );
}

#[test]
fn native_calls_outside_std_are_rejected() {
    assert_eq!(
        compile_result("func main() {\n    __NATIVE_INT_ABS(-1);\n}\n"),
        CompileResult::CompileError
    );
}

#[test]
fn missing_file_is_a_file_error() {
    let mut vm = Vm::new();
    let result = Compiler::compile_file(&mut vm, &PathBuf::from("/definitely/not/here.poise"));
    assert_eq!(result, CompileResult::FileError);
}

#[test]
fn wrong_extension_is_a_file_error() {
    let dir = temp_program_dir();
    let path = write_program(&dir, "main.txt", "func main() {}\n");
    let mut vm = Vm::new();
    assert_eq!(Compiler::compile_file(&mut vm, &path), CompileResult::FileError);
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let (outcome, _, err) = run_program(
        "func two(a, b) => a + b;\nfunc main() {\n    println(two(1));\n}\n",
    );
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("IncorrectArgCount"), "stderr was: {err}");
}

#[test]
fn calling_a_non_callable_raises_invalid_operand() {
    let (outcome, _, err) = run_program("func main() {\n    var x = 5;\n    x(1);\n}\n");
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("InvalidOperand"), "stderr was: {err}");
}

#[test]
fn unhandled_exceptions_report_a_backtrace() {
    let (outcome, _, err) = run_program(
        "func inner() {\n    throw \"deep\";\n}\nfunc outer() {\n    inner();\n}\nfunc main() {\n    outer();\n}\n",
    );
    assert_eq!(outcome, RunOutcome::RuntimeError);
    assert!(err.contains("Unhandled Exception: Exception: deep"), "stderr was: {err}");
    assert!(err.contains("at inner"), "stderr was: {err}");
    assert!(err.contains("at outer"), "stderr was: {err}");
    assert!(err.contains("at main"), "stderr was: {err}");
}
