//! End-to-end behavior of the compiler/VM pair, asserted on exact stdout.

use pretty_assertions::assert_eq;
use rlox::{CollectStringPrint, Vm};

/// Runs a program and returns everything it printed.
fn run(source: &str) -> String {
    let mut vm = Vm::with_writer(CollectStringPrint::new());
    vm.interpret(source).expect("program should run");
    vm.into_writer().into_output()
}

// =============================================================================
// Expressions and statements
// =============================================================================

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run("println(1 + 2 * 3);"), "7\n");
    assert_eq!(run("println((1 + 2) * 3);"), "9\n");
    assert_eq!(run("println(10 / 4);"), "2.5\n");
    assert_eq!(run("println(-2 - -3);"), "1\n");
    assert_eq!(run("println(1 + 2 == 3);"), "true\n");
}

#[test]
fn comparison_and_equality() {
    assert_eq!(run("println(1 < 2);"), "true\n");
    assert_eq!(run("println(2 <= 2);"), "true\n");
    assert_eq!(run("println(3 > 4);"), "false\n");
    assert_eq!(run("println(1 != 2);"), "true\n");
    assert_eq!(run("println(nil == nil);"), "true\n");
    assert_eq!(run("println(nil == false);"), "false\n");
    assert_eq!(run("println(\"a\" == \"b\");"), "false\n");
}

#[test]
fn truthiness() {
    // Only nil and false are falsey; 0 and "" are truthy.
    assert_eq!(run("println(!nil);"), "true\n");
    assert_eq!(run("println(!false);"), "true\n");
    assert_eq!(run("println(!0);"), "false\n");
    assert_eq!(run("println(!\"\");"), "false\n");
    assert_eq!(run("if (0) println(\"zero is truthy\");"), "zero is truthy\n");
}

#[test]
fn number_literals() {
    assert_eq!(run("println(1_000_000);"), "1000000\n");
    assert_eq!(run("println(1.5e2);"), "150\n");
    assert_eq!(run("println(2E-1);"), "0.2\n");
    assert_eq!(run("println(1_2.3_4);"), "12.34\n");
}

#[test]
fn number_printing_uses_fifteen_significant_digits() {
    assert_eq!(run("println(0.1 + 0.2);"), "0.3\n");
    assert_eq!(run("println(1/3);"), "0.333333333333333\n");
    assert_eq!(run("println(100000000000000000000);"), "1e+20\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("println(\"foo\" + \"bar\" + \"!\");"), "foobar!\n");
    assert_eq!(run("var s = \"\"; s = s + \"a\"; s = s + \"b\"; println(s);"), "ab\n");
}

#[test]
fn multiline_strings() {
    assert_eq!(run("println(\"one\ntwo\");"), "one\ntwo\n");
}

#[test]
fn logical_operators_short_circuit_to_operands() {
    assert_eq!(run("println(nil or \"fallback\");"), "fallback\n");
    assert_eq!(run("println(1 and 2);"), "2\n");
    assert_eq!(run("println(false and \"unreached\");"), "false\n");
    assert_eq!(run("println(\"first\" or \"second\");"), "first\n");
}

#[test]
fn logical_operators_do_not_evaluate_the_short_circuited_side() {
    let out = run(
        "fun loud() { println(\"evaluated\"); return true; }\n\
         false and loud();\n\
         true or loud();\n\
         println(\"done\");",
    );
    assert_eq!(out, "done\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run("var a; var b; a = b = 2; println(a + b);"), "4\n");
}

// =============================================================================
// Scopes and control flow
// =============================================================================

#[test]
fn block_scoping_and_shadowing() {
    let out = run(
        "var a = \"global\";\n\
         { var a = \"local\"; println(a); }\n\
         println(a);",
    );
    assert_eq!(out, "local\nglobal\n");
}

#[test]
fn if_else_chains() {
    let source = "fun pick(n) { if (n < 0) return \"neg\"; else if (n == 0) return \"zero\"; else return \"pos\"; }\n\
                  println(pick(-1)); println(pick(0)); println(pick(5));";
    assert_eq!(run(source), "neg\nzero\npos\n");
}

#[test]
fn while_loops() {
    assert_eq!(run("var i = 0; while (i < 5) { i = i + 1; } println(i);"), "5\n");
}

#[test]
fn for_loops() {
    assert_eq!(
        run("var total = 0; for (var i = 0; i < 5; i = i + 1) { total = total + i; } println(total);"),
        "10\n"
    );
    // All three clauses are optional; break provides the exit.
    assert_eq!(
        run("var i = 0; for (;;) { i = i + 1; if (i == 3) break; } println(i);"),
        "3\n"
    );
}

#[test]
fn break_exits_the_innermost_loop() {
    let out = run(
        "var log = \"\";\n\
         for (var i = 0; i < 3; i = i + 1) {\n\
           for (var j = 0; j < 10; j = j + 1) {\n\
             if (j == 2) break;\n\
             log = log + \"x\";\n\
           }\n\
           log = log + \".\";\n\
         }\n\
         println(log);",
    );
    assert_eq!(out, "xx.xx.xx.\n");
}

#[test]
fn break_discards_locals_from_inner_scopes() {
    let out = run(
        "var log = \"\";\n\
         for (var i = 0; i < 10; i = i + 1) {\n\
           var tag = \"x\";\n\
           if (i == 2) { var deep = \"unused\"; break; }\n\
           log = log + tag;\n\
         }\n\
         println(log);",
    );
    assert_eq!(out, "xx\n");
}

// =============================================================================
// Functions and closures
// =============================================================================

#[test]
fn fibonacci() {
    let out = run(
        "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
         println(fib(10));",
    );
    assert_eq!(out, "55\n");
}

#[test]
fn closure_captures_through_two_levels() {
    let out = run(
        "fun outer() { var x = \"value\"; fun middle() { fun inner() { println(x); } return inner; } return middle; }\n\
         outer()()();",
    );
    assert_eq!(out, "value\n");
}

#[test]
fn upvalue_updates_visible_after_return() {
    let out = run(
        "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }\n\
         var f = make(); println(f()); println(f()); println(f());",
    );
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn closures_share_a_captured_variable() {
    let out = run(
        "var bump; var bigBump;\n\
         fun make() {\n\
           var x = 0;\n\
           fun a() { x = x + 1; return x; }\n\
           fun b() { x = x + 10; return x; }\n\
           bump = a; bigBump = b;\n\
         }\n\
         make();\n\
         println(bump()); println(bigBump()); println(bump());",
    );
    assert_eq!(out, "1\n11\n12\n");
}

#[test]
fn each_call_captures_fresh_variables() {
    let out = run(
        "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }\n\
         var f = make(); var g = make();\n\
         println(f()); println(f()); println(g());",
    );
    assert_eq!(out, "1\n2\n1\n");
}

#[test]
fn functions_are_first_class() {
    let out = run(
        "fun twice(f, v) { return f(f(v)); }\n\
         fun addOne(n) { return n + 1; }\n\
         println(twice(addOne, 5));",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn recursion_through_a_local_function_name() {
    let out = run(
        "{\n\
           fun countdown(n) { if (n <= 0) return \"done\"; return countdown(n - 1); }\n\
           println(countdown(5));\n\
         }",
    );
    assert_eq!(out, "done\n");
}

// =============================================================================
// Classes
// =============================================================================

#[test]
fn initializer_stores_fields_and_returns_the_instance() {
    let out = run(
        "class P { init(x) { this.x = x; } }\n\
         var p = P(42); println(p.x);",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn calling_init_again_returns_this() {
    let out = run(
        "class P { init(x) { this.x = x; } }\n\
         var p = P(1);\n\
         var q = p.init(9);\n\
         println(p.x); println(p == q);",
    );
    assert_eq!(out, "9\ntrue\n");
}

#[test]
fn methods_bind_this() {
    let out = run(
        "class Counter {\n\
           init(start) { this.n = start; }\n\
           bump() { this.n = this.n + 1; return this.n; }\n\
         }\n\
         var c = Counter(41); println(c.bump()); println(c.n);",
    );
    assert_eq!(out, "42\n42\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let out = run(
        "class P { init(v) { this.v = v; } get() { return this.v; } }\n\
         var p = P(7);\n\
         var m = p.get;\n\
         println(m());",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn fields_shadow_methods() {
    let out = run(
        "class C { m() { return \"method\"; } }\n\
         var c = C();\n\
         println(c.m());\n\
         c.m = 5;\n\
         println(c.m);",
    );
    assert_eq!(out, "method\n5\n");
}

#[test]
fn callable_fields_are_invoked_like_methods() {
    let out = run(
        "fun shout() { return \"field fn\"; }\n\
         class C {}\n\
         var c = C(); c.f = shout;\n\
         println(c.f());",
    );
    assert_eq!(out, "field fn\n");
}

#[test]
fn inheritance_and_super() {
    let out = run(
        "class A { speak() { println(\"A\"); } }\n\
         class B < A { speak() { super.speak(); println(\"B\"); } }\n\
         B().speak();",
    );
    assert_eq!(out, "A\nB\n");
}

#[test]
fn inherited_methods_bind_the_subclass_instance() {
    let out = run(
        "class A { name() { return \"A\"; } describe() { return \"I am \" + this.name(); } }\n\
         class B < A { name() { return \"B\"; } }\n\
         println(B().describe());",
    );
    assert_eq!(out, "I am B\n");
}

#[test]
fn super_calls_skip_the_override() {
    let out = run(
        "class A { m() { return \"A.m\"; } }\n\
         class B < A { m() { return \"B.m\"; } callSuper() { return super.m(); } }\n\
         println(B().m()); println(B().callSuper());",
    );
    assert_eq!(out, "B.m\nA.m\n");
}

#[test]
fn initializers_are_inherited() {
    let out = run(
        "class A { init(v) { this.v = v; } }\n\
         class B < A {}\n\
         println(B(3).v);",
    );
    assert_eq!(out, "3\n");
}

// =============================================================================
// Strings and interning
// =============================================================================

#[test]
fn concatenated_strings_intern_to_the_same_object() {
    let out = run(
        "var a = \"ab\" + \"c\"; var b = \"abc\"; println(a == b);",
    );
    assert_eq!(out, "true\n");
}

// =============================================================================
// Natives and printing
// =============================================================================

#[test]
fn print_writes_without_separators_or_newline() {
    assert_eq!(run("print(1, 2, 3); print(\"x\");"), "123x");
}

#[test]
fn println_terminates_with_a_newline() {
    assert_eq!(run("println(\"a\", \"b\");"), "ab\n");
    assert_eq!(run("println();"), "\n");
}

#[test]
fn clock_is_monotonic_and_numeric() {
    assert_eq!(run("var t = clock(); println(t >= 0); println(clock() >= t);"), "true\ntrue\n");
}

#[test]
fn value_printing_rules() {
    assert_eq!(run("println(nil);"), "nil\n");
    assert_eq!(run("println(true, false);"), "truefalse\n");
    assert_eq!(run("fun f() {} println(f);"), "<fn f>\n");
    assert_eq!(run("class C {} println(C);"), "C\n");
    assert_eq!(run("class C {} println(C());"), "C instance\n");
    assert_eq!(run("class C { m() {} } println(C().m);"), "<fn m>\n");
    assert_eq!(run("println(clock);"), "<native fn>\n");
}

// =============================================================================
// Session behavior
// =============================================================================

#[test]
fn globals_persist_across_interpret_calls() {
    let mut vm = Vm::with_writer(CollectStringPrint::new());
    vm.interpret("var x = 1; fun double(n) { return n + n; }").unwrap();
    vm.interpret("println(double(x + 20));").unwrap();
    assert_eq!(vm.writer().output(), "42\n");
}

#[test]
fn vm_stays_usable_after_a_runtime_error() {
    let mut vm = Vm::with_writer(CollectStringPrint::new());
    assert!(vm.interpret("println(missing);").is_err());
    vm.interpret("println(\"still alive\");").unwrap();
    assert_eq!(vm.writer().output(), "still alive\n");
}

#[test]
fn disassembly_covers_nested_functions() {
    let mut vm = Vm::new();
    let text = vm
        .disassemble("fun greet(name) { println(\"hi \" + name); } greet(\"you\");")
        .unwrap();
    assert!(text.contains("== script =="));
    assert!(text.contains("== greet =="));
    assert!(text.contains("Closure"));
    assert!(text.contains("Call"));
}
