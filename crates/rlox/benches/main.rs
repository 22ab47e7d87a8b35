//! Interpreter benchmarks: call-heavy recursion, allocation churn, and
//! method dispatch.

use criterion::{Criterion, criterion_group, criterion_main};
use rlox::{NoPrint, Vm};

const FIB: &str = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\nfib(15);";

const STRING_CHURN: &str = "var s = \"\";\nfor (var i = 0; i < 200; i = i + 1) { s = s + \"x\"; }";

const METHOD_DISPATCH: &str = "class Counter {\n  init() { this.n = 0; }\n  bump() { this.n = this.n + 1; return this.n; }\n}\nvar c = Counter();\nfor (var i = 0; i < 500; i = i + 1) { c.bump(); }";

fn bench_interpret(c: &mut Criterion, name: &str, source: &str) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let mut vm = Vm::with_writer(NoPrint);
            vm.interpret(source).expect("benchmark program should run");
        });
    });
}

fn benches(c: &mut Criterion) {
    bench_interpret(c, "fib_15", FIB);
    bench_interpret(c, "string_churn", STRING_CHURN);
    bench_interpret(c, "method_dispatch", METHOD_DISPATCH);
}

criterion_group!(benchmark_group, benches);
criterion_main!(benchmark_group);
