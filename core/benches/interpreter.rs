//! Interpreter micro-benchmarks: a call-heavy workload and an
//! allocation-heavy one.

use criterion::{criterion_group, criterion_main, Criterion};

use bramble_core::Vm;

const FIB: &str = r#"
fun fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
fib(18);
"#;

const STRINGS: &str = r#"
var s = "";
for (var i = 0; i < 500; i = i + 1) {
    s = "chunk-" + i;
}
"#;

fn sink_vm() -> Vm {
    Vm::with_io(Box::new(std::io::sink()), Box::new(std::io::sink()))
}

fn bench_fib(c: &mut Criterion) {
    c.bench_function("fib_18", |b| {
        b.iter(|| {
            let mut vm = sink_vm();
            vm.interpret(FIB).unwrap();
        })
    });
}

fn bench_strings(c: &mut Criterion) {
    c.bench_function("string_churn", |b| {
        b.iter(|| {
            let mut vm = sink_vm();
            vm.interpret(STRINGS).unwrap();
        })
    });
}

criterion_group!(benches, bench_fib, bench_strings);
criterion_main!(benches);
