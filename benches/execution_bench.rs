use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oxidos::{compiler, Machine};

const FIB: &str = "int f(int i) { if (i < 2) return 1; return f(i - 1) + f(i - 2); }\n\
                   int main() { return f(15); }";

const SUM: &str = "int main() { int i; int s; for (i = 0, s = 0; i < 10000; ++i) s += i; return s & 0xff; }";

fn compile_benchmark(c: &mut Criterion) {
    c.bench_function("compile fib", |b| {
        b.iter(|| compiler::compile(black_box(FIB)).unwrap())
    });
}

fn execute_benchmark(c: &mut Criterion) {
    c.bench_function("execute sum loop", |b| {
        b.iter(|| {
            let mut m = Machine::new();
            m.write_file("/bin/bench", SUM.as_bytes()).unwrap();
            let pid = m.exec("/bin/bench", &[]).unwrap();
            m.run(10_000);
            m.reap(pid)
        })
    });
}

criterion_group!(benches, compile_benchmark, execute_benchmark);
criterion_main!(benches);
