mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use luaparse::backend::Backend;
use luaparse::backend::interpreter::Interpreter;

fn bench_interpreter(c: &mut Criterion) {
    for (name, path) in common::WORKLOADS {
        let program = common::load_program(path);
        c.bench_function(&format!("interpreter_{name}"), |b| {
            let mut interpreter = Interpreter::new();
            b.iter(|| {
                let output = interpreter.run(black_box(&program)).expect("run");
                black_box(output);
            })
        });
    }
}

criterion_group!(benches, bench_interpreter);
criterion_main!(benches);
