//! Evaluation Benchmarks
//!
//! Compares the three ways of running a function built from an expression string:
//! - **Interpreted**: the algorithm walked with the numeric semiring
//! - **Program**: the flat generated program run by the interpreter
//! - **Native**: the generated program compiled with Cranelift
//!
//! A second group measures Jacobian sparsity detection on banded systems of growing
//! size with plain and hierarchical propagation, and a third the compilation time.
//!
//! Run with: `cargo bench --bench evaluation`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use exprgraph_jit::prelude::*;

const EXPRESSIONS: [(&str, &str); 5] = [
    ("linear", "2.2 * a + 1.1"),
    ("polynomial", "(a^3 + 2*a^2 - 5*a + 1) / (b^2 + 3*b + 2)"),
    ("nested", "((a + b) * (a - b)) / ((c + 1) * (c - 1))"),
    ("sqrt", "sqrt(1 - 2.2*a + 3.14159/b/3.3)"),
    (
        "very_complex",
        "(a^3 + b^2*c - 2*a*b + c) / ((a+b)*(b+c)*(a+c) + 1) + sqrt(a*b*c) - sqrt((a+b+c)^3)",
    ),
];

fn scalar_function(name: &str, text: &str) -> Function {
    let mut g = Graph::new();
    let (expr, symbols) = parse_with_symbols(&mut g, text).expect("Failed to parse expression");
    let inputs: Vec<Mx> = symbols.iter().map(|(_, x)| *x).collect();
    Function::new(name, &g, &inputs, &[expr]).expect("Failed to create function")
}

/// `f_i = x_i * x_{i+1} - sin(x_i)` with a wrap-around last entry.
fn banded_function(n: usize, options: FunctionOptions) -> Function {
    let mut g = Graph::new();
    let x = g.sym("x", n, 1);
    let offsets: Vec<usize> = (0..=n).collect();
    let parts = g.vertsplit(x, &offsets).expect("Failed to split");
    let rows: Vec<Mx> = (0..n)
        .map(|i| {
            let prod = g.times(parts[i], parts[(i + 1) % n])?;
            let s = g.sin(parts[i])?;
            g.sub(prod, s)
        })
        .collect::<Result<_, _>>()
        .expect("Failed to build rows");
    let f = g.vertcat(&rows).expect("Failed to concatenate");
    Function::new("banded", &g, &[x], &[f])
        .and_then(|fun| fun.with_options(options))
        .expect("Failed to create function")
}

fn benchmark_evaluation(c: &mut Criterion) {
    let params = [2.5, 1.8, 0.7];
    let mut group = c.benchmark_group("Evaluation");

    for (name, text) in EXPRESSIONS {
        let fun = scalar_function(name, text);
        let args: Vec<Matrix> = params[..fun.n_in()].iter().map(|&v| Matrix::scalar(v)).collect();
        let code = fun.generate_code().expect("Failed to generate code");
        let compiled = fun.compile().expect("Failed to compile");

        group.bench_with_input(BenchmarkId::new("Interpreted", name), &args, |b, args| {
            b.iter(|| black_box(fun.evaluate(black_box(args)).expect("evaluation failed")))
        });
        group.bench_with_input(BenchmarkId::new("Program", name), &args, |b, args| {
            b.iter(|| black_box(code.interpret(black_box(args)).expect("evaluation failed")))
        });

        let inputs: Vec<[f64; 1]> = params[..fun.n_in()].iter().map(|&v| [v]).collect();
        let mut w = vec![0.0; compiled.code().n_w()];
        group.bench_function(BenchmarkId::new("Native", name), |b| {
            b.iter(|| {
                let arg: Vec<Option<&[f64]>> = inputs.iter().map(|v| Some(&v[..])).collect();
                let mut out = [0.0];
                let mut res = [Some(&mut out[..])];
                compiled
                    .call_raw(black_box(&arg), &mut res, &mut w)
                    .expect("evaluation failed");
                black_box(out[0])
            })
        });
    }
    group.finish();
}

fn benchmark_sparsity(c: &mut Criterion) {
    let mut group = c.benchmark_group("Jacobian Sparsity");
    for n in [16, 64, 256] {
        for (label, mode) in [
            ("Plain", SparsityMode::Plain),
            ("Hierarchical", SparsityMode::Hierarchical),
        ] {
            let options = FunctionOptions {
                sparsity_mode: mode,
                ..FunctionOptions::default()
            };
            let fun = banded_function(n, options);
            group.bench_with_input(BenchmarkId::new(label, n), &fun, |b, fun| {
                // a fresh handle per iteration keeps the pattern cache cold
                b.iter(|| {
                    let fresh = fun.with_options(options).expect("Failed to rebuild");
                    black_box(fresh.jacobian_sparsity(0, 0, false).expect("propagation failed"))
                })
            });
        }
    }
    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compilation");
    for (name, text) in EXPRESSIONS {
        group.bench_function(name, |b| {
            b.iter(|| {
                let fun = scalar_function(name, black_box(text));
                black_box(fun.compile().expect("Failed to compile"))
            })
        });
    }
    let banded = banded_function(64, FunctionOptions::default());
    group.bench_function("banded_jacobian", |b| {
        b.iter(|| {
            let jac = banded
                .with_options(FunctionOptions::default())
                .and_then(|f| f.jacobian(0, 0, false, false))
                .expect("Failed to build jacobian");
            black_box(jac.compile().expect("Failed to compile"))
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_evaluation,
    benchmark_sparsity,
    benchmark_compilation_time
);
criterion_main!(benches);
