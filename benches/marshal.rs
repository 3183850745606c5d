//! Benchmarks for the callback paths
//!
//! Measures the per-event cost of rule marshaling and the per-fill cost of
//! the input relay against the native runtime, both called directly and
//! through the C capability tables.
//!
//! Run with: cargo bench --bench marshal

use std::ffi::{c_char, CString};

use bisonlink::engine::{
    fill, invoke, BridgeContext, HostRuntime, NativeParser, NativeRuntime, RuleEvent,
    TruncationPolicy, Value,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_invoke(c: &mut Criterion) {
    let runtime = NativeRuntime::new();
    let parser = NativeParser::new()
        .on("expr_plus", |call| {
            Ok(Value::int(call.int_arg(0)? + call.int_arg(1)?))
        })
        .build();

    let mut group = c.benchmark_group("invoke");

    group.bench_function("direct", |b| {
        b.iter(|| {
            let event = RuleEvent::new(
                "expr_plus",
                1,
                vec![
                    ("left".to_string(), Value::int(3)),
                    ("right".to_string(), Value::int(4)),
                ],
            )
            .unwrap();
            black_box(invoke(&runtime, &parser, event).unwrap())
        })
    });

    group.bench_function("default_node", |b| {
        let parser = NativeParser::new().build();
        b.iter(|| {
            let event =
                RuleEvent::new("expr", 0, vec![("number".to_string(), Value::int(1))]).unwrap();
            black_box(invoke(&runtime, &parser, event).unwrap())
        })
    });

    group.bench_function("through_abi", |b| {
        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.marshaler_abi();
        let raw_parser = runtime.export(parser.clone());
        let left = runtime.export(Value::int(3));
        let right = runtime.export(Value::int(4));
        let target = CString::new("expr_plus").unwrap();
        let n_left = CString::new("left").unwrap();
        let n_right = CString::new("right").unwrap();
        let names = [n_left.as_ptr(), n_right.as_ptr()];
        let values = [left, right];

        b.iter(|| unsafe {
            let result = (abi.invoke)(
                abi.ctx,
                raw_parser,
                target.as_ptr(),
                1,
                2,
                names.as_ptr(),
                values.as_ptr(),
            );
            (abi.release)(abi.ctx, black_box(result));
        });

        unsafe {
            runtime.release_raw(left);
            runtime.release_raw(right);
            runtime.release_raw(raw_parser);
        }
    });

    group.finish();
}

fn bench_fill(c: &mut Criterion) {
    let runtime = NativeRuntime::new();
    let mut group = c.benchmark_group("fill");

    for size in [16usize, 256, 4096] {
        let line = "x".repeat(size - 1) + "\n";
        let parser = NativeParser::new()
            .read(move |_| Ok(Value::str(&line)))
            .build();

        group.bench_with_input(BenchmarkId::new("clamp", size), &size, |b, &size| {
            let mut buf = vec![0u8; size];
            b.iter(|| {
                black_box(fill(&runtime, &parser, &mut buf, TruncationPolicy::Clamp).unwrap())
            })
        });
    }

    group.bench_function("through_abi", |b| {
        let parser = NativeParser::new()
            .read(|_| Ok(Value::str("1 + 2 * 3\n")))
            .build();
        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.relay_abi();
        let raw_parser = runtime.export(parser);
        let mut buf = [0 as c_char; 64];

        b.iter(|| unsafe { black_box((abi.fill)(abi.ctx, raw_parser, buf.as_mut_ptr(), 64)) });

        unsafe { runtime.release_raw(raw_parser) };
    });

    group.finish();
}

criterion_group!(benches, bench_invoke, bench_fill);
criterion_main!(benches);
