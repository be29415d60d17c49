//! Throughput Benchmark for FlashRelay
//!
//! Measures the hot path components in isolation: the RESP request parser
//! and the fast-ack lookup.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashrelay::protocol::{fast_ack_reply, RequestParser};

/// Benchmark request parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_set_small", |b| {
        let frame = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$5\r\nvalue\r\n";
        let mut parser = RequestParser::new();
        b.iter(|| {
            let parsed = parser.parse(black_box(frame), true).unwrap().unwrap();
            black_box(parsed);
        });
    });

    group.bench_function("parse_set_large", |b| {
        let value = "x".repeat(16 * 1024);
        let frame = format!("*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n${}\r\n{}\r\n", value.len(), value);
        let mut parser = RequestParser::new();
        b.iter(|| {
            let parsed = parser.parse(black_box(frame.as_bytes()), true).unwrap().unwrap();
            black_box(parsed);
        });
    });

    group.bench_function("parse_mset_many_args", |b| {
        let mut frame = String::from("*21\r\n$4\r\nMSET\r\n");
        for i in 0..10 {
            frame.push_str(&format!("$4\r\nk{:03}\r\n$6\r\nvalue{}\r\n", i, i));
        }
        let mut parser = RequestParser::new();
        b.iter(|| {
            let parsed = parser.parse(black_box(frame.as_bytes()), true).unwrap().unwrap();
            black_box(parsed);
        });
    });

    group.bench_function("parse_inline", |b| {
        let frame = b"SET key value\r\n";
        let mut parser = RequestParser::new();
        b.iter(|| {
            let parsed = parser.parse(black_box(frame), true).unwrap().unwrap();
            black_box(parsed);
        });
    });

    group.finish();
}

/// Benchmark the smart-mode fast-ack table lookup
fn bench_fast_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("fast_ack");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit", |b| {
        b.iter(|| black_box(fast_ack_reply(black_box(b"SET"))));
    });

    group.bench_function("miss", |b| {
        b.iter(|| black_box(fast_ack_reply(black_box(b"GET"))));
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_fast_ack);
criterion_main!(benches);
