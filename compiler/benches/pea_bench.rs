//! Benchmarks for the escape analysis phase on generated graphs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pea_compiler::ir::{BinaryOp, FieldRef, Graph, GraphBuilder, ObjectLayout, ValueKind};
use pea_compiler::{PartialEscapePhase, PeaConfig};

/// One allocation threaded through `count` diamonds. Every diamond writes
/// the field on one side; every fourth one also lets it escape there.
fn generate_diamond_chain(count: usize) -> Graph {
    let mut b = GraphBuilder::new("diamonds");
    let layout = b.layout(ObjectLayout::instance("Cell", vec![ValueKind::Int, ValueKind::Int]));
    let value = FieldRef::new(layout, 0);
    let cond = b.param(0, ValueKind::Int);
    let object = b.new_instance(layout);

    for i in 0..count {
        let left = b.create_block(format!("left{}", i));
        let right = b.create_block(format!("right{}", i));
        let merge = b.create_block(format!("merge{}", i));
        b.branch(cond, left, right);

        b.switch_to_block(left);
        let constant = b.int(i as i32);
        b.store_field(object, value, constant);
        b.goto(merge);

        b.switch_to_block(right);
        if i % 4 == 3 {
            b.invoke("observe", &[object], ValueKind::Void);
        }
        b.goto(merge);

        b.switch_to_block(merge);
    }

    let result = b.load_field(object, value);
    b.ret(Some(result));
    b.finish()
}

/// `count` loops in sequence, each accumulating into a fresh object.
fn generate_loop_sequence(count: usize) -> Graph {
    let mut b = GraphBuilder::new("loops");
    let layout = b.layout(ObjectLayout::instance("Sum", vec![ValueKind::Int]));
    let total = FieldRef::new(layout, 0);
    let cond = b.param(0, ValueKind::Int);
    let mut carried = b.int(0);

    for i in 0..count {
        let header = b.create_block(format!("header{}", i));
        let body = b.create_block(format!("body{}", i));
        let exit = b.create_block(format!("exit{}", i));
        let object = b.new_instance(layout);
        b.store_field(object, total, carried);
        b.goto(header);

        b.switch_to_block(header);
        b.branch(cond, body, exit);

        b.switch_to_block(body);
        let current = b.load_field(object, total);
        let next = b.binary(BinaryOp::Add, current, cond);
        b.store_field(object, total, next);
        b.goto(header);

        b.switch_to_block(exit);
        carried = b.load_field(object, total);
    }

    b.ret(Some(carried));
    b.finish()
}

fn run_phase(graph: &Graph, config: &PeaConfig) {
    let mut graph = graph.clone();
    let mut phase = PartialEscapePhase::new(config.clone());
    let stats = phase.run(black_box(&mut graph));
    black_box(stats.ok());
}

fn benchmark_diamond_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamond_chain");
    let config = PeaConfig::default();

    for count in [10, 50, 200].iter() {
        let graph = generate_diamond_chain(*count);

        group.bench_with_input(BenchmarkId::from_parameter(count), &graph, |b, graph| {
            b.iter(|| run_phase(graph, &config));
        });
    }

    group.finish();
}

fn benchmark_loop_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop_sequence");
    let config = PeaConfig::default();

    for count in [5, 20, 80].iter() {
        let graph = generate_loop_sequence(*count);

        group.bench_with_input(BenchmarkId::from_parameter(count), &graph, |b, graph| {
            b.iter(|| run_phase(graph, &config));
        });
    }

    group.finish();
}

fn benchmark_escape_analysis_only(c: &mut Criterion) {
    let graph = generate_loop_sequence(20);
    let config = PeaConfig::escape_analysis_only();

    c.bench_function("escape_analysis_without_reads", |b| {
        b.iter(|| run_phase(&graph, &config));
    });
}

criterion_group!(
    benches,
    benchmark_diamond_chain,
    benchmark_loop_sequence,
    benchmark_escape_analysis_only
);
criterion_main!(benches);
