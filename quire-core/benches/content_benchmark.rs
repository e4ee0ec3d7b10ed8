use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use quire_core::content::{sanitize_doc, Block, Node, PageContent};
use std::hint::black_box;

fn sample_content(blocks: usize) -> PageContent {
    let mut out = Vec::with_capacity(blocks);
    for i in 0..blocks {
        if i % 10 == 0 {
            out.push(Block::heading(2, &format!("Section {i}")));
        } else {
            out.push(Block::paragraph("The quick brown fox jumps over the lazy dog."));
        }
    }
    PageContent::new(out)
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("Content Codec");
    group.throughput(Throughput::Elements(200));

    let content = sample_content(200);
    group.bench_function("serialize_200_blocks", |b| {
        b.iter(|| black_box(content.to_json()))
    });

    let raw = content.to_json();
    group.bench_function("parse_200_blocks", |b| {
        b.iter(|| black_box(PageContent::parse(black_box(&raw)).unwrap()))
    });

    group.finish();
}

fn bench_sanitize(c: &mut Criterion) {
    let mut group = c.benchmark_group("Content Codec");

    // Half the top-level nodes are stray text runs.
    let mut nodes = Vec::new();
    for i in 0..200 {
        if i % 2 == 0 {
            nodes.push(Node::text("stray"));
        } else {
            nodes.push(Node::paragraph("ok"));
        }
    }
    let doc = Node::doc(nodes);

    group.bench_function("sanitize_200_nodes", |b| {
        b.iter(|| black_box(sanitize_doc(black_box(doc.clone()))))
    });
    group.bench_function("durable_filter_200_nodes", |b| {
        b.iter(|| black_box(PageContent::from_doc(black_box(&doc))))
    });

    group.finish();
}

criterion_group!(benches, bench_serialize, bench_sanitize);
criterion_main!(benches);
