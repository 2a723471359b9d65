//! Benchmarks for trustlink core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::BTreeMap;
use trustlink::core::graph::{DependencyGraph, ResourceHandle};
use trustlink::core::parser::parse_config;
use trustlink::core::types::ResourceSpec;
use trustlink::resources::deployment;
use trustlink::tripwire::hasher;

fn bench_hash_inputs(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_inputs");
    for fields in [4, 16, 64] {
        let inputs: BTreeMap<String, serde_json::Value> = (0..fields)
            .map(|i| (format!("field_{i}"), json!({"value": i, "tags": ["a", "b"]})))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(fields), &inputs, |b, inputs| {
            b.iter(|| black_box(hasher::hash_inputs("service_connection", black_box(inputs))));
        });
    }
    group.finish();
}

/// Layered graph: each node reads up to three nodes of the previous layer.
fn layered_graph(layers: usize, width: usize) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    let mut previous: Vec<ResourceHandle> = Vec::new();
    for layer in 0..layers {
        let mut current = Vec::with_capacity(width);
        for i in 0..width {
            let id = format!("n{layer}_{i}");
            let mut spec = ResourceSpec::new(id.as_str(), "bench").input("name", id.as_str());
            for (k, dep) in previous.iter().skip(i).take(3).enumerate() {
                spec = spec.input(format!("dep{k}"), dep.output("id"));
            }
            current.push(graph.add_node(spec).unwrap());
        }
        previous = current;
    }
    graph
}

fn bench_topological_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("topological_order");
    for (layers, width) in [(5, 10), (10, 50), (20, 100)] {
        let graph = layered_graph(layers, width);
        group.bench_with_input(
            BenchmarkId::from_parameter(layers * width),
            &graph,
            |b, graph| {
                b.iter(|| black_box(graph.topological_order().unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_declare_deployment(c: &mut Criterion) {
    let config = parse_config(
        r#"
version: "1.0"
organization_url: https://dev.azure.com/contoso/
project:
  name: bench
pipeline:
  content: "trigger: [main]"
cloud:
  tenant_id: t
  subscription_id: s
  subscription_name: Bench
"#,
    )
    .unwrap();

    c.bench_function("declare_deployment", |b| {
        b.iter(|| black_box(deployment::declare(black_box(&config)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_hash_inputs,
    bench_topological_order,
    bench_declare_deployment
);
criterion_main!(benches);
