//! Construction and classification throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use treeline_common::{FieldRange, Packet, Rule, FIELD_COUNT};
use treeline_engine::Classifier;

/// Deterministic synthetic ruleset: distinct /24 source prefixes with a
/// sprinkling of port-constrained and wildcard rules.
fn synthetic_rules(n: usize) -> Vec<Rule> {
    (0..n)
        .map(|i| {
            let mut ranges = [
                FieldRange::full(32),
                FieldRange::full(32),
                FieldRange::full(16),
                FieldRange::full(16),
                FieldRange::full(8),
            ];
            let mut prefix_len = [0u32; FIELD_COUNT];

            let low = ((i as u32 % 256) << 24) | ((i as u32 / 256) << 16);
            ranges[0] = FieldRange {
                low,
                high: low + 0xFF,
            };
            prefix_len[0] = 24;

            if i % 3 == 0 {
                let port = (i as u32 * 13) % 65536;
                ranges[3] = FieldRange {
                    low: port,
                    high: port,
                };
                prefix_len[3] = 16;
            }
            if i % 7 == 0 {
                ranges[4] = FieldRange { low: 6, high: 6 };
                prefix_len[4] = 8;
            }

            Rule {
                id: i as u32,
                priority: (n - 1 - i) as i32,
                ranges,
                prefix_len,
            }
        })
        .collect()
}

fn synthetic_packets(rules: &[Rule], n: usize) -> Vec<Packet> {
    (0..n)
        .map(|i| {
            let rule = &rules[(i * 31) % rules.len()];
            Packet::new([
                rule.ranges[0].low | (i as u32 & 0xFF),
                i as u32,
                (i as u32 * 7) % 65536,
                rule.ranges[3].low,
                rule.ranges[4].low,
            ])
        })
        .collect()
}

fn bench_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("construction");
    for size in [1_000usize, 10_000] {
        let rules = synthetic_rules(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &rules, |b, rules| {
            b.iter(|| {
                let mut classifier = Classifier::with_defaults();
                classifier.construct(black_box(rules.clone()));
                black_box(classifier.num_tables())
            })
        });
    }
    group.finish();
}

fn bench_classification(c: &mut Criterion) {
    let rules = synthetic_rules(10_000);
    let packets = synthetic_packets(&rules, 1_000);
    let mut classifier = Classifier::with_defaults();
    classifier.construct(rules);

    let mut group = c.benchmark_group("classification");
    group.throughput(Throughput::Elements(packets.len() as u64));
    group.bench_function("trace_replay", |b| {
        b.iter(|| {
            let mut sum = 0i64;
            for packet in &packets {
                sum += classifier.classify(black_box(packet)) as i64;
            }
            black_box(sum)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_construction, bench_classification);
criterion_main!(benches);
