//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Every feed message passes through JSON decoding, classification and
//! the batch accumulator on the single dispatcher task, so these bound
//! the per-record throughput of the whole pipeline.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use feed_indexer::event::{classify, BatchAccumulator, CollectionSpec, Provenance, RawRecord};
use feed_indexer::source::filename::parse_spool_timestamp;
use serde_json::{json, Value};

fn like_payload(i: u64) -> Value {
    json!({
        "did": format!("did:plc:author{}", i % 97),
        "time_us": 1_735_689_600_000_000i64 + i as i64,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vuowo2b",
            "operation": "create",
            "collection": "app.bsky.feed.like",
            "rkey": format!("3l3qo2vutsw2b{}", i),
            "record": {
                "$type": "app.bsky.feed.like",
                "createdAt": "2025-01-01T00:00:00.000Z",
                "subject": {
                    "cid": "bafyreidfayvfuwqa7qlnopdjiqrxzs6blmoeu4rujcjtnci5beludirz2a",
                    "uri": format!("at://did:plc:subject{}/app.bsky.feed.post/3l3pte3p2e325", i % 13)
                }
            },
            "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
        }
    })
}

fn raw(payload: Value) -> RawRecord {
    RawRecord {
        payload,
        provenance: Provenance::Stream { connection: 1 },
        arrival_time_us: 0,
    }
}

/// Benchmark decode + classify of one feed message
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));

    let text = like_payload(7).to_string();
    group.bench_function("decode_and_classify_like", |b| {
        b.iter(|| {
            let payload: Value = serde_json::from_str(black_box(&text)).unwrap();
            classify(&raw(payload), &CollectionSpec::LIKES)
        })
    });

    let record = raw(like_payload(7));
    group.bench_function("classify_like", |b| {
        b.iter(|| classify(black_box(&record), &CollectionSpec::LIKES))
    });

    let rejected = raw(json!({"did": "d1", "time_us": 1, "identity": {"handle": "x"}}));
    group.bench_function("classify_rejected", |b| {
        b.iter(|| classify(black_box(&rejected), &CollectionSpec::LIKES))
    });

    group.finish();
}

/// Benchmark the accumulator across batch sizes
fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");

    let events: Vec<_> = (0..1_000)
        .map(|i| classify(&raw(like_payload(i)), &CollectionSpec::LIKES).unwrap())
        .collect();
    group.throughput(Throughput::Elements(events.len() as u64));

    for batch_size in [10, 100, 1_000] {
        group.bench_function(format!("batch_size_{}", batch_size), |b| {
            b.iter_batched(
                || events.clone(),
                |events| {
                    let mut accumulator = BatchAccumulator::new(batch_size);
                    for event in events {
                        black_box(accumulator.push(event));
                    }
                    accumulator.flush()
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

/// Benchmark spool file-name parsing
fn bench_spool_timestamp(c: &mut Criterion) {
    let mut group = c.benchmark_group("spool_timestamp");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_nested_key", |b| {
        b.iter(|| {
            parse_spool_timestamp(
                black_box("feed-indexer/spool/posts_20250101_010000.db.zst"),
                "posts",
            )
        })
    });

    group.finish();
}

criterion_group!(benches, bench_classify, bench_accumulate, bench_spool_timestamp);
criterion_main!(benches);
