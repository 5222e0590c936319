//! Routing benchmarks. The decision path must stay sub-millisecond.
//!
//! - Classification:               P50 <1μs
//! - Breaker admission check:      P50 <1μs
//! - Full route (budget + breaker): P50 <10μs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use llm_channel_router::{ChannelId, Router, TaskKind, TaskSpec};

const CONFIG: &str = r#"
[router]
name = "bench"
telemetry_capacity = 4096

[[channels]]
id = "primary"
cost_per_1k_tokens = 0.000001
soft_cap_usd = 1000000.0
hard_cap_usd = 1000000.0

[[channels]]
id = "secondary"
cost_per_1k_tokens = 0.000001
soft_cap_usd = 1000000.0
hard_cap_usd = 1000000.0

[[channels]]
id = "tertiary"
cost_per_1k_tokens = 0.000001
soft_cap_usd = 1000000.0
hard_cap_usd = 1000000.0

[[categories]]
name = "general"
chain = ["primary", "secondary", "tertiary"]

[[categories]]
name = "coding"
chain = ["secondary", "tertiary"]

[[rules]]
category = "coding"
kinds = ["coding"]

[[rules]]
category = "coding"
kinds = ["reasoning"]
strict_quality = true
max_context_tokens = 64000
"#;

fn router() -> Router {
    Router::from_toml(CONFIG).expect("bench config")
}

// ═══════════════════════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════════════════════

fn bench_classify(c: &mut Criterion) {
    let r = router();
    let task = TaskSpec::new(TaskKind::Reasoning)
        .strict_quality(true)
        .with_context_tokens(2000);

    c.bench_function("classify", |b| {
        b.iter(|| black_box(r.classifier().classify(black_box(&task))))
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Breaker
// ═══════════════════════════════════════════════════════════════════════════

fn bench_breaker_is_open(c: &mut Criterion) {
    let r = router();
    let id = ChannelId::new("primary");

    c.bench_function("breaker_is_open", |b| {
        b.iter(|| black_box(r.breaker().is_open(black_box(&id))))
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Full route
// ═══════════════════════════════════════════════════════════════════════════

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");

    for open in [0usize, 1, 2] {
        let r = router();
        for id in ["primary", "secondary"].iter().take(open) {
            r.breaker().trip(&ChannelId::new(*id));
        }
        let task = TaskSpec::new(TaskKind::Generation).with_context_tokens(1000);

        group.bench_with_input(BenchmarkId::new("open_channels", open), &task, |b, task| {
            b.iter(|| black_box(r.route(black_box(task))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_breaker_is_open, bench_route);
criterion_main!(benches);
