//! Benchmarks for idea aggregation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use retro_board::{aggregate, grouping_key, IdeaAggregator, SessionState};
use retro_core::{Category, Note, Timestamp};

fn sample_notes(count: usize, distinct: usize) -> Vec<Note> {
    let mut state = SessionState::default();
    let categories = [Category::Good, Category::Neutral, Category::Bad];
    for i in 0..count {
        let content = if i % 2 == 0 {
            format!("Idea number {}", i % distinct)
        } else {
            format!("  IDEA NUMBER {} ", i % distinct)
        };
        let _ = state.submit(
            &content,
            categories[i % categories.len()],
            &format!("author-{}", i % 17),
            Timestamp::from_millis(i as i64),
        );
    }
    state.notes().to_vec()
}

fn bench_grouping_key(c: &mut Criterion) {
    c.bench_function("grouping_key", |b| {
        b.iter(|| grouping_key(black_box("   Too Many Meetings This Sprint  ")))
    });
}

fn bench_aggregate_cold(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_cold");
    for size in [10usize, 100, 1000] {
        let notes = sample_notes(size, size / 4 + 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &notes, |b, notes| {
            b.iter(|| black_box(aggregate(black_box(notes), 7)))
        });
    }
    group.finish();
}

fn bench_aggregate_cached(c: &mut Criterion) {
    let notes = sample_notes(1000, 200);
    let mut engine = IdeaAggregator::new(7);
    engine.aggregate(&notes);

    c.bench_function("aggregate_cached_1000", |b| {
        b.iter(|| black_box(engine.aggregate(black_box(&notes))))
    });
}

criterion_group!(
    benches,
    bench_grouping_key,
    bench_aggregate_cold,
    bench_aggregate_cached,
);
criterion_main!(benches);
