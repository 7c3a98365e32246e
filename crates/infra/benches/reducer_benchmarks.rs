use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docreduce_core::{CorrelationId, ManualClock, MemberEventId, Strategy};
use docreduce_events::{CompositeEvent, InMemoryEventBus, MemberEvent};
use docreduce_infra::reducer::Reducer;
use docreduce_infra::scheduler::InMemoryScheduler;
use docreduce_infra::store::InMemoryAggregationStore;
use serde_json::json;

type BenchReducer = Reducer<
    InMemoryAggregationStore,
    InMemoryScheduler,
    Arc<InMemoryEventBus<CompositeEvent>>,
    ManualClock,
>;

fn reducer(strategy: Strategy) -> BenchReducer {
    Reducer::new(
        InMemoryAggregationStore::new(),
        InMemoryScheduler::new(),
        Arc::new(InMemoryEventBus::new()),
        ManualClock::new(Utc::now()),
        strategy,
    )
}

fn member(correlation_id: &str, event_id: usize) -> MemberEvent {
    MemberEvent::new(
        MemberEventId::new(event_id.to_string()).unwrap(),
        CorrelationId::new(correlation_id).unwrap(),
        format!("s3://bench/{correlation_id}/{event_id}"),
        json!({ "page": event_id }),
    )
}

fn bench_member_registration(c: &mut Criterion) {
    let mut group = c.benchmark_group("member_registration");

    for group_size in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*group_size as u64));
        group.bench_with_input(
            BenchmarkId::new("time_window", group_size),
            group_size,
            |b, &size| {
                let reducer = reducer(
                    Strategy::time_window(Duration::from_secs(15), Duration::from_secs(5)).unwrap(),
                );
                let events: Vec<_> = (0..size).map(|i| member("bench", i)).collect();
                let mut round = 0u64;

                b.iter(|| {
                    round += 1;
                    let cid = format!("bench-{round}");
                    for event in &events {
                        let event = MemberEvent::new(
                            event.event_id().clone(),
                            CorrelationId::new(cid.as_str()).unwrap(),
                            event.document_pointer(),
                            event.source_metadata().clone(),
                        );
                        black_box(reducer.on_member_event(&event).unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_static_counter_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("static_counter_completion");

    for expected in [2u32, 16, 128].iter() {
        group.throughput(Throughput::Elements(*expected as u64));
        group.bench_with_input(BenchmarkId::from_parameter(expected), expected, |b, &n| {
            let reducer = reducer(Strategy::static_counter(n).unwrap());
            let mut round = 0u64;

            b.iter(|| {
                round += 1;
                let cid = format!("group-{round}");
                for i in 0..n as usize {
                    black_box(reducer.on_member_event(&member(&cid, i)).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_duplicate_redelivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_redelivery");
    group.sample_size(1000);

    group.bench_function("redelivered_member", |b| {
        let reducer = reducer(
            Strategy::time_window(Duration::from_secs(15), Duration::ZERO).unwrap(),
        );
        let event = member("hot", 0);
        reducer.on_member_event(&event).unwrap();

        b.iter(|| black_box(reducer.on_member_event(&event).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_member_registration,
    bench_static_counter_completion,
    bench_duplicate_redelivery
);
criterion_main!(benches);
