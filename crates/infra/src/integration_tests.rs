//! Integration tests for the full reduction pipeline.
//!
//! Tests: MemberEvent → Reducer → AggregationStore → Scheduler → Dispatcher → sink
//!
//! Verifies:
//! - Each correlation id yields at most one composite
//! - Deadlines and dismissals fire through the dispatcher
//! - Store outages are retried and dead-lettered
//! - Groups compacted by retention stay closed to redeliveries

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    use docreduce_core::{
        Clock, CorrelationId, GroupStatus, ManualClock, MemberDisposition, MemberEventId, StaticCounter,
        Strategy,
    };
    use docreduce_events::{CompositeEvent, EventBus, InMemoryEventBus, MemberEvent};

    use crate::reducer::{CompletionOutcome, GroupReaper, Reducer};
    use crate::scheduler::{
        InMemoryScheduler, RetryPolicy, TriggerDispatcher, TriggerQueue, TriggerResult,
    };
    use crate::store::{AggregationStore, InMemoryAggregationStore};

    type TestReducer = Reducer<
        Arc<InMemoryAggregationStore>,
        Arc<InMemoryScheduler>,
        Arc<InMemoryEventBus<CompositeEvent>>,
        ManualClock,
    >;

    struct Pipeline {
        clock: ManualClock,
        store: Arc<InMemoryAggregationStore>,
        scheduler: Arc<InMemoryScheduler>,
        bus: Arc<InMemoryEventBus<CompositeEvent>>,
        reducer: Arc<TestReducer>,
    }

    impl Pipeline {
        fn new(strategy: Strategy) -> Self {
            let clock = ManualClock::new(Utc::now());
            let store = Arc::new(InMemoryAggregationStore::new());
            let scheduler = InMemoryScheduler::arc();
            let bus = Arc::new(InMemoryEventBus::<CompositeEvent>::new());
            let reducer = Arc::new(Reducer::new(
                store.clone(),
                scheduler.clone(),
                bus.clone(),
                clock.clone(),
                strategy,
            ));
            Self {
                clock,
                store,
                scheduler,
                bus,
                reducer,
            }
        }

        fn dispatcher(&self, policy: RetryPolicy) -> TriggerDispatcher<Arc<InMemoryScheduler>, ManualClock> {
            let reducer = self.reducer.clone();
            TriggerDispatcher::new(self.scheduler.clone(), self.clock.clone(), move |trigger| {
                TriggerResult::from(reducer.on_trigger(trigger))
            })
            .with_retry_policy(policy)
        }
    }

    fn event(cid: &str, id: &str) -> MemberEvent {
        MemberEvent::new(
            MemberEventId::new(id).unwrap(),
            CorrelationId::new(cid).unwrap(),
            format!("s3://documents/{cid}/{id}.json"),
            json!({ "page": id }),
        )
    }

    fn cid(s: &str) -> CorrelationId {
        CorrelationId::new(s).unwrap()
    }

    fn member_ids(composite: &CompositeEvent) -> Vec<String> {
        composite
            .members
            .iter()
            .map(|m| m.event_id.as_str().to_string())
            .collect()
    }

    #[test]
    fn static_counter_ignores_redelivered_members() {
        let p = Pipeline::new(Strategy::static_counter(2).unwrap());
        let sub = p.bus.subscribe();

        let first = p.reducer.on_member_event(&event("doc-1", "1")).unwrap();
        let again = p.reducer.on_member_event(&event("doc-1", "1")).unwrap();
        let second = p.reducer.on_member_event(&event("doc-1", "2")).unwrap();

        assert_eq!(first.disposition, MemberDisposition::Added);
        assert_eq!(again.disposition, MemberDisposition::Duplicate);
        assert!(second.composite().is_some());

        let composites = sub.drain();
        assert_eq!(composites.len(), 1);
        assert_eq!(member_ids(&composites[0]), vec!["1", "2"]);
        assert_eq!(composites[0].event_id, CompositeEvent::event_id_for(&cid("doc-1")));
    }

    #[test]
    fn time_window_completes_at_its_deadline() {
        let p = Pipeline::new(
            Strategy::time_window(Duration::from_secs(15), Duration::from_secs(5)).unwrap(),
        );
        let t0 = p.clock.now();
        let dispatcher = p.dispatcher(RetryPolicy::default());

        p.reducer.on_member_event(&event("doc-1", "a")).unwrap();
        let fire_at = p.scheduler.next_fire_at().unwrap();
        assert!(fire_at >= t0 + ChronoDuration::seconds(15));
        assert!(fire_at <= t0 + ChronoDuration::seconds(20));

        p.clock.advance(ChronoDuration::seconds(3));
        p.reducer.on_member_event(&event("doc-1", "b")).unwrap();
        p.reducer.on_member_event(&event("doc-1", "c")).unwrap();
        // Only the first arrival schedules.
        assert_eq!(p.scheduler.pending().len(), 1);

        p.clock.advance(ChronoDuration::seconds(10));
        assert_eq!(dispatcher.dispatch_due(10).unwrap().processed(), 0);
        assert_eq!(p.bus.published_count(), 0);

        p.clock.set(fire_at);
        let report = dispatcher.dispatch_due(10).unwrap();
        assert_eq!(report.delivered, 1);

        let group = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Completed);
        assert!(group.published_at.is_some());
        assert_eq!(p.bus.published_count(), 1);
        assert_eq!(p.scheduler.stats().unwrap().delivered, 1);
    }

    #[test]
    fn arrivals_after_completion_are_dropped() {
        let p = Pipeline::new(
            Strategy::time_window(Duration::from_secs(15), Duration::ZERO).unwrap(),
        );
        let sub = p.bus.subscribe();
        let dispatcher = p.dispatcher(RetryPolicy::default());

        p.reducer.on_member_event(&event("doc-1", "a")).unwrap();
        p.clock.advance(ChronoDuration::seconds(15));
        dispatcher.dispatch_due(10).unwrap();

        let late = p.reducer.on_member_event(&event("doc-1", "late")).unwrap();
        assert_eq!(late.disposition, MemberDisposition::Rejected);
        assert!(late.scheduled_at.is_none());
        assert!(late.completion.is_none());

        let composites = sub.drain();
        assert_eq!(composites.len(), 1);
        assert_eq!(member_ids(&composites[0]), vec!["a"]);
        assert!(p.scheduler.pending().is_empty());
    }

    #[test]
    fn incomplete_static_counter_group_is_dismissed_at_max_wait() {
        let counter = StaticCounter::with_max_wait(3, Duration::from_secs(60)).unwrap();
        let p = Pipeline::new(Strategy::StaticCounter(counter));
        let dispatcher = p.dispatcher(RetryPolicy::default());

        p.reducer.on_member_event(&event("doc-1", "1")).unwrap();
        p.reducer.on_member_event(&event("doc-1", "2")).unwrap();

        p.clock.advance(ChronoDuration::seconds(61));
        let report = dispatcher.dispatch_due(10).unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(p.bus.published_count(), 0);
        let group = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Dismissed);
        assert_eq!(group.member_count(), 2);

        let late = p.reducer.on_member_event(&event("doc-1", "3")).unwrap();
        assert_eq!(late.disposition, MemberDisposition::Rejected);
        assert_eq!(p.bus.published_count(), 0);
    }

    #[test]
    fn completed_static_counter_group_ignores_its_dismissal_trigger() {
        let counter = StaticCounter::with_max_wait(2, Duration::from_secs(60)).unwrap();
        let p = Pipeline::new(Strategy::StaticCounter(counter));
        let dispatcher = p.dispatcher(RetryPolicy::default());

        p.reducer.on_member_event(&event("doc-1", "1")).unwrap();
        p.reducer.on_member_event(&event("doc-1", "2")).unwrap();

        p.clock.advance(ChronoDuration::seconds(61));
        assert_eq!(dispatcher.dispatch_due(10).unwrap().delivered, 1);

        let group = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Completed);
        assert_eq!(p.bus.published_count(), 1);
    }

    #[test]
    fn concurrent_arrivals_publish_at_most_once() {
        let p = Pipeline::new(Strategy::static_counter(4).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let reducer = p.reducer.clone();
                thread::spawn(move || {
                    // Every worker delivers every member, in a rotated order.
                    for i in 0..4 {
                        let id = ((i + worker) % 4).to_string();
                        reducer.on_member_event(&event("doc-1", &id)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(p.bus.published_count(), 1);
        let group = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Completed);
        assert_eq!(group.member_count(), 4);
    }

    #[test]
    fn racing_completion_triggers_have_one_winner() {
        let p = Pipeline::new(
            Strategy::time_window(Duration::from_secs(15), Duration::ZERO).unwrap(),
        );
        for id in ["a", "b", "c"] {
            p.reducer.on_member_event(&event("doc-1", id)).unwrap();
        }

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let reducer = p.reducer.clone();
                thread::spawn(move || reducer.on_completion_trigger(&cid("doc-1")).unwrap())
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let published = outcomes
            .iter()
            .filter(|o| matches!(o, CompletionOutcome::Published(_)))
            .count();
        assert_eq!(published, 1);
        assert_eq!(p.bus.published_count(), 1);
    }

    #[test]
    fn store_outage_is_retried_by_the_dispatcher() {
        let counter = StaticCounter::with_max_wait(3, Duration::from_secs(60)).unwrap();
        let p = Pipeline::new(Strategy::StaticCounter(counter));
        let dispatcher = p.dispatcher(RetryPolicy::fixed(3, Duration::from_secs(5)));

        p.reducer.on_member_event(&event("doc-1", "1")).unwrap();
        p.clock.advance(ChronoDuration::seconds(61));

        p.store.set_unavailable(true);
        let report = dispatcher.dispatch_due(10).unwrap();
        assert_eq!(report.retrying, 1);

        p.store.set_unavailable(false);
        p.clock.advance(ChronoDuration::seconds(5));
        let report = dispatcher.dispatch_due(10).unwrap();
        assert_eq!(report.delivered, 1);

        let group = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Dismissed);
    }

    #[test]
    fn persistent_outage_dead_letters_the_trigger() {
        let p = Pipeline::new(
            Strategy::time_window(Duration::from_secs(15), Duration::ZERO).unwrap(),
        );
        let dispatcher = p.dispatcher(RetryPolicy::fixed(2, Duration::from_secs(1)));

        p.reducer.on_member_event(&event("doc-1", "a")).unwrap();
        p.clock.advance(ChronoDuration::seconds(15));

        p.store.set_unavailable(true);
        assert_eq!(dispatcher.dispatch_due(10).unwrap().retrying, 1);
        p.clock.advance(ChronoDuration::seconds(1));
        assert_eq!(dispatcher.dispatch_due(10).unwrap().dead_lettered, 1);

        let dead = p.scheduler.list_dead_letters(10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].trigger.correlation_id, cid("doc-1"));

        // Operator replays the trigger once the store is back.
        p.store.set_unavailable(false);
        p.scheduler
            .retry_dead_letter(dead[0].trigger.id, p.clock.now())
            .unwrap();
        assert_eq!(dispatcher.dispatch_due(10).unwrap().delivered, 1);
        assert_eq!(p.bus.published_count(), 1);
    }

    #[test]
    fn groups_are_isolated_by_correlation_id() {
        let p = Pipeline::new(Strategy::static_counter(2).unwrap());
        let sub = p.bus.subscribe();

        p.reducer.on_member_event(&event("doc-1", "1")).unwrap();
        p.reducer.on_member_event(&event("doc-2", "1")).unwrap();
        p.reducer.on_member_event(&event("doc-2", "2")).unwrap();

        let composites = sub.drain();
        assert_eq!(composites.len(), 1);
        assert_eq!(composites[0].correlation_id, cid("doc-2"));
        let open = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(open.status, GroupStatus::Open);
    }

    #[test]
    fn redelivery_after_retention_does_not_reopen_the_group() {
        let p = Pipeline::new(Strategy::static_counter(1).unwrap());
        let sub = p.bus.subscribe();
        let reaper = GroupReaper::new(p.store.clone(), p.clock.clone());

        let first = p.reducer.on_member_event(&event("doc-1", "a")).unwrap();
        assert!(first.composite().is_some());

        p.clock.advance(ChronoDuration::hours(49));
        assert_eq!(reaper.sweep().unwrap().purged, 1);

        let redelivered = p.reducer.on_member_event(&event("doc-1", "a")).unwrap();
        let stranger = p.reducer.on_member_event(&event("doc-1", "b")).unwrap();

        for report in [&redelivered, &stranger] {
            assert_eq!(report.disposition, MemberDisposition::Rejected);
            assert!(!report.is_new_group);
            assert!(report.composite().is_none());
            assert!(report.scheduled_at.is_none());
        }
        assert_eq!(sub.drain().len(), 1);
        assert!(p.scheduler.pending().is_empty());
        let tombstone = p.store.load(&cid("doc-1")).unwrap().unwrap();
        assert_eq!(tombstone.status, GroupStatus::Completed);
        assert!(tombstone.is_compacted());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn static_counter_publishes_exactly_the_first_n_distinct_members(
            expected in 1u32..6,
            arrivals in prop::collection::vec(0u32..8, 1..30),
        ) {
            let p = Pipeline::new(Strategy::static_counter(expected).unwrap());
            let sub = p.bus.subscribe();

            let mut seen = Vec::new();
            for id in &arrivals {
                if seen.len() < expected as usize && !seen.contains(id) {
                    seen.push(*id);
                }
                p.reducer.on_member_event(&event("doc", &id.to_string())).unwrap();
            }

            let composites = sub.drain();
            if seen.len() == expected as usize {
                prop_assert_eq!(composites.len(), 1);
                let expected_ids: Vec<String> = seen.iter().map(u32::to_string).collect();
                prop_assert_eq!(member_ids(&composites[0]), expected_ids);
                let distinct: HashSet<_> = composites[0].members.iter().map(|m| &m.event_id).collect();
                prop_assert_eq!(distinct.len(), expected as usize);
            } else {
                prop_assert!(composites.is_empty());
                let group = p.store.load(&cid("doc")).unwrap().unwrap();
                prop_assert_eq!(group.status, GroupStatus::Open);
                prop_assert_eq!(group.member_count(), seen.len());
            }
        }
    }
}
