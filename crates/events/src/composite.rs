//! Composite event: the engine's only output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docreduce_core::{CorrelationId, DomainError, DomainResult, Group, GroupStatus, MemberRef, StrategyKind};

/// Namespace for deriving composite event ids from correlation ids.
const COMPOSITE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_5b7d_4e39_9c0a_d3f4_1b2e_7a65);

/// Single event representing a completed group.
///
/// Members are in arrival order. Ordering by document position (page, chunk,
/// ...) is left to consumers, using each member's `source_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeEvent {
    /// Deterministic per correlation id, so consumers can de-duplicate.
    pub event_id: Uuid,
    pub correlation_id: CorrelationId,
    pub strategy: StrategyKind,
    pub members: Vec<MemberRef>,
    pub produced_at: DateTime<Utc>,
}

impl CompositeEvent {
    /// Stable event type name.
    pub const EVENT_TYPE: &'static str = "reducer.composite.created";

    /// Build the composite from a group that has been completed.
    pub fn from_completed(group: &Group, produced_at: DateTime<Utc>) -> DomainResult<Self> {
        if group.status != GroupStatus::Completed {
            return Err(DomainError::invalid_transition(format!(
                "composite requested for group '{}' in status {}",
                group.correlation_id, group.status
            )));
        }

        Ok(Self {
            event_id: Self::event_id_for(&group.correlation_id),
            correlation_id: group.correlation_id.clone(),
            strategy: group.strategy_kind,
            members: group.members.clone(),
            produced_at,
        })
    }

    pub fn event_id_for(correlation_id: &CorrelationId) -> Uuid {
        Uuid::new_v5(&COMPOSITE_NAMESPACE, correlation_id.as_str().as_bytes())
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use docreduce_core::{GroupSeed, MemberEventId};
    use serde_json::json;

    fn group(now: DateTime<Utc>) -> Group {
        let mut group = Group::open(
            CorrelationId::new("chain-1").unwrap(),
            GroupSeed {
                strategy_kind: StrategyKind::TimeWindow,
                expected_count: None,
                deadline_at: Some(now + Duration::seconds(15)),
                dismiss_after: now + Duration::hours(48),
                created_at: now,
            },
        );
        for id in ["b", "a"] {
            group.append(MemberRef::new(MemberEventId::new(id).unwrap(), now, json!({}), "s3://x"));
        }
        group
    }

    #[test]
    fn only_completed_groups_produce_composites() {
        let now = Utc::now();
        let mut g = group(now);
        assert!(CompositeEvent::from_completed(&g, now).is_err());

        g.complete(now).unwrap();
        let composite = CompositeEvent::from_completed(&g, now).unwrap();

        let ids: Vec<_> = composite.members.iter().map(|m| m.event_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(composite.member_count(), 2);
    }

    #[test]
    fn event_id_is_stable_per_correlation_id() {
        let a = CorrelationId::new("chain-1").unwrap();
        let b = CorrelationId::new("chain-2").unwrap();

        assert_eq!(CompositeEvent::event_id_for(&a), CompositeEvent::event_id_for(&a));
        assert_ne!(CompositeEvent::event_id_for(&a), CompositeEvent::event_id_for(&b));
    }
}
