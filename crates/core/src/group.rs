//! Group state model (the unit of aggregation).
//!
//! A `Group` tracks member references under one correlation id. Its lifecycle
//! is a tiny state machine:
//!
//! ```text
//! OPEN ──try_complete──▶ COMPLETED
//!   └───try_dismiss────▶ DISMISSED
//! ```
//!
//! Both terminal states are immutable. The transition methods here are pure;
//! atomicity is the store's job (the in-memory store calls them under a write
//! lock, the Postgres store mirrors them with conditional updates).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{CorrelationId, MemberEventId};
use crate::strategy::{StrategyKind, TriggerKind};

/// Lifecycle status of a group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Open,
    Completed,
    Dismissed,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GroupStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Open => "open",
            GroupStatus::Completed => "completed",
            GroupStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "open" => Ok(GroupStatus::Open),
            "completed" => Ok(GroupStatus::Completed),
            "dismissed" => Ok(GroupStatus::Dismissed),
            other => Err(DomainError::validation(format!("unknown group status '{other}'"))),
        }
    }
}

impl core::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to one upstream event (never its payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub event_id: MemberEventId,
    /// Informational only; arrival order is best-effort.
    pub arrived_at: DateTime<Utc>,
    /// Small metadata used downstream for ordering/labelling (e.g. page number).
    pub source_metadata: JsonValue,
    /// Opaque reference resolvable by downstream consumers.
    pub document_pointer: String,
}

impl MemberRef {
    pub fn new(
        event_id: MemberEventId,
        arrived_at: DateTime<Utc>,
        source_metadata: JsonValue,
        document_pointer: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            arrived_at,
            source_metadata,
            document_pointer: document_pointer.into(),
        }
    }
}

/// Initial group parameters computed by the strategy at first arrival.
///
/// Only the seed of the first registration for a correlation id is used; later
/// seeds are discarded (first arrival wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSeed {
    pub strategy_kind: StrategyKind,
    pub expected_count: Option<u32>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub dismiss_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// What happened to a member handed to [`Group::append`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberDisposition {
    /// First time this event id was seen; it is now a member.
    Added,
    /// The event id is already a member (redelivery).
    Duplicate,
    /// The group is terminal; the member was dropped.
    Rejected,
}

/// Aggregation record for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub correlation_id: CorrelationId,
    pub strategy_kind: StrategyKind,
    pub status: GroupStatus,
    /// Ordered by arrival, unique by `event_id`.
    pub members: Vec<MemberRef>,
    /// Static-Counter only.
    pub expected_count: Option<u32>,
    /// Time-Window only.
    pub deadline_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub dismiss_after: DateTime<Utc>,
    /// Set once the deferred trigger has been accepted by the scheduler.
    pub trigger_scheduled: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    /// Set when retention dropped the members. The record stays as a
    /// tombstone so redelivered members cannot reopen the correlation id.
    #[serde(default)]
    pub compacted_at: Option<DateTime<Utc>>,
    /// Incremented on every successful mutation.
    pub version: u64,
}

impl Group {
    /// Open a new group from its seed (no members yet).
    pub fn open(correlation_id: CorrelationId, seed: GroupSeed) -> Self {
        Self {
            correlation_id,
            strategy_kind: seed.strategy_kind,
            status: GroupStatus::Open,
            members: Vec::new(),
            expected_count: seed.expected_count,
            deadline_at: seed.deadline_at,
            created_at: seed.created_at,
            dismiss_after: seed.dismiss_after,
            trigger_scheduled: false,
            finalized_at: None,
            published_at: None,
            compacted_at: None,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == GroupStatus::Open
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, event_id: &MemberEventId) -> bool {
        self.members.iter().any(|m| &m.event_id == event_id)
    }

    /// Whether a Static-Counter group has reached its target cardinality.
    ///
    /// Always false for Time-Window groups.
    pub fn has_reached_expected_count(&self) -> bool {
        self.expected_count
            .is_some_and(|expected| self.member_count() >= expected as usize)
    }

    /// Which deferred trigger this group uses.
    pub fn trigger_kind(&self) -> TriggerKind {
        self.strategy_kind.trigger_kind()
    }

    /// When the deferred trigger should fire: the deadline for Time-Window
    /// groups, the dismissal timeout for Static-Counter groups.
    pub fn trigger_at(&self) -> DateTime<Utc> {
        match self.strategy_kind {
            StrategyKind::TimeWindow => self.deadline_at.unwrap_or(self.dismiss_after),
            StrategyKind::StaticCounter => self.dismiss_after,
        }
    }

    /// Register a member, de-duplicating by event id.
    ///
    /// Duplicates are reported even for terminal groups so a redelivery of an
    /// already included event is recognised as such.
    pub fn append(&mut self, member: MemberRef) -> MemberDisposition {
        if self.contains(&member.event_id) {
            return MemberDisposition::Duplicate;
        }
        if !self.is_open() {
            return MemberDisposition::Rejected;
        }
        self.members.push(member);
        self.version += 1;
        MemberDisposition::Added
    }

    /// OPEN → COMPLETED.
    pub fn complete(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.finalize(GroupStatus::Completed, at)
    }

    /// OPEN → DISMISSED.
    pub fn dismiss(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.finalize(GroupStatus::Dismissed, at)
    }

    /// Flag the deferred trigger as scheduled. Returns `false` if it already was.
    pub fn mark_trigger_scheduled(&mut self) -> bool {
        if self.trigger_scheduled {
            return false;
        }
        self.trigger_scheduled = true;
        self.version += 1;
        true
    }

    pub fn mark_published(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != GroupStatus::Completed {
            return Err(DomainError::invalid_transition(format!(
                "cannot publish group '{}' in status {}",
                self.correlation_id, self.status
            )));
        }
        if self.published_at.is_none() {
            self.published_at = Some(at);
            self.version += 1;
        }
        Ok(())
    }

    /// COMPLETED, but no publication of its composite was recorded.
    pub fn awaits_publication(&self) -> bool {
        self.status == GroupStatus::Completed && self.published_at.is_none()
    }

    /// Whether retention may compact this group: finalized before `before`,
    /// not compacted yet, and not a completed group still waiting for its
    /// composite to be published.
    pub fn is_compactable(&self, before: DateTime<Utc>) -> bool {
        let finalized_before = self.finalized_at.is_some_and(|at| at < before);
        let settled = match self.status {
            GroupStatus::Open => false,
            GroupStatus::Completed => self.published_at.is_some(),
            GroupStatus::Dismissed => true,
        };
        settled && finalized_before && self.compacted_at.is_none()
    }

    /// Drop the members of a compactable group, keeping the terminal record.
    pub fn compact(&mut self, before: DateTime<Utc>, at: DateTime<Utc>) -> bool {
        if !self.is_compactable(before) {
            return false;
        }
        self.members = Vec::new();
        self.compacted_at = Some(at);
        self.version += 1;
        true
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted_at.is_some()
    }

    fn finalize(&mut self, status: GroupStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "group '{}' is already {}",
                self.correlation_id, self.status
            )));
        }
        self.status = status;
        self.finalized_at = Some(at);
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn seed(now: DateTime<Utc>) -> GroupSeed {
        GroupSeed {
            strategy_kind: StrategyKind::StaticCounter,
            expected_count: Some(2),
            deadline_at: None,
            dismiss_after: now + Duration::hours(48),
            created_at: now,
        }
    }

    fn member(id: &str, now: DateTime<Utc>) -> MemberRef {
        MemberRef::new(
            MemberEventId::new(id).unwrap(),
            now,
            json!({ "page": 1 }),
            format!("s3://bucket/{id}"),
        )
    }

    fn group() -> (Group, DateTime<Utc>) {
        let now = Utc::now();
        (Group::open(CorrelationId::new("chain-1").unwrap(), seed(now)), now)
    }

    #[test]
    fn append_deduplicates_by_event_id() {
        let (mut g, now) = group();

        assert_eq!(g.append(member("a", now)), MemberDisposition::Added);
        assert_eq!(g.append(member("a", now)), MemberDisposition::Duplicate);
        assert_eq!(g.member_count(), 1);
    }

    #[test]
    fn terminal_groups_are_frozen() {
        let (mut g, now) = group();
        g.append(member("a", now));
        g.complete(now).unwrap();

        assert_eq!(g.append(member("b", now)), MemberDisposition::Rejected);
        assert_eq!(g.append(member("a", now)), MemberDisposition::Duplicate);
        assert_eq!(g.member_count(), 1);
    }

    #[test]
    fn only_one_terminal_transition_is_allowed() {
        let (mut g, now) = group();

        g.dismiss(now).unwrap();
        let err = g.complete(now).unwrap_err();

        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(g.status, GroupStatus::Dismissed);
    }

    #[test]
    fn publishing_requires_completion() {
        let (mut g, now) = group();
        assert!(g.mark_published(now).is_err());

        g.complete(now).unwrap();
        g.mark_published(now).unwrap();
        assert_eq!(g.published_at, Some(now));
    }

    #[test]
    fn expected_count_threshold() {
        let (mut g, now) = group();
        g.append(member("a", now));
        assert!(!g.has_reached_expected_count());

        g.append(member("b", now));
        assert!(g.has_reached_expected_count());
    }

    #[test]
    fn trigger_is_scheduled_once() {
        let (mut g, _) = group();

        assert!(g.mark_trigger_scheduled());
        assert!(!g.mark_trigger_scheduled());
    }

    #[test]
    fn compaction_keeps_a_frozen_tombstone() {
        let (mut g, now) = group();
        g.append(member("a", now));
        g.complete(now).unwrap();
        let later = now + Duration::hours(49);

        // Not published yet: retention must keep the members.
        assert!(g.awaits_publication());
        assert!(!g.compact(later, later));

        g.mark_published(now).unwrap();
        assert!(!g.awaits_publication());
        assert!(g.compact(later, later));
        assert!(g.is_compacted());
        assert_eq!(g.member_count(), 0);
        assert!(!g.compact(later, later));

        assert_eq!(g.append(member("a", later)), MemberDisposition::Rejected);
        assert_eq!(g.status, GroupStatus::Completed);
    }

    #[test]
    fn open_groups_are_never_compacted() {
        let (mut g, now) = group();
        g.append(member("a", now));

        assert!(!g.compact(now + Duration::days(30), now));
        assert_eq!(g.member_count(), 1);
    }
}
