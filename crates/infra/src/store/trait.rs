use chrono::{DateTime, Utc};
use thiserror::Error;

use docreduce_core::{CorrelationId, DomainError, Group, GroupSeed, MemberDisposition, MemberRef};
use std::sync::Arc;

use super::query::GroupQuery;

/// Result of [`AggregationStore::register_member`].
///
/// `group` is the state **after** the registration, read inside the same atomic
/// step, so callers can evaluate completion without a second read.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub group: Group,
    /// This call created the group (first arrival for the correlation id).
    pub is_new_group: bool,
    pub disposition: MemberDisposition,
}

impl Registration {
    pub fn is_duplicate(&self) -> bool {
        self.disposition == MemberDisposition::Duplicate
    }

    pub fn is_rejected(&self) -> bool {
        self.disposition == MemberDisposition::Rejected
    }
}

/// Result of a conditional terminal transition (`try_complete` / `try_dismiss`).
///
/// Exactly one caller per group ever observes `won == true` for a terminal
/// transition. Losers get the group as it is now (already terminal).
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub won: bool,
    pub group: Group,
}

/// Aggregation store operation error.
///
/// ## Error Categories
///
/// - **ConcurrentModification**: lost a race inside the backend; the caller no-ops
///   (the winner carries the operation)
/// - **NotFound**: no group for the correlation id (never created)
/// - **Unavailable**: transient backend failure; surfaced so the triggering
///   message is redelivered
/// - **InvalidTransition**: bookkeeping requested on a group in the wrong state
/// - **Corrupt**: a stored record could not be decoded
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("group not found: {0}")]
    NotFound(CorrelationId),

    #[error("aggregation store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("corrupt group record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether redelivering the triggering message may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition(msg) => StoreError::InvalidTransition(msg),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

/// Durable, concurrently-safe storage of group records.
///
/// The store is the **single source of truth** for aggregation state. Handlers
/// are stateless; every decision they make is based on what a store operation
/// returned, and every mutation goes through one of the conditional operations
/// below.
///
/// ## Atomicity Requirements
///
/// - `register_member`: create-if-absent (first arrival wins), de-duplicate by
///   `event_id`, append if new, all in one step. Concurrent registrations for
///   the same correlation id never lose a member and never count a duplicate.
/// - `try_complete` / `try_dismiss`: compare-and-set on `status`
///   (OPEN → terminal). One winner per group, across both operations.
/// - `mark_trigger_scheduled`: compare-and-set on the scheduling flag.
///
/// ## Implementations
///
/// - `InMemoryAggregationStore`: a `RwLock<HashMap>` (tests/dev)
/// - `PostgresAggregationStore`: row locks + conditional `UPDATE`s
pub trait AggregationStore: Send + Sync {
    /// Register a member under `correlation_id`, creating the group from `seed`
    /// if it does not exist yet.
    ///
    /// Members of terminal groups are rejected (not appended); duplicates are
    /// reported as such regardless of status.
    fn register_member(
        &self,
        correlation_id: &CorrelationId,
        member: MemberRef,
        seed: GroupSeed,
    ) -> Result<Registration, StoreError>;

    /// Atomic OPEN → COMPLETED.
    fn try_complete(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError>;

    /// Atomic OPEN → DISMISSED.
    fn try_dismiss(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError>;

    /// Set the "deferred trigger scheduled" flag. Returns `true` if this call set it.
    fn mark_trigger_scheduled(&self, correlation_id: &CorrelationId) -> Result<bool, StoreError>;

    /// Record that the composite event of a completed group was published.
    fn mark_published(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<Group>, StoreError>;

    /// Read-only scan used by the reaper and for inspection.
    fn list(&self, query: &GroupQuery) -> Result<Vec<Group>, StoreError>;

    /// Compact terminal groups finalized before `before` into tombstones.
    ///
    /// A tombstone keeps the status and timestamps but no members, so later
    /// redeliveries for the correlation id are still rejected. Completed groups
    /// whose composite was never published are left untouched. Returns how many
    /// groups were compacted by this call.
    fn purge_finalized(
        &self,
        before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

impl<S> AggregationStore for Arc<S>
where
    S: AggregationStore + ?Sized,
{
    fn register_member(
        &self,
        correlation_id: &CorrelationId,
        member: MemberRef,
        seed: GroupSeed,
    ) -> Result<Registration, StoreError> {
        (**self).register_member(correlation_id, member, seed)
    }

    fn try_complete(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        (**self).try_complete(correlation_id, at)
    }

    fn try_dismiss(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        (**self).try_dismiss(correlation_id, at)
    }

    fn mark_trigger_scheduled(&self, correlation_id: &CorrelationId) -> Result<bool, StoreError> {
        (**self).mark_trigger_scheduled(correlation_id)
    }

    fn mark_published(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_published(correlation_id, at)
    }

    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<Group>, StoreError> {
        (**self).load(correlation_id)
    }

    fn list(&self, query: &GroupQuery) -> Result<Vec<Group>, StoreError> {
        (**self).list(query)
    }

    fn purge_finalized(
        &self,
        before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        (**self).purge_finalized(before, at)
    }
}
