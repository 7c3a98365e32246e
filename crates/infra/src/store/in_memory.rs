use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use docreduce_core::{CorrelationId, Group, GroupSeed, MemberRef};

use super::query::GroupQuery;
use super::r#trait::{AggregationStore, Registration, StoreError, Transition};

/// In-memory aggregation store.
///
/// Intended for tests/dev. Every operation runs under one write lock, which
/// makes each of them trivially atomic.
///
/// `set_unavailable(true)` makes every operation fail with
/// [`StoreError::Unavailable`], to exercise retry paths.
#[derive(Debug, Default)]
pub struct InMemoryAggregationStore {
    groups: RwLock<HashMap<CorrelationId, Group>>,
    unavailable: AtomicBool,
}

impl InMemoryAggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.groups.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut HashMap<CorrelationId, Group>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_available()?;
        let mut groups = self
            .groups
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        f(&mut groups)
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&HashMap<CorrelationId, Group>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_available()?;
        let groups = self
            .groups
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        f(&groups)
    }

    fn transition(
        &self,
        correlation_id: &CorrelationId,
        apply: impl FnOnce(&mut Group) -> Result<(), docreduce_core::DomainError>,
    ) -> Result<Transition, StoreError> {
        self.write(|groups| {
            let group = groups
                .get_mut(correlation_id)
                .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;

            // A terminal group is a lost race, not an error.
            let won = group.is_open() && apply(group).is_ok();
            Ok(Transition {
                won,
                group: group.clone(),
            })
        })
    }
}

impl AggregationStore for InMemoryAggregationStore {
    fn register_member(
        &self,
        correlation_id: &CorrelationId,
        member: MemberRef,
        seed: GroupSeed,
    ) -> Result<Registration, StoreError> {
        self.write(|groups| {
            let mut is_new_group = false;
            let group = groups.entry(correlation_id.clone()).or_insert_with(|| {
                is_new_group = true;
                Group::open(correlation_id.clone(), seed)
            });

            let disposition = group.append(member);
            Ok(Registration {
                group: group.clone(),
                is_new_group,
                disposition,
            })
        })
    }

    fn try_complete(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        self.transition(correlation_id, |g| g.complete(at))
    }

    fn try_dismiss(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        self.transition(correlation_id, |g| g.dismiss(at))
    }

    fn mark_trigger_scheduled(&self, correlation_id: &CorrelationId) -> Result<bool, StoreError> {
        self.write(|groups| {
            let group = groups
                .get_mut(correlation_id)
                .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;
            Ok(group.mark_trigger_scheduled())
        })
    }

    fn mark_published(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write(|groups| {
            let group = groups
                .get_mut(correlation_id)
                .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;
            group.mark_published(at)?;
            Ok(())
        })
    }

    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<Group>, StoreError> {
        self.read(|groups| Ok(groups.get(correlation_id).cloned()))
    }

    fn list(&self, query: &GroupQuery) -> Result<Vec<Group>, StoreError> {
        self.read(|groups| {
            let mut found: Vec<Group> = groups
                .values()
                .filter(|g| query.matches(g))
                .cloned()
                .collect();
            found.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.correlation_id.cmp(&b.correlation_id))
            });
            found.truncate(query.limit);
            Ok(found)
        })
    }

    fn purge_finalized(
        &self,
        before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.write(|groups| {
            let mut compacted = 0;
            for group in groups.values_mut() {
                if group.compact(before, at) {
                    compacted += 1;
                }
            }
            Ok(compacted)
        })
    }
}
