//! Trigger queue: the deferred-scheduling port and its in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::{DeadLetterEntry, ScheduledTrigger, TriggerId, TriggerStatus};

/// Scheduler error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("trigger not found: {0}")]
    NotFound(TriggerId),
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

impl SchedulerError {
    /// Whether redelivering the triggering message may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SchedulerError::Unavailable(_))
    }
}

/// Deferred, one-time callback delivery (the reducer's outbound port).
///
/// Scheduling is idempotent per `(correlation_id, kind)`: while a trigger for
/// the pair is still outstanding, scheduling another returns the existing id.
pub trait DeferredScheduler: Send + Sync {
    fn schedule(&self, trigger: ScheduledTrigger) -> Result<TriggerId, SchedulerError>;
}

impl<S> DeferredScheduler for Arc<S>
where
    S: DeferredScheduler + ?Sized,
{
    fn schedule(&self, trigger: ScheduledTrigger) -> Result<TriggerId, SchedulerError> {
        (**self).schedule(trigger)
    }
}

/// Dispatcher-side view of the trigger queue.
pub trait TriggerQueue: DeferredScheduler {
    /// Claim the earliest due trigger, marking it running.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTrigger>, SchedulerError>;

    /// Persist a trigger after an attempt. Delivered triggers leave the queue.
    fn update(&self, trigger: &ScheduledTrigger) -> Result<(), SchedulerError>;

    /// Move a trigger to the dead-letter queue.
    fn dead_letter(
        &self,
        trigger: ScheduledTrigger,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, SchedulerError>;

    /// Put a dead-lettered trigger back in the queue, due at `now`.
    fn retry_dead_letter(
        &self,
        id: TriggerId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTrigger, SchedulerError>;

    fn stats(&self) -> Result<QueueStats, SchedulerError>;
}

impl<S> TriggerQueue for Arc<S>
where
    S: TriggerQueue + ?Sized,
{
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTrigger>, SchedulerError> {
        (**self).claim_due(now)
    }

    fn update(&self, trigger: &ScheduledTrigger) -> Result<(), SchedulerError> {
        (**self).update(trigger)
    }

    fn dead_letter(
        &self,
        trigger: ScheduledTrigger,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        (**self).dead_letter(trigger, reason, at)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, SchedulerError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(
        &self,
        id: TriggerId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTrigger, SchedulerError> {
        (**self).retry_dead_letter(id, now)
    }

    fn stats(&self) -> Result<QueueStats, SchedulerError> {
        (**self).stats()
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub delivered: u64,
    pub dead_lettered: usize,
}

/// In-memory trigger queue for tests/dev.
///
/// `set_unavailable(true)` makes `schedule` and `claim_due` fail with
/// [`SchedulerError::Unavailable`].
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    triggers: RwLock<HashMap<TriggerId, ScheduledTrigger>>,
    dead_letters: RwLock<HashMap<TriggerId, DeadLetterEntry>>,
    delivered: RwLock<u64>,
    unavailable: AtomicBool,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Outstanding (not yet delivered or dead-lettered) triggers, earliest first.
    pub fn pending(&self) -> Vec<ScheduledTrigger> {
        let Ok(triggers) = self.triggers.read() else {
            return Vec::new();
        };
        let mut pending: Vec<_> = triggers.values().cloned().collect();
        pending.sort_by_key(|t| (t.fire_at, t.created_at));
        pending
    }

    /// Earliest `fire_at` among outstanding triggers.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.pending().first().map(|t| t.fire_at)
    }

    fn check_available(&self) -> Result<(), SchedulerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable(
                "scheduler marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> SchedulerError {
    SchedulerError::Unavailable("lock poisoned".to_string())
}

impl DeferredScheduler for InMemoryScheduler {
    fn schedule(&self, trigger: ScheduledTrigger) -> Result<TriggerId, SchedulerError> {
        self.check_available()?;
        let mut triggers = self.triggers.write().map_err(poisoned)?;

        if let Some(existing) = triggers.values().find(|t| {
            t.correlation_id == trigger.correlation_id
                && t.kind == trigger.kind
                && !t.status.is_terminal()
        }) {
            debug!(
                correlation_id = %trigger.correlation_id,
                trigger_id = %existing.id,
                "trigger already scheduled"
            );
            return Ok(existing.id);
        }

        let id = trigger.id;
        triggers.insert(id, trigger);
        Ok(id)
    }
}

impl TriggerQueue for InMemoryScheduler {
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTrigger>, SchedulerError> {
        self.check_available()?;
        let mut triggers = self.triggers.write().map_err(poisoned)?;

        let next = triggers
            .values()
            .filter(|t| t.is_due(now))
            .min_by_key(|t| (t.fire_at, t.created_at))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            triggers.get_mut(&id).map(|t| {
                t.mark_running(now);
                t.clone()
            })
        }))
    }

    fn update(&self, trigger: &ScheduledTrigger) -> Result<(), SchedulerError> {
        let mut triggers = self.triggers.write().map_err(poisoned)?;
        if !triggers.contains_key(&trigger.id) {
            return Err(SchedulerError::NotFound(trigger.id));
        }

        if trigger.status == TriggerStatus::Delivered {
            triggers.remove(&trigger.id);
            let mut delivered = self.delivered.write().map_err(poisoned)?;
            *delivered += 1;
        } else {
            triggers.insert(trigger.id, trigger.clone());
        }
        Ok(())
    }

    fn dead_letter(
        &self,
        trigger: ScheduledTrigger,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut triggers = self.triggers.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        triggers.remove(&trigger.id);
        dls.insert(trigger.id, DeadLetterEntry::new(trigger, reason, at));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, SchedulerError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(
        &self,
        id: TriggerId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTrigger, SchedulerError> {
        let mut triggers = self.triggers.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        let entry = dls.remove(&id).ok_or(SchedulerError::NotFound(id))?;

        let mut trigger = entry.trigger;
        trigger.status = TriggerStatus::Pending;
        trigger.attempt = 0;
        trigger.fire_at = now;
        trigger.updated_at = now;
        trigger.history.clear();

        triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    fn stats(&self) -> Result<QueueStats, SchedulerError> {
        let triggers = self.triggers.read().map_err(poisoned)?;
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let delivered = self.delivered.read().map_err(poisoned)?;

        let mut stats = QueueStats {
            delivered: *delivered,
            dead_lettered: dls.len(),
            ..Default::default()
        };
        for trigger in triggers.values() {
            match &trigger.status {
                TriggerStatus::Pending => stats.pending += 1,
                TriggerStatus::Running => stats.running += 1,
                TriggerStatus::Failed { .. } => stats.failed += 1,
                TriggerStatus::Delivered | TriggerStatus::DeadLettered { .. } => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use docreduce_core::{CorrelationId, TriggerKind};

    fn trigger(cid: &str, kind: TriggerKind, fire_at: DateTime<Utc>) -> ScheduledTrigger {
        ScheduledTrigger::new(CorrelationId::new(cid).unwrap(), kind, fire_at, fire_at)
    }

    #[test]
    fn scheduling_is_idempotent_per_group_and_kind() {
        let scheduler = InMemoryScheduler::new();
        let now = Utc::now();

        let first = scheduler.schedule(trigger("c", TriggerKind::Complete, now)).unwrap();
        let again = scheduler.schedule(trigger("c", TriggerKind::Complete, now)).unwrap();
        let other = scheduler.schedule(trigger("c", TriggerKind::Dismiss, now)).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(scheduler.pending().len(), 2);
    }

    #[test]
    fn claims_only_due_triggers_in_fire_order() {
        let scheduler = InMemoryScheduler::new();
        let now = Utc::now();
        scheduler.schedule(trigger("late", TriggerKind::Complete, now + Duration::seconds(5))).unwrap();
        scheduler.schedule(trigger("early", TriggerKind::Complete, now + Duration::seconds(1))).unwrap();

        assert!(scheduler.claim_due(now).unwrap().is_none());

        let claimed = scheduler.claim_due(now + Duration::seconds(10)).unwrap().unwrap();
        assert_eq!(claimed.correlation_id.as_str(), "early");
        assert_eq!(claimed.status, TriggerStatus::Running);
        assert_eq!(claimed.attempt, 1);
    }

    #[test]
    fn delivered_triggers_leave_the_queue() {
        let scheduler = InMemoryScheduler::new();
        let now = Utc::now();
        scheduler.schedule(trigger("c", TriggerKind::Complete, now)).unwrap();

        let mut claimed = scheduler.claim_due(now).unwrap().unwrap();
        claimed.mark_delivered(now, now);
        scheduler.update(&claimed).unwrap();

        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.pending + stats.running, 0);
        // A new trigger for the group can be scheduled again.
        let id = scheduler.schedule(trigger("c", TriggerKind::Complete, now)).unwrap();
        assert_ne!(id, claimed.id);
    }

    #[test]
    fn dead_letters_can_be_retried() {
        let scheduler = InMemoryScheduler::new();
        let now = Utc::now();
        scheduler.schedule(trigger("c", TriggerKind::Dismiss, now)).unwrap();

        let claimed = scheduler.claim_due(now).unwrap().unwrap();
        scheduler.dead_letter(claimed.clone(), "boom".to_string(), now).unwrap();

        assert!(scheduler.claim_due(now).unwrap().is_none());
        assert_eq!(scheduler.list_dead_letters(10).unwrap().len(), 1);

        let retried = scheduler.retry_dead_letter(claimed.id, now).unwrap();
        assert_eq!(retried.attempt, 0);
        assert!(scheduler.list_dead_letters(10).unwrap().is_empty());
        assert!(scheduler.claim_due(now).unwrap().is_some());
    }

    #[test]
    fn unavailable_scheduler_rejects_schedule() {
        let scheduler = InMemoryScheduler::new();
        scheduler.set_unavailable(true);

        let err = scheduler
            .schedule(trigger("c", TriggerKind::Complete, Utc::now()))
            .unwrap_err();
        assert!(err.is_retriable());
    }
}
