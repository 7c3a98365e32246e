use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use docreduce_core::{Clock, CorrelationId, TriggerKind};
use docreduce_events::{CompositeEvent, EventBus};

use crate::scheduler::{DeferredScheduler, ScheduledTrigger};
use crate::store::{AggregationStore, StoreError};

use super::{ReduceError, Reducer};

/// How long a completed group may stay unpublished before [`Reducer::republish`]
/// treats its original publisher as failed.
pub const REPUBLISH_AFTER: Duration = Duration::from_secs(30);

/// Result of a completion attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// This invocation won `try_complete` and published the composite.
    Published(CompositeEvent),
    /// The group was completed earlier but its composite never went out;
    /// this invocation rebuilt and published it.
    Republished(CompositeEvent),
    /// Another invocation finalized (or published) the group first.
    Lost,
    /// No group for the correlation id.
    NotFound,
}

/// Result of a dismissal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissalOutcome {
    /// This invocation won `try_dismiss`; the group held `member_count` members.
    Dismissed { member_count: usize },
    Lost,
    NotFound,
}

/// Result of [`Reducer::on_trigger`].
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completion(CompletionOutcome),
    Dismissal(DismissalOutcome),
}

impl<S, D, B, C> Reducer<S, D, B, C>
where
    S: AggregationStore,
    D: DeferredScheduler,
    B: EventBus<CompositeEvent>,
    C: Clock,
{
    /// Deadline trigger: complete the group and publish its composite, exactly
    /// once across all racing invocations.
    pub fn on_completion_trigger(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<CompletionOutcome, ReduceError> {
        self.complete(correlation_id, self.clock.now())
    }

    /// Dismissal trigger: finalize the group without emitting anything.
    pub fn on_dismissal_trigger(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<DismissalOutcome, ReduceError> {
        let now = self.clock.now();
        let transition = match self.store.try_dismiss(correlation_id, now) {
            Ok(t) => t,
            Err(StoreError::NotFound(_)) => {
                debug!(correlation_id = %correlation_id, "dismissal trigger for unknown group");
                return Ok(DismissalOutcome::NotFound);
            }
            Err(StoreError::ConcurrentModification(msg)) => {
                debug!(correlation_id = %correlation_id, reason = %msg, "lost dismissal race");
                return Ok(DismissalOutcome::Lost);
            }
            Err(e) => return Err(e.into()),
        };

        if !transition.won {
            debug!(
                correlation_id = %correlation_id,
                status = %transition.group.status,
                "dismissal trigger after group was finalized"
            );
            return Ok(DismissalOutcome::Lost);
        }

        let member_count = transition.group.member_count();
        info!(
            correlation_id = %correlation_id,
            strategy = %transition.group.strategy_kind,
            member_count,
            expected_count = ?transition.group.expected_count,
            "group dismissed"
        );
        Ok(DismissalOutcome::Dismissed { member_count })
    }

    /// Route a scheduler trigger by its kind.
    pub fn on_trigger(&self, trigger: &ScheduledTrigger) -> Result<TriggerOutcome, ReduceError> {
        match trigger.kind {
            TriggerKind::Complete => self
                .on_completion_trigger(&trigger.correlation_id)
                .map(TriggerOutcome::Completion),
            TriggerKind::Dismiss => self
                .on_dismissal_trigger(&trigger.correlation_id)
                .map(TriggerOutcome::Dismissal),
        }
    }

    /// Publish the composite of a COMPLETED group whose publication was never
    /// recorded, e.g. because the sink failed right after `try_complete`.
    ///
    /// Groups completed less than [`REPUBLISH_AFTER`] ago are left to the
    /// invocation that completed them. The composite id is derived from the
    /// correlation id, so a republished composite carries the same id.
    pub fn republish(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<CompletionOutcome, ReduceError> {
        let now = self.clock.now();
        let Some(group) = self.store.load(correlation_id)? else {
            return Ok(CompletionOutcome::NotFound);
        };
        if !group.awaits_publication() {
            return Ok(CompletionOutcome::Lost);
        }

        let grace = chrono::Duration::from_std(REPUBLISH_AFTER).unwrap_or(chrono::Duration::MAX);
        let finalized_at = group.finalized_at.unwrap_or(now);
        if now.signed_duration_since(finalized_at) < grace {
            debug!(
                correlation_id = %correlation_id,
                finalized_at = %finalized_at,
                "completed group is recent, leaving publication to its completer"
            );
            return Ok(CompletionOutcome::Lost);
        }

        let composite =
            CompositeEvent::from_completed(&group, finalized_at).map_err(StoreError::from)?;
        let composite = self.publish(composite)?;
        self.record_publication(correlation_id);

        info!(
            correlation_id = %correlation_id,
            composite_id = %composite.event_id,
            member_count = composite.member_count(),
            finalized_at = %finalized_at,
            "composite republished"
        );
        Ok(CompletionOutcome::Republished(composite))
    }

    pub(super) fn complete(
        &self,
        correlation_id: &CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, ReduceError> {
        let transition = match self.store.try_complete(correlation_id, now) {
            Ok(t) => t,
            Err(StoreError::NotFound(_)) => {
                debug!(correlation_id = %correlation_id, "completion for unknown group");
                return Ok(CompletionOutcome::NotFound);
            }
            Err(StoreError::ConcurrentModification(msg)) => {
                debug!(correlation_id = %correlation_id, reason = %msg, "lost completion race");
                return Ok(CompletionOutcome::Lost);
            }
            Err(e) => return Err(e.into()),
        };

        if !transition.won {
            debug!(
                correlation_id = %correlation_id,
                status = %transition.group.status,
                "lost completion race"
            );
            return Ok(CompletionOutcome::Lost);
        }

        let composite =
            CompositeEvent::from_completed(&transition.group, now).map_err(StoreError::from)?;
        let composite = self.publish(composite)?;
        self.record_publication(correlation_id);

        info!(
            correlation_id = %correlation_id,
            composite_id = %composite.event_id,
            strategy = %composite.strategy,
            member_count = composite.member_count(),
            "composite published"
        );
        Ok(CompletionOutcome::Published(composite))
    }

    fn record_publication(&self, correlation_id: &CorrelationId) {
        if let Err(e) = self.store.mark_published(correlation_id, self.clock.now()) {
            // The composite is out; only the bookkeeping is missing.
            warn!(correlation_id = %correlation_id, error = %e, "failed to record publication");
        }
    }
}
