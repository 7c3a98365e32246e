use chrono::{DateTime, Utc};
use tracing::{debug, info};

use docreduce_core::{ArrivalAction, Clock, CorrelationId, MemberDisposition};
use docreduce_events::{CompositeEvent, EventBus, MemberEvent};

use crate::scheduler::{DeferredScheduler, ScheduledTrigger};
use crate::store::AggregationStore;

use super::completion::CompletionOutcome;
use super::{ReduceError, Reducer};

/// What one member event invocation did.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalReport {
    pub correlation_id: CorrelationId,
    pub disposition: MemberDisposition,
    /// The invocation created the group.
    pub is_new_group: bool,
    /// Members in the group after registration.
    pub member_count: usize,
    /// Set when this invocation handed a deferred trigger to the scheduler.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set when this invocation attempted a synchronous completion.
    pub completion: Option<CompletionOutcome>,
}

impl ArrivalReport {
    /// The composite this invocation published, if any.
    pub fn composite(&self) -> Option<&CompositeEvent> {
        match &self.completion {
            Some(
                CompletionOutcome::Published(composite)
                | CompletionOutcome::Republished(composite),
            ) => Some(composite),
            _ => None,
        }
    }
}

impl<S, D, B, C> Reducer<S, D, B, C>
where
    S: AggregationStore,
    D: DeferredScheduler,
    B: EventBus<CompositeEvent>,
    C: Clock,
{
    /// Handle one (possibly redelivered) member event.
    ///
    /// Registers the member, then runs the strategy arrival hook on the
    /// registered group: schedule the deferred trigger if the group has none
    /// yet, or complete synchronously once a Static-Counter threshold is met.
    ///
    /// Re-invocation with the same event id is a no-op beyond the first
    /// registration, except that it repairs an earlier invocation that failed
    /// before scheduling, completing, or publishing the composite.
    pub fn on_member_event(&self, event: &MemberEvent) -> Result<ArrivalReport, ReduceError> {
        event.validate()?;

        let now = self.clock.now();
        let correlation_id = event.correlation_id();
        let seed = self.strategy.seed(now, &mut rand::thread_rng());

        let registration =
            self.store
                .register_member(correlation_id, event.to_member_ref(now), seed)?;
        let group = &registration.group;

        let mut report = ArrivalReport {
            correlation_id: correlation_id.clone(),
            disposition: registration.disposition,
            is_new_group: registration.is_new_group,
            member_count: group.member_count(),
            scheduled_at: None,
            completion: None,
        };

        if registration.is_new_group {
            info!(
                correlation_id = %correlation_id,
                strategy = %group.strategy_kind,
                deadline_at = ?group.deadline_at,
                expected_count = ?group.expected_count,
                "group opened"
            );
        }

        match self.strategy.on_arrival(group, registration.disposition) {
            ArrivalAction::Drop => {
                debug!(
                    correlation_id = %correlation_id,
                    event_id = %event.event_id(),
                    status = %group.status,
                    "member dropped: group already finalized"
                );
            }
            ArrivalAction::None => {
                debug!(
                    correlation_id = %correlation_id,
                    event_id = %event.event_id(),
                    disposition = ?registration.disposition,
                    member_count = report.member_count,
                    "member registered"
                );
            }
            ArrivalAction::Schedule { kind, at } => {
                let trigger = ScheduledTrigger::new(correlation_id.clone(), kind, at, now);
                let trigger_id = self.scheduler.schedule(trigger)?;
                self.store.mark_trigger_scheduled(correlation_id)?;

                debug!(
                    correlation_id = %correlation_id,
                    trigger_id = %trigger_id,
                    kind = %kind,
                    fire_at = %at,
                    "deferred trigger scheduled"
                );
                report.scheduled_at = Some(at);
            }
            ArrivalAction::CompleteNow => {
                report.completion = Some(self.complete(correlation_id, now)?);
            }
        }

        if report.completion.is_none() && group.awaits_publication() {
            report.completion = Some(self.republish(correlation_id)?);
        }

        Ok(report)
    }
}
