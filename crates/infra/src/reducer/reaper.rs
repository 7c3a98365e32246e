//! Periodic sweep over stranded and finished groups.
//!
//! Deferred triggers may be lost, so a group can stay OPEN past the point
//! where anything will ever finalize it. The sweep:
//!
//! 1. dismisses OPEN groups whose `dismiss_after` has passed (no composite);
//! 2. reports OPEN Time-Window groups past their deadline (`warn`) and
//!    COMPLETED groups whose composite was never recorded as published;
//! 3. compacts terminal groups finalized more than `retention` ago into
//!    member-less tombstones, which keep rejecting redeliveries.
//!
//! The reaper only needs the store. [`Reducer::repair`] acts on what it
//! reported: it completes the overdue groups (their deadline trigger was
//! lost, e.g. with a non-durable scheduler across a restart) and republishes
//! the unpublished composites.
//!
//! The host decides how often to sweep.

use std::time::Duration;

use tracing::{debug, info, warn};

use docreduce_core::{Clock, CorrelationId};
use docreduce_events::{CompositeEvent, EventBus};

use crate::scheduler::DeferredScheduler;
use crate::store::{AggregationStore, GroupQuery, StoreError};

use super::{CompletionOutcome, ReduceError, Reducer};

/// Default retention of finalized groups.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(48 * 60 * 60);

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired groups this sweep dismissed.
    pub dismissed: Vec<CorrelationId>,
    /// OPEN Time-Window groups whose deadline passed without completion.
    pub overdue: Vec<CorrelationId>,
    /// COMPLETED groups without a recorded publication.
    pub unpublished: Vec<CorrelationId>,
    /// Finalized groups compacted into tombstones.
    pub purged: usize,
    /// Overdue groups completed by [`Reducer::repair`].
    pub completed: Vec<CorrelationId>,
    /// Composites republished by [`Reducer::repair`].
    pub republished: Vec<CorrelationId>,
}

pub struct GroupReaper<S, C> {
    store: S,
    clock: C,
    retention: Duration,
    batch_size: usize,
}

impl<S, C> GroupReaper<S, C>
where
    S: AggregationStore,
    C: Clock,
{
    pub fn new(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
            retention: DEFAULT_RETENTION,
            batch_size: crate::store::query::DEFAULT_LIMIT,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn sweep(&self) -> Result<SweepReport, ReduceError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for group in self
            .store
            .list(&GroupQuery::expired(now).limit(self.batch_size))?
        {
            let transition = match self.store.try_dismiss(&group.correlation_id, now) {
                Ok(t) => t,
                Err(StoreError::NotFound(_)) | Err(StoreError::ConcurrentModification(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if transition.won {
                info!(
                    correlation_id = %group.correlation_id,
                    strategy = %group.strategy_kind,
                    member_count = transition.group.member_count(),
                    dismiss_after = %group.dismiss_after,
                    "expired group dismissed"
                );
                report.dismissed.push(group.correlation_id);
            }
        }

        for group in self
            .store
            .list(&GroupQuery::overdue(now).limit(self.batch_size))?
        {
            warn!(
                correlation_id = %group.correlation_id,
                deadline_at = ?group.deadline_at,
                member_count = group.member_count(),
                trigger_scheduled = group.trigger_scheduled,
                "group is past its deadline but still open"
            );
            report.overdue.push(group.correlation_id);
        }

        for group in self
            .store
            .list(&GroupQuery::unpublished().limit(self.batch_size))?
        {
            warn!(
                correlation_id = %group.correlation_id,
                finalized_at = ?group.finalized_at,
                "completed group has no recorded publication"
            );
            report.unpublished.push(group.correlation_id);
        }

        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        if let Some(cutoff) = now.checked_sub_signed(retention) {
            report.purged = self.store.purge_finalized(cutoff, now)?;
        }

        debug!(
            dismissed = report.dismissed.len(),
            overdue = report.overdue.len(),
            unpublished = report.unpublished.len(),
            purged = report.purged,
            "sweep finished"
        );
        Ok(report)
    }
}

impl<S, D, B, C> Reducer<S, D, B, C>
where
    S: AggregationStore,
    D: DeferredScheduler,
    B: EventBus<CompositeEvent>,
    C: Clock,
{
    /// Act on a sweep: complete overdue groups and republish unpublished
    /// composites. A failing sink leaves the group for the next sweep.
    pub fn repair(&self, report: &mut SweepReport) -> Result<(), ReduceError> {
        for correlation_id in &report.overdue {
            match self.on_completion_trigger(correlation_id) {
                Ok(CompletionOutcome::Published(_)) => report.completed.push(correlation_id.clone()),
                Ok(_) => {}
                Err(e @ ReduceError::PublishFailed { .. }) => {
                    warn!(correlation_id = %correlation_id, error = %e, "overdue completion not published");
                }
                Err(e) => return Err(e),
            }
        }

        for correlation_id in &report.unpublished {
            match self.republish(correlation_id) {
                Ok(CompletionOutcome::Republished(_)) => {
                    report.republished.push(correlation_id.clone())
                }
                Ok(_) => {}
                Err(e @ ReduceError::PublishFailed { .. }) => {
                    warn!(correlation_id = %correlation_id, error = %e, "republish failed");
                }
                Err(e) => return Err(e),
            }
        }

        if !report.completed.is_empty() || !report.republished.is_empty() {
            info!(
                completed = report.completed.len(),
                republished = report.republished.len(),
                "sweep repairs applied"
            );
        }
        Ok(())
    }
}
