//! Reduction engine: turns member events into at most one composite event per
//! correlation id.
//!
//! ## Flow
//!
//! ```text
//! MemberEvent
//!   ↓
//! on_member_event ── registerMember ──→ strategy arrival hook
//!   │                                     ├─ schedule deferred trigger (first arrival)
//!   │                                     └─ tryComplete (Static-Counter threshold)
//!   ↓
//! ScheduledTrigger (deadline / dismissal)
//!   ↓
//! on_trigger ── tryComplete ──→ CompositeEvent ──→ sink
//!          └── tryDismiss  ──→ (nothing emitted)
//! ```
//!
//! Handlers are stateless: every decision is taken from what a store operation
//! returned, and every terminal transition goes through a conditional store
//! operation with exactly one winner. Losing a race is a no-op, not an error.
//!
//! ## Retries
//!
//! Member events and triggers are delivered at least once. Every handler is
//! safe to re-invoke; errors that a redelivery may fix are flagged by
//! [`ReduceError::is_retriable`].

mod arrival;
mod completion;
pub mod reaper;

use thiserror::Error;
use tracing::error;

use docreduce_core::{Clock, CorrelationId, DomainError, Strategy};
use docreduce_events::{CompositeEvent, EventBus};

use crate::scheduler::{DeferredScheduler, SchedulerError, TriggerResult};
use crate::store::{AggregationStore, StoreError};

pub use arrival::ArrivalReport;
pub use completion::{CompletionOutcome, DismissalOutcome, TriggerOutcome};
pub use reaper::{GroupReaper, SweepReport};

/// Engine error.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The sink rejected the composite of a group this invocation completed.
    /// The group stays COMPLETED without `published_at`.
    #[error("failed to publish composite for '{correlation_id}': {reason}")]
    PublishFailed {
        correlation_id: CorrelationId,
        reason: String,
    },

    #[error("invalid member event: {0}")]
    InvalidEvent(#[from] DomainError),
}

impl ReduceError {
    /// Whether redelivering the triggering message may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ReduceError::Store(StoreError::ConcurrentModification(_)) => true,
            ReduceError::Store(e) => e.is_retriable(),
            ReduceError::Scheduler(e) => e.is_retriable(),
            ReduceError::PublishFailed { .. } | ReduceError::InvalidEvent(_) => false,
        }
    }
}

impl From<Result<TriggerOutcome, ReduceError>> for TriggerResult {
    fn from(value: Result<TriggerOutcome, ReduceError>) -> Self {
        match value {
            Ok(_) => TriggerResult::Delivered,
            Err(e) if e.is_retriable() => TriggerResult::Failure(e.to_string()),
            Err(e) => TriggerResult::Fatal(e.to_string()),
        }
    }
}

/// Reduction engine for one pipeline step.
///
/// ## Generic Parameters
///
/// - `S`: aggregation store (single source of truth for group state)
/// - `D`: deferred scheduler for deadline/dismissal triggers
/// - `B`: composite event sink
/// - `C`: clock
pub struct Reducer<S, D, B, C> {
    store: S,
    scheduler: D,
    sink: B,
    clock: C,
    strategy: Strategy,
}

impl<S, D, B, C> Reducer<S, D, B, C>
where
    S: AggregationStore,
    D: DeferredScheduler,
    B: EventBus<CompositeEvent>,
    C: Clock,
{
    pub fn new(store: S, scheduler: D, sink: B, clock: C, strategy: Strategy) -> Self {
        Self {
            store,
            scheduler,
            sink,
            clock,
            strategy,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &B {
        &self.sink
    }

    fn publish(&self, composite: CompositeEvent) -> Result<CompositeEvent, ReduceError> {
        let correlation_id = composite.correlation_id.clone();
        self.sink.publish(composite.clone()).map_err(|e| {
            error!(
                correlation_id = %correlation_id,
                composite_id = %composite.event_id,
                error = %e,
                "composite publish failed after completion"
            );
            ReduceError::PublishFailed {
                correlation_id,
                reason: e.to_string(),
            }
        })?;
        Ok(composite)
    }
}
