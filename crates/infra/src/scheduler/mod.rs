//! Deferred trigger scheduling with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `ScheduledTrigger`: one-time callback for a group (deadline or dismissal)
//! - `DeferredScheduler`: the port the reducer schedules through
//! - `TriggerQueue` / `InMemoryScheduler`: claimable queue of pending triggers
//! - `TriggerDispatcher`: delivers due triggers, retries failures, dead-letters
//!   triggers that exhaust their budget

pub mod dispatcher;
pub mod retry;
pub mod store;
pub mod types;

pub use dispatcher::{
    DispatchReport, Delivery, DispatcherConfig, DispatcherStats, TriggerDispatcher,
    TriggerDispatcherHandle, TriggerHandler,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{DeferredScheduler, InMemoryScheduler, QueueStats, SchedulerError, TriggerQueue};
pub use types::{
    DeadLetterEntry, ScheduledTrigger, TriggerAttemptRecord, TriggerId, TriggerResult,
    TriggerStatus,
};
