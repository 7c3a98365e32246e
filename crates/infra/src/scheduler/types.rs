//! Deferred trigger records and delivery outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docreduce_core::{CorrelationId, TriggerKind};

use super::retry::RetryPolicy;

/// Unique trigger identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub Uuid);

impl TriggerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trigger delivery status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Waiting for `fire_at`
    Pending,
    /// Claimed by a dispatcher
    Running,
    /// Delivered and handled
    Delivered,
    /// Handler failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries (or failed fatally), moved to the dead-letter queue
    DeadLettered { error: String, attempts: u32 },
}

impl TriggerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TriggerStatus::Delivered | TriggerStatus::DeadLettered { .. }
        )
    }

    /// Whether the trigger is waiting to be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TriggerStatus::Pending | TriggerStatus::Failed { .. })
    }
}

/// A deferred, one-time callback for a group.
///
/// Delivery is at-least-once: handlers must tolerate redundant triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTrigger {
    pub id: TriggerId,
    pub correlation_id: CorrelationId,
    pub kind: TriggerKind,
    /// Earliest delivery time. Moved forward by retry backoff.
    pub fire_at: DateTime<Utc>,
    pub status: TriggerStatus,
    /// Delivery attempts so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<TriggerAttemptRecord>,
}

/// Record of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl ScheduledTrigger {
    pub fn new(
        correlation_id: CorrelationId,
        kind: TriggerKind,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TriggerId::new(),
            correlation_id,
            kind,
            fire_at,
            status: TriggerStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.fire_at <= now
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TriggerStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
    }

    pub fn mark_delivered(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TriggerStatus::Delivered;
        self.updated_at = now;
        self.record(started_at, now, None);
    }

    /// Record a failed attempt and either reschedule it per `policy` or
    /// dead-letter it when the budget is spent.
    pub fn mark_failed(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) {
        self.updated_at = now;
        self.record(started_at, now, Some(error.clone()));

        if policy.should_retry(self.attempt) {
            let delay = policy.delay_for_attempt(self.attempt);
            self.fire_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = TriggerStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.dead_letter(error);
        }
    }

    /// Record a failure that retrying cannot fix.
    pub fn mark_abandoned(&mut self, error: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.updated_at = now;
        self.record(started_at, now, Some(error.clone()));
        self.dead_letter(error);
    }

    fn dead_letter(&mut self, error: String) {
        self.status = TriggerStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    fn record(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(TriggerAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
        });
    }
}

/// What a trigger handler reports back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResult {
    /// Handled (including no-op outcomes such as a lost race)
    Delivered,
    /// Transient failure; retry per policy
    Failure(String),
    /// Retry after an explicit delay (still counts against the budget)
    RetryAfter(Duration, String),
    /// Permanent failure; dead-letter immediately
    Fatal(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub trigger: ScheduledTrigger,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(trigger: ScheduledTrigger, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            dead_lettered_at: at,
            reason,
        }
    }
}
