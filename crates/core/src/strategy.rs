//! Reduction strategies (pure decision objects).
//!
//! A strategy answers three questions for the handlers:
//!
//! - **Seeding**: what a new group looks like at first arrival (deadline,
//!   expected count, dismissal timeout).
//! - **Arrival**: after a member registration, should we do nothing, schedule the
//!   deferred trigger, complete right now, or drop the member?
//! - **Trigger**: which terminal transition a deferred trigger attempts.
//!
//! Strategies never perform IO. There are exactly two kinds, so they are a
//! tagged enum rather than a trait.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DomainError, DomainResult};
use crate::group::{Group, GroupSeed, MemberDisposition};

/// Smallest accepted time window.
pub const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Largest accepted time window.
pub const MAX_WINDOW: Duration = Duration::from_secs(48 * 60 * 60);

/// Default upper bound on how long a Static-Counter group may wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(48 * 60 * 60);

/// Default delay after a Time-Window deadline before an untriggered group expires.
pub const DEFAULT_EXPIRY_GRACE: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TimeWindow,
    StaticCounter,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::TimeWindow => "time_window",
            StrategyKind::StaticCounter => "static_counter",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "time_window" => Ok(StrategyKind::TimeWindow),
            "static_counter" => Ok(StrategyKind::StaticCounter),
            other => Err(DomainError::invalid_configuration(format!(
                "unknown strategy kind '{other}'"
            ))),
        }
    }

    /// Deferred trigger used by groups of this kind.
    pub fn trigger_kind(self) -> TriggerKind {
        match self {
            StrategyKind::TimeWindow => TriggerKind::Complete,
            StrategyKind::StaticCounter => TriggerKind::Dismiss,
        }
    }
}

impl core::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal transition attempted by a deferred trigger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Deadline reached: attempt OPEN → COMPLETED.
    Complete,
    /// Maximum wait reached: attempt OPEN → DISMISSED.
    Dismiss,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Complete => "complete",
            TriggerKind::Dismiss => "dismiss",
        }
    }
}

impl core::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collect everything that arrives within a (jittered) window after the first member.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    window: Duration,
    jitter: Duration,
    expiry_grace: Duration,
}

impl TimeWindow {
    /// `window` must lie in [`MIN_WINDOW`], [`MAX_WINDOW`].
    pub fn new(window: Duration, jitter: Duration) -> DomainResult<Self> {
        if window < MIN_WINDOW || window > MAX_WINDOW {
            return Err(DomainError::invalid_configuration(format!(
                "time window must be between {}s and {}s, got {}ms",
                MIN_WINDOW.as_secs(),
                MAX_WINDOW.as_secs(),
                window.as_millis()
            )));
        }
        if jitter > window {
            warn!(
                window_ms = window.as_millis() as u64,
                jitter_ms = jitter.as_millis() as u64,
                "jitter exceeds the time window; deadlines will be heavily skewed"
            );
        }
        Ok(Self {
            window,
            jitter,
            expiry_grace: DEFAULT_EXPIRY_GRACE,
        })
    }

    pub fn with_expiry_grace(mut self, grace: Duration) -> Self {
        self.expiry_grace = grace;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    pub fn expiry_grace(&self) -> Duration {
        self.expiry_grace
    }

    /// `now + window + uniform(0, jitter)`.
    pub fn deadline_from<R: Rng + ?Sized>(&self, now: DateTime<Utc>, rng: &mut R) -> DateTime<Utc> {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        add(now, self.window + extra)
    }
}

/// Complete once a fixed number of distinct members has arrived.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StaticCounter {
    expected_count: u32,
    max_wait: Duration,
}

impl StaticCounter {
    pub fn new(expected_count: u32) -> DomainResult<Self> {
        Self::with_max_wait(expected_count, DEFAULT_MAX_WAIT)
    }

    pub fn with_max_wait(expected_count: u32, max_wait: Duration) -> DomainResult<Self> {
        if expected_count < 1 {
            return Err(DomainError::invalid_configuration(
                "expected count must be at least 1",
            ));
        }
        if max_wait.is_zero() {
            return Err(DomainError::invalid_configuration(
                "max wait must be greater than zero",
            ));
        }
        Ok(Self {
            expected_count,
            max_wait,
        })
    }

    pub fn expected_count(&self) -> u32 {
        self.expected_count
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

/// Configured reduction strategy for one pipeline step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    TimeWindow(TimeWindow),
    StaticCounter(StaticCounter),
}

/// Follow-up chosen by the strategy after a registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrivalAction {
    /// Member registered (or redelivered); nothing else to do.
    None,
    /// Hand a deferred trigger to the scheduler.
    Schedule { kind: TriggerKind, at: DateTime<Utc> },
    /// Target cardinality observed: attempt completion synchronously.
    CompleteNow,
    /// Group already terminal: the member was dropped.
    Drop,
}

impl Strategy {
    pub fn time_window(window: Duration, jitter: Duration) -> DomainResult<Self> {
        TimeWindow::new(window, jitter).map(Strategy::TimeWindow)
    }

    pub fn static_counter(expected_count: u32) -> DomainResult<Self> {
        StaticCounter::new(expected_count).map(Strategy::StaticCounter)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::TimeWindow(_) => StrategyKind::TimeWindow,
            Strategy::StaticCounter(_) => StrategyKind::StaticCounter,
        }
    }

    /// Parameters for a group created by an arrival at `now`.
    pub fn seed<R: Rng + ?Sized>(&self, now: DateTime<Utc>, rng: &mut R) -> GroupSeed {
        match self {
            Strategy::TimeWindow(tw) => {
                let deadline = tw.deadline_from(now, rng);
                GroupSeed {
                    strategy_kind: StrategyKind::TimeWindow,
                    expected_count: None,
                    deadline_at: Some(deadline),
                    dismiss_after: add(deadline, tw.expiry_grace),
                    created_at: now,
                }
            }
            Strategy::StaticCounter(sc) => GroupSeed {
                strategy_kind: StrategyKind::StaticCounter,
                expected_count: Some(sc.expected_count),
                deadline_at: None,
                dismiss_after: add(now, sc.max_wait),
                created_at: now,
            },
        }
    }

    /// Decide the follow-up for a registration outcome.
    ///
    /// Decisions read the group record, not `self`: a group keeps the
    /// parameters it was created with even if the step is reconfigured while
    /// it is open.
    pub fn on_arrival(&self, group: &Group, disposition: MemberDisposition) -> ArrivalAction {
        if disposition == MemberDisposition::Rejected {
            return ArrivalAction::Drop;
        }
        if !group.is_open() {
            return ArrivalAction::None;
        }
        if group.strategy_kind != self.kind() {
            warn!(
                correlation_id = %group.correlation_id,
                group_strategy = %group.strategy_kind,
                configured_strategy = %self.kind(),
                "group was created under a different strategy; following the group record"
            );
        }

        // A redelivered member still re-evaluates the threshold so that a
        // completion interrupted by a failure is retried.
        if group.has_reached_expected_count() {
            return ArrivalAction::CompleteNow;
        }
        if !group.trigger_scheduled {
            return ArrivalAction::Schedule {
                kind: group.trigger_kind(),
                at: group.trigger_at(),
            };
        }
        ArrivalAction::None
    }
}

fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
