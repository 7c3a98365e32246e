//! Read-only group queries (reaper scans, inspection).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docreduce_core::{Group, GroupStatus, StrategyKind};

/// Default page size.
pub const DEFAULT_LIMIT: usize = 100;

/// Hard cap on a single scan.
pub const MAX_LIMIT: usize = 1000;

/// Filter criteria for group scans. All set filters must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupQuery {
    pub status: Option<GroupStatus>,
    pub strategy_kind: Option<StrategyKind>,
    /// Groups whose `dismiss_after` is at or before this instant.
    pub dismiss_after_at_or_before: Option<DateTime<Utc>>,
    /// Groups whose `deadline_at` is at or before this instant.
    pub deadline_at_or_before: Option<DateTime<Utc>>,
    /// Completed groups whose composite has not been published.
    pub unpublished_only: bool,
    pub limit: usize,
}

impl Default for GroupQuery {
    fn default() -> Self {
        Self {
            status: None,
            strategy_kind: None,
            dismiss_after_at_or_before: None,
            deadline_at_or_before: None,
            unpublished_only: false,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl GroupQuery {
    pub fn with_status(status: GroupStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// OPEN groups past their dismissal timeout.
    pub fn expired(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(GroupStatus::Open),
            dismiss_after_at_or_before: Some(now),
            ..Default::default()
        }
    }

    /// OPEN Time-Window groups whose deadline has passed.
    pub fn overdue(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(GroupStatus::Open),
            strategy_kind: Some(StrategyKind::TimeWindow),
            deadline_at_or_before: Some(now),
            ..Default::default()
        }
    }

    /// COMPLETED groups without a published composite.
    pub fn unpublished() -> Self {
        Self {
            status: Some(GroupStatus::Completed),
            unpublished_only: true,
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(MAX_LIMIT);
        self
    }

    pub fn matches(&self, group: &Group) -> bool {
        if self.status.is_some_and(|s| s != group.status) {
            return false;
        }
        if self.strategy_kind.is_some_and(|k| k != group.strategy_kind) {
            return false;
        }
        if let Some(t) = self.dismiss_after_at_or_before {
            if group.dismiss_after > t {
                return false;
            }
        }
        if let Some(t) = self.deadline_at_or_before {
            match group.deadline_at {
                Some(deadline) if deadline <= t => {}
                _ => return false,
            }
        }
        if self.unpublished_only && group.published_at.is_some() {
            return false;
        }
        true
    }
}
