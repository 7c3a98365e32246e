//! `docreduce-core`: aggregation domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the group state machine, and the reduction strategies.

pub mod clock;
pub mod error;
pub mod group;
pub mod id;
pub mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use group::{Group, GroupSeed, GroupStatus, MemberDisposition, MemberRef};
pub use id::{CorrelationId, MemberEventId};
pub use strategy::{
    ArrivalAction, StaticCounter, Strategy, StrategyKind, TimeWindow, TriggerKind,
};
