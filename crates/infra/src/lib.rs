//! Infrastructure layer: aggregation stores, deferred scheduling, composite
//! sinks, configuration, and the reduction engine that ties them together.

pub mod config;
pub mod event_bus;
pub mod reducer;
pub mod scheduler;
pub mod services;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, ReducerConfig, StrategyConfig};
pub use reducer::{
    ArrivalReport, CompletionOutcome, DismissalOutcome, GroupReaper, ReduceError, Reducer,
    SweepReport, TriggerOutcome,
};
pub use services::{CompositeSink, ReducerServices, ServicesError};
