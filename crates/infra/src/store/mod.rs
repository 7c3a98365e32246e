//! Aggregation store boundary.
//!
//! Holds one group record per correlation id and performs every state change
//! atomically. Handlers never cache group state between calls.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryAggregationStore;
pub use postgres::PostgresAggregationStore;
pub use query::GroupQuery;
pub use r#trait::{AggregationStore, Registration, StoreError, Transition};
