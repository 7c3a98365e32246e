//! Integration events: inbound member events, the outbound composite event, and
//! the bus that carries composites to downstream stages.

pub mod bus;
pub mod composite;
pub mod in_memory_bus;
pub mod member;

pub use bus::{EventBus, Subscription};
pub use composite::CompositeEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use member::MemberEvent;
