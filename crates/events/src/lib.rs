//! Transition events and the pub/sub bus that carries them from the
//! orchestrators to downstream consumers (notification workers).

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{Event, TransitionEvent};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
