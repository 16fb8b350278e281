//! Outbox records and the accounting message bus.
//!
//! The outbox row is the durable hand-off between a document transaction and
//! the accounting consumer; the bus is the transport the relay publishes on.

pub mod bus;
pub mod in_memory_bus;
pub mod message;
pub mod outbox;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use message::AccountingMessage;
pub use outbox::{OutboxAction, OutboxRecord, PublishStatus};
