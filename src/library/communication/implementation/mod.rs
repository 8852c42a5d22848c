//! Implementations of the [`ServiceBus`](super::ServiceBus) boundary

pub mod local;
