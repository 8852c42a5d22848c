//! Addressing of peers, services, methods and events on the bus

use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Identifier assigned by the bus to every attached peer
///
/// Requests carry the client identifier of their sender so that responses can be routed back,
/// and it doubles as the subscriber identity for event subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClientId(pub u16);

/// Opaque identity of a subscriber as supplied by the bus
pub type SubscriberId = ClientId;

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "client-{:04x}", self.0)
    }
}

/// Logical peer role on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ServiceAddress {
    /// Service identifier
    pub service_id: u16,
    /// Instance of the service
    pub instance_id: u16,
}

impl ServiceAddress {
    /// Creates a new instance from raw parts
    pub const fn new(service_id: u16, instance_id: u16) -> Self {
        Self {
            service_id,
            instance_id,
        }
    }

    /// Method endpoint within this service
    pub const fn method(self, method_id: u16) -> MethodAddress {
        MethodAddress {
            service: self,
            method_id,
        }
    }

    /// Broadcast channel within this service
    pub const fn event(self, event_id: u16, eventgroup_id: u16) -> EventAddress {
        EventAddress {
            service: self,
            event_id,
            eventgroup_id,
        }
    }
}

impl Display for ServiceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}.{:04x}", self.service_id, self.instance_id)
    }
}

/// Request/response endpoint within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MethodAddress {
    /// Service offering the method
    pub service: ServiceAddress,
    /// Method identifier
    pub method_id: u16,
}

impl Display for MethodAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/m{:04x}", self.service, self.method_id)
    }
}

/// Broadcast channel within a service
///
/// Every event belongs to exactly one event group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventAddress {
    /// Service offering the event
    pub service: ServiceAddress,
    /// Event identifier
    pub event_id: u16,
    /// Group the event is subscribed through
    pub eventgroup_id: u16,
}

impl Display for EventAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/e{:04x}@g{:04x}",
            self.service, self.event_id, self.eventgroup_id
        )
    }
}

/// Destination of a message on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Request, response or one-shot call
    Method(MethodAddress),
    /// Broadcast or subscription control
    Event(EventAddress),
}

impl Address {
    /// Service the address belongs to
    pub fn service(&self) -> ServiceAddress {
        match self {
            Address::Method(method) => method.service,
            Address::Event(event) => event.service,
        }
    }
}

impl From<MethodAddress> for Address {
    fn from(method: MethodAddress) -> Self {
        Address::Method(method)
    }
}

impl From<EventAddress> for Address {
    fn from(event: EventAddress) -> Self {
        Address::Event(event)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::Method(method) => method.fmt(f),
            Address::Event(event) => event.fmt(f),
        }
    }
}
