//! Service oriented messaging between independently started peers
//!
//! The underlying [`ServiceBus`] only provides discovery and addressed delivery. Everything a
//! peer needs on top of that is implemented in this module:
//!
//! 1. Readiness gating through the [`AvailabilityTracker`], nothing is sent to a service that
//!    has not been discovered.
//! 2. Request and response via the [`RequestCorrelator`] which resolves each call to exactly
//!    one response or a timeout.
//! 3. Publish and subscribe, split into the server side [`SubscriptionRegistry`] and the client
//!    side [`EventSubscriber`].
//!
//! Payloads travel untagged, the [`codec`] decodes them with the shape expected on the address
//! they arrived on. The [`Endpoint`] ties all of the above together for a single peer and runs
//! the task that delivers inbound messages to them.

mod address;
mod availability;
mod bus;
mod correlator;
mod endpoint;
mod registry;
mod subscriber;

pub mod codec;
pub mod implementation;

pub use address::{Address, ClientId, EventAddress, MethodAddress, ServiceAddress, SubscriberId};
pub use availability::{AvailabilityState, AvailabilityTimeout, AvailabilityTracker};
pub use bus::{BusEvent, Envelope, MessageKind, PeerLink, ServiceBus};
pub use codec::{MalformedPayload, Payload, PayloadShape};
pub use correlator::{CallError, CallState, RequestCorrelator};
pub use endpoint::{Endpoint, NotificationConsumer, RequestProcessor};
pub use registry::{
    AcceptAll, BroadcastReport, CapacityLimit, MembershipChange, SubscriptionDecision,
    SubscriptionError, SubscriptionPolicy, SubscriptionRegistry,
};
pub use subscriber::{EventSubscriber, SubscribeError, SubscriptionStatus};
