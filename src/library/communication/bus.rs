//! Boundary towards the service bus providing discovery and delivery
//!
//! The bus moves opaque [`Envelopes`](Envelope) between attached peers and tells them when a
//! service they requested becomes reachable or disappears. It does not correlate requests with
//! responses, gate sends on readiness or track subscriptions. Those concerns are implemented
//! on top of it by the [`Endpoint`](super::Endpoint).

use super::address::{Address, ClientId, ServiceAddress};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Purpose of an [`Envelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Call addressed to the peer offering the method's service
    Request,
    /// Answer routed back to the client that sent the request
    Response,
    /// Broadcast event delivered to one subscriber
    Notification,
    /// Request to join an event's subscriber set
    Subscribe,
    /// Request to leave an event's subscriber set
    Unsubscribe,
    /// Subscription has been accepted
    SubscribeAck,
    /// Subscription has been rejected
    SubscribeNack,
}

/// Discrete message moved by the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Purpose of the message
    pub kind: MessageKind,
    /// Method or event the message refers to
    pub address: Address,
    /// Client which sent the message
    pub source: ClientId,
    /// Explicit recipient, `None` routes to whoever offers the addressed service
    pub destination: Option<ClientId>,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Creates a message that is routed to the offering peer of the addressed service
    pub fn to_service(
        kind: MessageKind,
        address: impl Into<Address>,
        source: ClientId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            address: address.into(),
            source,
            destination: None,
            payload,
        }
    }

    /// Creates a message that is routed to a specific client
    pub fn to_client(
        kind: MessageKind,
        address: impl Into<Address>,
        source: ClientId,
        destination: ClientId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            address: address.into(),
            source,
            destination: Some(destination),
            payload,
        }
    }
}

/// Inbound event delivered to an attached peer
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A message arrived
    Message(Envelope),
    /// A requested service became reachable or unreachable
    Availability {
        /// Affected service
        service: ServiceAddress,
        /// Whether it can be reached now
        available: bool,
    },
    /// Another peer left the bus, announced to every remaining peer
    PeerDetached(ClientId),
}

/// Attachment of a peer to the bus
pub struct PeerLink {
    /// Identifier assigned to the peer
    pub client: ClientId,
    /// Stream of inbound events, closed when the peer is detached
    pub inbox: mpsc::UnboundedReceiver<BusEvent>,
}

/// Addressed message delivery with service discovery
///
/// All sends are fire-and-forget. Undeliverable messages are dropped by the implementation,
/// senders only ever notice through timeouts.
#[async_trait]
pub trait ServiceBus: Send + Sync {
    /// Attaches a new peer and returns its identifier and inbox
    fn attach(&self, name: &str) -> PeerLink;

    /// Detaches a peer, withdrawing all of its offers and closing its inbox
    ///
    /// Remaining peers receive [`BusEvent::PeerDetached`] so that they can forget about it,
    /// regardless of whether the peer cleaned up after itself.
    async fn detach(&self, client: ClientId);

    /// Delivers a message
    async fn send(&self, envelope: Envelope);

    /// Announces that the given client serves a service
    async fn offer_service(&self, client: ClientId, service: ServiceAddress);

    /// Withdraws an announcement
    async fn stop_offer_service(&self, client: ClientId, service: ServiceAddress);

    /// Registers interest in the availability of a service
    async fn request_service(&self, client: ClientId, service: ServiceAddress);

    /// Removes the interest registered with [`request_service`](ServiceBus::request_service)
    async fn release_service(&self, client: ClientId, service: ServiceAddress);
}
