//! Server side bookkeeping of event subscribers
//!
//! Subscription control and broadcasts interleave freely, the subscriber set is therefore only
//! touched under its lock and broadcasts operate on a snapshot taken before any send happens.

use super::address::{ClientId, EventAddress, SubscriberId};
use super::bus::{Envelope, MessageKind, ServiceBus};
use super::codec::Payload;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Outcome of a subscription attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDecision {
    /// Subscriber may join the event
    Accept,
    /// Subscriber may not join the event
    Reject,
}

/// Effect of a subscription change on the subscriber set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// Subscriber has been added
    Added,
    /// Subscriber has been removed
    Removed,
    /// Set did not change
    Unchanged,
}

/// Subscription change which may not be applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber has been rejected for the event
    #[error("{subscriber} has been rejected for {event}")]
    Rejected {
        /// Subscriber that attempted to join
        subscriber: SubscriberId,
        /// Event it attempted to join
        event: EventAddress,
    },
    /// The event is not offered by this peer
    #[error("event {0} is not offered")]
    UnknownEvent(EventAddress),
}

/// Decides whether a subscriber may join an event
pub trait SubscriptionPolicy: Send + Sync {
    /// Called for subscribers that are not yet members, `members` is the current set size
    fn decide(
        &self,
        subscriber: SubscriberId,
        event: EventAddress,
        members: usize,
    ) -> SubscriptionDecision;
}

/// Policy accepting every subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SubscriptionPolicy for AcceptAll {
    fn decide(&self, _: SubscriberId, _: EventAddress, _: usize) -> SubscriptionDecision {
        SubscriptionDecision::Accept
    }
}

/// Policy rejecting new subscribers once an event has `max` members
#[derive(Debug, Clone, Copy)]
pub struct CapacityLimit {
    /// Maximum number of members per event
    pub max: usize,
}

impl SubscriptionPolicy for CapacityLimit {
    fn decide(&self, _: SubscriberId, _: EventAddress, members: usize) -> SubscriptionDecision {
        if members < self.max {
            SubscriptionDecision::Accept
        } else {
            SubscriptionDecision::Reject
        }
    }
}

/// Result of a single broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Event that has been broadcast
    pub event: EventAddress,
    /// Number of subscribers a notification has been sent to
    pub delivered: usize,
}

#[derive(Default)]
struct Channel {
    members: BTreeSet<SubscriberId>,
    rejected: HashSet<SubscriberId>,
}

/// Subscriber sets of all events offered by a peer
pub struct SubscriptionRegistry {
    client: ClientId,
    bus: Arc<dyn ServiceBus>,
    policy: Box<dyn SubscriptionPolicy>,
    channels: Mutex<HashMap<EventAddress, Channel>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry broadcasting as `client`
    pub fn new(
        client: ClientId,
        bus: Arc<dyn ServiceBus>,
        policy: Box<dyn SubscriptionPolicy>,
    ) -> Self {
        Self {
            client,
            bus,
            policy,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Declares an event published by this peer, starting with no subscribers
    pub fn offer(&self, event: EventAddress) {
        self.lock().entry(event).or_default();
    }

    /// Evaluates whether a subscriber may join an event
    ///
    /// Current members are always accepted again. A rejection is remembered until a later
    /// attempt of the same subscriber is accepted.
    pub fn on_subscribe_attempt(
        &self,
        subscriber: SubscriberId,
        event: EventAddress,
    ) -> SubscriptionDecision {
        let mut channels = self.lock();

        let channel = match channels.get_mut(&event) {
            Some(channel) => channel,
            None => {
                debug!(%subscriber, %event, "Rejecting subscription to unknown event");
                return SubscriptionDecision::Reject;
            }
        };

        if channel.members.contains(&subscriber) {
            return SubscriptionDecision::Accept;
        }

        let decision = self
            .policy
            .decide(subscriber, event, channel.members.len());

        match decision {
            SubscriptionDecision::Accept => {
                channel.rejected.remove(&subscriber);
            }
            SubscriptionDecision::Reject => {
                info!(%subscriber, %event, "Rejected subscriber");
                channel.rejected.insert(subscriber);
            }
        }

        decision
    }

    /// Adds or removes a subscriber, repeated changes leave the set untouched
    pub fn on_subscription_change(
        &self,
        subscriber: SubscriberId,
        event: EventAddress,
        subscribed: bool,
    ) -> Result<MembershipChange, SubscriptionError> {
        let mut channels = self.lock();
        let channel = channels
            .get_mut(&event)
            .ok_or(SubscriptionError::UnknownEvent(event))?;

        let change = if subscribed {
            if channel.rejected.contains(&subscriber) {
                return Err(SubscriptionError::Rejected { subscriber, event });
            }

            if channel.members.insert(subscriber) {
                MembershipChange::Added
            } else {
                MembershipChange::Unchanged
            }
        } else if channel.members.remove(&subscriber) {
            MembershipChange::Removed
        } else {
            MembershipChange::Unchanged
        };

        if change != MembershipChange::Unchanged {
            debug!(%subscriber, %event, ?change, members = channel.members.len(), "Subscriber set changed");
        }

        Ok(change)
    }

    /// Processes a subscription control message, joining requires the policy's consent
    pub fn handle_request(
        &self,
        subscriber: SubscriberId,
        event: EventAddress,
        subscribe: bool,
    ) -> Result<MembershipChange, SubscriptionError> {
        if subscribe
            && self.on_subscribe_attempt(subscriber, event) == SubscriptionDecision::Reject
        {
            if !self.lock().contains_key(&event) {
                return Err(SubscriptionError::UnknownEvent(event));
            }

            return Err(SubscriptionError::Rejected { subscriber, event });
        }

        self.on_subscription_change(subscriber, event, subscribe)
    }

    /// Forgets a subscriber that left the bus, returning the number of events it was a member of
    ///
    /// Remembered rejections are dropped too since a returning peer gets a fresh identifier.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) -> usize {
        let mut removed = 0;

        for (event, channel) in self.lock().iter_mut() {
            channel.rejected.remove(&subscriber);

            if channel.members.remove(&subscriber) {
                debug!(%subscriber, %event, members = channel.members.len(), "Dropped departed subscriber");
                removed += 1;
            }
        }

        removed
    }

    /// Current members of an event in ascending order
    pub fn subscribers(&self, event: EventAddress) -> Vec<SubscriberId> {
        self.lock()
            .get(&event)
            .map(|channel| channel.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sends a notification to every current member of an event
    ///
    /// Members joining or leaving while the notifications are sent do not affect this
    /// broadcast.
    #[instrument(skip(self, payload), fields(%event))]
    pub async fn broadcast(&self, event: EventAddress, payload: &Payload) -> BroadcastReport {
        let snapshot: Vec<SubscriberId> = match self.lock().get(&event) {
            Some(channel) => channel.members.iter().copied().collect(),
            None => {
                warn!("Broadcasting unoffered event");
                Vec::new()
            }
        };

        let bytes = payload.encode();

        for subscriber in snapshot.iter() {
            trace!(%subscriber, "Notifying subscriber");
            let envelope = Envelope::to_client(
                MessageKind::Notification,
                event,
                self.client,
                *subscriber,
                bytes.clone(),
            );
            self.bus.send(envelope).await;
        }

        debug!(delivered = snapshot.len(), %payload, "Broadcast event");

        BroadcastReport {
            event,
            delivered: snapshot.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventAddress, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::address::ServiceAddress;
    use crate::library::communication::bus::{BusEvent, PeerLink};
    use crate::library::communication::implementation::local::LocalServiceBus;
    use pretty_assertions::assert_eq;

    const EVENT: EventAddress = ServiceAddress::new(0x2222, 0x0001).event(0x1001, 0x0001);
    const OTHER: EventAddress = ServiceAddress::new(0x2222, 0x0001).event(0x1002, 0x0002);

    fn registry(policy: Box<dyn SubscriptionPolicy>) -> (Arc<LocalServiceBus>, SubscriptionRegistry) {
        let bus = Arc::new(LocalServiceBus::default());
        let publisher = bus.attach("publisher");
        let registry = SubscriptionRegistry::new(publisher.client, bus.clone(), policy);
        registry.offer(EVENT);

        (bus, registry)
    }

    fn drain(peer: &mut PeerLink) -> Vec<Envelope> {
        let mut messages = Vec::new();

        while let Ok(event) = peer.inbox.try_recv() {
            if let BusEvent::Message(envelope) = event {
                messages.push(envelope);
            }
        }

        messages
    }

    #[test]
    fn add_and_remove_idempotently() {
        let (_bus, registry) = registry(Box::new(AcceptAll));
        let subscriber = ClientId(7);

        assert_eq!(
            registry.handle_request(subscriber, EVENT, true),
            Ok(MembershipChange::Added)
        );
        assert_eq!(
            registry.handle_request(subscriber, EVENT, true),
            Ok(MembershipChange::Unchanged)
        );
        assert_eq!(registry.subscribers(EVENT), vec![subscriber]);

        assert_eq!(
            registry.handle_request(subscriber, EVENT, false),
            Ok(MembershipChange::Removed)
        );
        assert_eq!(
            registry.handle_request(subscriber, EVENT, false),
            Ok(MembershipChange::Unchanged)
        );
        assert!(registry.subscribers(EVENT).is_empty());
    }

    #[test]
    fn reject_unknown_event() {
        let (_bus, registry) = registry(Box::new(AcceptAll));

        assert_eq!(
            registry.on_subscribe_attempt(ClientId(1), OTHER),
            SubscriptionDecision::Reject
        );
        assert_eq!(
            registry.handle_request(ClientId(1), OTHER, true),
            Err(SubscriptionError::UnknownEvent(OTHER))
        );
    }

    #[test]
    fn remember_rejection_until_accepted() {
        let (_bus, registry) = registry(Box::new(CapacityLimit { max: 1 }));

        assert_eq!(
            registry.handle_request(ClientId(1), EVENT, true),
            Ok(MembershipChange::Added)
        );
        assert_eq!(
            registry.handle_request(ClientId(2), EVENT, true),
            Err(SubscriptionError::Rejected {
                subscriber: ClientId(2),
                event: EVENT
            })
        );
        assert_eq!(
            registry.on_subscription_change(ClientId(2), EVENT, true),
            Err(SubscriptionError::Rejected {
                subscriber: ClientId(2),
                event: EVENT
            })
        );

        // Existing members are accepted again even at capacity
        assert_eq!(
            registry.on_subscribe_attempt(ClientId(1), EVENT),
            SubscriptionDecision::Accept
        );

        registry.handle_request(ClientId(1), EVENT, false).unwrap();
        assert_eq!(
            registry.handle_request(ClientId(2), EVENT, true),
            Ok(MembershipChange::Added)
        );
    }

    #[test]
    fn free_capacity_of_departed_subscribers() {
        let (_bus, registry) = registry(Box::new(CapacityLimit { max: 1 }));

        registry.handle_request(ClientId(1), EVENT, true).unwrap();
        assert!(registry.handle_request(ClientId(2), EVENT, true).is_err());

        assert_eq!(registry.remove_subscriber(ClientId(1)), 1);
        assert_eq!(registry.remove_subscriber(ClientId(1)), 0);
        assert!(registry.subscribers(EVENT).is_empty());

        assert_eq!(
            registry.handle_request(ClientId(3), EVENT, true),
            Ok(MembershipChange::Added)
        );
    }

    #[tokio::test]
    async fn report_zero_deliveries_without_subscribers() {
        let (_bus, registry) = registry(Box::new(AcceptAll));

        assert_eq!(
            registry
                .broadcast(EVENT, &Payload::Text("SPEED_ALERT".into()))
                .await,
            BroadcastReport {
                event: EVENT,
                delivered: 0
            }
        );
    }

    #[tokio::test]
    async fn notify_each_member_once() {
        let (bus, registry) = registry(Box::new(CapacityLimit { max: 2 }));
        let mut first = bus.attach("first");
        let mut second = bus.attach("second");
        let mut rejected = bus.attach("rejected");

        registry.handle_request(first.client, EVENT, true).unwrap();
        registry.handle_request(first.client, EVENT, true).unwrap();
        registry.handle_request(second.client, EVENT, true).unwrap();
        assert!(registry
            .handle_request(rejected.client, EVENT, true)
            .is_err());

        let report = registry
            .broadcast(EVENT, &Payload::Text("SPEED_ALERT".into()))
            .await;
        assert_eq!(report.delivered, 2);

        for peer in [&mut first, &mut second] {
            let messages = drain(peer);
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].kind, MessageKind::Notification);
            assert_eq!(messages[0].payload, b"SPEED_ALERT".to_vec());
        }

        assert!(drain(&mut rejected).is_empty());
    }
}
