//! Client side of event subscriptions
//!
//! Notifications are only accepted for events whose subscription has been acknowledged by the
//! publisher. When the publisher disappears, acknowledged subscriptions fall back to pending and
//! are requested again as soon as it is reachable.

use super::address::{ClientId, EventAddress, ServiceAddress};
use super::availability::AvailabilityTracker;
use super::bus::{Envelope, MessageKind, ServiceBus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of a subscription as seen by the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscription has been requested, no decision yet
    Pending,
    /// Publisher accepted the subscription
    Acknowledged,
    /// Publisher rejected the subscription
    Rejected,
    /// Subscription has been withdrawn locally
    Unsubscribed,
}

/// Reasons why a subscription did not become active
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The publishing service is not available
    #[error("service {0} is not available")]
    AddressUnavailable(ServiceAddress),
    /// The publisher rejected the subscription
    #[error("subscription to {0} has been rejected")]
    Rejected(EventAddress),
    /// No decision arrived in time, the subscription stays pending
    #[error("no acknowledgement for {event} within {waited:?}")]
    Timeout {
        /// Event that was subscribed to
        event: EventAddress,
        /// Duration that was waited
        waited: Duration,
    },
}

/// Tracks the subscriptions a peer holds on remote events
pub struct EventSubscriber {
    client: ClientId,
    bus: Arc<dyn ServiceBus>,
    availability: Arc<AvailabilityTracker>,
    subscriptions: Mutex<HashMap<EventAddress, Arc<watch::Sender<SubscriptionStatus>>>>,
}

impl EventSubscriber {
    /// Creates a subscriber without any subscriptions
    pub fn new(
        client: ClientId,
        bus: Arc<dyn ServiceBus>,
        availability: Arc<AvailabilityTracker>,
    ) -> Self {
        Self {
            client,
            bus,
            availability,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Requests a subscription and waits for the publisher's decision
    #[instrument(skip(self), fields(%event, client = %self.client))]
    pub async fn subscribe(
        &self,
        event: EventAddress,
        duration: Duration,
    ) -> Result<(), SubscribeError> {
        if !self.availability.is_available(event.service) {
            return Err(SubscribeError::AddressUnavailable(event.service));
        }

        let mut receiver = self.set_status(event, SubscriptionStatus::Pending).subscribe();
        self.send(MessageKind::Subscribe, event).await;

        let decision = timeout(
            duration,
            receiver.wait_for(|status| *status != SubscriptionStatus::Pending),
        )
        .await
        .map(|result| result.map(|status| *status));

        match decision {
            Ok(Ok(SubscriptionStatus::Acknowledged)) => {
                info!("Subscription acknowledged");
                Ok(())
            }
            Ok(_) => Err(SubscribeError::Rejected(event)),
            Err(_) => Err(SubscribeError::Timeout {
                event,
                waited: duration,
            }),
        }
    }

    /// Withdraws a subscription, notifications for the event are dropped from now on
    #[instrument(skip(self), fields(%event, client = %self.client))]
    pub async fn unsubscribe(&self, event: EventAddress) {
        self.set_status(event, SubscriptionStatus::Unsubscribed);
        self.send(MessageKind::Unsubscribe, event).await;
    }

    /// Applies the publisher's decision on a pending subscription
    pub fn on_decision(&self, event: EventAddress, accepted: bool) {
        let sender = match self.lock().get(&event) {
            Some(sender) => sender.clone(),
            None => {
                warn!(%event, "Ignoring decision on unknown subscription");
                return;
            }
        };

        let status = if accepted {
            SubscriptionStatus::Acknowledged
        } else {
            SubscriptionStatus::Rejected
        };

        sender.send_if_modified(|current| {
            if *current == SubscriptionStatus::Unsubscribed || *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Whether notifications on the event may be delivered
    pub fn accepts(&self, event: EventAddress) -> bool {
        self.status(event) == Some(SubscriptionStatus::Acknowledged)
    }

    /// Current status of a subscription, `None` if it has never been requested
    pub fn status(&self, event: EventAddress) -> Option<SubscriptionStatus> {
        self.lock().get(&event).map(|sender| *sender.borrow())
    }

    /// Events which have been subscribed to and not withdrawn since, whatever their decision
    pub fn subscriptions(&self) -> Vec<EventAddress> {
        self.lock()
            .iter()
            .filter(|(_, sender)| *sender.borrow() != SubscriptionStatus::Unsubscribed)
            .map(|(event, _)| *event)
            .collect()
    }

    /// Returns acknowledged subscriptions on a lost service to pending
    pub fn on_service_lost(&self, service: ServiceAddress) {
        for (event, sender) in self.lock().iter() {
            if event.service != service {
                continue;
            }

            sender.send_if_modified(|status| {
                if *status == SubscriptionStatus::Acknowledged {
                    debug!(%event, "Subscription suspended");
                    *status = SubscriptionStatus::Pending;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Requests all pending subscriptions on a service that became reachable again
    pub async fn on_service_found(&self, service: ServiceAddress) {
        let pending: Vec<EventAddress> = self
            .lock()
            .iter()
            .filter(|(event, sender)| {
                event.service == service && *sender.borrow() == SubscriptionStatus::Pending
            })
            .map(|(event, _)| *event)
            .collect();

        for event in pending {
            debug!(%event, "Renewing subscription");
            self.send(MessageKind::Subscribe, event).await;
        }
    }

    async fn send(&self, kind: MessageKind, event: EventAddress) {
        let envelope = Envelope::to_service(kind, event, self.client, Vec::new());
        self.bus.send(envelope).await;
    }

    fn set_status(
        &self,
        event: EventAddress,
        status: SubscriptionStatus,
    ) -> Arc<watch::Sender<SubscriptionStatus>> {
        let sender = self
            .lock()
            .entry(event)
            .or_insert_with(|| Arc::new(watch::channel(status).0))
            .clone();

        sender.send_replace(status);
        sender
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventAddress, Arc<watch::Sender<SubscriptionStatus>>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::bus::{BusEvent, PeerLink};
    use crate::library::communication::implementation::local::LocalServiceBus;
    use pretty_assertions::assert_eq;

    const SERVICE: ServiceAddress = ServiceAddress::new(0x2222, 0x0001);
    const EVENT: EventAddress = SERVICE.event(0x1001, 0x0001);
    const WAIT: Duration = Duration::from_secs(2);

    async fn fixture() -> (Arc<EventSubscriber>, PeerLink) {
        let bus = Arc::new(LocalServiceBus::default());
        let client = bus.attach("client");
        let publisher = bus.attach("publisher");
        bus.offer_service(publisher.client, SERVICE).await;

        let availability = Arc::new(AvailabilityTracker::default());
        availability.mark_available(SERVICE);

        let subscriber = Arc::new(EventSubscriber::new(client.client, bus, availability));
        (subscriber, publisher)
    }

    async fn next_control(publisher: &mut PeerLink) -> MessageKind {
        loop {
            match publisher.inbox.recv().await {
                Some(BusEvent::Message(envelope)) => return envelope.kind,
                Some(_) => continue,
                None => panic!("publisher inbox closed"),
            }
        }
    }

    #[tokio::test]
    async fn activate_on_acknowledgement() {
        let (subscriber, mut publisher) = fixture().await;

        let requester = subscriber.clone();
        let subscription = tokio::spawn(async move { requester.subscribe(EVENT, WAIT).await });

        assert_eq!(next_control(&mut publisher).await, MessageKind::Subscribe);
        assert!(!subscriber.accepts(EVENT));

        subscriber.on_decision(EVENT, true);
        assert_eq!(subscription.await.unwrap(), Ok(()));
        assert!(subscriber.accepts(EVENT));
        assert_eq!(subscriber.subscriptions(), vec![EVENT]);
    }

    #[tokio::test]
    async fn report_rejection() {
        let (subscriber, mut publisher) = fixture().await;

        let requester = subscriber.clone();
        let subscription = tokio::spawn(async move { requester.subscribe(EVENT, WAIT).await });

        next_control(&mut publisher).await;
        subscriber.on_decision(EVENT, false);

        assert_eq!(
            subscription.await.unwrap(),
            Err(SubscribeError::Rejected(EVENT))
        );
        assert_eq!(
            subscriber.status(EVENT),
            Some(SubscriptionStatus::Rejected)
        );
    }

    #[tokio::test]
    async fn require_available_publisher() {
        let bus = Arc::new(LocalServiceBus::default());
        let client = bus.attach("client");
        let subscriber =
            EventSubscriber::new(client.client, bus, Arc::new(AvailabilityTracker::default()));

        assert_eq!(
            subscriber.subscribe(EVENT, WAIT).await,
            Err(SubscribeError::AddressUnavailable(SERVICE))
        );
    }

    #[tokio::test]
    async fn stay_pending_after_timeout() {
        let (subscriber, _publisher) = fixture().await;
        let short = Duration::from_millis(20);

        assert_eq!(
            subscriber.subscribe(EVENT, short).await,
            Err(SubscribeError::Timeout {
                event: EVENT,
                waited: short
            })
        );
        assert_eq!(subscriber.status(EVENT), Some(SubscriptionStatus::Pending));

        subscriber.on_decision(EVENT, true);
        assert!(subscriber.accepts(EVENT));
    }

    #[tokio::test]
    async fn ignore_decisions_after_unsubscribing() {
        let (subscriber, mut publisher) = fixture().await;

        subscriber.unsubscribe(EVENT).await;
        assert_eq!(next_control(&mut publisher).await, MessageKind::Unsubscribe);

        subscriber.on_decision(EVENT, true);
        assert!(!subscriber.accepts(EVENT));
        assert!(subscriber.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn renew_subscription_after_service_returns() {
        let (subscriber, mut publisher) = fixture().await;

        let requester = subscriber.clone();
        let subscription = tokio::spawn(async move { requester.subscribe(EVENT, WAIT).await });
        next_control(&mut publisher).await;
        subscriber.on_decision(EVENT, true);
        subscription.await.unwrap().unwrap();

        subscriber.on_service_lost(SERVICE);
        assert_eq!(subscriber.status(EVENT), Some(SubscriptionStatus::Pending));

        subscriber.on_service_found(SERVICE).await;
        assert_eq!(next_control(&mut publisher).await, MessageKind::Subscribe);
    }
}
