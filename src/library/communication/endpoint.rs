//! Per-peer context object tying the messaging components together

use super::super::{BoxedError, EmptyResult};
use super::address::{
    Address, ClientId, EventAddress, MethodAddress, ServiceAddress, SubscriberId,
};
use super::availability::{AvailabilityTimeout, AvailabilityTracker};
use super::bus::{BusEvent, Envelope, MessageKind, ServiceBus};
use super::codec::{Payload, PayloadShape};
use super::correlator::{CallError, RequestCorrelator};
use super::registry::{AcceptAll, BroadcastReport, SubscriptionPolicy, SubscriptionRegistry};
use super::subscriber::{EventSubscriber, SubscribeError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, instrument, trace, warn, Instrument};

/// Structure which processes requests on a method and may produce a response
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Handler for decoded requests, returning `None` leaves the request unanswered
    async fn process(&self, request: Payload) -> Result<Option<Payload>, BoxedError>;
}

/// Entity which consumes notifications of an event
#[async_trait]
pub trait NotificationConsumer: Send + Sync {
    /// Processes a decoded notification
    async fn consume(&self, event: EventAddress, notification: Payload) -> EmptyResult;
}

struct MethodHandler {
    request_shape: PayloadShape,
    processor: Arc<dyn RequestProcessor>,
}

struct EventHandler {
    shape: PayloadShape,
    consumer: Arc<dyn NotificationConsumer>,
}

type NotificationQueue = mpsc::UnboundedSender<(EventAddress, Vec<u8>)>;

struct Workers {
    delivery: JoinHandle<()>,
    notifications: JoinHandle<()>,
}

struct Inner {
    name: String,
    client: ClientId,
    bus: Arc<dyn ServiceBus>,
    availability: Arc<AvailabilityTracker>,
    correlator: RequestCorrelator,
    registry: SubscriptionRegistry,
    subscriber: EventSubscriber,
    methods: RwLock<HashMap<MethodAddress, MethodHandler>>,
    consumers: RwLock<HashMap<EventAddress, EventHandler>>,
    offered: Mutex<HashSet<ServiceAddress>>,
    requested: Mutex<HashSet<ServiceAddress>>,
    workers: Mutex<Option<Workers>>,
}

/// Attachment of a single peer to the service bus
///
/// Owns the peer's availability view, pending calls and subscriptions in both directions and
/// runs a delivery worker which routes inbound messages to them through a dispatch table keyed
/// by method and event address. Inbound delivery never waits on outgoing calls, so a peer can
/// serve requests while its own calls are pending. Notifications are handed to their consumers
/// in arrival order on a separate task so that slow consumers do not hold up responses.
///
/// Cloning is cheap and yields a handle to the same attachment.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Attaches a new peer accepting every subscriber
    pub fn start(bus: Arc<dyn ServiceBus>, name: &str) -> Self {
        Self::start_with_policy(bus, name, Box::new(AcceptAll))
    }

    /// Attaches a new peer whose published events admit subscribers according to `policy`
    pub fn start_with_policy(
        bus: Arc<dyn ServiceBus>,
        name: &str,
        policy: Box<dyn SubscriptionPolicy>,
    ) -> Self {
        let link = bus.attach(name);
        let client = link.client;
        let availability = Arc::new(AvailabilityTracker::default());

        let inner = Arc::new(Inner {
            name: name.to_owned(),
            client,
            correlator: RequestCorrelator::new(client, bus.clone(), availability.clone()),
            registry: SubscriptionRegistry::new(client, bus.clone(), policy),
            subscriber: EventSubscriber::new(client, bus.clone(), availability.clone()),
            bus,
            availability,
            methods: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            offered: Mutex::new(HashSet::new()),
            requested: Mutex::new(HashSet::new()),
            workers: Mutex::new(None),
        });

        let (queue, notifications) = mpsc::unbounded_channel();
        let span = info_span!("endpoint", peer = name, %client);
        let delivery = tokio::spawn(
            Inner::deliver(inner.clone(), link.inbox, queue).instrument(span.clone()),
        );
        let notifications =
            tokio::spawn(Inner::notify(inner.clone(), notifications).instrument(span));

        *lock(&inner.workers) = Some(Workers {
            delivery,
            notifications,
        });

        debug!(peer = name, %client, "Endpoint started");

        Self { inner }
    }

    /// Identifier assigned by the bus
    pub fn client(&self) -> ClientId {
        self.inner.client
    }

    /// Name the endpoint has been attached with
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Routes requests on a method to a processor, replacing any previous one
    ///
    /// Requests are decoded with `request_shape`. Malformed requests remain unanswered.
    pub fn register_method<P>(
        &self,
        method: MethodAddress,
        request_shape: PayloadShape,
        processor: P,
    ) where
        P: RequestProcessor + 'static,
    {
        let handler = MethodHandler {
            request_shape,
            processor: Arc::new(processor),
        };

        write(&self.inner.methods).insert(method, handler);
    }

    /// Announces that this peer serves a service
    pub async fn offer_service(&self, service: ServiceAddress) {
        lock(&self.inner.offered).insert(service);
        self.inner.bus.offer_service(self.inner.client, service).await;
    }

    /// Withdraws a previous announcement
    pub async fn stop_offer_service(&self, service: ServiceAddress) {
        lock(&self.inner.offered).remove(&service);
        self.inner
            .bus
            .stop_offer_service(self.inner.client, service)
            .await;
    }

    /// Declares an event published by this peer so that subscribers may join it
    pub fn offer_event(&self, event: EventAddress) {
        self.inner.registry.offer(event);
    }

    /// Registers interest in a remote service, its availability is tracked from now on
    pub async fn request_service(&self, service: ServiceAddress) {
        lock(&self.inner.requested).insert(service);
        self.inner
            .bus
            .request_service(self.inner.client, service)
            .await;
    }

    /// Drops the interest in a remote service, it is considered unavailable from now on
    pub async fn release_service(&self, service: ServiceAddress) {
        lock(&self.inner.requested).remove(&service);
        self.inner
            .bus
            .release_service(self.inner.client, service)
            .await;
        self.inner.availability.mark_unavailable(service);
    }

    /// Whether a remote service is currently reachable
    pub fn is_available(&self, service: ServiceAddress) -> bool {
        self.inner.availability.is_available(service)
    }

    /// Waits until a requested service is reachable
    pub async fn await_available(
        &self,
        service: ServiceAddress,
        duration: Duration,
    ) -> Result<(), AvailabilityTimeout> {
        self.inner
            .availability
            .await_available(service, duration)
            .await
    }

    /// Calls a remote method, see [`RequestCorrelator::call`]
    pub async fn call(
        &self,
        target: MethodAddress,
        request: &Payload,
        response_shape: PayloadShape,
        duration: Duration,
    ) -> Result<Payload, CallError> {
        self.inner
            .correlator
            .call(target, request, response_shape, duration)
            .await
    }

    /// Subscribes to a remote event and routes its notifications to `consumer`
    ///
    /// Notifications are decoded with `shape` and only delivered once the publisher
    /// acknowledged the subscription. The consumer is kept after a timeout since a late
    /// acknowledgement still activates the subscription.
    pub async fn subscribe<C>(
        &self,
        event: EventAddress,
        shape: PayloadShape,
        consumer: C,
        duration: Duration,
    ) -> Result<(), SubscribeError>
    where
        C: NotificationConsumer + 'static,
    {
        let handler = EventHandler {
            shape,
            consumer: Arc::new(consumer),
        };

        write(&self.inner.consumers).insert(event, handler);
        let outcome = self.inner.subscriber.subscribe(event, duration).await;

        match outcome {
            Ok(()) | Err(SubscribeError::Timeout { .. }) => {}
            Err(_) => {
                write(&self.inner.consumers).remove(&event);
            }
        }

        outcome
    }

    /// Leaves a remote event, pending notifications are dropped
    pub async fn unsubscribe(&self, event: EventAddress) {
        self.inner.subscriber.unsubscribe(event).await;
        write(&self.inner.consumers).remove(&event);
    }

    /// Sends a notification to all current subscribers of an event
    pub async fn broadcast(&self, event: EventAddress, payload: &Payload) -> BroadcastReport {
        self.inner.registry.broadcast(event, payload).await
    }

    /// Current subscribers of an event published by this peer
    pub fn subscribers(&self, event: EventAddress) -> Vec<SubscriberId> {
        self.inner.registry.subscribers(event)
    }

    /// Detaches from the bus and waits for the workers to finish
    ///
    /// Waiting calls fail with [`CallError::Disconnected`], held subscriptions are withdrawn and
    /// requested services released. Further shutdowns of clones of this endpoint return
    /// immediately.
    #[instrument(skip(self), fields(peer = %self.inner.name))]
    pub async fn shutdown(&self) {
        let workers = match lock(&self.inner.workers).take() {
            Some(workers) => workers,
            None => return,
        };

        self.inner.correlator.cancel_all();

        for event in self.inner.subscriber.subscriptions() {
            self.inner.subscriber.unsubscribe(event).await;
        }

        let offered: Vec<ServiceAddress> = lock(&self.inner.offered).drain().collect();
        for service in offered {
            self.inner
                .bus
                .stop_offer_service(self.inner.client, service)
                .await;
        }

        let requested: Vec<ServiceAddress> = lock(&self.inner.requested).drain().collect();
        for service in requested {
            self.inner
                .bus
                .release_service(self.inner.client, service)
                .await;
        }

        self.inner.bus.detach(self.inner.client).await;

        // Notifications drain once the delivery worker has dropped the queue
        for (worker, handle) in [
            ("delivery", workers.delivery),
            ("notifications", workers.notifications),
        ] {
            if let Err(e) = handle.await {
                error!(worker, error = %e, "Worker terminated abnormally");
            }
        }

        // Handlers may hold clones of this endpoint
        write(&self.inner.methods).clear();
        write(&self.inner.consumers).clear();

        debug!("Endpoint stopped");
    }
}

impl Inner {
    async fn deliver(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<BusEvent>,
        notifications: NotificationQueue,
    ) {
        while let Some(event) = inbox.recv().await {
            match event {
                BusEvent::Availability {
                    service,
                    available: true,
                } => {
                    self.availability.mark_available(service);
                    self.subscriber.on_service_found(service).await;
                }
                BusEvent::Availability {
                    service,
                    available: false,
                } => {
                    self.availability.mark_unavailable(service);
                    self.subscriber.on_service_lost(service);
                }
                BusEvent::PeerDetached(peer) => {
                    self.registry.remove_subscriber(peer);
                }
                BusEvent::Message(envelope) => self.dispatch(envelope, &notifications).await,
            }
        }

        trace!("Inbox closed");
    }

    async fn notify(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<(EventAddress, Vec<u8>)>,
    ) {
        while let Some((event, payload)) = queue.recv().await {
            self.consume(event, &payload).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope, notifications: &NotificationQueue) {
        let Envelope {
            kind,
            address,
            source,
            payload,
            ..
        } = envelope;

        match (kind, address) {
            (MessageKind::Request, Address::Method(method)) => {
                // Processors may take their time, the worker has to stay responsive
                let inner = self.clone();
                tokio::spawn(
                    async move { inner.process(method, source, payload).await }.in_current_span(),
                );
            }
            (MessageKind::Response, Address::Method(method)) => {
                self.correlator.on_response(method, &payload);
            }
            (MessageKind::Notification, Address::Event(event)) => {
                notifications.send((event, payload)).ok();
            }
            (MessageKind::Subscribe, Address::Event(event))
            | (MessageKind::Unsubscribe, Address::Event(event)) => {
                let subscribe = kind == MessageKind::Subscribe;
                let outcome = self.registry.handle_request(source, event, subscribe);

                if let Err(e) = &outcome {
                    debug!(subscriber = %source, %event, error = %e, "Subscription refused");
                }

                if subscribe {
                    let decision = if outcome.is_ok() {
                        MessageKind::SubscribeAck
                    } else {
                        MessageKind::SubscribeNack
                    };

                    let reply = Envelope::to_client(decision, event, self.client, source, Vec::new());
                    self.bus.send(reply).await;
                }
            }
            (MessageKind::SubscribeAck, Address::Event(event)) => {
                self.subscriber.on_decision(event, true)
            }
            (MessageKind::SubscribeNack, Address::Event(event)) => {
                self.subscriber.on_decision(event, false)
            }
            (kind, address) => {
                warn!(?kind, %address, "Dropping message with mismatched address");
            }
        }
    }

    async fn process(&self, method: MethodAddress, source: ClientId, payload: Vec<u8>) {
        let handler = read(&self.methods)
            .get(&method)
            .map(|handler| (handler.request_shape, handler.processor.clone()));

        let (shape, processor) = match handler {
            Some(handler) => handler,
            None => {
                warn!(%method, "Dropping request for unknown method");
                return;
            }
        };

        let request = match Payload::decode(shape, &payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(%method, error = %e, "Dropping malformed request");
                return;
            }
        };

        trace!(%method, %request, caller = %source, "Processing request");

        match processor.process(request).await {
            Ok(Some(response)) => {
                let envelope = Envelope::to_client(
                    MessageKind::Response,
                    method,
                    self.client,
                    source,
                    response.encode(),
                );
                self.bus.send(envelope).await;
            }
            Ok(None) => trace!(%method, "Request left unanswered"),
            Err(e) => error!(%method, error = %e, "Processing request failed"),
        }
    }

    async fn consume(&self, event: EventAddress, payload: &[u8]) {
        if !self.subscriber.accepts(event) {
            debug!(%event, "Dropping notification for inactive subscription");
            return;
        }

        let handler = read(&self.consumers)
            .get(&event)
            .map(|handler| (handler.shape, handler.consumer.clone()));

        let (shape, consumer) = match handler {
            Some(handler) => handler,
            None => return,
        };

        match Payload::decode(shape, payload) {
            Ok(notification) => {
                if let Err(e) = consumer.consume(event, notification).await {
                    error!(%event, error = %e, "Consuming notification failed");
                }
            }
            Err(e) => warn!(%event, error = %e, "Dropping malformed notification"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
