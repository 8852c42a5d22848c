//! Service bus living entirely within the current process

use crate::library::communication::address::{ClientId, ServiceAddress};
use crate::library::communication::bus::{BusEvent, Envelope, PeerLink, ServiceBus};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

/// Timing behaviour of the [`LocalServiceBus`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalBusOptions {
    /// Minimum time between an offer and the availability notification of interested peers
    pub discovery_delay: Duration,
    /// Upper bound of the random delay added on top of `discovery_delay`
    pub discovery_jitter: Duration,
}

impl LocalBusOptions {
    fn sample_delay(&self) -> Duration {
        let jitter = self.discovery_jitter.as_millis() as u64;

        if jitter == 0 {
            return self.discovery_delay;
        }

        let jitter = rand::thread_rng().gen_range(0..=jitter);
        self.discovery_delay + Duration::from_millis(jitter)
    }
}

struct Peer {
    name: String,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct BusState {
    peers: HashMap<ClientId, Peer>,
    offers: HashMap<ServiceAddress, ClientId>,
    interests: HashMap<ServiceAddress, BTreeSet<ClientId>>,
    partitioned: HashSet<ServiceAddress>,
}

impl BusState {
    fn reachable(&self, service: ServiceAddress) -> bool {
        self.offers.contains_key(&service) && !self.partitioned.contains(&service)
    }

    fn notify(&self, service: ServiceAddress, available: bool, recipients: &[ClientId]) {
        for client in recipients {
            if let Some(peer) = self.peers.get(client) {
                trace!(peer = %peer.name, %service, available, "Announcing availability");
                peer.tx
                    .send(BusEvent::Availability { service, available })
                    .ok();
            }
        }
    }

    fn interested(&self, service: ServiceAddress) -> Vec<ClientId> {
        self.interests
            .get(&service)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// In-process service bus connecting peers through unbounded channels
///
/// Availability announcements can be delayed to mimic discovery latency on a real network and
/// individual services can be cut off to simulate a partition. Messages are delivered in the
/// order they were sent.
pub struct LocalServiceBus {
    options: LocalBusOptions,
    next_client: AtomicU16,
    state: Arc<Mutex<BusState>>,
}

impl Default for LocalServiceBus {
    fn default() -> Self {
        Self::new(LocalBusOptions::default())
    }
}

impl LocalServiceBus {
    /// Creates a bus without any peers
    pub fn new(options: LocalBusOptions) -> Self {
        Self {
            options,
            next_client: AtomicU16::new(1),
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Cuts off a service: messages to and from it are dropped and interested peers see it
    /// becoming unavailable
    pub fn partition(&self, service: ServiceAddress) {
        let mut state = self.lock();

        if state.partitioned.insert(service) {
            info!(%service, "Partitioned service");
            let recipients = state.interested(service);
            state.notify(service, false, &recipients);
        }
    }

    /// Reconnects a previously partitioned service
    pub fn heal(&self, service: ServiceAddress) {
        let recipients = {
            let mut state = self.lock();

            if !state.partitioned.remove(&service) {
                return;
            }

            info!(%service, "Healed partition");
            state.interested(service)
        };

        self.announce(service, recipients);
    }

    /// Tells the given peers that a service is reachable, honouring the discovery delay
    fn announce(&self, service: ServiceAddress, recipients: Vec<ClientId>) {
        if recipients.is_empty() {
            return;
        }

        let delay = self.options.sample_delay();

        if delay.is_zero() {
            let state = self.lock();
            if state.reachable(service) {
                state.notify(service, true, &recipients);
            }
            return;
        }

        let shared = self.state.clone();
        tokio::spawn(async move {
            sleep(delay).await;

            let state = lock(&shared);
            // The offer may have been withdrawn in the meantime
            if state.reachable(service) {
                state.notify(service, true, &recipients);
            }
        });
    }

    fn withdraw(state: &mut BusState, service: ServiceAddress) {
        state.offers.remove(&service);

        if !state.partitioned.contains(&service) {
            let recipients = state.interested(service);
            state.notify(service, false, &recipients);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ServiceBus for LocalServiceBus {
    fn attach(&self, name: &str) -> PeerLink {
        let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        let (tx, inbox) = mpsc::unbounded_channel();

        self.lock().peers.insert(
            client,
            Peer {
                name: name.to_owned(),
                tx,
            },
        );

        debug!(peer = name, %client, "Attached peer");

        PeerLink { client, inbox }
    }

    async fn detach(&self, client: ClientId) {
        let mut state = self.lock();

        let peer = match state.peers.remove(&client) {
            Some(peer) => peer,
            None => return,
        };

        for interested in state.interests.values_mut() {
            interested.remove(&client);
        }

        let offered: Vec<ServiceAddress> = state
            .offers
            .iter()
            .filter(|(_, provider)| **provider == client)
            .map(|(service, _)| *service)
            .collect();

        for service in offered {
            Self::withdraw(&mut state, service);
        }

        for remaining in state.peers.values() {
            remaining.tx.send(BusEvent::PeerDetached(client)).ok();
        }

        debug!(peer = %peer.name, %client, "Detached peer");
    }

    async fn send(&self, envelope: Envelope) {
        let state = self.lock();
        let service = envelope.address.service();

        if state.partitioned.contains(&service) {
            trace!(address = %envelope.address, kind = ?envelope.kind, "Dropping message to partitioned service");
            return;
        }

        let recipient = envelope
            .destination
            .or_else(|| state.offers.get(&service).copied());

        match recipient.and_then(|client| state.peers.get(&client)) {
            Some(peer) => {
                trace!(peer = %peer.name, address = %envelope.address, kind = ?envelope.kind, "Delivering message");
                if peer.tx.send(BusEvent::Message(envelope)).is_err() {
                    debug!(peer = %peer.name, "Dropping message to closed inbox");
                }
            }
            None => {
                debug!(address = %envelope.address, kind = ?envelope.kind, "Dropping undeliverable message");
            }
        }
    }

    async fn offer_service(&self, client: ClientId, service: ServiceAddress) {
        let recipients = {
            let mut state = self.lock();

            if let Some(previous) = state.offers.insert(service, client) {
                if previous != client {
                    warn!(%service, %previous, %client, "Service offer taken over by another peer");
                }
            }

            debug!(%service, %client, "Service offered");
            state.interested(service)
        };

        self.announce(service, recipients);
    }

    async fn stop_offer_service(&self, client: ClientId, service: ServiceAddress) {
        let mut state = self.lock();

        if state.offers.get(&service) == Some(&client) {
            debug!(%service, %client, "Service offer withdrawn");
            Self::withdraw(&mut state, service);
        }
    }

    async fn request_service(&self, client: ClientId, service: ServiceAddress) {
        self.lock()
            .interests
            .entry(service)
            .or_default()
            .insert(client);

        self.announce(service, vec![client]);
    }

    async fn release_service(&self, client: ClientId, service: ServiceAddress) {
        if let Some(interested) = self.lock().interests.get_mut(&service) {
            interested.remove(&client);
        }
    }
}
