//! Matching of outgoing requests with their responses
//!
//! The bus delivers responses keyed only by the [`MethodAddress`] they belong to and carries no
//! per-call token. Correlation is therefore bounded to one outstanding call per target: a second
//! call while the first one is still waiting is rejected instead of overwriting it.
//!
//! ```text
//! Idle ──call──► Waiting ──response──► Fulfilled ──► Idle
//!                   └──────timeout───► TimedOut  ──► Idle
//! ```
//!
//! A timeout only stops the waiting, the request has already been sent. Responses arriving
//! afterwards are discarded since no caller is listening anymore. Retrying is up to the caller.

use super::address::{ClientId, MethodAddress, ServiceAddress};
use super::availability::AvailabilityTracker;
use super::bus::{Envelope, MessageKind, ServiceBus};
use super::codec::{Payload, PayloadShape};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

/// Reasons why a call did not produce a response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The target's service has not been discovered or went away
    #[error("service {0} is not available")]
    AddressUnavailable(ServiceAddress),
    /// Another call to the same target is still waiting for its response
    #[error("a call to {0} is already in flight")]
    CallAlreadyInFlight(MethodAddress),
    /// No response arrived in time
    #[error("no response from {target} within {waited:?}")]
    Timeout {
        /// Method that was called
        target: MethodAddress,
        /// Duration that was waited
        waited: Duration,
    },
    /// The endpoint stopped while the call was waiting
    #[error("endpoint stopped while waiting for {0}")]
    Disconnected(MethodAddress),
}

/// Lifecycle state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Request has been sent, no response yet
    Waiting,
    /// Response has been delivered to the caller
    Fulfilled,
    /// Caller stopped waiting
    TimedOut,
}

struct PendingCall {
    sequence: u64,
    issued_at: Instant,
    response_shape: PayloadShape,
    tx: oneshot::Sender<Payload>,
}

/// Sends requests and resolves each to exactly one response or a timeout
pub struct RequestCorrelator {
    client: ClientId,
    bus: Arc<dyn ServiceBus>,
    availability: Arc<AvailabilityTracker>,
    pending: Mutex<HashMap<MethodAddress, PendingCall>>,
    sequence: AtomicU64,
}

impl RequestCorrelator {
    /// Creates a new correlator sending as `client`
    pub fn new(
        client: ClientId,
        bus: Arc<dyn ServiceBus>,
        availability: Arc<AvailabilityTracker>,
    ) -> Self {
        Self {
            client,
            bus,
            availability,
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        }
    }

    /// Calls a remote method and waits for the correlated response
    ///
    /// Fails immediately when the target service is not available or a call to the same target
    /// is already waiting. The response is decoded with `response_shape`.
    #[instrument(skip(self, request), fields(%target, client = %self.client))]
    pub async fn call(
        &self,
        target: MethodAddress,
        request: &Payload,
        response_shape: PayloadShape,
        duration: Duration,
    ) -> Result<Payload, CallError> {
        if !self.availability.is_available(target.service) {
            debug!("Refusing to call unavailable service");
            return Err(CallError::AddressUnavailable(target.service));
        }

        let (guard, rx) = self.register(target, response_shape)?;

        trace!(sequence = guard.sequence, %request, "Dispatching request");
        let envelope = Envelope::to_service(MessageKind::Request, target, self.client, request.encode());
        self.bus.send(envelope).await;

        match timeout(duration, rx).await {
            Ok(Ok(response)) => {
                debug!(state = ?CallState::Fulfilled, %response, "Call resolved");
                Ok(response)
            }
            Ok(Err(_)) => {
                debug!("Call abandoned as the endpoint stopped");
                Err(CallError::Disconnected(target))
            }
            Err(_) => {
                debug!(state = ?CallState::TimedOut, ?duration, "Call resolved");
                Err(CallError::Timeout {
                    target,
                    waited: duration,
                })
            }
        }
    }

    /// Delivers an inbound response to the caller waiting on `target`
    ///
    /// Returns whether a caller received it. Responses without a waiting caller are late or
    /// unsolicited and are discarded, malformed ones are discarded while the call keeps waiting.
    #[instrument(skip(self, bytes), fields(%target, length = bytes.len()))]
    pub fn on_response(&self, target: MethodAddress, bytes: &[u8]) -> bool {
        let mut pending = self.lock();

        let call = match pending.remove(&target) {
            Some(call) => call,
            None => {
                warn!("Discarding response without a waiting caller");
                return false;
            }
        };

        match Payload::decode(call.response_shape, bytes) {
            Ok(response) => {
                drop(pending);
                trace!(
                    sequence = call.sequence,
                    elapsed = ?call.issued_at.elapsed(),
                    "Correlated response"
                );

                // The receiver is gone if the caller timed out in the meantime
                if call.tx.send(response).is_err() {
                    warn!("Discarding late response");
                    return false;
                }

                true
            }
            Err(error) => {
                warn!(%error, "Discarding malformed response");
                pending.insert(target, call);
                false
            }
        }
    }

    /// Observable state of the calls to a target, `None` when idle
    pub fn state(&self, target: MethodAddress) -> Option<CallState> {
        self.lock().get(&target).map(|_| CallState::Waiting)
    }

    /// Abandons all waiting calls, their callers receive [`CallError::Disconnected`]
    pub fn cancel_all(&self) {
        let abandoned = self.lock().drain().count();

        if abandoned > 0 {
            debug!(abandoned, "Abandoned waiting calls");
        }
    }

    fn register(
        &self,
        target: MethodAddress,
        response_shape: PayloadShape,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Payload>), CallError> {
        let mut pending = self.lock();

        if pending.contains_key(&target) {
            debug!("Rejecting call as another one is in flight");
            return Err(CallError::CallAlreadyInFlight(target));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        pending.insert(
            target,
            PendingCall {
                sequence,
                issued_at: Instant::now(),
                response_shape,
                tx,
            },
        );

        let guard = PendingGuard {
            correlator: self,
            target,
            sequence,
        };

        Ok((guard, rx))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MethodAddress, PendingCall>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the target to idle once the call future completes or is dropped
///
/// Only removes the entry it created, a newer call to the same target is left untouched.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    target: MethodAddress,
    sequence: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.correlator.lock();

        if let Some(call) = pending.get(&self.target) {
            if call.sequence == self.sequence {
                pending.remove(&self.target);
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::bus::{BusEvent, PeerLink};
    use crate::library::communication::implementation::local::LocalServiceBus;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    const SERVICE: ServiceAddress = ServiceAddress::new(0x1111, 0x0001);
    const TARGET: MethodAddress = SERVICE.method(0x0001);
    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        correlator: Arc<RequestCorrelator>,
        server: PeerLink,
    }

    /// Correlator with an available target whose requests land in `server.inbox`
    async fn fixture() -> Fixture {
        let bus = Arc::new(LocalServiceBus::default());
        let client = bus.attach("client");
        let server = bus.attach("server");
        bus.offer_service(server.client, SERVICE).await;

        let availability = Arc::new(AvailabilityTracker::default());
        availability.mark_available(SERVICE);

        let correlator = Arc::new(RequestCorrelator::new(client.client, bus, availability));

        Fixture { correlator, server }
    }

    async fn next_request(server: &mut PeerLink) -> Envelope {
        loop {
            match server.inbox.recv().await {
                Some(BusEvent::Message(envelope)) => return envelope,
                Some(_) => continue,
                None => panic!("server inbox closed"),
            }
        }
    }

    #[tokio::test]
    async fn resolve_with_response() {
        let Fixture {
            correlator,
            mut server,
        } = fixture().await;

        let caller = correlator.clone();
        let call = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Text(String::new()), PayloadShape::Int32, WAIT)
                .await
        });

        let request = next_request(&mut server).await;
        assert_eq!(request.kind, MessageKind::Request);
        assert!(correlator.on_response(TARGET, &Payload::Int32(5000).encode()));

        assert_eq!(call.await.unwrap(), Ok(Payload::Int32(5000)));
        assert_eq!(correlator.state(TARGET), None);
    }

    #[tokio::test]
    async fn fail_fast_on_unavailable_service() {
        let bus = Arc::new(LocalServiceBus::default());
        let client = bus.attach("client");
        let correlator =
            RequestCorrelator::new(client.client, bus, Arc::new(AvailabilityTracker::default()));

        assert_eq!(
            correlator
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await,
            Err(CallError::AddressUnavailable(SERVICE))
        );
    }

    #[tokio::test]
    async fn reject_second_call_while_waiting() {
        let Fixture {
            correlator,
            mut server,
        } = fixture().await;

        let caller = correlator.clone();
        let first = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await
        });

        next_request(&mut server).await;
        assert_eq!(correlator.state(TARGET), Some(CallState::Waiting));

        assert_eq!(
            correlator
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await,
            Err(CallError::CallAlreadyInFlight(TARGET))
        );

        correlator.on_response(TARGET, &Payload::Int32(1).encode());
        assert_eq!(first.await.unwrap(), Ok(Payload::Int32(1)));

        // Target is idle again and accepts a new call
        let caller = correlator.clone();
        let second = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await
        });

        next_request(&mut server).await;
        correlator.on_response(TARGET, &Payload::Int32(2).encode());
        assert_eq!(second.await.unwrap(), Ok(Payload::Int32(2)));
    }

    #[tokio::test]
    async fn accept_new_call_after_timeout() {
        let Fixture {
            correlator,
            mut server,
        } = fixture().await;
        let short = Duration::from_millis(20);

        assert_eq!(
            correlator
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, short)
                .await,
            Err(CallError::Timeout {
                target: TARGET,
                waited: short
            })
        );
        assert_eq!(correlator.state(TARGET), None);
        next_request(&mut server).await;

        let caller = correlator.clone();
        let retry = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await
        });

        next_request(&mut server).await;
        correlator.on_response(TARGET, &Payload::Int32(7).encode());
        assert_eq!(retry.await.unwrap(), Ok(Payload::Int32(7)));
    }

    #[tokio::test]
    async fn discard_late_response() {
        let Fixture { correlator, .. } = fixture().await;

        let result = correlator
            .call(
                TARGET,
                &Payload::Int32(0),
                PayloadShape::Int32,
                Duration::from_millis(10),
            )
            .await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));

        assert!(!correlator.on_response(TARGET, &Payload::Int32(5000).encode()));
        assert_eq!(correlator.state(TARGET), None);
    }

    #[tokio::test]
    async fn keep_waiting_after_malformed_response() {
        let Fixture {
            correlator,
            mut server,
        } = fixture().await;

        let caller = correlator.clone();
        let call = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await
        });

        next_request(&mut server).await;
        assert!(!correlator.on_response(TARGET, &[0x01, 0x02]));
        assert_eq!(correlator.state(TARGET), Some(CallState::Waiting));

        assert!(correlator.on_response(TARGET, &Payload::Int32(3).encode()));
        assert_eq!(call.await.unwrap(), Ok(Payload::Int32(3)));
    }

    #[tokio::test]
    async fn release_target_when_caller_is_dropped() {
        let Fixture {
            correlator,
            mut server,
        } = fixture().await;

        let caller = correlator.clone();
        let call = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await
        });

        next_request(&mut server).await;
        call.abort();
        let _ = call.await;
        sleep(Duration::from_millis(5)).await;

        assert_eq!(correlator.state(TARGET), None);
    }

    #[tokio::test]
    async fn disconnect_waiting_callers_on_cancel() {
        let Fixture {
            correlator,
            mut server,
        } = fixture().await;

        let caller = correlator.clone();
        let call = tokio::spawn(async move {
            caller
                .call(TARGET, &Payload::Int32(0), PayloadShape::Int32, WAIT)
                .await
        });

        next_request(&mut server).await;
        correlator.cancel_all();

        assert_eq!(call.await.unwrap(), Err(CallError::Disconnected(TARGET)));
    }
}
