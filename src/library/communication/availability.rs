//! Reachability bookkeeping for remote services
//!
//! Discovery latency is unbounded and independent of process start order, so every sender
//! gates on the [`AvailabilityTracker`] instead of assuming its peers are up.

use super::address::ServiceAddress;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

/// Service did not become available within the allotted time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("service {service} did not become available within {waited:?}")]
pub struct AvailabilityTimeout {
    /// Service that was awaited
    pub service: ServiceAddress,
    /// Duration that was waited
    pub waited: Duration,
}

/// Reachability of a service and when it last changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityState {
    /// Whether the service can currently be reached
    pub available: bool,
    /// Moment of the last transition (or of the first observation)
    pub since: Instant,
}

impl AvailabilityState {
    fn unavailable() -> Self {
        Self {
            available: false,
            since: Instant::now(),
        }
    }
}

/// Tracks which remote services are currently reachable
#[derive(Default)]
pub struct AvailabilityTracker {
    services: Mutex<HashMap<ServiceAddress, Arc<watch::Sender<AvailabilityState>>>>,
}

impl AvailabilityTracker {
    /// Records that a service became reachable
    pub fn mark_available(&self, service: ServiceAddress) {
        self.transition(service, true);
    }

    /// Records that a service can no longer be reached
    pub fn mark_unavailable(&self, service: ServiceAddress) {
        self.transition(service, false);
    }

    /// Whether the service is currently reachable
    pub fn is_available(&self, service: ServiceAddress) -> bool {
        self.state(service).available
    }

    /// Current state of a service, unknown services are unavailable
    pub fn state(&self, service: ServiceAddress) -> AvailabilityState {
        *self.sender(service).borrow()
    }

    /// Waits until the service is reachable or the timeout elapses
    ///
    /// Returns immediately when the service is already available.
    #[instrument(skip(self), fields(%service))]
    pub async fn await_available(
        &self,
        service: ServiceAddress,
        duration: Duration,
    ) -> Result<(), AvailabilityTimeout> {
        let mut receiver = self.sender(service).subscribe();

        if receiver.borrow().available {
            return Ok(());
        }

        trace!("Waiting for service to become available");

        // The sender is owned by the tracker, so the channel stays open while we wait
        let outcome = timeout(duration, receiver.wait_for(|state| state.available))
            .await
            .map(|result| result.map(|_| ()));

        match outcome {
            Ok(Ok(())) => Ok(()),
            _ => {
                debug!(?duration, "Service did not become available in time");
                Err(AvailabilityTimeout {
                    service,
                    waited: duration,
                })
            }
        }
    }

    fn transition(&self, service: ServiceAddress, available: bool) {
        let sender = self.sender(service);

        let changed = sender.send_if_modified(|state| {
            if state.available == available {
                false
            } else {
                *state = AvailabilityState {
                    available,
                    since: Instant::now(),
                };
                true
            }
        });

        if changed {
            debug!(%service, available, "Service availability changed");
        }
    }

    fn sender(&self, service: ServiceAddress) -> Arc<watch::Sender<AvailabilityState>> {
        let mut services = self
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        services
            .entry(service)
            .or_insert_with(|| Arc::new(watch::channel(AvailabilityState::unavailable()).0))
            .clone()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use tokio::time::sleep;

    const SERVICE: ServiceAddress = ServiceAddress::new(0x1111, 0x0001);

    #[test]
    fn start_unavailable() {
        let tracker = AvailabilityTracker::default();
        assert!(!tracker.is_available(SERVICE));
    }

    #[test]
    fn follow_transitions() {
        let tracker = AvailabilityTracker::default();

        tracker.mark_available(SERVICE);
        assert!(tracker.is_available(SERVICE));

        tracker.mark_unavailable(SERVICE);
        assert!(!tracker.is_available(SERVICE));
    }

    #[test]
    fn keep_timestamp_on_repeated_marks() {
        let tracker = AvailabilityTracker::default();

        tracker.mark_available(SERVICE);
        let first = tracker.state(SERVICE);
        std::thread::sleep(Duration::from_millis(5));
        tracker.mark_available(SERVICE);

        assert_eq!(tracker.state(SERVICE), first);
    }

    #[tokio::test]
    async fn return_immediately_when_available() {
        let tracker = AvailabilityTracker::default();
        tracker.mark_available(SERVICE);

        tracker
            .await_available(SERVICE, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wake_up_on_transition() {
        let tracker = Arc::new(AvailabilityTracker::default());
        let marker = tracker.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            marker.mark_available(SERVICE);
        });

        tracker
            .await_available(SERVICE, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn time_out_without_transition() {
        let tracker = AvailabilityTracker::default();
        let duration = Duration::from_millis(20);

        assert_eq!(
            tracker.await_available(SERVICE, duration).await,
            Err(AvailabilityTimeout {
                service: SERVICE,
                waited: duration
            })
        );
    }
}
