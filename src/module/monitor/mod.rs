//! Acknowledges reported speeds and broadcasts an alert when they exceed the threshold

mod options;

use super::Journal;
use crate::domain::ids::{ACK, ALERT, SPEED_ALERT, SPEED_VALUE, SPEED_VALUE_SERVICE};
use crate::domain::AlertPolicy;
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::communication::{
    AcceptAll, BroadcastReport, CapacityLimit, Endpoint, Payload, PayloadShape,
    RequestProcessor, ServiceBus, SubscriptionPolicy,
};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use options::Options;

/// Evaluates each reported speed against the alert policy
struct SpeedEvaluator {
    endpoint: Endpoint,
    policy: AlertPolicy,
    broadcasts: Journal<BroadcastReport>,
}

#[async_trait]
impl RequestProcessor for SpeedEvaluator {
    async fn process(&self, request: Payload) -> Result<Option<Payload>, BoxedError> {
        let speed_kmh = match request.as_f32() {
            Some(speed_kmh) => speed_kmh,
            None => return Ok(None),
        };

        info!(speed_kmh, "Received converted speed");

        if self.policy.should_alert(speed_kmh) {
            let report = self
                .endpoint
                .broadcast(SPEED_ALERT, &Payload::Text(ALERT.to_owned()))
                .await;

            warn!(
                speed_kmh,
                threshold_kmh = self.policy.threshold_kmh,
                delivered = report.delivered,
                "Speed exceeds threshold, alert sent"
            );
            self.broadcasts.record(report);
        } else {
            debug!(speed_kmh, "Speed within threshold");
        }

        Ok(Some(Payload::Text(ACK.to_owned())))
    }
}

/// Module implementation
pub struct Monitor {
    bus: Arc<dyn ServiceBus>,
    options: Options,
    heart: Option<Heart>,
    endpoint: Option<Endpoint>,
    broadcasts: Journal<BroadcastReport>,
}

impl Monitor {
    /// Creates a new instance which serves requests until `heart` dies
    pub fn new(bus: Arc<dyn ServiceBus>, options: Options, heart: Heart) -> Self {
        Self {
            bus,
            options,
            heart: Some(heart),
            endpoint: None,
            broadcasts: Journal::default(),
        }
    }

    /// Reports of all alerts broadcast so far
    pub fn broadcasts(&self) -> Journal<BroadcastReport> {
        self.broadcasts.clone()
    }
}

#[async_trait]
impl Module for Monitor {
    async fn pre_startup(&mut self) -> EmptyResult {
        let policy: Box<dyn SubscriptionPolicy> = match self.options.max_subscribers {
            Some(max) => Box::new(CapacityLimit { max }),
            None => Box::new(AcceptAll),
        };

        let endpoint = Endpoint::start_with_policy(self.bus.clone(), "monitor", policy);

        let evaluator = SpeedEvaluator {
            endpoint: endpoint.clone(),
            policy: AlertPolicy {
                threshold_kmh: self.options.threshold,
            },
            broadcasts: self.broadcasts.clone(),
        };

        endpoint.register_method(SPEED_VALUE, PayloadShape::Float32, evaluator);
        endpoint.offer_event(SPEED_ALERT);
        endpoint.offer_service(SPEED_VALUE_SERVICE).await;

        debug!(service = %SPEED_VALUE_SERVICE, event = %SPEED_ALERT, "Offering speed monitoring");
        self.endpoint = Some(endpoint);

        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        Ok(Some(self.heart.take().ok_or("monitor has already been run")?))
    }

    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.shutdown().await;
        }

        info!(
            %termination_reason,
            alerts = self.broadcasts.entries().len(),
            "Monitor stopped"
        );
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::harness::ModuleRunner;
    use crate::library::communication::implementation::local::LocalServiceBus;
    use crate::library::communication::{BusEvent, Envelope, MessageKind, PeerLink};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(peer: &mut PeerLink, wait: Duration) -> Option<BusEvent> {
        timeout(wait, peer.inbox.recv()).await.ok().flatten()
    }

    fn evaluator() -> SpeedEvaluator {
        let endpoint = Endpoint::start(Arc::new(LocalServiceBus::default()), "monitor");
        endpoint.offer_event(SPEED_ALERT);

        SpeedEvaluator {
            endpoint,
            policy: AlertPolicy::default(),
            broadcasts: Journal::default(),
        }
    }

    #[tokio::test]
    async fn acknowledge_and_alert_above_threshold() {
        let evaluator = evaluator();

        assert_eq!(
            evaluator.process(Payload::Float32(161.57)).await.unwrap(),
            Some(Payload::Text("ACK".into()))
        );
        assert_eq!(
            evaluator.broadcasts.entries(),
            vec![BroadcastReport {
                event: SPEED_ALERT,
                delivered: 0
            }]
        );
    }

    #[tokio::test]
    async fn acknowledge_without_alert_at_or_below_threshold() {
        let evaluator = evaluator();

        for speed in [80.78, 100.0] {
            assert_eq!(
                evaluator.process(Payload::Float32(speed)).await.unwrap(),
                Some(Payload::Text("ACK".into()))
            );
        }

        assert!(evaluator.broadcasts.entries().is_empty());
    }

    #[tokio::test]
    async fn ignore_non_numeric_requests() {
        let evaluator = evaluator();

        assert_eq!(
            evaluator.process(Payload::Text("fast".into())).await.unwrap(),
            None
        );
        assert!(evaluator.broadcasts.entries().is_empty());
    }

    #[tokio::test]
    async fn leave_truncated_speeds_unanswered() {
        let bus = Arc::new(LocalServiceBus::default());
        let (heart, stone) = Heart::new();
        let mut monitor = Monitor::new(bus.clone(), Options::default(), heart);
        let broadcasts = monitor.broadcasts();
        let monitor = tokio::spawn(async move { ModuleRunner::default().run(&mut monitor).await });

        let mut caller = bus.attach("caller");
        bus.request_service(caller.client, SPEED_VALUE_SERVICE).await;
        assert_eq!(
            next(&mut caller, Duration::from_secs(2)).await,
            Some(BusEvent::Availability {
                service: SPEED_VALUE_SERVICE,
                available: true
            })
        );

        bus.send(Envelope::to_service(
            MessageKind::Request,
            SPEED_VALUE,
            caller.client,
            vec![0, 0],
        ))
        .await;
        assert_eq!(next(&mut caller, Duration::from_millis(100)).await, None);
        assert!(broadcasts.entries().is_empty());

        // A well-formed speed on the same connection is still answered
        bus.send(Envelope::to_service(
            MessageKind::Request,
            SPEED_VALUE,
            caller.client,
            Payload::Float32(161.57).encode(),
        ))
        .await;
        match next(&mut caller, Duration::from_secs(2)).await {
            Some(BusEvent::Message(envelope)) => {
                assert_eq!(envelope.kind, MessageKind::Response);
                assert_eq!(
                    Payload::decode(PayloadShape::Text, &envelope.payload),
                    Ok(Payload::Text("ACK".into()))
                );
            }
            other => panic!("expected a response, got {:?}", other),
        }
        assert_eq!(broadcasts.entries().len(), 1);

        stone.kill("done").await;
        assert!(monitor.await.unwrap().is_clean());
    }
}
