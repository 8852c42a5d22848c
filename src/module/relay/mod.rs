//! Fetches engine speeds, converts them and reports the vehicle speed to the monitor
//!
//! Each cycle performs two correlated calls. Calls that time out are retried with exponential
//! backoff, calls to an unavailable service wait for it to be rediscovered first. Both share the
//! same retry bound.

mod options;

use super::listener::AlertLog;
use super::Journal;
use crate::domain::ids::{
    ACK, SPEED_ALERT, SPEED_REQUEST, SPEED_REQUEST_SERVICE, SPEED_VALUE, SPEED_VALUE_SERVICE,
};
use crate::domain::VehicleParameters;
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::communication::{
    CallError, Endpoint, MethodAddress, Payload, PayloadShape, ServiceBus,
};
use crate::library::helpers::Backoff;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

pub use options::Options;

/// Reasons why a relay cycle failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// A call failed in a way that retrying can not fix
    #[error("call to {target} failed")]
    Call {
        /// Method that was called
        target: MethodAddress,
        /// Underlying failure
        #[source]
        source: CallError,
    },
    /// A call failed on every attempt
    #[error("call to {target} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Method that was called
        target: MethodAddress,
        /// Number of calls sent
        attempts: u32,
        /// Failure of the last attempt
        #[source]
        last: CallError,
    },
    /// The response did not have the expected content
    #[error("unexpected response from {target}: {response}")]
    UnexpectedResponse {
        /// Method that was called
        target: MethodAddress,
        /// Response as received
        response: Payload,
    },
}

/// Outcome of a single relay cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayReport {
    /// Zero based index of the cycle
    pub cycle: u32,
    /// Engine speed received from the producer
    pub rpm: Option<i32>,
    /// Vehicle speed derived from `rpm`
    pub speed_kmh: Option<f32>,
    /// Whether the monitor acknowledged the speed
    pub acknowledged: bool,
    /// Calls sent during this cycle, including retries
    pub attempts: u32,
    /// Failure description if the cycle did not complete
    pub error: Option<String>,
}

impl RelayReport {
    fn new(cycle: u32) -> Self {
        Self {
            cycle,
            rpm: None,
            speed_kmh: None,
            acknowledged: false,
            attempts: 0,
            error: None,
        }
    }
}

/// Module implementation
pub struct Relay {
    bus: Arc<dyn ServiceBus>,
    options: Options,
    vehicle: VehicleParameters,
    endpoint: Option<Endpoint>,
    reports: Journal<RelayReport>,
    alerts: AlertLog,
}

impl Relay {
    /// Creates a new instance performing the configured number of cycles
    pub fn new(bus: Arc<dyn ServiceBus>, options: Options) -> Self {
        Self {
            bus,
            options,
            vehicle: VehicleParameters::default(),
            endpoint: None,
            reports: Journal::default(),
            alerts: AlertLog::new("relay"),
        }
    }

    /// Reports of all completed cycles
    pub fn reports(&self) -> Journal<RelayReport> {
        self.reports.clone()
    }

    /// Alerts received while subscribed
    pub fn alerts(&self) -> Journal<String> {
        self.alerts.alerts()
    }

    #[instrument(skip(self, endpoint))]
    async fn cycle(&self, endpoint: &Endpoint, cycle: u32) -> RelayReport {
        let mut report = RelayReport::new(cycle);

        if let Err(e) = self.relay(endpoint, &mut report).await {
            warn!(error = %e, "Relay cycle failed");
            report.error = Some(e.to_string());
        }

        report
    }

    async fn relay(
        &self,
        endpoint: &Endpoint,
        report: &mut RelayReport,
    ) -> Result<(), RelayError> {
        let measurement = self
            .call(
                endpoint,
                SPEED_REQUEST,
                &Payload::Text(String::new()),
                PayloadShape::Int32,
                report,
            )
            .await?;

        let rpm = measurement
            .as_i32()
            .ok_or_else(|| RelayError::UnexpectedResponse {
                target: SPEED_REQUEST,
                response: measurement.clone(),
            })?;
        let speed_kmh = self.vehicle.convert(rpm);

        report.rpm = Some(rpm);
        report.speed_kmh = Some(speed_kmh);
        info!(rpm, speed_kmh, "Converted engine speed");

        let acknowledgement = self
            .call(
                endpoint,
                SPEED_VALUE,
                &Payload::Float32(speed_kmh),
                PayloadShape::Text,
                report,
            )
            .await?;

        if acknowledgement.as_text() != Some(ACK) {
            return Err(RelayError::UnexpectedResponse {
                target: SPEED_VALUE,
                response: acknowledgement,
            });
        }

        report.acknowledged = true;
        debug!("Monitor acknowledged speed");

        Ok(())
    }

    /// Calls a method, retrying on timeouts and unavailability
    async fn call(
        &self,
        endpoint: &Endpoint,
        target: MethodAddress,
        request: &Payload,
        response_shape: PayloadShape,
        report: &mut RelayReport,
    ) -> Result<Payload, RelayError> {
        let timing = &self.options.timing;
        let mut backoff =
            Backoff::new(self.options.retry_backoff, 2, self.options.max_retries).with_jitter();
        let mut attempts = 0;

        loop {
            attempts += 1;
            report.attempts += 1;

            let result = endpoint
                .call(target, request, response_shape, timing.call_timeout)
                .await;

            let error = match result {
                Ok(response) => return Ok(response),
                Err(error) => match error {
                    CallError::Timeout { .. } => error,
                    CallError::AddressUnavailable(service) => {
                        debug!(%service, "Waiting for service to return");
                        endpoint
                            .await_available(service, timing.discovery_timeout)
                            .await
                            .ok();
                        error
                    }
                    source => return Err(RelayError::Call { target, source }),
                },
            };

            match backoff.next() {
                Some(delay) => {
                    warn!(%target, %error, attempts, ?delay, "Retrying call");
                    sleep(delay).await;
                }
                None => {
                    return Err(RelayError::RetriesExhausted {
                        target,
                        attempts,
                        last: error,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Module for Relay {
    async fn pre_startup(&mut self) -> EmptyResult {
        self.vehicle = self.options.vehicle.parameters()?;

        let timing = &self.options.timing;
        let endpoint = Endpoint::start(self.bus.clone(), "relay");
        self.endpoint = Some(endpoint.clone());

        for service in [SPEED_REQUEST_SERVICE, SPEED_VALUE_SERVICE] {
            endpoint.request_service(service).await;
        }

        for service in [SPEED_REQUEST_SERVICE, SPEED_VALUE_SERVICE] {
            endpoint
                .await_available(service, timing.discovery_timeout)
                .await?;
        }

        if self.options.subscribe_alerts {
            let subscription = endpoint
                .subscribe(
                    SPEED_ALERT,
                    PayloadShape::Text,
                    self.alerts.clone(),
                    timing.call_timeout,
                )
                .await;

            if let Err(e) = subscription {
                warn!(error = %e, "Continuing without alert subscription");
            }
        }

        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let endpoint = self.endpoint.clone().ok_or("relay has not been started")?;

        for cycle in 0..self.options.cycles {
            if cycle > 0 {
                sleep(self.options.interval).await;
            }

            let report = self.cycle(&endpoint, cycle).await;
            self.reports.record(report);
        }

        Ok(None)
    }

    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if let Some(endpoint) = self.endpoint.take() {
            if self.options.subscribe_alerts {
                endpoint.unsubscribe(SPEED_ALERT).await;
            }

            endpoint.shutdown().await;
        }

        let reports = self.reports.entries();
        let failed = reports.iter().filter(|report| report.error.is_some()).count();

        info!(%termination_reason, cycles = reports.len(), failed, "Relay stopped");
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::harness::ModuleRunner;
    use crate::library::communication::implementation::local::LocalServiceBus;
    use crate::module::options::TimingOptions;
    use crate::module::{monitor, producer};
    use crate::module::{monitor::Monitor, producer::Producer};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    fn options() -> Options {
        Options {
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
            timing: TimingOptions {
                discovery_timeout: Duration::from_secs(2),
                call_timeout: Duration::from_millis(50),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn wait_for_late_peers() {
        let bus: Arc<dyn ServiceBus> = Arc::new(LocalServiceBus::default());
        let mut relay = Relay::new(bus.clone(), options());
        let reports = relay.reports();

        let relay = tokio::spawn(async move { ModuleRunner::default().run(&mut relay).await });

        // Peers come up in reverse order long after the relay
        sleep(Duration::from_millis(100)).await;
        let (heart, monitor_stone) = Heart::new();
        let mut monitor = Monitor::new(bus.clone(), monitor::Options::default(), heart);
        let monitor = tokio::spawn(async move { ModuleRunner::default().run(&mut monitor).await });

        sleep(Duration::from_millis(50)).await;
        let (heart, producer_stone) = Heart::new();
        let mut producer = Producer::new(bus.clone(), producer::Options::default(), heart);
        let producer =
            tokio::spawn(async move { ModuleRunner::default().run(&mut producer).await });

        assert!(relay.await.unwrap().is_clean());

        let reports = reports.entries();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].acknowledged);
        assert_eq!(reports[0].attempts, 2);

        monitor_stone.kill("done").await;
        producer_stone.kill("done").await;
        assert!(monitor.await.unwrap().is_clean());
        assert!(producer.await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn resume_once_producer_is_reachable_again() {
        let bus = Arc::new(LocalServiceBus::default());

        let (heart, producer_stone) = Heart::new();
        let mut producer = Producer::new(bus.clone(), producer::Options::default(), heart);
        let producer =
            tokio::spawn(async move { ModuleRunner::default().run(&mut producer).await });

        let (heart, monitor_stone) = Heart::new();
        let mut monitor = Monitor::new(bus.clone(), monitor::Options::default(), heart);
        let monitor = tokio::spawn(async move { ModuleRunner::default().run(&mut monitor).await });

        let mut options = options();
        options.cycles = 2;
        options.interval = Duration::from_millis(50);
        let mut relay = Relay::new(bus.clone(), options);
        let reports = relay.reports();
        let relay = tokio::spawn(async move { ModuleRunner::default().run(&mut relay).await });

        timeout(Duration::from_secs(2), async {
            while reports.entries().is_empty() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // Second cycle starts while the producer is cut off
        bus.partition(SPEED_REQUEST_SERVICE);
        sleep(Duration::from_millis(150)).await;
        bus.heal(SPEED_REQUEST_SERVICE);

        assert!(relay.await.unwrap().is_clean());

        let reports = reports.entries();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].attempts, 2);
        assert_eq!(reports[1].rpm, Some(5000));
        assert!(reports[1].acknowledged);
        assert_eq!(reports[1].error, None);
        // Unavailable producer call, its retry and the monitor call
        assert_eq!(reports[1].attempts, 3);

        monitor_stone.kill("done").await;
        producer_stone.kill("done").await;
        assert!(monitor.await.unwrap().is_clean());
        assert!(producer.await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn give_up_after_retries() {
        let bus: Arc<dyn ServiceBus> = Arc::new(LocalServiceBus::default());

        let (heart, producer_stone) = Heart::new();
        let mut producer = Producer::new(bus.clone(), producer::Options::default(), heart);
        producer.pre_startup().await.unwrap();

        // Offers the monitor's service without ever answering
        let silent = Endpoint::start(bus.clone(), "silent");
        silent.offer_service(SPEED_VALUE_SERVICE).await;

        let mut relay = Relay::new(bus.clone(), options());
        let reason = ModuleRunner::default().run(&mut relay).await;
        assert!(reason.is_clean());

        let reports = relay.reports().entries();
        assert_eq!(reports[0].rpm, Some(5000));
        assert!(!reports[0].acknowledged);
        // One producer call, one monitor call and two retries
        assert_eq!(reports[0].attempts, 4);
        assert_eq!(
            reports[0].error.as_deref(),
            Some("call to 2222.0001/m0001 failed after 3 attempts")
        );

        producer_stone.kill("done").await;
        silent.shutdown().await;
    }

    #[tokio::test]
    async fn fail_startup_without_peers() {
        let bus: Arc<dyn ServiceBus> = Arc::new(LocalServiceBus::default());
        let mut options = options();
        options.timing.discovery_timeout = Duration::from_millis(20);

        let mut relay = Relay::new(bus, options);
        let reason = ModuleRunner::default().run(&mut relay).await;

        assert!(matches!(reason, ModuleTerminationReason::StartupFailed(_)));
        assert!(relay.reports().entries().is_empty());
    }

    #[test]
    fn serialize_reports() {
        let report = RelayReport {
            cycle: 0,
            rpm: Some(2500),
            speed_kmh: Some(80.5),
            acknowledged: true,
            attempts: 2,
            error: None,
        };

        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"cycle":0,"rpm":2500,"speed_kmh":80.5,"acknowledged":true,"attempts":2,"error":null}"#
        );
    }
}
