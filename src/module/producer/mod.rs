//! Serves engine speed measurements on request

mod options;

use crate::domain::ids::{SPEED_REQUEST, SPEED_REQUEST_SERVICE};
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::communication::{
    Endpoint, Payload, PayloadShape, RequestProcessor, ServiceBus,
};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub use options::Options;

/// Measurement source without any values
#[derive(Error, Debug)]
#[error("at least one RPM value is required")]
pub struct NoMeasurements;

/// Cyclic sequence of measurements, one value per request
struct RpmSource {
    values: Vec<i32>,
    position: AtomicUsize,
}

impl RpmSource {
    fn new(values: Vec<i32>) -> Result<Self, NoMeasurements> {
        if values.is_empty() {
            return Err(NoMeasurements);
        }

        Ok(Self {
            values,
            position: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> i32 {
        let position = self.position.fetch_add(1, Ordering::Relaxed);
        self.values[position % self.values.len()]
    }
}

#[async_trait]
impl RequestProcessor for RpmSource {
    async fn process(&self, _request: Payload) -> Result<Option<Payload>, BoxedError> {
        let rpm = self.next();
        info!(rpm, "Serving engine speed");
        Ok(Some(Payload::Int32(rpm)))
    }
}

/// Module implementation
pub struct Producer {
    bus: Arc<dyn ServiceBus>,
    options: Options,
    heart: Option<Heart>,
    endpoint: Option<Endpoint>,
}

impl Producer {
    /// Creates a new instance which serves requests until `heart` dies
    pub fn new(bus: Arc<dyn ServiceBus>, options: Options, heart: Heart) -> Self {
        Self {
            bus,
            options,
            heart: Some(heart),
            endpoint: None,
        }
    }
}

#[async_trait]
impl Module for Producer {
    async fn pre_startup(&mut self) -> EmptyResult {
        let source = RpmSource::new(self.options.rpm.clone())?;

        let endpoint = Endpoint::start(self.bus.clone(), "producer");
        endpoint.register_method(SPEED_REQUEST, PayloadShape::Text, source);
        endpoint.offer_service(SPEED_REQUEST_SERVICE).await;

        debug!(service = %SPEED_REQUEST_SERVICE, "Offering engine speed");
        self.endpoint = Some(endpoint);

        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        Ok(Some(self.heart.take().ok_or("producer has already been run")?))
    }

    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.shutdown().await;
        }

        info!(%termination_reason, "Producer stopped");
    }
}
