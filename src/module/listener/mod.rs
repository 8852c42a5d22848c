//! Subscribes to speed alerts and records every alert it receives

mod options;

use super::Journal;
use crate::domain::ids::{SPEED_ALERT, SPEED_VALUE_SERVICE};
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::communication::{
    Endpoint, EventAddress, NotificationConsumer, Payload, PayloadShape, ServiceBus,
};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument};

pub use options::Options;

/// Consumer logging and recording alert notifications
#[derive(Clone)]
pub struct AlertLog {
    role: &'static str,
    alerts: Journal<String>,
}

impl AlertLog {
    /// Creates an empty log, `role` is included in log messages
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            alerts: Journal::default(),
        }
    }

    /// Alerts received so far
    pub fn alerts(&self) -> Journal<String> {
        self.alerts.clone()
    }
}

#[async_trait]
impl NotificationConsumer for AlertLog {
    async fn consume(&self, event: EventAddress, notification: Payload) -> EmptyResult {
        let text = notification.as_text().unwrap_or_default().to_owned();
        info!(role = self.role, %event, alert = %text, "Received speed alert");
        self.alerts.record(text);
        Ok(())
    }
}

/// Module implementation
pub struct Listener {
    bus: Arc<dyn ServiceBus>,
    options: Options,
    heart: Option<Heart>,
    endpoint: Option<Endpoint>,
    log: AlertLog,
    subscribed: watch::Sender<bool>,
}

impl Listener {
    /// Creates a new instance which stays subscribed until `heart` dies
    pub fn new(bus: Arc<dyn ServiceBus>, options: Options, heart: Heart) -> Self {
        Self {
            bus,
            options,
            heart: Some(heart),
            endpoint: None,
            log: AlertLog::new("listener"),
            subscribed: watch::channel(false).0,
        }
    }

    /// Alerts received so far
    pub fn alerts(&self) -> Journal<String> {
        self.log.alerts()
    }

    /// Turns `true` once the monitor acknowledged the subscription
    pub fn subscribed(&self) -> watch::Receiver<bool> {
        self.subscribed.subscribe()
    }
}

#[async_trait]
impl Module for Listener {
    #[instrument(skip(self))]
    async fn pre_startup(&mut self) -> EmptyResult {
        let timing = &self.options.timing;
        let endpoint = Endpoint::start(self.bus.clone(), "listener");
        self.endpoint = Some(endpoint.clone());

        endpoint.request_service(SPEED_VALUE_SERVICE).await;
        endpoint
            .await_available(SPEED_VALUE_SERVICE, timing.discovery_timeout)
            .await?;

        endpoint
            .subscribe(
                SPEED_ALERT,
                PayloadShape::Text,
                self.log.clone(),
                timing.call_timeout,
            )
            .await?;

        self.subscribed.send_replace(true);
        info!(event = %SPEED_ALERT, "Listening for speed alerts");

        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        Ok(Some(self.heart.take().ok_or("listener has already been run")?))
    }

    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.unsubscribe(SPEED_ALERT).await;
            endpoint.shutdown().await;
        }

        info!(
            %termination_reason,
            alerts = self.log.alerts().entries().len(),
            "Listener stopped"
        );
    }
}
