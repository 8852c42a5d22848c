//! Runs producer, monitor, alert listeners and relay against one in-process bus
//!
//! Producer, monitor and listeners are long running and only stop once the relay completed its
//! cycles. Listeners are started before the relay so that they observe every alert.

mod options;

use super::listener::{self, Listener};
use super::monitor::Monitor;
use super::producer::Producer;
use super::relay::{Relay, RelayReport};
use crate::harness::{Heart, HeartStone, Module, ModuleRunner, ModuleTerminationReason};
use crate::library::communication::implementation::local::{LocalBusOptions, LocalServiceBus};
use crate::library::communication::{BroadcastReport, ServiceBus};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

pub use options::Options;

/// Pipeline did not run to completion
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The relay module failed
    #[error("relay terminated abnormally")]
    Relay(#[source] ModuleTerminationReason),
}

/// Everything observed during a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    /// One report per relay cycle
    pub relay: Vec<RelayReport>,
    /// Alerts broadcast by the monitor
    pub broadcasts: Vec<BroadcastReport>,
    /// Alerts received by each listener
    pub listeners: Vec<Vec<String>>,
    /// Alerts received by the relay itself
    pub relay_alerts: Vec<String>,
}

impl PipelineSummary {
    /// Whether every relay cycle has been acknowledged by the monitor
    pub fn is_success(&self) -> bool {
        self.relay.iter().all(|report| report.acknowledged)
    }
}

/// Executes the pipeline once and collects its results
#[instrument(skip(options))]
pub async fn run(options: Options) -> Result<PipelineSummary, PipelineError> {
    let bus: Arc<dyn ServiceBus> = Arc::new(LocalServiceBus::new(LocalBusOptions {
        discovery_delay: options.discovery_delay,
        discovery_jitter: options.discovery_jitter,
    }));

    let mut stones = Vec::new();
    let mut roles = Vec::new();
    let mut heart = || {
        let (heart, stone) = match options.lifetime {
            Some(lifetime) => Heart::with_lifetime(lifetime),
            None => Heart::new(),
        };
        stones.push(stone);
        heart
    };

    let producer = Producer::new(bus.clone(), options.producer.clone(), heart());
    roles.push(spawn_module(producer));

    let monitor = Monitor::new(bus.clone(), options.monitor.clone(), heart());
    let broadcasts = monitor.broadcasts();
    roles.push(spawn_module(monitor));

    let listener_options = listener::Options {
        timing: options.relay.timing.clone(),
    };
    let mut alerts = Vec::new();
    let mut readiness = Vec::new();

    for _ in 0..options.listeners {
        let listener = Listener::new(bus.clone(), listener_options.clone(), heart());
        alerts.push(listener.alerts());
        readiness.push(listener.subscribed());
        roles.push(spawn_module(listener));
    }

    let startup_bound = options.relay.timing.discovery_timeout + options.relay.timing.call_timeout;
    for mut subscribed in readiness {
        if timeout(startup_bound, subscribed.wait_for(|subscribed| *subscribed))
            .await
            .map_or(true, |result| result.is_err())
        {
            warn!("Listener did not subscribe, continuing without it");
        }
    }

    let mut relay = Relay::new(bus.clone(), options.relay.clone());
    let relay_reports = relay.reports();
    let relay_alerts = relay.alerts();
    let termination_reason = ModuleRunner::default().run(&mut relay).await;

    stop(&stones, roles).await;

    if !termination_reason.is_clean() {
        return Err(PipelineError::Relay(termination_reason));
    }

    let summary = PipelineSummary {
        relay: relay_reports.entries(),
        broadcasts: broadcasts.entries(),
        listeners: alerts.iter().map(|journal| journal.entries()).collect(),
        relay_alerts: relay_alerts.entries(),
    };

    info!(
        cycles = summary.relay.len(),
        alerts = summary.broadcasts.len(),
        success = summary.is_success(),
        "Pipeline finished"
    );

    Ok(summary)
}

fn spawn_module<M>(mut module: M) -> JoinHandle<ModuleTerminationReason>
where
    M: Module + Send + 'static,
{
    tokio::spawn(async move { ModuleRunner::default().run(&mut module).await })
}

async fn stop(stones: &[HeartStone], roles: Vec<JoinHandle<ModuleTerminationReason>>) {
    for stone in stones {
        stone.kill("Relay finished").await;
    }

    for result in join_all(roles).await {
        match result {
            Ok(reason) if reason.is_clean() => {}
            Ok(reason) => warn!(%reason, "Role terminated abnormally"),
            Err(e) => error!(error = %e, "Role panicked"),
        }
    }
}
