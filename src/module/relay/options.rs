use crate::library::helpers::parse_millis;
use crate::module::options::{TimingOptions, VehicleOptions};
use std::time::Duration;
use structopt::StructOpt;

/// Options for the relay module
#[derive(Debug, Clone, StructOpt)]
pub struct Options {
    /// Number of measurement cycles to perform
    #[structopt(long, env = "RELAY_CYCLES", default_value = "1", value_name = "count")]
    pub cycles: u32,

    /// Milliseconds to pause between two cycles
    #[structopt(
        long,
        env = "RELAY_INTERVAL",
        default_value = "1000",
        parse(try_from_str = parse_millis),
        value_name = "ms"
    )]
    pub interval: Duration,

    /// Retries of a call which did not get a response in time
    #[structopt(long, env, default_value = "3", value_name = "count")]
    pub max_retries: u32,

    /// Milliseconds to wait before the first retry, doubling with every further retry
    #[structopt(
        long,
        env,
        default_value = "100",
        parse(try_from_str = parse_millis),
        value_name = "ms"
    )]
    pub retry_backoff: Duration,

    /// Subscribe to speed alerts and log them
    #[structopt(long)]
    pub subscribe_alerts: bool,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub vehicle: VehicleOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub timing: TimingOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cycles: 1,
            interval: Duration::from_millis(1000),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            subscribe_alerts: false,
            vehicle: VehicleOptions::default(),
            timing: TimingOptions::default(),
        }
    }
}
