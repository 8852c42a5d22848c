use crate::library::helpers::parse_millis;
use crate::module::{monitor, producer, relay};
use std::time::Duration;
use structopt::StructOpt;

/// Options for running all roles of the pipeline in one process
#[derive(Debug, Clone, StructOpt)]
pub struct Options {
    /// Number of peers subscribing to speed alerts
    #[structopt(long, env, default_value = "1", value_name = "count")]
    pub listeners: usize,

    /// Minimum milliseconds between a service offer and its discovery by other peers
    #[structopt(
        long,
        env,
        default_value = "0",
        parse(try_from_str = parse_millis),
        value_name = "ms"
    )]
    pub discovery_delay: Duration,

    /// Upper bound of random milliseconds added to each discovery
    #[structopt(
        long,
        env,
        default_value = "0",
        parse(try_from_str = parse_millis),
        value_name = "ms"
    )]
    pub discovery_jitter: Duration,

    /// Milliseconds after which long running roles stop even if the relay has not finished
    #[structopt(long, env, parse(try_from_str = parse_millis), value_name = "ms")]
    pub lifetime: Option<Duration>,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub producer: producer::Options,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub monitor: monitor::Options,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub relay: relay::Options,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listeners: 1,
            discovery_delay: Duration::ZERO,
            discovery_jitter: Duration::ZERO,
            lifetime: None,
            producer: producer::Options::default(),
            monitor: monitor::Options::default(),
            relay: relay::Options::default(),
        }
    }
}
