use speedlink::module::options::VehicleOptions;
use speedlink::module::pipeline;
use std::str::FromStr;
use structopt::StructOpt;
use thiserror::Error;

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Service oriented vehicle speed pipeline with threshold alerts.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Output format of log messages
    #[structopt(
        long,
        global = true,
        env,
        default_value = "text",
        possible_values = &["text", "compact", "json"],
        value_name = "format"
    )]
    pub log_format: LogFormat,

    /// Print results as JSON to stdout
    #[structopt(long, global = true)]
    pub json: bool,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Runs producer, monitor, alert listeners and relay in this process
    Pipeline(pipeline::Options),
    /// Prints the vehicle speed derived from an engine speed
    Convert(ConvertOptions),
}

#[derive(Debug, StructOpt)]
pub struct ConvertOptions {
    /// Engine speed in RPM
    #[structopt(allow_hyphen_values = true)]
    pub rpm: i32,

    /// Speed in km/h that has to be exceeded to raise an alert
    #[structopt(long, env, default_value = "100.0", value_name = "kmh")]
    pub threshold: f32,

    #[structopt(flatten)]
    pub vehicle: VehicleOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

#[derive(Error, Debug)]
#[error("unknown log format: {0}")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(UnknownLogFormat(other.to_owned())),
        }
    }
}
