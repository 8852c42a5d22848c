use structopt::StructOpt;

/// Options for the monitor module
#[derive(Debug, Clone, StructOpt)]
pub struct Options {
    /// Speed in km/h that has to be exceeded to broadcast an alert
    #[structopt(long, env, default_value = "100.0", value_name = "kmh")]
    pub threshold: f32,

    /// Maximum number of alert subscribers, unlimited if omitted
    #[structopt(long, env, value_name = "count")]
    pub max_subscribers: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threshold: 100.0,
            max_subscribers: None,
        }
    }
}
