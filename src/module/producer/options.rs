use structopt::StructOpt;

/// Options for the producer module
#[derive(Debug, Clone, StructOpt)]
pub struct Options {
    /// Engine speeds in RPM returned to consecutive requests, repeating from the start once
    /// exhausted
    #[structopt(
        long = "rpm",
        env = "PRODUCER_RPM",
        default_value = "5000",
        use_delimiter = true,
        allow_hyphen_values = true,
        value_name = "rpm"
    )]
    pub rpm: Vec<i32>,
}

impl Default for Options {
    fn default() -> Self {
        Self { rpm: vec![5000] }
    }
}
