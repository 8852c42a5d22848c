use crate::module::options::TimingOptions;
use structopt::StructOpt;

/// Options for the alert listener module
#[derive(Debug, Clone, Default, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub timing: TimingOptions,
}
