//! Various small helper functions

use std::num::ParseIntError;
use std::time::Duration;

mod backoff;

pub use backoff::Backoff;

/// Parses a string containing a number of milliseconds
pub fn parse_millis(src: &str) -> Result<Duration, ParseIntError> {
    let millis = src.parse::<u64>()?;
    Ok(Duration::from_millis(millis))
}
