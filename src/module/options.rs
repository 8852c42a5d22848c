//! Various options usable by modules
//!
//! The structs in this module allow other modules to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set.

use crate::domain::{InvalidParameters, VehicleParameters};
use crate::library::helpers::parse_millis;
use std::time::Duration;
use structopt::StructOpt;

/// Drivetrain geometry used for the speed conversion
#[derive(Debug, Clone, StructOpt)]
pub struct VehicleOptions {
    /// Radius of the driven wheels in meters
    #[structopt(long, env, default_value = "0.3", value_name = "meters")]
    pub wheel_radius: f32,

    /// Ratio between engine and wheel revolutions
    #[structopt(long, env, default_value = "3.5", value_name = "ratio")]
    pub gear_ratio: f32,
}

impl VehicleOptions {
    /// Validated conversion parameters
    pub fn parameters(&self) -> Result<VehicleParameters, InvalidParameters> {
        VehicleParameters::new(self.wheel_radius, self.gear_ratio)
    }
}

impl Default for VehicleOptions {
    fn default() -> Self {
        let parameters = VehicleParameters::default();

        Self {
            wheel_radius: parameters.wheel_radius_m(),
            gear_ratio: parameters.gear_ratio(),
        }
    }
}

/// Bounds for all waits on remote peers
#[derive(Debug, Clone, StructOpt)]
pub struct TimingOptions {
    /// Milliseconds to wait for a remote service to be discovered
    #[structopt(
        long,
        env,
        default_value = "5000",
        parse(try_from_str = parse_millis),
        value_name = "ms"
    )]
    pub discovery_timeout: Duration,

    /// Milliseconds to wait for the response to a single call or subscription
    #[structopt(
        long,
        env,
        default_value = "1000",
        parse(try_from_str = parse_millis),
        value_name = "ms"
    )]
    pub call_timeout: Duration,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_millis(5000),
            call_timeout: Duration::from_millis(1000),
        }
    }
}
