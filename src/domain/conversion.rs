//! Conversion of engine speed into vehicle speed and the alert threshold

use serde::Serialize;
use std::f32::consts::PI;
use thiserror::Error;

/// Parameter that can not describe a real vehicle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidParameters {
    /// Wheel radius is zero, negative or not finite
    #[error("wheel radius must be a positive number of meters, got {0}")]
    WheelRadius(f32),
    /// Gear ratio is zero, negative or not finite
    #[error("gear ratio must be positive, got {0}")]
    GearRatio(f32),
}

/// Drivetrain geometry used to derive the vehicle speed
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VehicleParameters {
    wheel_radius_m: f32,
    gear_ratio: f32,
}

impl Default for VehicleParameters {
    fn default() -> Self {
        Self {
            wheel_radius_m: 0.3,
            gear_ratio: 3.5,
        }
    }
}

impl VehicleParameters {
    /// Creates a new instance, rejecting values which would yield infinite or undefined speeds
    pub fn new(wheel_radius_m: f32, gear_ratio: f32) -> Result<Self, InvalidParameters> {
        if !(wheel_radius_m.is_finite() && wheel_radius_m > 0.0) {
            return Err(InvalidParameters::WheelRadius(wheel_radius_m));
        }

        if !(gear_ratio.is_finite() && gear_ratio > 0.0) {
            return Err(InvalidParameters::GearRatio(gear_ratio));
        }

        Ok(Self {
            wheel_radius_m,
            gear_ratio,
        })
    }

    /// Radius of the driven wheels in meters
    pub fn wheel_radius_m(&self) -> f32 {
        self.wheel_radius_m
    }

    /// Ratio between engine and wheel revolutions
    pub fn gear_ratio(&self) -> f32 {
        self.gear_ratio
    }

    /// Derives the vehicle speed in km/h from the engine speed in RPM
    ///
    /// Negative RPM values yield negative speeds, no clamping is applied.
    pub fn convert(&self, rpm: i32) -> f32 {
        let wheel_rpm = rpm as f32 / self.gear_ratio;
        let meters_per_minute = wheel_rpm * 2.0 * PI * self.wheel_radius_m;

        meters_per_minute * 60.0 / 1000.0
    }
}

/// Threshold deciding when a speed is reported as an alert
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlertPolicy {
    /// Speed in km/h which has to be exceeded
    pub threshold_kmh: f32,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            threshold_kmh: 100.0,
        }
    }
}

impl AlertPolicy {
    /// Whether the speed strictly exceeds the threshold, `NaN` never does
    pub fn should_alert(&self, speed_kmh: f32) -> bool {
        should_alert(speed_kmh, self.threshold_kmh)
    }
}

/// Derives the vehicle speed in km/h, see [`VehicleParameters::convert`]
pub fn convert(rpm: i32, vehicle: &VehicleParameters) -> f32 {
    vehicle.convert(rpm)
}

/// Whether `speed_kmh` strictly exceeds `threshold_kmh`
pub fn should_alert(speed_kmh: f32, threshold_kmh: f32) -> bool {
    speed_kmh > threshold_kmh
}
