//! Vehicle telemetry specific identifiers, payload texts and policies

pub mod conversion;
pub mod ids;

pub use conversion::{AlertPolicy, InvalidParameters, VehicleParameters};
