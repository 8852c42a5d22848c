//! Well-known addresses and payload texts shared by all roles

use crate::library::communication::{EventAddress, MethodAddress, ServiceAddress};

/// Service offered by the producer of engine measurements
pub const SPEED_REQUEST_SERVICE: ServiceAddress = ServiceAddress::new(0x1111, 0x0001);

/// Method answering with the current engine speed in RPM
pub const SPEED_REQUEST: MethodAddress = SPEED_REQUEST_SERVICE.method(0x0001);

/// Service offered by the monitor
pub const SPEED_VALUE_SERVICE: ServiceAddress = ServiceAddress::new(0x2222, 0x0001);

/// Method receiving the derived vehicle speed in km/h
pub const SPEED_VALUE: MethodAddress = SPEED_VALUE_SERVICE.method(0x0001);

/// Event broadcast whenever a reported speed exceeds the threshold
pub const SPEED_ALERT: EventAddress = SPEED_VALUE_SERVICE.event(0x1001, 0x0001);

/// Acknowledgement returned for every valid speed value
pub const ACK: &str = "ACK";

/// Notification text of [`SPEED_ALERT`]
pub const ALERT: &str = "SPEED_ALERT";
