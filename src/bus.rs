//! Actuator-bus abstraction layer.
//!
//! Defines the capability surface the calibration core needs from the
//! hardware layer, without committing to any wire protocol. Real devices
//! implement [`BusAdapter`] on top of their serial driver; tests use the
//! scripted adapter in [`mock`].
//!
//! The physical bus is exclusively driven by the calibration worker while a
//! session is active. No other component may issue reads or writes to the
//! same device concurrently; this is a precondition on the caller, not
//! something the core enforces.

pub mod mock;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::CalibrationRequest;

/// Errors reported by a bus adapter.
#[derive(Error, Debug)]
pub enum BusError {
    /// The shared serial channel was busy with another request. Transient;
    /// callers retry with a short backoff.
    #[error("bus busy: {0}")]
    Busy(String),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Whether this error is transient contention worth retrying.
    pub fn is_busy(&self) -> bool {
        matches!(self, BusError::Busy(_))
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Register-level operating mode for a motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Closed-loop position control.
    Position,
    /// Closed-loop velocity control.
    Velocity,
    /// Open-loop PWM drive.
    Pwm,
}

impl OperatingMode {
    /// Raw value written to the `Operating_Mode` register.
    pub fn register_value(self) -> i32 {
        match self {
            OperatingMode::Position => 0,
            OperatingMode::Velocity => 1,
            OperatingMode::Pwm => 2,
        }
    }
}

/// Static description of one motor on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Motor {
    /// Bus identifier.
    pub id: u8,
    /// Model name, e.g. `"sts3215"`.
    pub model: String,
}

/// Final calibration constants for one motor.
///
/// Produced by the Completing step and handed to the adapter for register
/// write-through and durable persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    pub id: u8,
    pub drive_mode: i32,
    pub homing_offset: i32,
    pub range_min: i32,
    pub range_max: i32,
}

/// Raw full-bus position snapshot: motor name to present position.
pub type PositionSnapshot = HashMap<String, i32>;

/// Capability surface the calibration core needs from the hardware layer.
pub trait BusAdapter: Send {
    /// Establish the connection. `calibrate` selects whether the device
    /// applies stored calibration on connect; the calibration worker always
    /// passes `false`.
    fn connect(&mut self, calibrate: bool) -> BusResult<()>;

    /// Close the connection. Idempotent; safe to call on an already
    /// disconnected device.
    fn disconnect(&mut self) -> BusResult<()>;

    /// Whether the device is currently connected.
    fn is_connected(&self) -> bool;

    /// Disable torque on all motors, allowing free manual movement.
    fn disable_torque(&mut self) -> BusResult<()>;

    /// Set one motor's operating mode register.
    fn set_operating_mode(&mut self, motor: &str, mode: OperatingMode) -> BusResult<()>;

    /// Read present positions of all motors in one request. Fails with
    /// [`BusError::Busy`] when the channel is contended.
    fn read_positions(&mut self) -> BusResult<PositionSnapshot>;

    /// Reset any calibration currently stored on the bus.
    fn reset_calibration(&mut self) -> BusResult<()>;

    /// Compute per-motor homing offsets that place the given snapshot half a
    /// turn from zero.
    fn half_turn_homings(&self, snapshot: &PositionSnapshot) -> HashMap<String, i32>;

    /// Write a named register on one motor.
    fn write_register(&mut self, name: &str, motor: &str, value: i32) -> BusResult<()>;

    /// Write a finished calibration table to the motor registers.
    fn write_calibration(&mut self, table: &HashMap<String, MotorCalibration>) -> BusResult<()>;

    /// Durably save the last written calibration, keyed by device identity.
    fn persist_calibration(&mut self) -> BusResult<()>;

    /// Enumerate the motors on the bus.
    fn motors(&self) -> &HashMap<String, Motor>;
}

/// Builds an unconnected bus adapter for a device description.
///
/// Device construction and configuration loading live outside the core; the
/// control surface only holds one of these and calls it when a session
/// starts.
pub trait DeviceConnector: Send + Sync {
    fn build(&self, request: &CalibrationRequest) -> BusResult<Box<dyn BusAdapter>>;
}

impl<F> DeviceConnector for F
where
    F: Fn(&CalibrationRequest) -> BusResult<Box<dyn BusAdapter>> + Send + Sync,
{
    fn build(&self, request: &CalibrationRequest) -> BusResult<Box<dyn BusAdapter>> {
        self(request)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Position => write!(f, "position"),
            OperatingMode::Velocity => write!(f, "velocity"),
            OperatingMode::Pwm => write!(f, "pwm"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_distinguishable_from_transport_errors() {
        assert!(BusError::Busy("port is in use".into()).is_busy());
        assert!(!BusError::Transport("read failed".into()).is_busy());
        assert!(!BusError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).is_busy());
    }

    #[test]
    fn operating_mode_register_values() {
        assert_eq!(OperatingMode::Position.register_value(), 0);
        assert_eq!(OperatingMode::Velocity.register_value(), 1);
        assert_eq!(OperatingMode::Pwm.register_value(), 2);
    }
}
