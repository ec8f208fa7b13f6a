//! ARMCAL - guided calibration core for multi-joint actuator buses.
//!
//! Walks a human operator through calibrating a robotic arm or
//! teleoperation handle over a contended serial bus, in two guided steps:
//!
//! 1. **Homing** - the operator moves the device to the middle of its range;
//!    per-motor homing offsets are derived from one full-bus snapshot and
//!    written back to the motors.
//! 2. **Recording** - the operator sweeps every joint through its full range
//!    while the worker polls positions at ~20 Hz, filters glitch readings
//!    and widens per-motor min/max.
//!
//! The finished per-motor constants (homing offset, range min/max) are
//! written through the [`BusAdapter`] and persisted durably. A
//! [`CalibrationManager`] owns the session: `start` spawns the worker
//! thread, `advance_step` completes the current guided step, `stop` cancels
//! with bounded cleanup, and `status` returns a consistent snapshot at any
//! time, from any thread.
//!
//! The hardware layer is abstracted behind [`BusAdapter`] and
//! [`DeviceConnector`]; see [`bus::mock`] for the scripted adapter the test
//! suite drives sessions with.

pub mod bus;
pub mod error;
pub mod manager;
pub mod session;
pub mod settings;
pub mod store;
mod worker;

pub use crate::bus::{
    BusAdapter, BusError, BusResult, DeviceConnector, Motor, MotorCalibration, OperatingMode,
    PositionSnapshot,
};
pub use crate::error::CalibrationError;
pub use crate::manager::CalibrationManager;
pub use crate::session::{
    ActionResponse, CalibrationPhase, CalibrationRequest, CalibrationStatus, DeviceKind,
    MotorRange,
};
pub use crate::settings::CalibrationSettings;
pub use crate::store::{CalibrationStore, StoredCalibration};
