//! Session state shared between the control surface and the worker.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Which side of the teleoperation pair is being calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The robot arm itself.
    Follower,
    /// The teleoperation handle.
    Leader,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Follower => write!(f, "follower"),
            DeviceKind::Leader => write!(f, "leader"),
        }
    }
}

/// Current named state of the calibration state machine.
///
/// ```text
/// Connecting -> Homing -> Recording -> Completing -> Completed
///    any state -> Error                (unhandled fault)
///    any state -> Stopping -> Idle     (external cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Idle,
    Connecting,
    Homing,
    Recording,
    Completing,
    Completed,
    Error,
    Stopping,
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibrationPhase::Idle => "idle",
            CalibrationPhase::Connecting => "connecting",
            CalibrationPhase::Homing => "homing",
            CalibrationPhase::Recording => "recording",
            CalibrationPhase::Completing => "completing",
            CalibrationPhase::Completed => "completed",
            CalibrationPhase::Error => "error",
            CalibrationPhase::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// Observed travel of one motor during range recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorRange {
    pub min: i32,
    pub max: i32,
    pub current: i32,
}

impl MotorRange {
    /// Range seeded from the first valid reading.
    pub fn seed(pos: i32) -> Self {
        Self {
            min: pos,
            max: pos,
            current: pos,
        }
    }

    /// Fold a new valid reading in. Min and max only ever widen.
    pub fn widen(&mut self, pos: i32) {
        self.current = pos;
        self.min = self.min.min(pos);
        self.max = self.max.max(pos);
    }

    /// Raw span covered so far.
    pub fn travel(&self) -> i32 {
        self.max - self.min
    }
}

/// Parameters for starting a calibration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub device_kind: DeviceKind,
    /// Serial port the bus lives on, e.g. `/dev/ttyACM0`.
    pub port: String,
    /// Device identity; also the key under which calibration is persisted.
    pub config_id: String,
}

/// Snapshot of the calibration session, serialized for status polls.
///
/// Invariant: `calibration_active == false` implies the phase is `Idle`,
/// `Completed` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub calibration_active: bool,
    pub phase: CalibrationPhase,
    pub device_kind: Option<DeviceKind>,
    pub error: Option<String>,
    pub message: String,
    pub step: u32,
    pub total_steps: u32,
    pub current_positions: Option<HashMap<String, i32>>,
    pub recorded_ranges: Option<HashMap<String, MotorRange>>,
}

impl Default for CalibrationStatus {
    fn default() -> Self {
        Self {
            calibration_active: false,
            phase: CalibrationPhase::Idle,
            device_kind: None,
            error: None,
            message: String::new(),
            step: 0,
            total_steps: 2,
            current_positions: None,
            recorded_ranges: None,
        }
    }
}

/// Structured `{success, message}` record returned by every control action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn from_result(result: Result<&str, CalibrationError>) -> Self {
        match result {
            Ok(message) => Self {
                success: true,
                message: message.to_string(),
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motor_range_widens_monotonically() {
        let mut range = MotorRange::seed(2048);
        for pos in [2000, 2100, 1500, 3000, 2048] {
            let before = range;
            range.widen(pos);
            assert!(range.min <= before.min);
            assert!(range.max >= before.max);
            assert_eq!(range.current, pos);
        }
        assert_eq!(range.min, 1500);
        assert_eq!(range.max, 3000);
        assert_eq!(range.travel(), 1500);
    }

    #[test]
    fn phase_serializes_to_snake_case() {
        let json = serde_json::to_string(&CalibrationPhase::Recording).unwrap();
        assert_eq!(json, "\"recording\"");
        let phase: CalibrationPhase = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(phase, CalibrationPhase::Error);
    }

    #[test]
    fn default_status_is_inactive_idle() {
        let status = CalibrationStatus::default();
        assert!(!status.calibration_active);
        assert_eq!(status.phase, CalibrationPhase::Idle);
        assert_eq!(status.total_steps, 2);
    }

    #[test]
    fn action_response_carries_error_message() {
        let response = ActionResponse::from_result(Err(CalibrationError::AlreadyActive));
        assert!(!response.success);
        assert_eq!(response.message, "calibration already active");

        let response = ActionResponse::from_result(Ok("Calibration started"));
        assert!(response.success);
        assert_eq!(response.message, "Calibration started");
    }
}
