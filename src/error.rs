use thiserror::Error;

use crate::bus::BusError;
use crate::session::CalibrationPhase;

/// Errors produced by the calibration control surface and worker.
///
/// Transient bus contention never appears here; it is retried inside the
/// worker's read loops. Cancellation is not an error either, it is a clean
/// early return on the worker's own path.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// A calibration session is already active.
    #[error("calibration already active")]
    AlreadyActive,

    /// No calibration session is active.
    #[error("no calibration active")]
    NotActive,

    /// The current phase does not accept this action.
    #[error("cannot complete step in phase: {0}")]
    InvalidPhase(CalibrationPhase),

    /// Could not obtain a clean full-bus snapshot after bounded retries.
    #[error("could not get valid initial positions after {attempts} attempts")]
    NoValidSnapshot { attempts: u32 },

    /// One or more motors never moved during range recording.
    #[error("motors with identical min and max values: {}", motors.join(", "))]
    DegenerateRange { motors: Vec<String> },

    /// Device construction or connection failed.
    #[error("failed to connect to device: {0}")]
    ConnectFailure(String),

    /// The bus adapter reported a non-recoverable failure.
    #[error("bus adapter error: {0}")]
    Adapter(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_range_names_offending_motors() {
        let err = CalibrationError::DegenerateRange {
            motors: vec!["elbow".to_string(), "wrist".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "motors with identical min and max values: elbow, wrist"
        );
    }

    #[test]
    fn invalid_phase_reports_the_phase() {
        let err = CalibrationError::InvalidPhase(CalibrationPhase::Connecting);
        assert_eq!(err.to_string(), "cannot complete step in phase: connecting");
    }
}
