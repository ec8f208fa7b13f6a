//! Tunable policy for the calibration worker.

use std::time::Duration;

/// Retry, filtering and timing policy for a calibration session.
///
/// The defaults match the bus this was built for (feetech-style servos with
/// a 4096-count encoder, polled over a contended USB serial port); every
/// field can be overridden for faster tests or a different bus.
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Readings at or below this raw value are discarded as glitches.
    pub valid_min: i32,
    /// Readings at or above this raw value are discarded as glitches.
    pub valid_max: i32,
    /// Attempts to obtain a fully valid initial snapshot before recording.
    pub snapshot_attempts: u32,
    /// Backoff between initial-snapshot attempts.
    pub snapshot_backoff: Duration,
    /// Read attempts per recording iteration when the bus reports busy.
    pub busy_retries: u32,
    /// Backoff between busy retries.
    pub busy_backoff: Duration,
    /// Backoff after a failed recording iteration, to avoid hammering a
    /// failing channel.
    pub error_backoff: Duration,
    /// Recording poll cadence.
    pub poll_interval: Duration,
    /// Wake resolution while blocked on the operator.
    pub wait_interval: Duration,
    /// Travel below this raw span draws an insufficient-sweep warning.
    pub min_travel: i32,
    /// How long `stop` waits for the worker before forcing cleanup.
    pub stop_timeout: Duration,
    /// Retry delay for the status path's best-effort live read.
    pub status_retry_delay: Duration,
}

impl CalibrationSettings {
    /// Validity predicate for raw position readings; both bounds exclusive.
    pub fn is_valid_position(&self, pos: i32) -> bool {
        pos > self.valid_min && pos < self.valid_max
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            valid_min: 0,
            valid_max: 5000,
            snapshot_attempts: 5,
            snapshot_backoff: Duration::from_millis(100),
            busy_retries: 3,
            busy_backoff: Duration::from_millis(10),
            error_backoff: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            wait_interval: Duration::from_millis(100),
            min_travel: 100,
            stop_timeout: Duration::from_secs(5),
            status_retry_delay: Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CalibrationSettings::default();
        assert_eq!(settings.snapshot_attempts, 5);
        assert_eq!(settings.busy_retries, 3);
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.min_travel, 100);
        assert_eq!(settings.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn validity_band_is_exclusive_on_both_ends() {
        let settings = CalibrationSettings::default();
        assert!(!settings.is_valid_position(0));
        assert!(!settings.is_valid_position(-1));
        assert!(!settings.is_valid_position(5000));
        assert!(!settings.is_valid_position(6000));
        assert!(settings.is_valid_position(1));
        assert!(settings.is_valid_position(4999));
        assert!(settings.is_valid_position(2048));
    }
}
