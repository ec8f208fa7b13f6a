//! Control surface for calibration sessions.
//!
//! One manager serves one device at a time: `start` spawns the worker,
//! `advance_step` releases its operator waits, `stop` cancels it with a
//! bounded join and forced cleanup, and `status` returns a consistent
//! snapshot at any time. Methods run on caller threads and never block on
//! the worker except in `stop`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::{DeviceConnector, PositionSnapshot};
use crate::error::CalibrationError;
use crate::session::{CalibrationPhase, CalibrationRequest, CalibrationStatus, MotorRange};
use crate::settings::CalibrationSettings;
use crate::worker::{release_device, CalibrationWorker, Shared};

/// Manages the calibration process for one actuator bus.
pub struct CalibrationManager {
    shared: Arc<Shared>,
    connector: Arc<dyn DeviceConnector>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CalibrationManager {
    /// Create a manager with default settings.
    pub fn new(connector: impl DeviceConnector + 'static) -> Self {
        Self::with_settings(connector, CalibrationSettings::default())
    }

    /// Create a manager with custom retry/timing policy.
    pub fn with_settings(
        connector: impl DeviceConnector + 'static,
        settings: CalibrationSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(settings)),
            connector: Arc::new(connector),
            worker: Mutex::new(None),
        }
    }

    /// Start a calibration session.
    ///
    /// Fails with [`CalibrationError::AlreadyActive`] if one is running.
    /// Returns as soon as the worker is spawned; progress is observed
    /// through [`status`](Self::status).
    pub fn start(&self, request: CalibrationRequest) -> Result<&'static str, CalibrationError> {
        let mut worker_slot = self.worker.lock().unwrap();

        {
            let mut session = self.shared.session.lock().unwrap();
            if session.calibration_active {
                return Err(CalibrationError::AlreadyActive);
            }
            *session = CalibrationStatus {
                calibration_active: true,
                phase: CalibrationPhase::Connecting,
                device_kind: Some(request.device_kind),
                error: None,
                message: format!("Starting calibration for {}", request.device_kind),
                step: 0,
                total_steps: 2,
                current_positions: None,
                recorded_ranges: None,
            };
        }

        self.shared.cancel.store(false, Ordering::SeqCst);
        *self.shared.advance.lock().unwrap() = false;

        let worker = CalibrationWorker::new(
            self.shared.clone(),
            self.connector.clone(),
            request,
        );
        // A worker leaked by a forced stop is abandoned, not joined; joining
        // here could block a request thread on stuck hardware.
        *worker_slot = Some(thread::spawn(move || worker.run()));

        info!("calibration started");
        Ok("Calibration started")
    }

    /// Complete the current guided step.
    ///
    /// Valid only in the Homing and Recording phases; in Recording it also
    /// marks recording inactive.
    pub fn advance_step(&self) -> Result<&'static str, CalibrationError> {
        let phase = {
            let session = self.shared.session.lock().unwrap();
            if !session.calibration_active {
                return Err(CalibrationError::NotActive);
            }
            session.phase
        };

        match phase {
            CalibrationPhase::Homing => {
                self.shared.request_advance();
                Ok("Homing position set")
            }
            CalibrationPhase::Recording => {
                self.shared.recording_active.store(false, Ordering::SeqCst);
                self.shared.request_advance();
                Ok("Range recording completed")
            }
            other => Err(CalibrationError::InvalidPhase(other)),
        }
    }

    /// Stop the active session.
    ///
    /// Signals cancellation, waits up to the configured timeout for the
    /// worker to exit, then forces cleanup either way: the device is
    /// released and the phase reset to Idle.
    pub fn stop(&self) -> Result<&'static str, CalibrationError> {
        {
            let session = self.shared.session.lock().unwrap();
            if !session.calibration_active {
                return Err(CalibrationError::NotActive);
            }
        }

        info!("stopping calibration process");
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.shared.recording_active.store(false, Ordering::SeqCst);
        self.shared.wake();

        self.shared.update_session(|s| {
            s.phase = CalibrationPhase::Stopping;
            s.message = "Stopping calibration...".to_string();
        });

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + self.shared.settings.stop_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("calibration worker did not finish within timeout, forcing cleanup");
            }
        }

        // Forced cleanup, whether or not the worker exited. Idempotent with
        // the worker's own cleanup path.
        release_device(&self.shared);
        self.shared.update_session(|s| {
            s.calibration_active = false;
            s.phase = CalibrationPhase::Idle;
            s.message = "Calibration stopped".to_string();
        });

        info!("calibration stop completed");
        Ok("Calibration stopped")
    }

    /// Current session snapshot. Never fails.
    ///
    /// During the Recording phase this opportunistically refreshes the live
    /// positions with one best-effort bus read (one quick retry on
    /// contention); any failure leaves the previous snapshot untouched.
    pub fn status(&self) -> CalibrationStatus {
        let recording = {
            let session = self.shared.session.lock().unwrap();
            session.phase == CalibrationPhase::Recording
        };
        if recording {
            if let Some(snapshot) = self.try_live_read() {
                self.merge_live(snapshot);
            }
        }
        self.shared.session.lock().unwrap().clone()
    }

    /// One bus read that must never block behind the worker: a held device
    /// lock counts as contention, and one short retry is all it gets.
    fn try_live_read(&self) -> Option<PositionSnapshot> {
        for attempt in 0..2 {
            match self.shared.device.try_lock() {
                Ok(mut guard) => {
                    let device = guard.as_deref_mut()?;
                    if !device.is_connected() {
                        return None;
                    }
                    match device.read_positions() {
                        Ok(snapshot) => return Some(snapshot),
                        Err(e) if e.is_busy() => {
                            debug!("bus busy during status read: {e}");
                            if attempt > 0 {
                                return None;
                            }
                        }
                        Err(e) => {
                            warn!("failed to read positions for status: {e}");
                            return None;
                        }
                    }
                }
                Err(_) => {
                    debug!("device in use during status read");
                    if attempt > 0 {
                        return None;
                    }
                }
            }
            thread::sleep(self.shared.settings.status_retry_delay);
        }
        None
    }

    /// Widen the published ranges from a live snapshot, filtering invalid
    /// readings. Races with the worker's own updates, but both sides only
    /// ever widen min/max.
    fn merge_live(&self, snapshot: PositionSnapshot) {
        let mut session = self.shared.session.lock().unwrap();
        if session.phase != CalibrationPhase::Recording {
            return;
        }
        let CalibrationStatus {
            current_positions,
            recorded_ranges,
            ..
        } = &mut *session;

        let ranges = recorded_ranges.get_or_insert_with(Default::default);
        let positions = current_positions.get_or_insert_with(Default::default);
        for (motor, pos) in snapshot {
            if !self.shared.settings.is_valid_position(pos) {
                continue;
            }
            positions.insert(motor.clone(), pos);
            ranges
                .entry(motor)
                .and_modify(|r| r.widen(pos))
                .or_insert_with(|| MotorRange::seed(pos));
        }
    }
}
