//! The calibration state machine.
//!
//! One worker runs per session, on its own thread, and drives the step
//! sequence: connect the device, guide the operator through homing, record
//! the range of motion at the poll cadence, then write the finished table
//! through the adapter. All session state it publishes lives behind the
//! shared status lock; the device handle lives behind its own mutex so the
//! status path can take best-effort reads without queueing behind slow bus
//! calls.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::bus::{BusAdapter, BusError, BusResult, DeviceConnector, MotorCalibration, OperatingMode, PositionSnapshot};
use crate::error::CalibrationError;
use crate::session::{CalibrationPhase, CalibrationRequest, CalibrationStatus, MotorRange};
use crate::settings::CalibrationSettings;

/// How an operator wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepWait {
    Advanced,
    Cancelled,
}

/// How one guided step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Done,
    Cancelled,
}

/// How the whole drive sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Cancelled,
}

/// State shared between the control surface and the worker thread.
pub(crate) struct Shared {
    pub(crate) session: Mutex<CalibrationStatus>,
    pub(crate) device: Mutex<Option<Box<dyn BusAdapter>>>,
    pub(crate) advance: Mutex<bool>,
    pub(crate) advance_cv: Condvar,
    pub(crate) cancel: AtomicBool,
    pub(crate) recording_active: AtomicBool,
    pub(crate) settings: CalibrationSettings,
}

impl Shared {
    pub(crate) fn new(settings: CalibrationSettings) -> Self {
        Self {
            session: Mutex::new(CalibrationStatus::default()),
            device: Mutex::new(None),
            advance: Mutex::new(false),
            advance_cv: Condvar::new(),
            cancel: AtomicBool::new(false),
            recording_active: AtomicBool::new(false),
            settings,
        }
    }

    /// Mutate the session snapshot under the status lock.
    pub(crate) fn update_session(&self, f: impl FnOnce(&mut CalibrationStatus)) {
        let mut session = self.session.lock().unwrap();
        f(&mut session);
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Signal the worker to leave its current operator wait.
    pub(crate) fn request_advance(&self) {
        *self.advance.lock().unwrap() = true;
        self.advance_cv.notify_all();
    }

    /// Wake the worker without setting the advance flag (cancellation path).
    pub(crate) fn wake(&self) {
        self.advance_cv.notify_all();
    }

    /// Consume a pending advance request, if any.
    fn take_advance(&self) -> bool {
        let mut advance = self.advance.lock().unwrap();
        std::mem::take(&mut *advance)
    }

    /// Block until the operator advances or cancellation arrives.
    pub(crate) fn wait_for_advance(&self) -> StepWait {
        let mut advance = self.advance.lock().unwrap();
        loop {
            if self.cancelled() {
                return StepWait::Cancelled;
            }
            if std::mem::take(&mut *advance) {
                return StepWait::Advanced;
            }
            let (guard, _) = self
                .advance_cv
                .wait_timeout(advance, self.settings.wait_interval)
                .unwrap();
            advance = guard;
        }
    }

    /// Sleep for at most `dur`, waking early on advance or cancel signals.
    fn pause(&self, dur: std::time::Duration) {
        let advance = self.advance.lock().unwrap();
        if *advance || self.cancelled() {
            return;
        }
        let _ = self.advance_cv.wait_timeout(advance, dur).unwrap();
    }
}

/// Release the device handle if still held. Safe to invoke from either the
/// worker's own exit path or the forced-stop path; the `take` makes a second
/// invocation a no-op.
pub(crate) fn release_device(shared: &Shared) {
    let device = shared.device.lock().unwrap().take();
    if let Some(mut device) = device {
        info!("disconnecting device");
        if let Err(e) = device.disconnect() {
            error!("error disconnecting device: {e}");
        }
    }
}

/// One calibration session's worker. Owns the range accumulators and the
/// homing offset table; nothing else touches them.
pub(crate) struct CalibrationWorker {
    shared: Arc<Shared>,
    connector: Arc<dyn DeviceConnector>,
    request: CalibrationRequest,
    start_positions: PositionSnapshot,
    mins: HashMap<String, i32>,
    maxes: HashMap<String, i32>,
    homing_offsets: HashMap<String, i32>,
}

impl CalibrationWorker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        connector: Arc<dyn DeviceConnector>,
        request: CalibrationRequest,
    ) -> Self {
        Self {
            shared,
            connector,
            request,
            start_positions: PositionSnapshot::new(),
            mins: HashMap::new(),
            maxes: HashMap::new(),
            homing_offsets: HashMap::new(),
        }
    }

    /// Worker thread entry point. Whatever happens inside, the session ends
    /// inactive and the device released.
    pub(crate) fn run(mut self) {
        info!(
            device_kind = %self.request.device_kind,
            port = %self.request.port,
            "starting calibration worker"
        );

        match catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(Ok(RunOutcome::Completed)) => {
                info!("calibration completed successfully");
                self.cleanup_and_finish(
                    CalibrationPhase::Completed,
                    "Calibration completed successfully".to_string(),
                );
            }
            Ok(Ok(RunOutcome::Cancelled)) => {
                info!("calibration cancelled");
                self.cleanup_and_finish(CalibrationPhase::Idle, "Calibration cancelled".to_string());
            }
            Ok(Err(e)) => {
                error!("calibration error: {e}");
                self.shared.update_session(|s| s.error = Some(e.to_string()));
                self.cleanup_and_finish(CalibrationPhase::Error, format!("Calibration failed: {e}"));
            }
            Err(_) => {
                error!("calibration worker panicked");
                self.shared
                    .update_session(|s| s.error = Some("internal error".to_string()));
                self.cleanup_and_finish(
                    CalibrationPhase::Error,
                    "Calibration failed: internal error".to_string(),
                );
            }
        }

        let still_active = self.shared.session.lock().unwrap().calibration_active;
        if still_active {
            warn!("worker exiting with session still marked active, forcing cleanup");
            self.cleanup_and_finish(CalibrationPhase::Idle, "Calibration stopped".to_string());
        }
        info!("calibration worker finished");
    }

    fn drive(&mut self) -> Result<RunOutcome, CalibrationError> {
        self.connect_device()?;
        if self.shared.cancelled() {
            info!("calibration stopped after device connection");
            return Ok(RunOutcome::Cancelled);
        }

        if self.step_homing()? == StepOutcome::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }
        if self.step_recording()? == StepOutcome::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }

        self.complete()?;
        Ok(RunOutcome::Completed)
    }

    fn connect_device(&mut self) -> Result<(), CalibrationError> {
        self.shared.update_session(|s| {
            s.phase = CalibrationPhase::Connecting;
            s.message = "Connecting to device...".to_string();
        });

        let mut device = self
            .connector
            .build(&self.request)
            .map_err(|e| CalibrationError::ConnectFailure(e.to_string()))?;
        device
            .connect(false)
            .map_err(|e| CalibrationError::ConnectFailure(e.to_string()))?;
        info!("connected to {} device", self.request.device_kind);

        *self.shared.device.lock().unwrap() = Some(device);
        Ok(())
    }

    /// Run a bus operation with the device lock held only for its duration.
    fn with_device<T>(
        &self,
        f: impl FnOnce(&mut dyn BusAdapter) -> BusResult<T>,
    ) -> Result<T, CalibrationError> {
        let mut guard = self.shared.device.lock().unwrap();
        let device = guard
            .as_deref_mut()
            .ok_or_else(|| CalibrationError::ConnectFailure("device not connected".to_string()))?;
        f(device).map_err(CalibrationError::from)
    }

    fn read_positions(&self) -> BusResult<PositionSnapshot> {
        let mut guard = self.shared.device.lock().unwrap();
        match guard.as_deref_mut() {
            Some(device) => device.read_positions(),
            None => Err(BusError::Transport("device not connected".to_string())),
        }
    }

    /// Read positions, retrying on bus contention up to the configured
    /// attempt count. Errors other than contention surface immediately.
    fn read_positions_retrying(&self) -> BusResult<PositionSnapshot> {
        let retries = self.shared.settings.busy_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.read_positions() {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_busy() && attempt < retries => {
                    debug!("bus busy during position read (attempt {attempt}): {e}");
                    attempt += 1;
                    thread::sleep(self.shared.settings.busy_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Step 1: let the operator set the home position, then derive and write
    /// homing offsets from a single snapshot.
    fn step_homing(&mut self) -> Result<StepOutcome, CalibrationError> {
        info!("starting homing step");

        self.with_device(|d| d.disable_torque())?;
        let motor_names: Vec<String> =
            self.with_device(|d| Ok(d.motors().keys().cloned().collect()))?;
        for motor in &motor_names {
            self.with_device(|d| d.set_operating_mode(motor, OperatingMode::Position))?;
        }

        self.shared.update_session(|s| {
            s.phase = CalibrationPhase::Homing;
            s.step = 1;
            s.message =
                "Move the device to the middle of its range of motion, then complete the step"
                    .to_string();
        });

        if self.shared.wait_for_advance() == StepWait::Cancelled {
            info!("homing step cancelled due to stop request");
            return Ok(StepOutcome::Cancelled);
        }

        info!("setting homing offsets");
        self.with_device(|d| d.reset_calibration())?;
        let snapshot = self.with_device(|d| d.read_positions())?;
        debug!("current positions for homing: {snapshot:?}");

        self.homing_offsets = self.with_device(|d| Ok(d.half_turn_homings(&snapshot)))?;
        info!("calculated homing offsets: {:?}", self.homing_offsets);

        for (motor, offset) in &self.homing_offsets {
            self.with_device(|d| d.write_register("Homing_Offset", motor, *offset))?;
        }

        info!("homing step completed");
        Ok(StepOutcome::Done)
    }

    /// Obtain an initial snapshot where every motor reads valid, with
    /// bounded retries.
    fn initial_snapshot(&self) -> Result<PositionSnapshot, CalibrationError> {
        let attempts = self.shared.settings.snapshot_attempts;
        for attempt in 1..=attempts {
            match self.read_positions() {
                Ok(snapshot) => {
                    let all_valid = !snapshot.is_empty()
                        && snapshot
                            .values()
                            .all(|&pos| self.shared.settings.is_valid_position(pos));
                    if all_valid {
                        return Ok(snapshot);
                    }
                    warn!("attempt {attempt}: got invalid initial positions, retrying");
                }
                Err(e) => {
                    warn!("attempt {attempt}: failed to read initial positions: {e}");
                }
            }
            thread::sleep(self.shared.settings.snapshot_backoff);
        }
        Err(CalibrationError::NoValidSnapshot { attempts })
    }

    /// Step 2: poll the bus while the operator sweeps every joint through
    /// its full range, widening per-motor min/max from valid readings only.
    fn step_recording(&mut self) -> Result<StepOutcome, CalibrationError> {
        info!("starting range recording step");

        self.start_positions = self.initial_snapshot()?;
        info!("starting positions for range recording: {:?}", self.start_positions);

        self.mins = self.start_positions.clone();
        self.maxes = self.start_positions.clone();

        let seeded: HashMap<String, MotorRange> = self
            .start_positions
            .iter()
            .map(|(motor, &pos)| (motor.clone(), MotorRange::seed(pos)))
            .collect();
        self.shared.update_session(|s| {
            s.phase = CalibrationPhase::Recording;
            s.step = 2;
            s.message = "Move ALL joints through their FULL ranges of motion, from minimum \
                         to maximum positions"
                .to_string();
            s.recorded_ranges = Some(seeded);
        });
        self.shared.recording_active.store(true, Ordering::SeqCst);

        loop {
            if self.shared.cancelled() {
                info!("range recording cancelled due to stop request");
                return Ok(StepOutcome::Cancelled);
            }
            if self.shared.take_advance() {
                break;
            }

            match self.read_positions_retrying() {
                Ok(snapshot) => {
                    self.fold_snapshot(&snapshot);
                    self.shared.pause(self.shared.settings.poll_interval);
                }
                Err(e) if e.is_busy() => {
                    debug!("bus busy during position read: {e}");
                    self.shared.pause(self.shared.settings.error_backoff);
                }
                Err(e) => {
                    warn!("error reading positions during recording: {e}");
                    self.shared.pause(self.shared.settings.error_backoff);
                }
            }
        }

        info!("final recorded ranges:");
        let mut motors: Vec<&String> = self.mins.keys().collect();
        motors.sort();
        for motor in &motors {
            let min = self.mins[motor.as_str()];
            let max = self.maxes[motor.as_str()];
            info!("  {motor}: min={min}, max={max}, travel={}", max - min);
        }

        let degenerate: Vec<String> = motors
            .iter()
            .filter(|m| self.mins[m.as_str()] == self.maxes[m.as_str()])
            .map(|m| m.to_string())
            .collect();
        if !degenerate.is_empty() {
            return Err(CalibrationError::DegenerateRange { motors: degenerate });
        }

        let insufficient: Vec<String> = motors
            .iter()
            .filter_map(|m| {
                let travel = self.maxes[m.as_str()] - self.mins[m.as_str()];
                (travel < self.shared.settings.min_travel).then(|| format!("{m}: {travel}"))
            })
            .collect();
        if !insufficient.is_empty() {
            warn!(
                "some motors may not have been moved through sufficient range: {}",
                insufficient.join(", ")
            );
        }

        info!("range recording step completed");
        Ok(StepOutcome::Done)
    }

    /// Fold one snapshot into the accumulators and the published ranges,
    /// discarding readings outside the validity band.
    fn fold_snapshot(&mut self, snapshot: &PositionSnapshot) {
        let mut valid = PositionSnapshot::new();
        for (motor, &pos) in snapshot {
            if !self.shared.settings.is_valid_position(pos) {
                debug!("filtered invalid position for {motor}: {pos}");
                continue;
            }
            valid.insert(motor.clone(), pos);
            if let Some(min) = self.mins.get_mut(motor) {
                *min = (*min).min(pos);
            }
            if let Some(max) = self.maxes.get_mut(motor) {
                *max = (*max).max(pos);
            }
        }

        if valid.is_empty() {
            return;
        }
        self.shared.update_session(|s| {
            let ranges = s.recorded_ranges.get_or_insert_with(HashMap::new);
            for (motor, &pos) in &valid {
                ranges
                    .entry(motor.clone())
                    .and_modify(|r| r.widen(pos))
                    .or_insert_with(|| MotorRange::seed(pos));
            }
            s.current_positions = Some(valid);
        });
    }

    /// Assemble the final table for every motor on the bus and hand it to
    /// the adapter for write-through and durable persistence.
    fn complete(&mut self) -> Result<(), CalibrationError> {
        info!("completing calibration");
        self.shared.update_session(|s| {
            s.phase = CalibrationPhase::Completing;
            s.message = "Saving calibration...".to_string();
        });

        let motors = self.with_device(|d| Ok(d.motors().clone()))?;
        let mut table = HashMap::new();
        for (name, motor) in &motors {
            let homing_offset = *self.homing_offsets.get(name).ok_or_else(|| {
                BusError::Transport(format!("no homing offset recorded for motor {name}"))
            })?;
            let range_min = *self.mins.get(name).ok_or_else(|| {
                BusError::Transport(format!("no recorded range for motor {name}"))
            })?;
            let range_max = *self.maxes.get(name).ok_or_else(|| {
                BusError::Transport(format!("no recorded range for motor {name}"))
            })?;
            info!(
                "calibration for {name}: id={}, homing_offset={homing_offset}, \
                 range=[{range_min}, {range_max}]",
                motor.id
            );
            table.insert(
                name.clone(),
                MotorCalibration {
                    id: motor.id,
                    drive_mode: 0,
                    homing_offset,
                    range_min,
                    range_max,
                },
            );
        }

        self.with_device(|d| d.write_calibration(&table))?;
        self.with_device(|d| d.persist_calibration())?;
        info!("calibration saved");
        Ok(())
    }

    /// Terminal path: release the device, clear the recording flag and set
    /// the final phase. Idempotent.
    fn cleanup_and_finish(&self, phase: CalibrationPhase, message: String) {
        release_device(&self.shared);
        self.shared.recording_active.store(false, Ordering::SeqCst);
        self.shared.update_session(|s| {
            s.calibration_active = false;
            s.phase = phase;
            s.message = message;
        });
    }
}
