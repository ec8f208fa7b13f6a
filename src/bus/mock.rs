//! Scripted bus adapter for tests.
//!
//! Behaves like a small actuator bus: reads come from a queue of scripted
//! outcomes, falling back to a settable default snapshot once the queue is
//! drained. Every mutating call is recorded so tests can assert on what the
//! calibration worker did to the hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BusAdapter, BusError, BusResult, Motor, MotorCalibration, OperatingMode, PositionSnapshot};

/// Half of the 4096-count encoder resolution; the mock's homing computation
/// zeroes each motor half a turn from its snapshot position.
const HALF_TURN: i32 = 2048;

#[derive(Default)]
struct MockBusInner {
    connected: bool,
    connect_error: Option<String>,
    connect_delay: Option<Duration>,
    torque_disabled: bool,
    operating_modes: HashMap<String, i32>,
    scripted_reads: VecDeque<BusResult<PositionSnapshot>>,
    default_positions: PositionSnapshot,
    read_count: usize,
    reset_calibration_count: usize,
    written_registers: Vec<(String, String, i32)>,
    written_calibration: Option<HashMap<String, MotorCalibration>>,
    persisted: bool,
    disconnect_count: usize,
}

/// Scripted in-memory bus adapter.
///
/// Clones share state, so a test can hand one clone to the calibration
/// manager's connector and keep another to script reads and inspect writes.
#[derive(Clone)]
pub struct MockBus {
    motors: HashMap<String, Motor>,
    inner: Arc<Mutex<MockBusInner>>,
}

impl MockBus {
    /// Create a bus with the given motors, all reads returning `positions`
    /// until scripted otherwise.
    pub fn new(motors: &[(&str, u8)], positions: PositionSnapshot) -> Self {
        let motors = motors
            .iter()
            .map(|(name, id)| {
                (
                    name.to_string(),
                    Motor {
                        id: *id,
                        model: "sts3215".to_string(),
                    },
                )
            })
            .collect();
        let inner = MockBusInner {
            default_positions: positions,
            ..Default::default()
        };
        Self {
            motors,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Queue one read outcome; consumed before the default snapshot.
    pub fn push_read(&self, outcome: BusResult<PositionSnapshot>) {
        self.inner.lock().unwrap().scripted_reads.push_back(outcome);
    }

    /// Replace the snapshot returned once the scripted queue is empty.
    pub fn set_positions(&self, positions: PositionSnapshot) {
        self.inner.lock().unwrap().default_positions = positions;
    }

    /// Make the next `connect` call fail.
    pub fn fail_connect(&self, message: &str) {
        self.inner.lock().unwrap().connect_error = Some(message.to_string());
    }

    /// Delay `connect` calls, simulating slow device bring-up.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().connect_delay = Some(delay);
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub fn torque_disabled(&self) -> bool {
        self.inner.lock().unwrap().torque_disabled
    }

    pub fn operating_mode(&self, motor: &str) -> Option<i32> {
        self.inner.lock().unwrap().operating_modes.get(motor).copied()
    }

    pub fn read_count(&self) -> usize {
        self.inner.lock().unwrap().read_count
    }

    pub fn reset_calibration_count(&self) -> usize {
        self.inner.lock().unwrap().reset_calibration_count
    }

    /// `(register, motor, value)` triples in write order.
    pub fn written_registers(&self) -> Vec<(String, String, i32)> {
        self.inner.lock().unwrap().written_registers.clone()
    }

    pub fn written_calibration(&self) -> Option<HashMap<String, MotorCalibration>> {
        self.inner.lock().unwrap().written_calibration.clone()
    }

    pub fn persisted(&self) -> bool {
        self.inner.lock().unwrap().persisted
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.lock().unwrap().disconnect_count
    }
}

impl BusAdapter for MockBus {
    fn connect(&mut self, _calibrate: bool) -> BusResult<()> {
        let delay = self.inner.lock().unwrap().connect_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.connect_error.take() {
            return Err(BusError::Transport(message));
        }
        inner.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> BusResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.disconnect_count += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected()
    }

    fn disable_torque(&mut self) -> BusResult<()> {
        self.inner.lock().unwrap().torque_disabled = true;
        Ok(())
    }

    fn set_operating_mode(&mut self, motor: &str, mode: OperatingMode) -> BusResult<()> {
        self.inner
            .lock()
            .unwrap()
            .operating_modes
            .insert(motor.to_string(), mode.register_value());
        Ok(())
    }

    fn read_positions(&mut self) -> BusResult<PositionSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_count += 1;
        match inner.scripted_reads.pop_front() {
            Some(outcome) => outcome,
            None => Ok(inner.default_positions.clone()),
        }
    }

    fn reset_calibration(&mut self) -> BusResult<()> {
        self.inner.lock().unwrap().reset_calibration_count += 1;
        Ok(())
    }

    fn half_turn_homings(&self, snapshot: &PositionSnapshot) -> HashMap<String, i32> {
        snapshot
            .iter()
            .map(|(motor, pos)| (motor.clone(), pos - HALF_TURN))
            .collect()
    }

    fn write_register(&mut self, name: &str, motor: &str, value: i32) -> BusResult<()> {
        self.inner
            .lock()
            .unwrap()
            .written_registers
            .push((name.to_string(), motor.to_string(), value));
        Ok(())
    }

    fn write_calibration(&mut self, table: &HashMap<String, MotorCalibration>) -> BusResult<()> {
        self.inner.lock().unwrap().written_calibration = Some(table.clone());
        Ok(())
    }

    fn persist_calibration(&mut self) -> BusResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.written_calibration.is_none() {
            return Err(BusError::Transport("no calibration written".to_string()));
        }
        inner.persisted = true;
        Ok(())
    }

    fn motors(&self) -> &HashMap<String, Motor> {
        &self.motors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, i32)]) -> PositionSnapshot {
        pairs.iter().map(|(m, p)| (m.to_string(), *p)).collect()
    }

    #[test]
    fn scripted_reads_are_consumed_before_default() {
        let bus = MockBus::new(&[("shoulder", 1)], snapshot(&[("shoulder", 2048)]));
        bus.push_read(Err(BusError::Busy("port is in use".into())));
        bus.push_read(Ok(snapshot(&[("shoulder", 1000)])));

        let mut adapter = bus.clone();
        assert!(adapter.read_positions().unwrap_err().is_busy());
        assert_eq!(adapter.read_positions().unwrap()["shoulder"], 1000);
        assert_eq!(adapter.read_positions().unwrap()["shoulder"], 2048);
        assert_eq!(bus.read_count(), 3);
    }

    #[test]
    fn half_turn_homings_center_each_motor() {
        let bus = MockBus::new(&[("shoulder", 1)], PositionSnapshot::new());
        let homings = bus.half_turn_homings(&snapshot(&[("shoulder", 2148), ("elbow", 1948)]));
        assert_eq!(homings["shoulder"], 100);
        assert_eq!(homings["elbow"], -100);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let bus = MockBus::new(&[("shoulder", 1)], PositionSnapshot::new());
        let mut adapter = bus.clone();
        adapter.connect(false).unwrap();
        assert!(bus.connected());
        adapter.disconnect().unwrap();
        adapter.disconnect().unwrap();
        assert!(!bus.connected());
        assert_eq!(bus.disconnect_count(), 2);
    }

    #[test]
    fn failed_connect_reports_transport_error() {
        let bus = MockBus::new(&[("shoulder", 1)], PositionSnapshot::new());
        bus.fail_connect("no such port");
        let mut adapter = bus.clone();
        let err = adapter.connect(false).unwrap_err();
        assert!(err.to_string().contains("no such port"));
        assert!(!bus.connected());
    }
}
