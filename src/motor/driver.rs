// High-level motor driver for the arm
//
// Converts joint-space setpoints into servo commands (gear ratio, encoder
// resolution, direction, coupled wrist) and servo feedback back into joint
// space. Every transaction goes through the single `MksBus`.

use tracing::{debug, info, warn};

use super::mks::{
    BusError, CommandCode, MksBus, MotorFlags, Request, Status, Transaction, Transport,
};
use crate::config::{ArmConfig, GripperConfig, MotorDescriptor};
use crate::motion::types::{GripperCommand, JointVector};

/// Servo speed range (RPM)
pub const MAX_RPM: i16 = 3000;
/// Acceleration byte used for streamed setpoints
pub const STREAM_ACCEL: u8 = 200;
/// Acceleration byte used for stops
pub const STOP_ACCEL: u8 = u8::MAX;
/// Speed used while seeking the home switch and the homing offset (RPM)
pub const HOMING_RPM: i16 = 300;

/// Decoded response from one motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackFrame {
    pub address: u8,
    /// Raw encoder position (counts)
    pub position: i32,
    /// Signed speed (RPM)
    pub speed: i16,
    pub flags: MotorFlags,
    pub status: Status,
    pub retries: u8,
}

impl From<Transaction> for FeedbackFrame {
    fn from(tx: Transaction) -> Self {
        Self {
            address: tx.response.address,
            position: tx.response.position,
            speed: tx.response.speed,
            flags: tx.response.flags,
            status: tx.response.status,
            retries: tx.retries,
        }
    }
}

/// Joint-space view of one round of feedback
#[derive(Debug, Clone, PartialEq)]
pub struct JointFeedback {
    /// Joint angles with joint velocities
    pub joints: JointVector,
    pub frames: Vec<FeedbackFrame>,
}

impl JointFeedback {
    /// First motor reporting a stall or end-limit hit
    pub fn faulted_motor(&self) -> Option<usize> {
        self.frames.iter().position(|f| f.flags.faulted())
    }

    pub fn retries(&self) -> u32 {
        self.frames.iter().map(|f| u32::from(f.retries)).sum()
    }
}

/// High-level driver for the arm's servos and gripper
pub struct MotorDriver {
    bus: MksBus,
    motors: Vec<MotorDescriptor>,
    gripper: GripperConfig,
    coupled_wrist: bool,
    estop_threshold_rpm: i16,
    /// Last speed each motor reported (RPM)
    last_speed: Vec<i16>,
}

impl MotorDriver {
    pub fn new(transport: Box<dyn Transport>, config: &ArmConfig) -> Self {
        Self {
            bus: MksBus::new(transport, config.bus.max_retries),
            motors: config.motors.clone(),
            gripper: config.gripper.clone(),
            coupled_wrist: config.coupled_wrist,
            estop_threshold_rpm: config.estop_speed_threshold_rpm,
            last_speed: vec![0; config.motors.len()],
        }
    }

    pub fn motor(&self, index: usize) -> &MotorDescriptor {
        &self.motors[index]
    }

    /// Joint angles to motor shaft angles (still in joint units, before gearing)
    pub fn joints_to_motor(&self, joints: &[f64]) -> Vec<f64> {
        let mut m = joints.to_vec();
        if self.coupled_wrist && m.len() >= 2 {
            let n = m.len();
            let (a, b) = (joints[n - 2], joints[n - 1]);
            m[n - 2] = a + b;
            m[n - 1] = a - b;
        }
        m
    }

    /// Inverse of `joints_to_motor`
    pub fn motor_to_joints(&self, motor: &[f64]) -> Vec<f64> {
        let mut j = motor.to_vec();
        if self.coupled_wrist && j.len() >= 2 {
            let n = j.len();
            let (a, b) = (motor[n - 2], motor[n - 1]);
            j[n - 2] = 0.5 * (a + b);
            j[n - 1] = 0.5 * (a - b);
        }
        j
    }

    pub fn angle_to_counts(&self, motor: usize, angle: f64) -> i32 {
        let counts = (angle * self.motors[motor].counts_per_radian()).round();
        counts.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
    }

    pub fn counts_to_angle(&self, motor: usize, counts: i32) -> f64 {
        f64::from(counts) / self.motors[motor].counts_per_radian()
    }

    /// Joint-side angular velocity (rad/s) to signed servo RPM, clamped
    pub fn velocity_to_rpm(&self, motor: usize, velocity: f64) -> i16 {
        let m = &self.motors[motor];
        let rpm = velocity * m.gear_ratio * f64::from(m.direction) * 60.0
            / (2.0 * std::f64::consts::PI);
        rpm.round()
            .clamp(-f64::from(MAX_RPM), f64::from(MAX_RPM)) as i16
    }

    pub fn rpm_to_velocity(&self, motor: usize, rpm: i16) -> f64 {
        let m = &self.motors[motor];
        f64::from(rpm) * 2.0 * std::f64::consts::PI
            / (60.0 * m.gear_ratio * f64::from(m.direction))
    }

    fn transact(&mut self, request: Request) -> Result<FeedbackFrame, BusError> {
        let frame = FeedbackFrame::from(self.bus.transact(request)?);
        if let Some(i) = self.motors.iter().position(|m| m.address == frame.address) {
            self.last_speed[i] = frame.speed;
        }
        Ok(frame)
    }

    /// Status query of one motor
    pub fn query(&mut self, motor: usize) -> Result<FeedbackFrame, BusError> {
        let address = self.motors[motor].address;
        self.transact(Request::new(address, CommandCode::QueryStatus))
    }

    /// Query every motor; the first absent motor fails the whole check
    pub fn ping_all(&mut self) -> Result<Vec<FeedbackFrame>, BusError> {
        let mut frames = Vec::with_capacity(self.motors.len());
        for i in 0..self.motors.len() {
            let frame = self.query(i)?;
            debug!("Motor {} ({}) responding", self.motors[i].address, self.motors[i].name);
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Enable or disable torque on every motor
    pub fn enable_all(&mut self, enabled: bool) -> Result<(), BusError> {
        info!(
            "{} torque on all motors",
            if enabled { "Enabling" } else { "Disabling" }
        );
        for i in 0..self.motors.len() {
            let address = self.motors[i].address;
            self.transact(
                Request::new(address, CommandCode::Enable).with_position(i32::from(enabled)),
            )?;
        }
        Ok(())
    }

    /// Start the home-switch seek on one motor
    pub fn go_home(&mut self, motor: usize) -> Result<FeedbackFrame, BusError> {
        let address = self.motors[motor].address;
        debug!("Homing motor {}", address);
        self.transact(Request::new(address, CommandCode::GoHome).with_speed(HOMING_RPM, STREAM_ACCEL))
    }

    /// Absolute move in raw encoder counts
    pub fn move_to_counts(
        &mut self,
        motor: usize,
        counts: i32,
        rpm: i16,
    ) -> Result<FeedbackFrame, BusError> {
        let address = self.motors[motor].address;
        self.transact(
            Request::new(address, CommandCode::PositionTarget)
                .with_position(counts)
                .with_speed(rpm.clamp(1, MAX_RPM), STREAM_ACCEL),
        )
    }

    /// Declare the motor's current position to be zero
    pub fn set_zero(&mut self, motor: usize) -> Result<FeedbackFrame, BusError> {
        let address = self.motors[motor].address;
        debug!("Zeroing motor {}", address);
        self.transact(Request::new(address, CommandCode::SetZero))
    }

    /// Stream one joint setpoint to every motor.
    ///
    /// Servo speed comes from the setpoint's velocities when present,
    /// otherwise from the distance to `previous` over `dt`.
    pub fn send_setpoint(
        &mut self,
        joints: &JointVector,
        previous: &JointVector,
        dt: f64,
    ) -> Result<Vec<FeedbackFrame>, BusError> {
        let target = self.joints_to_motor(&joints.positions);
        let velocity = match &joints.velocities {
            Some(v) => self.joints_to_motor(v),
            None => {
                let from = self.joints_to_motor(&previous.positions);
                target
                    .iter()
                    .zip(&from)
                    .map(|(t, f)| (t - f) / dt.max(1e-6))
                    .collect()
            }
        };

        let mut frames = Vec::with_capacity(self.motors.len());
        for i in 0..self.motors.len() {
            let counts = self.angle_to_counts(i, target[i]);
            let rpm = self.velocity_to_rpm(i, velocity[i]).saturating_abs();
            frames.push(self.move_to_counts(i, counts, rpm)?);
        }
        Ok(frames)
    }

    /// Joint angles and velocities from one frame per motor, in motor order
    pub fn joints_from_frames(&self, frames: &[FeedbackFrame]) -> JointVector {
        let angles: Vec<f64> = frames
            .iter()
            .enumerate()
            .map(|(i, f)| self.counts_to_angle(i, f.position))
            .collect();
        let speeds: Vec<f64> = frames
            .iter()
            .enumerate()
            .map(|(i, f)| self.rpm_to_velocity(i, f.speed))
            .collect();
        JointVector::new(self.motor_to_joints(&angles)).with_velocities(self.motor_to_joints(&speeds))
    }

    /// Read every motor and express the result in joint space
    pub fn read_joints(&mut self) -> Result<JointFeedback, BusError> {
        let frames = self.ping_all()?;
        Ok(JointFeedback {
            joints: self.joints_from_frames(&frames),
            frames,
        })
    }

    /// Drive the gripper; opening 0..1 maps to a 0..255 position payload
    pub fn set_gripper(&mut self, command: GripperCommand) -> Result<FeedbackFrame, BusError> {
        let opening = command.opening().clamp(0.0, 1.0);
        let payload = (opening * 255.0).round() as i32;
        debug!("Gripper to {:.2} (payload {})", opening, payload);
        self.transact(
            Request::new(self.gripper.address, CommandCode::PositionTarget)
                .with_position(payload)
                .with_speed(self.gripper.speed, STREAM_ACCEL),
        )
    }

    /// Decelerate every motor to zero speed. Non-latching hold.
    ///
    /// Every motor is addressed even if an earlier one fails; the first
    /// failure is returned.
    pub fn halt(&mut self) -> Result<(), BusError> {
        info!("Halting all motors");
        self.for_each_motor(|driver, address| {
            driver.transact(
                Request::new(address, CommandCode::SpeedTarget).with_speed(0, STOP_ACCEL),
            )
        })
    }

    /// Emergency hold. A motor still running fast is decelerated at maximum
    /// acceleration instead of braked, which would jolt the arm.
    pub fn emergency_stop(&mut self) -> Result<(), BusError> {
        let fast = self
            .last_speed
            .iter()
            .any(|s| s.saturating_abs() > self.estop_threshold_rpm);
        if fast {
            warn!("Emergency stop while moving fast: decelerating all motors");
            self.for_each_motor(|driver, address| {
                driver.transact(
                    Request::new(address, CommandCode::SpeedTarget).with_speed(0, STOP_ACCEL),
                )
            })
        } else {
            warn!("Emergency stop: braking all motors");
            self.for_each_motor(|driver, address| {
                driver.transact(Request::new(address, CommandCode::EmergencyStop))
            })
        }
    }

    fn for_each_motor<F>(&mut self, mut op: F) -> Result<(), BusError>
    where
        F: FnMut(&mut Self, u8) -> Result<FeedbackFrame, BusError>,
    {
        let mut first_error = None;
        for i in 0..self.motors.len() {
            let address = self.motors[i].address;
            if let Err(e) = op(self, address) {
                warn!("Motor {} did not take the command: {}", address, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MotorDriver {
    fn drop(&mut self) {
        // Never leave the arm running on an abandoned trajectory
        if let Err(e) = self.halt() {
            warn!("Failed to halt motors on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::mks::BusErrorKind;
    use crate::motor::sim::SimulatedBus;

    fn driver(config: &ArmConfig) -> (MotorDriver, SimulatedBus) {
        let sim = SimulatedBus::from_config(config);
        (MotorDriver::new(Box::new(sim.clone()), config), sim)
    }

    #[test]
    fn test_counts_round_trip_with_direction() {
        let mut config = ArmConfig::default();
        config.motors[1].direction = -1;
        let (d, _) = driver(&config);
        let counts = d.angle_to_counts(1, 0.5);
        assert!(counts < 0);
        assert!((d.counts_to_angle(1, counts) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_rpm_conversion_and_clamp() {
        let (d, _) = driver(&ArmConfig::default());
        // 1 rad/s on the base: 13.5 * 60 / 2π ≈ 128.9 RPM
        assert_eq!(d.velocity_to_rpm(0, 1.0), 129);
        assert_eq!(d.velocity_to_rpm(1, -10.0), -MAX_RPM);
        assert!((d.rpm_to_velocity(0, 129) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_coupled_wrist_is_inverted_exactly() {
        let mut config = ArmConfig::default();
        config.coupled_wrist = true;
        let (d, _) = driver(&config);
        let q = [0.1, 0.2, 0.3, 0.4, 0.7, -0.25];
        let m = d.joints_to_motor(&q);
        assert_eq!(m[4], 0.7 + -0.25);
        assert_eq!(m[5], 0.7 - -0.25);
        let back = d.motor_to_joints(&m);
        for (a, b) in back.iter().zip(&q) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn test_setpoint_reaches_every_motor_and_reads_back() {
        let mut config = ArmConfig::default();
        config.coupled_wrist = true;
        let (mut d, sim) = driver(&config);
        let target = JointVector::new(vec![0.1, -0.2, 0.3, 0.0, 0.5, 0.2]);
        d.send_setpoint(&target, &JointVector::zeros(6), 0.02).unwrap();

        let sent = sim.log();
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|r| r.code == CommandCode::PositionTarget));
        assert!(sent.iter().all(|r| r.speed > 0));

        let feedback = d.read_joints().unwrap();
        assert!(feedback.joints.max_abs_diff(&target) < 1e-4);
        assert_eq!(feedback.faulted_motor(), None);
    }

    #[test]
    fn test_gripper_payload() {
        let (mut d, sim) = driver(&ArmConfig::default());
        d.set_gripper(GripperCommand::Open).unwrap();
        d.set_gripper(GripperCommand::Position(0.5)).unwrap();
        d.set_gripper(GripperCommand::Close).unwrap();
        let payloads: Vec<(u8, i32)> = sim.log().iter().map(|r| (r.address, r.position)).collect();
        assert_eq!(payloads, vec![(7, 255), (7, 128), (7, 0)]);
    }

    #[test]
    fn test_emergency_stop_brakes_when_slow() {
        let (mut d, sim) = driver(&ArmConfig::default());
        d.emergency_stop().unwrap();
        let log = sim.log();
        assert_eq!(log.len(), 6);
        assert!(log.iter().all(|r| r.code == CommandCode::EmergencyStop));
    }

    #[test]
    fn test_emergency_stop_decelerates_when_fast() {
        let (mut d, sim) = driver(&ArmConfig::default());
        d.move_to_counts(1, 1_000_000, 2500).unwrap();
        sim.clear_log();
        d.emergency_stop().unwrap();
        let log = sim.log();
        assert_eq!(log.len(), 6);
        assert!(log
            .iter()
            .all(|r| r.code == CommandCode::SpeedTarget && r.speed == 0 && r.accel == STOP_ACCEL));
    }

    #[test]
    fn test_halt_addresses_every_motor_despite_failure() {
        let (mut d, sim) = driver(&ArmConfig::default());
        sim.set_absent(3, true);
        let err = d.halt().unwrap_err();
        assert_eq!(err.address, 3);
        assert_eq!(err.kind, BusErrorKind::NoResponse);
        let addresses: std::collections::BTreeSet<u8> = sim.log().iter().map(|r| r.address).collect();
        assert_eq!(addresses.len(), 6);
    }

    #[test]
    fn test_checksum_failures_are_retried() {
        let (mut d, sim) = driver(&ArmConfig::default());
        sim.corrupt_next(2);
        let frame = d.query(0).unwrap();
        assert_eq!(frame.retries, 2);
        assert!(frame.retries <= ArmConfig::default().bus.max_retries);
    }
}
