// Joint-space and Cartesian-space value types shared by the motion core

use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

/// Malformed request shape: rejected before anything is planned
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidInputError {
    #[error("expected {expected} joint values, got {got}")]
    Length { expected: usize, got: usize },

    #[error("joint {joint} value is not finite")]
    NonFinite { joint: usize },

    #[error("pose contains a non-finite value")]
    NonFinitePose,

    #[error("{what} = {value} is out of range")]
    OutOfRange { what: &'static str, value: f64 },

    #[error("{0}")]
    Other(String),
}

/// Per-joint angles (rad) with optional per-joint velocities (rad/s)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointVector {
    pub positions: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocities: Option<Vec<f64>>,
}

impl JointVector {
    pub fn new(positions: Vec<f64>) -> Self {
        Self {
            positions,
            velocities: None,
        }
    }

    pub fn zeros(n: usize) -> Self {
        Self::new(vec![0.0; n])
    }

    pub fn with_velocities(mut self, velocities: Vec<f64>) -> Self {
        self.velocities = Some(velocities);
        self
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Velocity of joint `i`, zero when none was recorded
    pub fn velocity(&self, i: usize) -> f64 {
        self.velocities
            .as_ref()
            .and_then(|v| v.get(i).copied())
            .unwrap_or(0.0)
    }

    /// Shape check: joint count and finiteness
    pub fn check(&self, expected: usize) -> Result<(), InvalidInputError> {
        if self.positions.len() != expected {
            return Err(InvalidInputError::Length {
                expected,
                got: self.positions.len(),
            });
        }
        if let Some(velocities) = &self.velocities {
            if velocities.len() != expected {
                return Err(InvalidInputError::Length {
                    expected,
                    got: velocities.len(),
                });
            }
        }
        let values = self
            .positions
            .iter()
            .chain(self.velocities.iter().flatten());
        for (i, v) in values.enumerate() {
            if !v.is_finite() {
                return Err(InvalidInputError::NonFinite {
                    joint: i % expected.max(1),
                });
            }
        }
        Ok(())
    }

    /// Largest absolute per-joint position difference
    pub fn max_abs_diff(&self, other: &JointVector) -> f64 {
        self.positions
            .iter()
            .zip(&other.positions)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Tool pose: position in metres, fixed-axis roll/pitch/yaw in radians
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CartesianPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl CartesianPose {
    pub fn new(position: [f64; 3], rpy: [f64; 3]) -> Self {
        Self {
            x: position[0],
            y: position[1],
            z: position[2],
            roll: rpy[0],
            pitch: rpy[1],
            yaw: rpy[2],
        }
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        let t = &iso.translation.vector;
        let (roll, pitch, yaw) = iso.rotation.euler_angles();
        Self::new([t.x, t.y, t.z], [roll, pitch, yaw])
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(self.x, self.y, self.z),
            UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw),
        )
    }

    pub fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.z, self.roll, self.pitch, self.yaw]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Translation distance (m) and rotation angle (rad) to another pose
    pub fn distance_to(&self, other: &CartesianPose) -> (f64, f64) {
        let a = self.to_isometry();
        let b = other.to_isometry();
        let linear = (b.translation.vector - a.translation.vector).norm();
        let angular = a.rotation.angle_to(&b.rotation);
        (linear, angular)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "value")]
pub enum GripperCommand {
    Open,
    Close,
    /// Opening fraction, 0 = closed, 1 = fully open
    Position(f64),
}

impl GripperCommand {
    pub fn opening(&self) -> f64 {
        match *self {
            GripperCommand::Open => 1.0,
            GripperCommand::Close => 0.0,
            GripperCommand::Position(p) => p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum GripperState {
    #[default]
    Unknown,
    Open,
    Closed,
    Position(f64),
}

impl From<GripperCommand> for GripperState {
    fn from(cmd: GripperCommand) -> Self {
        match cmd {
            GripperCommand::Open => GripperState::Open,
            GripperCommand::Close => GripperState::Closed,
            GripperCommand::Position(p) => GripperState::Position(p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingStatus {
    #[default]
    Unhomed,
    Homing,
    Homed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionStatus {
    #[default]
    Idle,
    Moving,
    Fault,
}

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    #[default]
    Disconnected,
    Connecting,
    Homing,
    Idle,
    Moving,
    EmergencyStopped,
}

/// A joint setpoint due `time` seconds after the trajectory starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub time: f64,
    pub joints: JointVector,
    /// Gripper action performed when this waypoint is dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gripper: Option<GripperCommand>,
}

impl Waypoint {
    pub fn new(time: f64, joints: JointVector) -> Self {
        Self {
            time,
            joints,
            gripper: None,
        }
    }
}

/// Time-ordered joint setpoints. Immutable once built; consumed by value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    waypoints: Vec<Waypoint>,
}

impl Trajectory {
    pub fn from_waypoints(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints }
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn first(&self) -> Option<&Waypoint> {
        self.waypoints.first()
    }

    pub fn last(&self) -> Option<&Waypoint> {
        self.waypoints.last()
    }

    pub fn duration(&self) -> f64 {
        self.waypoints.last().map(|w| w.time).unwrap_or(0.0)
    }

    pub fn into_waypoints(self) -> Vec<Waypoint> {
        self.waypoints
    }
}

/// Controller-owned robot state. Observers only ever see copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub joints: JointVector,
    /// Forward-kinematics image of `joints`
    pub pose: CartesianPose,
    pub gripper: GripperState,
    pub homing: HomingStatus,
    pub motion: MotionStatus,
    pub phase: ControllerState,
    pub tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RobotState {
    pub fn new(joints: JointVector, pose: CartesianPose) -> Self {
        Self {
            joints,
            pose,
            gripper: GripperState::Unknown,
            homing: HomingStatus::Unhomed,
            motion: MotionStatus::Idle,
            phase: ControllerState::Disconnected,
            tick: 0,
            last_error: None,
        }
    }
}
