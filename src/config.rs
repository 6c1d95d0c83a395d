// Timing, topics, and the immutable arm description handed to the core
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::motor::mks::{DEFAULT_BAUDRATE, DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS};

// Control loop frequency
pub const LOOP_HZ: u64 = 50;

// Publish the state snapshot every Nth tick (10 Hz at 50 Hz)
pub const STATE_PUBLISH_DIVIDER: u64 = 5;

// Commands waiting for the control loop
pub const COMMAND_QUEUE_DEPTH: usize = 16;

// Zenoh topics
pub const TOPIC_CMD: &str = "arm/cmd"; // commands
pub const TOPIC_ESTOP: &str = "arm/estop"; // emergency stop, any payload
pub const TOPIC_REPLY: &str = "arm/reply"; // command outcomes
pub const TOPIC_STATE: &str = "arm/state"; // robot state snapshot
pub const TOPIC_EVENTS: &str = "arm/events"; // controller transitions
pub const TOPIC_HEALTH: &str = "arm/state/health"; // health status

// Serial port for the servo bus adapter
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

/// Static description of one joint's servo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorDescriptor {
    pub name: String,
    pub address: u8,
    pub gear_ratio: f64,
    pub counts_per_rev: u32,
    /// +1 or -1
    pub direction: i8,
    pub min_angle: f64,
    pub max_angle: f64,
    /// rad/s
    pub max_velocity: f64,
    /// rad/s²
    pub max_acceleration: f64,
    /// Encoder counts travelled after the home switch before zeroing
    #[serde(default)]
    pub homing_offset: i32,
}

impl MotorDescriptor {
    /// Encoder counts per radian of joint motion, direction included
    pub fn counts_per_radian(&self) -> f64 {
        f64::from(self.counts_per_rev) * self.gear_ratio * f64::from(self.direction)
            / (2.0 * std::f64::consts::PI)
    }
}

/// One revolute joint of the kinematic chain, URDF style: a fixed origin
/// relative to the previous joint frame, then rotation about `axis`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub xyz: [f64; 3],
    #[serde(default)]
    pub rpy: [f64; 3],
    pub axis: [f64; 3],
}

/// Fixed transform from the last joint frame to the tool point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFrame {
    pub xyz: [f64; 3],
    #[serde(default)]
    pub rpy: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub baudrate: u32,
    pub timeout_ms: u64,
    pub max_retries: u8,
}

impl BusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_RETRIES,
        }
    }
}

/// Bounds for straight-line tool motion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartesianLimits {
    /// m/s
    pub max_linear_velocity: f64,
    /// m/s²
    pub max_linear_acceleration: f64,
    /// rad/s
    pub max_angular_velocity: f64,
    /// rad/s²
    pub max_angular_acceleration: f64,
}

impl Default for CartesianLimits {
    fn default() -> Self {
        Self {
            max_linear_velocity: 0.10,
            max_linear_acceleration: 0.25,
            max_angular_velocity: 0.8,
            max_angular_acceleration: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GripperConfig {
    pub address: u8,
    /// Servo RPM used for gripper moves
    pub speed: i16,
}

impl Default for GripperConfig {
    fn default() -> Self {
        Self {
            address: 7,
            speed: 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("arm has no joints")]
    NoJoints,

    #[error("{motors} motor descriptors but {links} chain links")]
    ChainMismatch { motors: usize, links: usize },

    #[error("joint {joint}: {reason}")]
    Joint { joint: usize, reason: String },

    #[error("{0}")]
    Invalid(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything the motion core needs to know about the arm.
///
/// Built once at startup and shared read-only (`Arc<ArmConfig>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    pub motors: Vec<MotorDescriptor>,
    pub chain: Vec<ChainLink>,
    pub tool: ToolFrame,
    pub bus: BusConfig,
    pub cartesian: CartesianLimits,
    pub gripper: GripperConfig,
    /// Joint indices in the order they are homed
    pub homing_order: Vec<usize>,
    pub homing_timeout_ms: u64,
    pub park_pose: Vec<f64>,
    /// Differential wrist: the last two motors drive `j4 + j5` and `j4 - j5`
    pub coupled_wrist: bool,
    /// Global scale on joint velocity/acceleration bounds, in (0, 1]
    pub speed_scale: f64,
    pub loop_hz: u64,
    /// Largest joint change between consecutive Cartesian samples (rad)
    pub max_joint_jump: f64,
    /// Largest gap between the last setpoint and the measured joints during
    /// a move (rad)
    pub max_tracking_error: f64,
    /// Above this motor speed an E-stop decelerates instead of braking hard
    pub estop_speed_threshold_rpm: i16,
}

impl Default for ArmConfig {
    fn default() -> Self {
        let motor = |name: &str,
                     address: u8,
                     gear_ratio: f64,
                     limits: (f64, f64),
                     max_velocity: f64,
                     max_acceleration: f64,
                     homing_offset: i32| MotorDescriptor {
            name: name.to_string(),
            address,
            gear_ratio,
            counts_per_rev: 16_384,
            direction: 1,
            min_angle: limits.0,
            max_angle: limits.1,
            max_velocity,
            max_acceleration,
            homing_offset,
        };
        let link = |xyz: [f64; 3], axis: [f64; 3]| ChainLink {
            xyz,
            rpy: [0.0; 3],
            axis,
        };
        const Z: [f64; 3] = [0.0, 0.0, 1.0];
        const Y: [f64; 3] = [0.0, 1.0, 0.0];
        const X: [f64; 3] = [1.0, 0.0, 0.0];

        Self {
            motors: vec![
                motor("base", 1, 13.5, (-2.9, 2.9), 1.0, 2.0, -103_800),
                motor("shoulder", 2, 150.0, (-1.5, 1.5), 0.6, 1.0, -330_000),
                motor("elbow", 3, 150.0, (-2.3, 2.3), 0.6, 1.0, -241_000),
                motor("forearm", 4, 48.0, (-2.9, 2.9), 1.2, 3.0, 0),
                motor("wrist_pitch", 5, 33.91, (-2.0, 2.0), 1.2, 3.0, 0),
                motor("wrist_roll", 6, 33.91, (-2.9, 2.9), 1.5, 3.0, 0),
            ],
            chain: vec![
                link([0.0, 0.0, 0.12], Z),
                link([0.0, 0.0, 0.17], Y),
                link([0.0, 0.0, 0.26], Y),
                link([0.06, 0.0, 0.04], X),
                link([0.18, 0.0, 0.0], Y),
                link([0.05, 0.0, 0.0], X),
            ],
            tool: ToolFrame {
                xyz: [0.07, 0.0, 0.0],
                rpy: [0.0; 3],
            },
            bus: BusConfig::default(),
            cartesian: CartesianLimits::default(),
            gripper: GripperConfig::default(),
            homing_order: vec![5, 4, 3, 2, 1, 0],
            homing_timeout_ms: 30_000,
            park_pose: vec![0.0, -0.6, 1.4, 0.0, 0.8, 0.0],
            coupled_wrist: false,
            speed_scale: 1.0,
            loop_hz: LOOP_HZ,
            max_joint_jump: 45f64.to_radians(),
            max_tracking_error: 0.1,
            estop_speed_threshold_rpm: 1000,
        }
    }
}

impl ArmConfig {
    /// Deserialize from a JSON document; missing keys take defaults
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: ArmConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn joint_count(&self) -> usize {
        self.motors.len()
    }

    /// Control tick interval
    pub fn tick(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.loop_hz.max(1))
    }

    /// Control tick interval in seconds
    pub fn dt(&self) -> f64 {
        self.tick().as_secs_f64()
    }

    /// Homing timeout per joint, in ticks
    pub fn homing_timeout_ticks(&self) -> u64 {
        (self.homing_timeout_ms * self.loop_hz).div_ceil(1000)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.motors.len();
        if n == 0 {
            return Err(ConfigError::NoJoints);
        }
        if self.chain.len() != n {
            return Err(ConfigError::ChainMismatch {
                motors: n,
                links: self.chain.len(),
            });
        }
        for (joint, m) in self.motors.iter().enumerate() {
            let reason = if m.direction != 1 && m.direction != -1 {
                Some("direction must be +1 or -1".to_string())
            } else if !(m.gear_ratio.is_finite() && m.gear_ratio > 0.0) {
                Some(format!("gear ratio {} must be positive", m.gear_ratio))
            } else if m.counts_per_rev == 0 {
                Some("counts per revolution must be non-zero".to_string())
            } else if !(m.min_angle.is_finite() && m.max_angle.is_finite())
                || m.min_angle >= m.max_angle
            {
                Some(format!("bad limits [{}, {}]", m.min_angle, m.max_angle))
            } else if !(m.max_velocity > 0.0 && m.max_acceleration > 0.0) {
                Some("velocity and acceleration bounds must be positive".to_string())
            } else if m.address == self.gripper.address {
                Some(format!("address {} collides with the gripper", m.address))
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ConfigError::Joint { joint, reason });
            }
        }
        for (joint, link) in self.chain.iter().enumerate() {
            let norm = link.axis.iter().map(|a| a * a).sum::<f64>().sqrt();
            if !(norm > 1e-9) {
                return Err(ConfigError::Joint {
                    joint,
                    reason: "zero rotation axis".to_string(),
                });
            }
        }

        let mut order = self.homing_order.clone();
        order.sort_unstable();
        if order != (0..n).collect::<Vec<_>>() {
            return Err(ConfigError::Invalid(format!(
                "homing order {:?} is not a permutation of the joints",
                self.homing_order
            )));
        }
        if self.park_pose.len() != n {
            return Err(ConfigError::Invalid(format!(
                "park pose has {} values, expected {}",
                self.park_pose.len(),
                n
            )));
        }
        if self.coupled_wrist && n < 2 {
            return Err(ConfigError::Invalid(
                "coupled wrist needs at least two joints".to_string(),
            ));
        }
        if !(self.speed_scale > 0.0 && self.speed_scale <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "speed scale {} outside (0, 1]",
                self.speed_scale
            )));
        }
        if !(self.max_tracking_error.is_finite() && self.max_tracking_error > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tracking error bound {} must be positive",
                self.max_tracking_error
            )));
        }
        if self.loop_hz == 0 || self.loop_hz > 1000 {
            return Err(ConfigError::Invalid(format!(
                "loop rate {} Hz outside 1..=1000",
                self.loop_hz
            )));
        }
        Ok(())
    }
}
