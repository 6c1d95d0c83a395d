// Motion core: data model, kinematics, planning, safety, programs
pub mod kinematics;
pub mod planner;
pub mod program;
pub mod safety;
pub mod types;

pub use kinematics::{ArmKinematics, KinematicsError};
pub use planner::{MotionTarget, PathPlanner, PlanMode, PlanningError};
pub use program::{Program, ProgramEntry, ProgramError, ProgramStore};
pub use safety::{SafetyValidator, SafetyViolation, ViolationReason};
pub use types::{
    CartesianPose, ControllerState, GripperCommand, GripperState, HomingStatus,
    InvalidInputError, JointVector, MotionStatus, RobotState, Trajectory, Waypoint,
};
