// Define message types crossing the pub/sub boundary

use serde::{Deserialize, Serialize};

use crate::motion::{CartesianPose, ControllerState, GripperCommand, JointVector, PlanMode, Program};

/// Command from the operator interface / scripts -> controller.
///
/// Closed set: unknown `type` tags and malformed shapes are rejected by
/// serde before anything reaches the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Connect,
    Disconnect,
    Home,
    MoveJoint {
        target: JointVector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    MoveCartesian {
        target: CartesianPose,
        #[serde(default)]
        mode: PlanMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    RunProgram {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    SaveProgram {
        program: Program,
    },
    /// Append the current joint angles to a program, creating it if needed
    CapturePose {
        program: String,
        #[serde(default)]
        name: String,
    },
    DeletePose {
        program: String,
        index: usize,
    },
    DeleteProgram {
        name: String,
    },
    ListPrograms,
    Gripper {
        command: GripperCommand,
    },
    Park {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    Abort,
    #[serde(rename = "estop")]
    EStop,
    Reset,
}

impl Command {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::Home => "home",
            Command::MoveJoint { .. } => "move_joint",
            Command::MoveCartesian { .. } => "move_cartesian",
            Command::RunProgram { .. } => "run_program",
            Command::SaveProgram { .. } => "save_program",
            Command::CapturePose { .. } => "capture_pose",
            Command::DeletePose { .. } => "delete_pose",
            Command::DeleteProgram { .. } => "delete_program",
            Command::ListPrograms => "list_programs",
            Command::Gripper { .. } => "gripper",
            Command::Park { .. } => "park",
            Command::Abort => "abort",
            Command::EStop => "estop",
            Command::Reset => "reset",
        }
    }
}

/// Command as published on the command topic, with a caller-chosen id
/// echoed in the reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// What an accepted command did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Finished within the command itself
    Done,
    /// Homing sequence started
    HomingStarted { joints: usize },
    /// Trajectory accepted and dispatch started
    MotionStarted { waypoints: usize, duration: f64 },
    /// Stored program after an entry was added or removed
    ProgramUpdated { name: String, entries: usize },
    Programs { names: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok {
        #[serde(flatten)]
        outcome: CommandOutcome,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// Reply published for every command received on the command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: u64,
    pub command: String,
    #[serde(flatten)]
    pub status: ReplyStatus,
}

/// Controller phase transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub from: ControllerState,
    pub to: ControllerState,
    pub reason: String,
    pub tick: u64,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    /// Bus transactions needed retries or failed recently
    BusDegraded,
    Disconnected,
    EmergencyStopped,
}
