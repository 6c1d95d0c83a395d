// Motion controller: sole owner of the robot state and the motor driver
//
// Synchronous and tick-driven. The control loop calls `handle_command` for
// at most one queued command per tick, then `tick` once. Homing and
// trajectory dispatch advance one step per tick so an emergency stop can
// preempt them between any two bus transactions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{ArmConfig, BusConfig};
use crate::messages::{Command, CommandOutcome, RuntimeHealth, StateEvent};
use crate::motion::{
    CartesianPose, ControllerState, GripperCommand, HomingStatus, InvalidInputError, JointVector,
    MotionStatus, MotionTarget, PathPlanner, PlanMode, PlanningError, Program, ProgramEntry,
    ProgramError, ProgramStore, RobotState, SafetyValidator, SafetyViolation, Trajectory, Waypoint,
};
use crate::motor::driver::HOMING_RPM;
use crate::motor::mks::{BusError, SerialTransport, Transport};
use crate::motor::{MotorDriver, SimulatedBus};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to open {port}: {message}")]
    Open { port: String, message: String },

    #[error("motor presence check failed: {0}")]
    Presence(#[source] BusError),

    #[error("failed to enable motors: {0}")]
    Enable(#[source] BusError),
}

#[derive(Debug, thiserror::Error)]
pub enum HomingError {
    #[error("joint {joint} did not finish homing within {ticks} ticks")]
    Timeout { joint: usize, ticks: u64 },

    #[error("joint {joint} reported a stall or end-limit while homing")]
    Fault { joint: usize },

    #[error("joint {joint} homing failed: {source}")]
    Bus {
        joint: usize,
        #[source]
        source: BusError,
    },

    #[error("no motor bus connected")]
    NotConnected,
}

/// Every way a command can be refused or a motion can fail
#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    Unreachable(PlanningError),

    #[error(transparent)]
    Planning(PlanningError),

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Homing(#[from] HomingError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("emergency stop latched; reset required")]
    EmergencyStop,

    #[error("controller busy ({0:?})")]
    Busy(ControllerState),

    #[error("{command} not allowed while {state:?}")]
    InvalidState {
        command: &'static str,
        state: ControllerState,
    },

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error("command queue full")]
    QueueFull,

    #[error("controller is not running")]
    Unavailable,
}

impl From<PlanningError> for MotionError {
    fn from(err: PlanningError) -> Self {
        match err {
            PlanningError::InvalidInput(e) => MotionError::InvalidInput(e),
            PlanningError::Unreachable(_)
            | PlanningError::PathUnreachable { .. }
            | PlanningError::BranchFlip { .. } => MotionError::Unreachable(err),
            other => MotionError::Planning(other),
        }
    }
}

impl MotionError {
    /// Stable machine-readable kind, used in command replies
    pub fn kind(&self) -> &'static str {
        match self {
            MotionError::InvalidInput(_) => "invalid_input",
            MotionError::Unreachable(_) => "unreachable",
            MotionError::Planning(_) => "planning",
            MotionError::Safety(_) => "safety_violation",
            MotionError::Bus(_) => "bus",
            MotionError::Homing(_) => "homing",
            MotionError::Connection(_) => "connection",
            MotionError::EmergencyStop => "emergency_stop",
            MotionError::Busy(_) => "busy",
            MotionError::InvalidState { .. } => "invalid_state",
            MotionError::Program(_) => "program",
            MotionError::QueueFull => "queue_full",
            MotionError::Unavailable => "unavailable",
        }
    }
}

/// Opens the byte link to the servo bus
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Transport>, ConnectionError>;
}

pub struct SerialConnector {
    port: String,
    baudrate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, bus: &BusConfig) -> Self {
        Self {
            port: port.into(),
            baudrate: bus.baudrate,
            timeout: bus.timeout(),
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&mut self) -> Result<Box<dyn Transport>, ConnectionError> {
        info!("Opening motor bus on {} at {} baud", self.port, self.baudrate);
        let transport = SerialTransport::open(&self.port, self.baudrate, self.timeout).map_err(
            |e| ConnectionError::Open {
                port: self.port.clone(),
                message: e.to_string(),
            },
        )?;
        Ok(Box::new(transport))
    }
}

/// Connects to an in-process simulated bus
pub struct SimConnector {
    bus: SimulatedBus,
}

impl SimConnector {
    pub fn new(bus: SimulatedBus) -> Self {
        Self { bus }
    }
}

impl Connector for SimConnector {
    fn connect(&mut self) -> Result<Box<dyn Transport>, ConnectionError> {
        info!("Connecting to simulated motor bus");
        Ok(Box::new(self.bus.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HomingStage {
    /// Home command not yet sent for the current joint
    Start,
    /// Waiting for the home switch
    Seek,
    /// Travelling to the homing offset
    Offset,
}

#[derive(Debug, Clone)]
struct HomingProgress {
    /// Position in the homing order
    step: usize,
    stage: HomingStage,
    ticks: u64,
}

#[derive(Debug)]
struct ActiveMotion {
    label: &'static str,
    waypoints: Vec<Waypoint>,
    /// Everything before this index has been sent
    next: usize,
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Connecting,
    Homing(HomingProgress),
    Idle,
    Moving(ActiveMotion),
    EmergencyStopped,
}

impl Phase {
    fn state(&self) -> ControllerState {
        match self {
            Phase::Disconnected => ControllerState::Disconnected,
            Phase::Connecting => ControllerState::Connecting,
            Phase::Homing(_) => ControllerState::Homing,
            Phase::Idle => ControllerState::Idle,
            Phase::Moving(_) => ControllerState::Moving,
            Phase::EmergencyStopped => ControllerState::EmergencyStopped,
        }
    }
}

pub struct Controller {
    config: Arc<ArmConfig>,
    planner: PathPlanner,
    safety: SafetyValidator,
    programs: Option<ProgramStore>,
    connector: Box<dyn Connector>,
    driver: Option<MotorDriver>,
    phase: Phase,
    state: RobotState,
    events: Vec<StateEvent>,
    /// Bus retries and failures seen during the current tick
    recent_bus_trouble: u32,
}

impl Controller {
    pub fn new(config: Arc<ArmConfig>, connector: Box<dyn Connector>) -> Self {
        let planner = PathPlanner::from_config(&config);
        let joints = JointVector::zeros(config.joint_count());
        let pose = planner.kinematics().forward(&joints).unwrap_or_default();
        Self {
            safety: SafetyValidator::from_config(&config),
            planner,
            programs: None,
            connector,
            driver: None,
            phase: Phase::Disconnected,
            state: RobotState::new(joints, pose),
            events: Vec::new(),
            recent_bus_trouble: 0,
            config,
        }
    }

    pub fn with_programs(mut self, store: ProgramStore) -> Self {
        self.programs = Some(store);
        self
    }

    pub fn phase(&self) -> ControllerState {
        self.phase.state()
    }

    pub fn state(&self) -> &RobotState {
        &self.state
    }

    pub fn snapshot(&self) -> RobotState {
        self.state.clone()
    }

    /// Transitions since the last call
    pub fn take_events(&mut self) -> Vec<StateEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn health(&self) -> RuntimeHealth {
        match self.phase() {
            ControllerState::EmergencyStopped => RuntimeHealth::EmergencyStopped,
            ControllerState::Disconnected | ControllerState::Connecting => {
                RuntimeHealth::Disconnected
            }
            _ if self.recent_bus_trouble > 0 => RuntimeHealth::BusDegraded,
            _ => RuntimeHealth::Ok,
        }
    }

    fn transition(&mut self, next: Phase, reason: impl Into<String>) {
        let from = self.phase.state();
        let to = next.state();
        self.phase = next;
        self.state.phase = to;
        self.state.motion = match to {
            ControllerState::Moving => MotionStatus::Moving,
            ControllerState::EmergencyStopped => MotionStatus::Fault,
            _ => MotionStatus::Idle,
        };
        if from != to {
            let reason = reason.into();
            if to == ControllerState::EmergencyStopped {
                error!("{:?} -> {:?}: {}", from, to, reason);
            } else {
                info!("{:?} -> {:?}: {}", from, to, reason);
            }
            self.events.push(StateEvent {
                from,
                to,
                reason,
                tick: self.state.tick,
            });
        }
    }

    /// Joints and pose are only ever written together
    fn set_joints(&mut self, joints: JointVector) {
        match self.planner.kinematics().forward(&joints) {
            Ok(pose) => {
                self.state.joints = joints;
                self.state.pose = pose;
            }
            Err(e) => warn!("Ignoring joint update: {}", e),
        }
    }

    fn record_error(&mut self, message: String) {
        self.state.last_error = Some(message);
    }

    /// Drop the bus connection; the driver halts the motors on drop
    fn release_driver(&mut self) {
        self.driver = None;
        self.state.homing = HomingStatus::Unhomed;
    }

    pub fn handle_command(&mut self, command: Command) -> Result<CommandOutcome, MotionError> {
        let name = command.name();
        debug!("Command: {:?}", command);
        let result = match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Home => self.home(),
            Command::MoveJoint { target, speed } => self.plan_and_start(
                "joint move",
                MotionTarget::Joints(target),
                PlanMode::JointLinear,
                speed,
            ),
            Command::MoveCartesian {
                target,
                mode,
                speed,
            } => self.move_cartesian(target, mode, speed),
            Command::RunProgram { name, speed } => self.run_program(&name, speed),
            Command::SaveProgram { program } => self.save_program(&program),
            Command::CapturePose { program, name } => self.capture_pose(&program, name),
            Command::DeletePose { program, index } => self.delete_pose(&program, index),
            Command::DeleteProgram { name } => self.delete_program(&name),
            Command::ListPrograms => self.list_programs(),
            Command::Gripper { command } => self.gripper(command),
            Command::Park { speed } => {
                let target = MotionTarget::Joints(JointVector::new(self.config.park_pose.clone()));
                self.plan_and_start("park", target, PlanMode::JointLinear, speed)
            }
            Command::Abort => self.abort(),
            Command::EStop => {
                self.emergency_stop();
                Ok(CommandOutcome::Done)
            }
            Command::Reset => self.reset(),
        };
        if let Err(e) = &result {
            warn!("{} rejected: {}", name, e);
        }
        result
    }

    fn require_idle(&self, command: &'static str) -> Result<(), MotionError> {
        match self.phase() {
            ControllerState::Idle => Ok(()),
            state @ (ControllerState::Moving | ControllerState::Homing) => {
                Err(MotionError::Busy(state))
            }
            ControllerState::EmergencyStopped => Err(MotionError::EmergencyStop),
            state => Err(MotionError::InvalidState { command, state }),
        }
    }

    fn connect(&mut self) -> Result<CommandOutcome, MotionError> {
        match self.phase() {
            ControllerState::Disconnected => {}
            ControllerState::EmergencyStopped => return Err(MotionError::EmergencyStop),
            state => {
                return Err(MotionError::InvalidState {
                    command: "connect",
                    state,
                });
            }
        }
        self.transition(Phase::Connecting, "connect requested");

        let opened = self.connector.connect().and_then(|transport| {
            let mut driver = MotorDriver::new(transport, &self.config);
            driver.ping_all().map_err(ConnectionError::Presence)?;
            driver.enable_all(true).map_err(ConnectionError::Enable)?;
            Ok(driver)
        });
        match opened {
            Ok(driver) => {
                self.driver = Some(driver);
                self.state.last_error = None;
                Ok(self.start_homing("motors connected"))
            }
            Err(e) => {
                self.record_error(e.to_string());
                self.transition(Phase::Disconnected, format!("connection failed: {e}"));
                Err(e.into())
            }
        }
    }

    fn disconnect(&mut self) -> Result<CommandOutcome, MotionError> {
        match self.phase() {
            ControllerState::Disconnected => return Ok(CommandOutcome::Done),
            ControllerState::Idle => {}
            ControllerState::EmergencyStopped => return Err(MotionError::EmergencyStop),
            state => return Err(MotionError::Busy(state)),
        }
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.enable_all(false) {
                warn!("Failed to disable torque before disconnect: {}", e);
            }
        }
        self.release_driver();
        self.transition(Phase::Disconnected, "disconnect requested");
        Ok(CommandOutcome::Done)
    }

    fn home(&mut self) -> Result<CommandOutcome, MotionError> {
        self.require_idle("home")?;
        Ok(self.start_homing("home requested"))
    }

    fn start_homing(&mut self, reason: &str) -> CommandOutcome {
        self.state.homing = HomingStatus::Homing;
        self.transition(
            Phase::Homing(HomingProgress {
                step: 0,
                stage: HomingStage::Start,
                ticks: 0,
            }),
            reason,
        );
        CommandOutcome::HomingStarted {
            joints: self.config.homing_order.len(),
        }
    }

    fn move_cartesian(
        &mut self,
        target: CartesianPose,
        mode: PlanMode,
        speed: Option<f64>,
    ) -> Result<CommandOutcome, MotionError> {
        self.plan_and_start("cartesian move", MotionTarget::Pose(target), mode, speed)
    }

    fn plan_and_start(
        &mut self,
        label: &'static str,
        target: MotionTarget,
        mode: PlanMode,
        speed: Option<f64>,
    ) -> Result<CommandOutcome, MotionError> {
        self.require_idle(label)?;
        let trajectory = self.planner.plan(&self.state.joints, &target, mode, speed)?;
        self.start_motion(label, trajectory)
    }

    /// Without a store every program is missing
    fn program_store(&self, name: &str) -> Result<&ProgramStore, ProgramError> {
        self.programs
            .as_ref()
            .ok_or_else(|| ProgramError::NotFound(name.to_string()))
    }

    fn run_program(&mut self, name: &str, speed: Option<f64>) -> Result<CommandOutcome, MotionError> {
        self.require_idle("run_program")?;
        let program = self.program_store(name)?.load(name)?;
        program.validate(self.config.joint_count())?;
        let trajectory = self
            .planner
            .plan_program(&self.state.joints, &program, speed)?;
        self.start_motion("program", trajectory)
    }

    fn save_program(&mut self, program: &Program) -> Result<CommandOutcome, MotionError> {
        program.validate(self.config.joint_count())?;
        self.program_store(&program.name)?.save(program)?;
        Ok(CommandOutcome::Done)
    }

    /// Teach the current joint angles as the program's next entry
    fn capture_pose(&mut self, program: &str, name: String) -> Result<CommandOutcome, MotionError> {
        self.require_idle("capture_pose")?;
        let entry = ProgramEntry {
            name,
            target: MotionTarget::Joints(JointVector::new(self.state.joints.positions.clone())),
            gripper: None,
            duration: None,
        };
        let updated = self.program_store(program)?.append_entry(program, entry)?;
        info!(
            "Captured pose {} of '{}'",
            updated.entries.len(),
            updated.name
        );
        Ok(CommandOutcome::ProgramUpdated {
            name: updated.name,
            entries: updated.entries.len(),
        })
    }

    fn delete_pose(&mut self, program: &str, index: usize) -> Result<CommandOutcome, MotionError> {
        let updated = self.program_store(program)?.remove_entry(program, index)?;
        Ok(CommandOutcome::ProgramUpdated {
            name: updated.name,
            entries: updated.entries.len(),
        })
    }

    fn delete_program(&mut self, name: &str) -> Result<CommandOutcome, MotionError> {
        self.program_store(name)?.delete(name)?;
        Ok(CommandOutcome::Done)
    }

    fn list_programs(&self) -> Result<CommandOutcome, MotionError> {
        let names = match &self.programs {
            Some(store) => store.list()?,
            None => Vec::new(),
        };
        Ok(CommandOutcome::Programs { names })
    }

    fn gripper(&mut self, command: GripperCommand) -> Result<CommandOutcome, MotionError> {
        self.require_idle("gripper")?;
        let opening = command.opening();
        if !(opening.is_finite() && (0.0..=1.0).contains(&opening)) {
            return Err(InvalidInputError::OutOfRange {
                what: "gripper",
                value: opening,
            }
            .into());
        }
        let Some(driver) = self.driver.as_mut() else {
            return Err(MotionError::Unavailable);
        };
        driver.set_gripper(command)?;
        self.state.gripper = command.into();
        Ok(CommandOutcome::Done)
    }

    /// Only a fully validated trajectory gets here
    fn start_motion(
        &mut self,
        label: &'static str,
        trajectory: Trajectory,
    ) -> Result<CommandOutcome, MotionError> {
        self.safety.check_trajectory(&trajectory, &self.state.joints)?;
        let outcome = CommandOutcome::MotionStarted {
            waypoints: trajectory.len(),
            duration: trajectory.duration(),
        };
        self.transition(
            Phase::Moving(ActiveMotion {
                label,
                waypoints: trajectory.into_waypoints(),
                next: 0,
            }),
            format!("{label} started"),
        );
        Ok(outcome)
    }

    fn abort(&mut self) -> Result<CommandOutcome, MotionError> {
        match self.phase() {
            ControllerState::Moving | ControllerState::Idle => {
                let halted = match self.driver.as_mut() {
                    Some(driver) => driver.halt(),
                    None => Ok(()),
                };
                match halted {
                    Ok(()) => {
                        self.transition(Phase::Idle, "motion aborted");
                        Ok(CommandOutcome::Done)
                    }
                    Err(e) => {
                        self.record_error(e.to_string());
                        self.transition(Phase::EmergencyStopped, format!("hold failed on abort: {e}"));
                        Err(e.into())
                    }
                }
            }
            ControllerState::Homing => {
                if let Some(driver) = self.driver.as_mut() {
                    if let Err(e) = driver.halt() {
                        warn!("Halt failed while aborting homing: {}", e);
                    }
                }
                self.release_driver();
                self.transition(Phase::Disconnected, "homing aborted");
                Ok(CommandOutcome::Done)
            }
            ControllerState::EmergencyStopped => Err(MotionError::EmergencyStop),
            state => Err(MotionError::InvalidState {
                command: "abort",
                state,
            }),
        }
    }

    /// Latch the emergency stop: hold every motor and drop any trajectory.
    /// Valid in every phase.
    pub fn emergency_stop(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.emergency_stop() {
                error!("Emergency hold did not reach every motor: {}", e);
                self.state.last_error = Some(e.to_string());
            }
        }
        if self.state.homing == HomingStatus::Homing {
            self.state.homing = HomingStatus::Unhomed;
        }
        self.transition(Phase::EmergencyStopped, "emergency stop");
    }

    fn reset(&mut self) -> Result<CommandOutcome, MotionError> {
        let state = self.phase();
        if state != ControllerState::EmergencyStopped {
            return Err(MotionError::InvalidState {
                command: "reset",
                state,
            });
        }
        if self.state.homing != HomingStatus::Homed || self.driver.is_none() {
            self.release_driver();
            self.transition(Phase::Disconnected, "reset of an unhomed arm");
            return Ok(CommandOutcome::Done);
        }
        self.safety.check_joints(&self.state.joints)?;
        self.state.last_error = None;
        self.transition(Phase::Idle, "reset");
        Ok(CommandOutcome::Done)
    }

    /// One control tick
    pub fn tick(&mut self) {
        self.state.tick += 1;
        self.recent_bus_trouble = 0;
        match self.phase {
            Phase::Homing(_) => self.tick_homing(),
            Phase::Idle => self.poll_feedback(),
            Phase::Moving(_) => self.tick_motion(),
            Phase::Disconnected | Phase::Connecting | Phase::EmergencyStopped => {}
        }
    }

    fn poll_feedback(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        match driver.read_joints() {
            Ok(feedback) => {
                self.recent_bus_trouble += feedback.retries();
                if let Some(motor) = feedback.faulted_motor() {
                    warn!("Motor {} reports a stall or end-limit", motor);
                }
                self.set_joints(feedback.joints);
            }
            Err(e) => {
                self.recent_bus_trouble += 1;
                warn!("Feedback poll failed: {}", e);
                self.record_error(e.to_string());
            }
        }
    }

    fn tick_homing(&mut self) {
        let Phase::Homing(progress) = &self.phase else {
            return;
        };
        let mut progress = progress.clone();
        match self.step_homing(&mut progress) {
            Ok(true) => self.finish_homing(),
            Ok(false) => self.phase = Phase::Homing(progress),
            Err(e) => self.fail_homing(e),
        }
    }

    /// Advance homing by one step; true once every joint is zeroed
    fn step_homing(&mut self, progress: &mut HomingProgress) -> Result<bool, HomingError> {
        let order = &self.config.homing_order;
        let joint = order[progress.step];
        let timeout = self.config.homing_timeout_ticks();
        let driver = self.driver.as_mut().ok_or(HomingError::NotConnected)?;
        let bus = |source| HomingError::Bus { joint, source };

        match progress.stage {
            HomingStage::Start => {
                debug!("Homing joint {} ({})", joint, driver.motor(joint).name);
                driver.go_home(joint).map_err(bus)?;
                progress.stage = HomingStage::Seek;
                progress.ticks = 0;
            }
            HomingStage::Seek => {
                let frame = driver.query(joint).map_err(bus)?;
                if frame.flags.home_found() {
                    let offset = driver.motor(joint).homing_offset;
                    driver.move_to_counts(joint, offset, HOMING_RPM).map_err(bus)?;
                    progress.stage = HomingStage::Offset;
                    progress.ticks = 0;
                    return Ok(false);
                }
                if frame.flags.faulted() {
                    return Err(HomingError::Fault { joint });
                }
                progress.ticks += 1;
            }
            HomingStage::Offset => {
                let frame = driver.query(joint).map_err(bus)?;
                if frame.flags.faulted() {
                    return Err(HomingError::Fault { joint });
                }
                if !frame.flags.moving() {
                    driver.set_zero(joint).map_err(bus)?;
                    info!("Joint {} ({}) homed", joint, driver.motor(joint).name);
                    progress.step += 1;
                    progress.stage = HomingStage::Start;
                    progress.ticks = 0;
                    return Ok(progress.step == order.len());
                }
                progress.ticks += 1;
            }
        }
        if progress.ticks > timeout {
            return Err(HomingError::Timeout {
                joint,
                ticks: timeout,
            });
        }
        Ok(false)
    }

    fn finish_homing(&mut self) {
        let joints = match self.driver.as_mut().map(|d| d.read_joints()) {
            Some(Ok(feedback)) => feedback.joints,
            Some(Err(e)) => {
                warn!("Feedback read after homing failed: {}", e);
                JointVector::zeros(self.config.joint_count())
            }
            None => JointVector::zeros(self.config.joint_count()),
        };
        self.set_joints(joints);
        self.state.homing = HomingStatus::Homed;
        self.transition(Phase::Idle, "homing complete");
    }

    fn fail_homing(&mut self, err: HomingError) {
        error!("Homing failed: {}", err);
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.halt() {
                warn!("Halt after homing failure failed: {}", e);
            }
        }
        self.record_error(err.to_string());
        self.release_driver();
        self.transition(Phase::Disconnected, format!("homing failed: {err}"));
    }

    fn tick_motion(&mut self) {
        let Phase::Moving(motion) = &self.phase else {
            return;
        };
        let label = motion.label;
        let Some(waypoint) = motion.waypoints.get(motion.next).cloned() else {
            self.transition(Phase::Idle, format!("{label} complete"));
            return;
        };
        let sent = &motion.waypoints[..motion.next];
        let previous = sent.last().map(|w| w.joints.clone());

        // Re-check right before transmission; nothing invalid reaches the bus
        let checked = self.safety.check_waypoint(&waypoint, sent, &self.state.joints);
        if let Err(violation) = checked {
            error!("Waypoint rejected before dispatch: {}", violation);
            self.record_error(violation.to_string());
            self.hold_after_fault(format!("{label} aborted: {violation}"));
            return;
        }

        let dt = self.config.dt();
        let from = previous.unwrap_or_else(|| self.state.joints.clone());
        let Some(driver) = self.driver.as_mut() else {
            self.hold_after_fault(format!("{label} aborted: no motor bus"));
            return;
        };
        let dispatched = driver.send_setpoint(&waypoint.joints, &from, dt).and_then(|frames| {
            if let Some(command) = waypoint.gripper {
                driver.set_gripper(command)?;
            }
            Ok(frames)
        });

        match dispatched {
            Ok(frames) => {
                let joints = driver.joints_from_frames(&frames);
                self.recent_bus_trouble += frames.iter().map(|f| u32::from(f.retries)).sum::<u32>();
                self.set_joints(joints);
                if let Some(frame) = frames.iter().find(|f| f.flags.faulted()) {
                    let reason = format!(
                        "{label} aborted: motor {} reports a stall or end-limit",
                        frame.address
                    );
                    error!("{}", reason);
                    self.record_error(reason.clone());
                    self.hold_after_fault(reason);
                    return;
                }
                if let Some(command) = waypoint.gripper {
                    self.state.gripper = command.into();
                }
                if let Phase::Moving(motion) = &mut self.phase {
                    motion.next += 1;
                    if motion.next == motion.waypoints.len() {
                        self.transition(Phase::Idle, format!("{label} complete"));
                    }
                }
            }
            Err(e) => {
                self.recent_bus_trouble += 1;
                self.record_error(e.to_string());
                self.hold_after_fault(format!("{label} aborted: {e}"));
            }
        }
    }

    /// Abort the active motion with a hold; a failed hold latches the
    /// emergency stop
    fn hold_after_fault(&mut self, reason: String) {
        let held = match self.driver.as_mut() {
            Some(driver) => driver.halt(),
            None => Ok(()),
        };
        match held {
            Ok(()) => self.transition(Phase::Idle, reason),
            Err(e) => {
                self.record_error(format!("{reason}; hold failed: {e}"));
                self.transition(
                    Phase::EmergencyStopped,
                    format!("{reason}; hold failed: {e}"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::GripperState;
    use crate::motion::ViolationReason;
    use crate::motor::mks::CommandCode;
    use nalgebra::Point3;

    const MAX_TICKS: usize = 5_000;

    fn controller_with(config: ArmConfig) -> (Controller, SimulatedBus) {
        let sim = SimulatedBus::from_config(&config);
        let controller = Controller::new(Arc::new(config), Box::new(SimConnector::new(sim.clone())));
        (controller, sim)
    }

    fn run_until(c: &mut Controller, done: impl Fn(&Controller) -> bool) {
        for _ in 0..MAX_TICKS {
            if done(c) {
                return;
            }
            c.tick();
        }
        panic!("condition not reached, phase {:?}", c.phase());
    }

    fn homed() -> (Controller, SimulatedBus) {
        let (mut c, sim) = controller_with(ArmConfig::default());
        c.handle_command(Command::Connect).unwrap();
        run_until(&mut c, |c| c.phase() != ControllerState::Homing);
        assert_eq!(c.phase(), ControllerState::Idle);
        c.take_events();
        sim.clear_log();
        (c, sim)
    }

    fn move_to(c: &mut Controller, q: [f64; 6]) {
        c.handle_command(Command::MoveJoint {
            target: JointVector::new(q.to_vec()),
            speed: None,
        })
        .unwrap();
        run_until(c, |c| c.phase() != ControllerState::Moving);
    }

    #[test]
    fn test_connect_homes_in_configured_order() {
        let (mut c, sim) = controller_with(ArmConfig::default());
        let outcome = c.handle_command(Command::Connect).unwrap();
        assert_eq!(outcome, CommandOutcome::HomingStarted { joints: 6 });
        run_until(&mut c, |c| c.phase() != ControllerState::Homing);

        assert_eq!(c.phase(), ControllerState::Idle);
        assert_eq!(c.state().homing, HomingStatus::Homed);
        assert!(c.state().joints.max_abs_diff(&JointVector::zeros(6)) < 1e-9);

        let homed: Vec<u8> = sim
            .log()
            .iter()
            .filter(|r| r.code == CommandCode::GoHome)
            .map(|r| r.address)
            .collect();
        assert_eq!(homed, vec![6, 5, 4, 3, 2, 1]);
        // Offset travel happens before zeroing
        let shoulder_offset = sim
            .log()
            .iter()
            .any(|r| r.address == 2 && r.code == CommandCode::PositionTarget && r.position == -330_000);
        assert!(shoulder_offset);

        let phases: Vec<(ControllerState, ControllerState)> =
            c.take_events().iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            phases,
            vec![
                (ControllerState::Disconnected, ControllerState::Connecting),
                (ControllerState::Connecting, ControllerState::Homing),
                (ControllerState::Homing, ControllerState::Idle),
            ]
        );
    }

    #[test]
    fn test_connect_fails_on_missing_motor() {
        let (mut c, sim) = controller_with(ArmConfig::default());
        sim.set_absent(4, true);
        let err = c.handle_command(Command::Connect).unwrap_err();
        assert!(matches!(err, MotionError::Connection(ConnectionError::Presence(_))));
        assert_eq!(c.phase(), ControllerState::Disconnected);
        assert!(c.state().last_error.is_some());
    }

    #[test]
    fn test_homing_timeout_disconnects() {
        let mut config = ArmConfig::default();
        config.homing_timeout_ms = 100;
        let (mut c, sim) = controller_with(config);
        sim.set_home_delay(u32::MAX);
        c.handle_command(Command::Connect).unwrap();
        run_until(&mut c, |c| c.phase() != ControllerState::Homing);
        assert_eq!(c.phase(), ControllerState::Disconnected);
        assert_eq!(c.state().homing, HomingStatus::Unhomed);
        assert!(c.state().last_error.as_deref().unwrap().contains("joint 5"));
    }

    #[test]
    fn test_joint_move_to_zero_returns_to_idle() {
        let (mut c, _sim) = homed();
        move_to(&mut c, [0.3, -0.2, 0.4, 0.1, 0.6, -0.3]);
        move_to(&mut c, [0.0; 6]);
        assert_eq!(c.phase(), ControllerState::Idle);
        assert!(c.state().joints.max_abs_diff(&JointVector::zeros(6)) < 1e-4);

        // Pose always tracks the joints
        let expected = c.planner.kinematics().forward(&c.state().joints).unwrap();
        assert_eq!(c.state().pose, expected);
        assert_eq!(c.state().motion, MotionStatus::Idle);
    }

    #[test]
    fn test_out_of_limit_target_never_reaches_bus() {
        let (mut c, sim) = homed();
        let before = c.snapshot();
        let err = c
            .handle_command(Command::MoveJoint {
                target: JointVector::new(vec![0.0, 0.0, 2.8, 0.0, 0.0, 0.0]),
                speed: None,
            })
            .unwrap_err();
        match err {
            MotionError::Safety(v) => {
                assert_eq!(v.reason, ViolationReason::JointLimit);
                assert_eq!(v.joint, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(sim.log().is_empty());
        assert_eq!(c.snapshot(), before);
    }

    #[test]
    fn test_unreachable_pose_leaves_state_unchanged() {
        let (mut c, sim) = homed();
        let before = c.snapshot();
        let err = c
            .handle_command(Command::MoveCartesian {
                target: CartesianPose::new([2.0, 0.0, 0.5], [0.0; 3]),
                mode: PlanMode::CartesianLinear,
                speed: None,
            })
            .unwrap_err();
        assert!(matches!(err, MotionError::Unreachable(_)));
        assert_eq!(err.kind(), "unreachable");
        assert_eq!(c.snapshot(), before);
        assert!(sim.log().is_empty());
    }

    #[test]
    fn test_path_through_dead_zone_never_reaches_bus() {
        let (mut c, sim) = homed();
        move_to(&mut c, [0.0, 0.3, 0.5, 0.0, 0.8, 0.0]);
        sim.clear_log();
        let before = c.snapshot();

        // Both ends solve, but the wrist centre would pass through the shoulder
        let start = before.pose;
        let wrist = start.to_isometry() * Point3::new(-0.12, 0.0, 0.0);
        let shift = (Point3::new(0.0, 0.0, 0.29) - wrist) * 2.0;
        let mut target = start;
        target.x += shift.x;
        target.y += shift.y;
        target.z += shift.z;
        let err = c
            .handle_command(Command::MoveCartesian {
                target,
                mode: PlanMode::CartesianLinear,
                speed: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            MotionError::Unreachable(PlanningError::PathUnreachable { .. })
        ));
        assert_eq!(c.snapshot(), before);
        assert!(sim.log().is_empty());
    }

    #[test]
    fn test_busy_while_moving() {
        let (mut c, _sim) = homed();
        c.handle_command(Command::Park { speed: None }).unwrap();
        c.tick();
        assert!(matches!(
            c.handle_command(Command::Home),
            Err(MotionError::Busy(ControllerState::Moving))
        ));
        assert!(matches!(
            c.handle_command(Command::Gripper {
                command: GripperCommand::Open
            }),
            Err(MotionError::Busy(_))
        ));
        assert_eq!(c.phase(), ControllerState::Moving);
    }

    #[test]
    fn test_estop_during_motion_holds_within_one_tick() {
        let (mut c, sim) = homed();
        c.handle_command(Command::Park { speed: None }).unwrap();
        for _ in 0..10 {
            c.tick();
        }
        sim.clear_log();
        c.emergency_stop();

        let log = sim.log();
        assert_eq!(log.len(), 6);
        assert!(log.iter().all(|r| r.code == CommandCode::EmergencyStop));
        assert_eq!(c.phase(), ControllerState::EmergencyStopped);
        assert_eq!(c.state().motion, MotionStatus::Fault);

        // Nothing else goes out, and motion is refused until reset
        c.tick();
        assert_eq!(sim.log().len(), 6);
        assert!(matches!(
            c.handle_command(Command::Park { speed: None }),
            Err(MotionError::EmergencyStop)
        ));

        c.handle_command(Command::Reset).unwrap();
        assert_eq!(c.phase(), ControllerState::Idle);
        move_to(&mut c, [0.0; 6]);
        assert_eq!(c.phase(), ControllerState::Idle);
    }

    #[test]
    fn test_reset_of_unhomed_arm_disconnects() {
        let (mut c, _sim) = controller_with(ArmConfig::default());
        c.handle_command(Command::Connect).unwrap();
        c.tick();
        c.handle_command(Command::EStop).unwrap();
        assert_eq!(c.state().homing, HomingStatus::Unhomed);
        c.handle_command(Command::Reset).unwrap();
        assert_eq!(c.phase(), ControllerState::Disconnected);
    }

    #[test]
    fn test_reset_refused_outside_limits() {
        let (mut c, sim) = homed();
        // Elbow driven past its limit by hand
        let counts = (2.5 * ArmConfig::default().motors[2].counts_per_radian()) as i32;
        sim.set_position(3, counts);
        c.tick();
        c.emergency_stop();
        let err = c.handle_command(Command::Reset).unwrap_err();
        assert!(matches!(err, MotionError::Safety(_)));
        assert_eq!(c.phase(), ControllerState::EmergencyStopped);
    }

    #[test]
    fn test_bus_error_mid_move_holds_and_idles() {
        let (mut c, sim) = homed();
        c.handle_command(Command::Park { speed: None }).unwrap();
        c.tick();
        c.tick();
        sim.drop_next(4);
        c.tick();
        assert_eq!(c.phase(), ControllerState::Idle);
        assert!(c.state().last_error.as_deref().unwrap().contains("NoResponse"));
        let log = sim.log();
        let halts = log.iter().filter(|r| r.code == CommandCode::SpeedTarget).count();
        assert_eq!(halts, 6);
    }

    #[test]
    fn test_fault_flag_mid_move_holds_at_once() {
        let (mut c, sim) = homed();
        c.handle_command(Command::Park { speed: None }).unwrap();
        c.tick();
        c.tick();
        sim.set_end_limit(3, true);
        sim.clear_log();
        c.tick();

        assert_eq!(c.phase(), ControllerState::Idle);
        assert!(c.state().last_error.as_deref().unwrap().contains("motor 3"));
        let log = sim.log();
        // One setpoint round, then the hold
        assert_eq!(log.iter().filter(|r| r.code == CommandCode::PositionTarget).count(), 6);
        assert_eq!(log.iter().filter(|r| r.code == CommandCode::SpeedTarget).count(), 6);

        sim.clear_log();
        c.tick();
        assert!(sim.log().iter().all(|r| r.code == CommandCode::QueryStatus));
    }

    #[test]
    fn test_jammed_joint_trips_tracking_check() {
        let (mut c, sim) = homed();
        sim.set_jammed(3, true);
        c.handle_command(Command::Park { speed: None }).unwrap();
        run_until(&mut c, |c| c.phase() != ControllerState::Moving);

        assert_eq!(c.phase(), ControllerState::Idle);
        let error = c.state().last_error.clone().unwrap();
        assert!(error.contains("lag the setpoint"), "{error}");
        assert!(error.contains("joint 2"), "{error}");
        assert!(c.state().joints.positions[2].abs() < 1e-9);
        // Halted well short of the park pose
        assert!(c.state().joints.positions[1] > -0.6 + 0.1);
    }

    #[test]
    fn test_failed_hold_latches_estop() {
        let (mut c, sim) = homed();
        c.handle_command(Command::Park { speed: None }).unwrap();
        c.tick();
        sim.set_absent(3, true);
        c.tick();
        assert_eq!(c.phase(), ControllerState::EmergencyStopped);
    }

    #[test]
    fn test_abort_is_not_latching() {
        let (mut c, _sim) = homed();
        c.handle_command(Command::Park { speed: None }).unwrap();
        c.tick();
        c.handle_command(Command::Abort).unwrap();
        assert_eq!(c.phase(), ControllerState::Idle);
        move_to(&mut c, [0.0; 6]);
        assert!(c.state().joints.max_abs_diff(&JointVector::zeros(6)) < 1e-4);
    }

    #[test]
    fn test_gripper_command() {
        let (mut c, sim) = homed();
        c.handle_command(Command::Gripper {
            command: GripperCommand::Close,
        })
        .unwrap();
        assert_eq!(c.state().gripper, GripperState::Closed);
        let last = *sim.log().last().unwrap();
        assert_eq!((last.address, last.position), (7, 0));

        let err = c
            .handle_command(Command::Gripper {
                command: GripperCommand::Position(2.0),
            })
            .unwrap_err();
        assert!(matches!(err, MotionError::InvalidInput(_)));
    }

    #[test]
    fn test_run_saved_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArmConfig::default();
        let sim = SimulatedBus::from_config(&config);
        let mut c = Controller::new(Arc::new(config), Box::new(SimConnector::new(sim.clone())))
            .with_programs(ProgramStore::open(dir.path()).unwrap());
        c.handle_command(Command::Connect).unwrap();
        run_until(&mut c, |c| c.phase() == ControllerState::Idle);

        let program = Program {
            name: "wave".to_string(),
            entries: vec![
                ProgramEntry {
                    name: "out".to_string(),
                    target: MotionTarget::Joints(JointVector::new(vec![0.3, 0.1, 0.2, 0.0, 0.5, 0.0])),
                    gripper: Some(GripperCommand::Close),
                    duration: None,
                },
                ProgramEntry {
                    name: "back".to_string(),
                    target: MotionTarget::Joints(JointVector::zeros(6)),
                    gripper: None,
                    duration: Some(2.0),
                },
            ],
        };
        c.handle_command(Command::SaveProgram { program }).unwrap();
        let outcome = c
            .handle_command(Command::RunProgram {
                name: "wave".to_string(),
                speed: None,
            })
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::MotionStarted { .. }));
        run_until(&mut c, |c| c.phase() != ControllerState::Moving);

        assert_eq!(c.phase(), ControllerState::Idle);
        assert_eq!(c.state().gripper, GripperState::Closed);
        assert!(sim.log().iter().any(|r| r.address == 7 && r.position == 0));
        assert!(c.state().joints.max_abs_diff(&JointVector::zeros(6)) < 1e-4);

        assert!(matches!(
            c.handle_command(Command::RunProgram {
                name: "missing".to_string(),
                speed: None
            }),
            Err(MotionError::Program(ProgramError::NotFound(_)))
        ));
    }

    #[test]
    fn test_teach_program_by_capture() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArmConfig::default();
        let sim = SimulatedBus::from_config(&config);
        let mut c = Controller::new(Arc::new(config), Box::new(SimConnector::new(sim)))
            .with_programs(ProgramStore::open(dir.path()).unwrap());
        assert_eq!(
            c.handle_command(Command::ListPrograms).unwrap(),
            CommandOutcome::Programs { names: Vec::new() }
        );
        // Joints mean nothing before homing
        assert!(matches!(
            c.handle_command(Command::CapturePose {
                program: "teach".to_string(),
                name: String::new()
            }),
            Err(MotionError::InvalidState { .. })
        ));
        c.handle_command(Command::Connect).unwrap();
        run_until(&mut c, |c| c.phase() == ControllerState::Idle);

        let reach = [0.3, 0.1, 0.2, 0.0, 0.5, 0.0];
        move_to(&mut c, reach);
        let outcome = c
            .handle_command(Command::CapturePose {
                program: "teach".to_string(),
                name: "reach".to_string(),
            })
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::ProgramUpdated {
                name: "teach".to_string(),
                entries: 1
            }
        );
        move_to(&mut c, [0.0; 6]);
        c.handle_command(Command::CapturePose {
            program: "teach".to_string(),
            name: "rest".to_string(),
        })
        .unwrap();
        assert_eq!(
            c.handle_command(Command::ListPrograms).unwrap(),
            CommandOutcome::Programs {
                names: vec!["teach".to_string()]
            }
        );

        assert!(matches!(
            c.handle_command(Command::DeletePose {
                program: "teach".to_string(),
                index: 5
            }),
            Err(MotionError::Program(ProgramError::EntryOutOfRange { index: 5, len: 2, .. }))
        ));
        let outcome = c
            .handle_command(Command::DeletePose {
                program: "teach".to_string(),
                index: 1,
            })
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::ProgramUpdated { entries: 1, .. }));

        // Replaying the taught program returns to the captured joints
        c.handle_command(Command::RunProgram {
            name: "teach".to_string(),
            speed: None,
        })
        .unwrap();
        c.tick();
        assert!(matches!(
            c.handle_command(Command::CapturePose {
                program: "teach".to_string(),
                name: String::new()
            }),
            Err(MotionError::Busy(ControllerState::Moving))
        ));
        run_until(&mut c, |c| c.phase() != ControllerState::Moving);
        assert!(c.state().joints.max_abs_diff(&JointVector::new(reach.to_vec())) < 1e-3);

        c.handle_command(Command::DeleteProgram {
            name: "teach".to_string(),
        })
        .unwrap();
        assert_eq!(
            c.handle_command(Command::ListPrograms).unwrap(),
            CommandOutcome::Programs { names: Vec::new() }
        );
        assert!(matches!(
            c.handle_command(Command::DeleteProgram {
                name: "teach".to_string()
            }),
            Err(MotionError::Program(ProgramError::NotFound(_)))
        ));
    }

    #[test]
    fn test_commands_need_connection() {
        let (mut c, _sim) = controller_with(ArmConfig::default());
        assert!(matches!(
            c.handle_command(Command::Park { speed: None }),
            Err(MotionError::InvalidState {
                state: ControllerState::Disconnected,
                ..
            })
        ));
        assert!(matches!(
            c.handle_command(Command::Reset),
            Err(MotionError::InvalidState { .. })
        ));
        assert_eq!(c.health(), RuntimeHealth::Disconnected);
    }

    #[test]
    fn test_disconnect_from_idle() {
        let (mut c, sim) = homed();
        c.handle_command(Command::Disconnect).unwrap();
        assert_eq!(c.phase(), ControllerState::Disconnected);
        assert_eq!(c.state().homing, HomingStatus::Unhomed);
        assert!(sim
            .log()
            .iter()
            .any(|r| r.code == CommandCode::Enable && r.position == 0));
    }
}
