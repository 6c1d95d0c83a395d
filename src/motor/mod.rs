// Motor control module for the arm
//
// Provides:
// - MKS-style servo bus framing, transport seam and retrying bus
// - High-level joint-space motor driver (gearing, coupled wrist, gripper, stops)
// - Simulated servo bus for dry runs and tests

pub mod driver;
pub mod mks;
pub mod sim;

pub use driver::{FeedbackFrame, JointFeedback, MotorDriver};
pub use mks::{BusError, BusErrorKind, MksBus, SerialTransport, Transport};
pub use sim::SimulatedBus;
