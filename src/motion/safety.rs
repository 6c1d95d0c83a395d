// Stateless gate between planning and the bus
//
// Every trajectory is checked as a whole before it is accepted, and every
// waypoint is checked again right before it is transmitted.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{JointVector, Trajectory, Waypoint};
use crate::config::ArmConfig;

/// Relative slack on velocity/acceleration bounds for sampling round-off
const RATE_TOLERANCE: f64 = 1e-6;
const RATE_EPSILON: f64 = 1e-9;
/// How far the first waypoint may sit from the robot's current joints (rad)
pub const CONTINUITY_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    Length,
    NonFinite,
    JointLimit,
    Velocity,
    Acceleration,
    Timestamp,
    Discontinuity,
    EmptyTrajectory,
    Tracking,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationReason::Length => "wrong joint count",
            ViolationReason::NonFinite => "non-finite value",
            ViolationReason::JointLimit => "joint limit exceeded",
            ViolationReason::Velocity => "velocity bound exceeded",
            ViolationReason::Acceleration => "acceleration bound exceeded",
            ViolationReason::Timestamp => "timestamps not strictly increasing",
            ViolationReason::Discontinuity => "trajectory does not start at the current joints",
            ViolationReason::EmptyTrajectory => "empty trajectory",
            ViolationReason::Tracking => "measured joints lag the setpoint",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}{}", describe(.joint, .value))]
pub struct SafetyViolation {
    pub reason: ViolationReason,
    pub joint: Option<usize>,
    pub value: f64,
}

fn describe(joint: &Option<usize>, value: &f64) -> String {
    match joint {
        Some(j) => format!(" (joint {j}, value {value:.4})"),
        None => format!(" (value {value:.4})"),
    }
}

impl SafetyViolation {
    fn joint(reason: ViolationReason, joint: usize, value: f64) -> Self {
        Self {
            reason,
            joint: Some(joint),
            value,
        }
    }

    fn whole(reason: ViolationReason, value: f64) -> Self {
        Self {
            reason,
            joint: None,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct JointBounds {
    min: f64,
    max: f64,
    max_velocity: f64,
    max_acceleration: f64,
}

/// Joint-limit and rate checks built from the motor descriptors
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    bounds: Vec<JointBounds>,
    /// Largest gap between the last setpoint and the read-back (rad)
    max_tracking_error: f64,
}

impl SafetyValidator {
    pub fn from_config(config: &ArmConfig) -> Self {
        Self {
            bounds: config
                .motors
                .iter()
                .map(|m| JointBounds {
                    min: m.min_angle,
                    max: m.max_angle,
                    max_velocity: m.max_velocity,
                    max_acceleration: m.max_acceleration,
                })
                .collect(),
            max_tracking_error: config.max_tracking_error,
        }
    }

    pub fn joint_count(&self) -> usize {
        self.bounds.len()
    }

    /// Length, finiteness and limit containment of a single configuration
    pub fn check_joints(&self, q: &JointVector) -> Result<(), SafetyViolation> {
        if q.len() != self.bounds.len() {
            return Err(SafetyViolation::whole(ViolationReason::Length, q.len() as f64));
        }
        for (i, (&angle, b)) in q.positions.iter().zip(&self.bounds).enumerate() {
            if !angle.is_finite() {
                return Err(SafetyViolation::joint(ViolationReason::NonFinite, i, angle));
            }
            if angle < b.min || angle > b.max {
                return Err(SafetyViolation::joint(ViolationReason::JointLimit, i, angle));
            }
        }
        Ok(())
    }

    /// Checks a waypoint right before transmission.
    ///
    /// `sent` holds the waypoints already sent from the same trajectory,
    /// oldest first; the last two bound the step velocity and acceleration.
    /// `measured` is the latest joint read-back, which must still follow the
    /// last setpoint.
    pub fn check_waypoint(
        &self,
        waypoint: &Waypoint,
        sent: &[Waypoint],
        measured: &JointVector,
    ) -> Result<(), SafetyViolation> {
        if !waypoint.time.is_finite() {
            return Err(SafetyViolation::whole(ViolationReason::NonFinite, waypoint.time));
        }
        self.check_joints(&waypoint.joints)?;
        if let Some(prev) = sent.last() {
            self.check_step(prev, waypoint)?;
        }
        if let [.., before, prev] = sent {
            self.check_accel(before, prev, waypoint)?;
        }

        let setpoint = sent.last().unwrap_or(waypoint);
        if measured.len() != setpoint.joints.len() {
            return Err(SafetyViolation::whole(ViolationReason::Length, measured.len() as f64));
        }
        for (i, (m, s)) in measured.positions.iter().zip(&setpoint.joints.positions).enumerate() {
            let gap = (m - s).abs();
            if !(gap <= self.max_tracking_error) {
                return Err(SafetyViolation::joint(ViolationReason::Tracking, i, gap));
            }
        }
        Ok(())
    }

    /// Whole-trajectory gate: every waypoint, timestamp order, per-step
    /// velocity and acceleration, and continuity with `current`
    pub fn check_trajectory(
        &self,
        trajectory: &Trajectory,
        current: &JointVector,
    ) -> Result<(), SafetyViolation> {
        let waypoints = trajectory.waypoints();
        let Some(first) = waypoints.first() else {
            return Err(SafetyViolation::whole(ViolationReason::EmptyTrajectory, 0.0));
        };

        for w in waypoints {
            if !w.time.is_finite() {
                return Err(SafetyViolation::whole(ViolationReason::NonFinite, w.time));
            }
            self.check_joints(&w.joints)?;
        }

        if current.len() == first.joints.len() {
            for (i, (a, b)) in first.joints.positions.iter().zip(&current.positions).enumerate() {
                let gap = (a - b).abs();
                if gap > CONTINUITY_TOLERANCE {
                    return Err(SafetyViolation::joint(ViolationReason::Discontinuity, i, gap));
                }
            }
        } else {
            return Err(SafetyViolation::whole(
                ViolationReason::Length,
                current.len() as f64,
            ));
        }

        for pair in waypoints.windows(2) {
            self.check_step(&pair[0], &pair[1])?;
        }

        for triple in waypoints.windows(3) {
            self.check_accel(&triple[0], &triple[1], &triple[2])?;
        }
        Ok(())
    }

    fn check_step(&self, prev: &Waypoint, next: &Waypoint) -> Result<(), SafetyViolation> {
        let dt = next.time - prev.time;
        if !(dt > 0.0) {
            return Err(SafetyViolation::whole(ViolationReason::Timestamp, next.time));
        }
        for (i, b) in self.bounds.iter().enumerate() {
            let velocity = (next.joints.positions[i] - prev.joints.positions[i]).abs() / dt;
            if velocity > b.max_velocity * (1.0 + RATE_TOLERANCE) + RATE_EPSILON {
                return Err(SafetyViolation::joint(ViolationReason::Velocity, i, velocity));
            }
        }
        Ok(())
    }

    /// Timestamps must already be known to increase
    fn check_accel(&self, a: &Waypoint, b: &Waypoint, c: &Waypoint) -> Result<(), SafetyViolation> {
        let dt_a = b.time - a.time;
        let dt_b = c.time - b.time;
        for (i, bound) in self.bounds.iter().enumerate() {
            let v_a = (b.joints.positions[i] - a.joints.positions[i]) / dt_a;
            let v_b = (c.joints.positions[i] - b.joints.positions[i]) / dt_b;
            // Consecutive mean velocities are half a step apart on each side
            let accel = (v_b - v_a).abs() / (0.5 * (dt_a + dt_b));
            if accel > bound.max_acceleration * (1.0 + RATE_TOLERANCE) + RATE_EPSILON {
                return Err(SafetyViolation::joint(ViolationReason::Acceleration, i, accel));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::from_config(&ArmConfig::default())
    }

    fn ramp(steps: usize, joint: usize, step: f64, dt: f64) -> Trajectory {
        let waypoints = (0..=steps)
            .map(|k| {
                let mut q = vec![0.0; 6];
                q[joint] = step * k as f64;
                Waypoint::new(k as f64 * dt, JointVector::new(q))
            })
            .collect();
        Trajectory::from_waypoints(waypoints)
    }

    #[test]
    fn test_joint_limits() {
        let v = validator();
        assert!(v.check_joints(&JointVector::zeros(6)).is_ok());

        let mut q = JointVector::zeros(6);
        q.positions[1] = 1.6;
        let err = v.check_joints(&q).unwrap_err();
        assert_eq!(err.reason, ViolationReason::JointLimit);
        assert_eq!(err.joint, Some(1));
        assert_eq!(err.value, 1.6);

        q.positions[1] = f64::INFINITY;
        assert_eq!(v.check_joints(&q).unwrap_err().reason, ViolationReason::NonFinite);

        let short = JointVector::zeros(4);
        assert_eq!(v.check_joints(&short).unwrap_err().reason, ViolationReason::Length);
    }

    #[test]
    fn test_trajectory_within_bounds_passes() {
        // 0.01 rad per 20 ms = 0.5 rad/s on the shoulder (limit 0.6)
        let traj = ramp(10, 1, 0.01, 0.02);
        assert!(v_ok(&traj));
    }

    fn v_ok(traj: &Trajectory) -> bool {
        validator().check_trajectory(traj, &JointVector::zeros(6)).is_ok()
    }

    #[test]
    fn test_velocity_violation() {
        // 0.02 rad per 20 ms = 1.0 rad/s on the shoulder
        let traj = ramp(5, 1, 0.02, 0.02);
        let err = validator()
            .check_trajectory(&traj, &JointVector::zeros(6))
            .unwrap_err();
        assert_eq!(err.reason, ViolationReason::Velocity);
        assert_eq!(err.joint, Some(1));
    }

    #[test]
    fn test_acceleration_violation() {
        // Standing start straight into 0.5 rad/s: 25 rad/s² on the shoulder
        let mut waypoints = vec![Waypoint::new(0.0, JointVector::zeros(6))];
        waypoints.extend(ramp(5, 1, 0.01, 0.02).into_waypoints().into_iter().map(|mut w| {
            w.time += 0.02;
            w
        }));
        let traj = Trajectory::from_waypoints(waypoints);
        let err = validator()
            .check_trajectory(&traj, &JointVector::zeros(6))
            .unwrap_err();
        assert_eq!(err.reason, ViolationReason::Acceleration);
    }

    #[test]
    fn test_out_of_limit_waypoint_rejects_whole_trajectory() {
        let mut waypoints = ramp(3, 0, 0.01, 0.02).into_waypoints();
        waypoints[2].joints.positions[2] = 3.0;
        let traj = Trajectory::from_waypoints(waypoints);
        let err = validator()
            .check_trajectory(&traj, &JointVector::zeros(6))
            .unwrap_err();
        assert_eq!(err.reason, ViolationReason::JointLimit);
        assert_eq!(err.joint, Some(2));
    }

    #[test]
    fn test_timestamps_must_increase() {
        let mut waypoints = ramp(3, 0, 0.0, 0.02).into_waypoints();
        waypoints[2].time = waypoints[1].time;
        let traj = Trajectory::from_waypoints(waypoints);
        let err = validator()
            .check_trajectory(&traj, &JointVector::zeros(6))
            .unwrap_err();
        assert_eq!(err.reason, ViolationReason::Timestamp);
    }

    #[test]
    fn test_must_start_at_current_joints() {
        let traj = ramp(3, 0, 0.01, 0.02);
        let mut current = JointVector::zeros(6);
        current.positions[4] = 0.2;
        let err = validator().check_trajectory(&traj, &current).unwrap_err();
        assert_eq!(err.reason, ViolationReason::Discontinuity);
        assert_eq!(err.joint, Some(4));
    }

    #[test]
    fn test_empty_trajectory() {
        let traj = Trajectory::from_waypoints(Vec::new());
        assert!(!v_ok(&traj));
    }

    #[test]
    fn test_waypoint_check_against_previous() {
        let v = validator();
        let a = Waypoint::new(0.0, JointVector::zeros(6));
        let mut q = JointVector::zeros(6);
        q.positions[0] = 0.1;
        let b = Waypoint::new(0.02, q);
        assert!(v.check_waypoint(&a, &[], &JointVector::zeros(6)).is_ok());
        // 5 rad/s on the base
        let err = v
            .check_waypoint(&b, std::slice::from_ref(&a), &JointVector::zeros(6))
            .unwrap_err();
        assert_eq!(err.reason, ViolationReason::Velocity);
    }

    #[test]
    fn test_waypoint_step_acceleration() {
        let v = validator();
        let sent = ramp(2, 1, 0.01, 0.02).into_waypoints();
        let measured = sent[2].joints.clone();
        let mut stop = sent[2].clone();
        stop.time += 0.02;
        // 0.5 rad/s straight to a stop: 25 rad/s² on the shoulder
        let err = v.check_waypoint(&stop, &sent, &measured).unwrap_err();
        assert_eq!(err.reason, ViolationReason::Acceleration);
        assert_eq!(err.joint, Some(1));
        // One sent waypoint has no rate to change from
        v.check_waypoint(&stop, &sent[2..], &measured).unwrap();

        let mut cruise = stop;
        cruise.joints.positions[1] += 0.01;
        v.check_waypoint(&cruise, &sent, &measured).unwrap();
    }

    #[test]
    fn test_waypoint_tracking() {
        let v = validator();
        let sent = ramp(2, 2, 0.01, 0.02).into_waypoints();
        let mut next = sent[2].clone();
        next.time += 0.02;
        next.joints.positions[2] += 0.01;

        let mut measured = sent[2].joints.clone();
        measured.positions[2] -= 0.05;
        v.check_waypoint(&next, &sent, &measured).unwrap();

        // Elbow stuck at zero while the setpoints ran ahead
        measured.positions[2] = -0.2;
        let err = v.check_waypoint(&next, &sent, &measured).unwrap_err();
        assert_eq!(err.reason, ViolationReason::Tracking);
        assert_eq!(err.joint, Some(2));
        assert!((err.value - 0.22).abs() < 1e-9);

        measured.positions[2] = f64::NAN;
        assert_eq!(
            v.check_waypoint(&next, &sent, &measured).unwrap_err().reason,
            ViolationReason::Tracking
        );
    }

    #[test]
    fn test_violation_display() {
        let err = SafetyViolation::joint(ViolationReason::JointLimit, 3, 2.95);
        assert_eq!(err.to_string(), "joint limit exceeded (joint 3, value 2.9500)");
    }
}
