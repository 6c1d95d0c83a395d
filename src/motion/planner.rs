// Trajectory generation: one sample per control tick
//
// Joint moves use a per-joint three-phase velocity profile (accelerate,
// cruise, decelerate) stretched so every joint finishes on the same tick.
// Cartesian moves run the same profile on the path parameter and resolve
// each sample through IK, seeded by the previous sample.

use nalgebra::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::kinematics::{ArmKinematics, KinematicsError};
use super::program::Program;
use super::types::{CartesianPose, InvalidInputError, JointVector, Trajectory, Waypoint};
use crate::config::{ArmConfig, CartesianLimits};

/// Bounded re-timing passes for Cartesian paths
pub const MAX_RETIME_ATTEMPTS: usize = 4;
/// Slowest speed override accepted
pub const MIN_SPEED_SCALE: f64 = 0.01;
/// Longest trajectory ever sampled: twenty minutes at the default loop rate
pub const MAX_TRAJECTORY_TICKS: usize = 60_000;
/// Extra slowdown on each re-timing pass
const RETIME_MARGIN: f64 = 1.05;
/// Via-point velocities are capped at this share of the joint's bound
const BLEND_FRACTION: f64 = 0.5;
const SOLVER_ITERATIONS: usize = 100;
const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    #[default]
    JointLinear,
    CartesianLinear,
}

/// Goal of a move: joint angles or a tool pose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionTarget {
    Joints(JointVector),
    Pose(CartesianPose),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    Unreachable(KinematicsError),

    #[error("path sample {index} of {total} unreachable: {source}")]
    PathUnreachable {
        index: usize,
        total: usize,
        #[source]
        source: KinematicsError,
    },

    #[error("joint {joint} jumps {jump:.3} rad at path sample {index}")]
    BranchFlip {
        index: usize,
        joint: usize,
        jump: f64,
    },

    #[error("joint bounds still exceeded after {attempts} re-timing passes")]
    RetimeExhausted { attempts: usize },

    #[error("rotation between start and goal is a half turn; orientation path undefined")]
    AmbiguousRotation,

    #[error("program has no entries")]
    EmptyProgram,

    #[error("trajectory needs {ticks} ticks, limit is {limit}")]
    TooLong { ticks: usize, limit: usize },
}

impl From<KinematicsError> for PlanningError {
    fn from(err: KinematicsError) -> Self {
        match err {
            KinematicsError::InvalidInput(e) => PlanningError::InvalidInput(e),
            other => PlanningError::Unreachable(other),
        }
    }
}

/// Velocity and acceleration bound for one joint (or the path parameter)
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    velocity: f64,
    acceleration: f64,
}

/// Three-phase profile over a fixed duration.
///
/// Stored in a frame where the displacement is non-negative; `sign` maps it
/// back.
#[derive(Debug, Clone, Copy)]
struct Profile {
    origin: f64,
    sign: f64,
    v0: f64,
    vc: f64,
    accel_start: f64,
    accel_end: f64,
    t_accel: f64,
    t_cruise: f64,
    t_decel: f64,
}

fn reflect(d: f64, v0: f64, v1: f64) -> (f64, f64, f64, f64) {
    let sign = if d < 0.0 || (d == 0.0 && v0 + v1 < 0.0) {
        -1.0
    } else {
        1.0
    };
    (sign, d * sign, v0 * sign, v1 * sign)
}

/// Distance covered when cruising at `vc` with boundary velocities v0/v1
fn covered(v0: f64, v1: f64, vc: f64, a: f64, duration: f64) -> f64 {
    let ta = (vc - v0).abs() / a;
    let tb = (vc - v1).abs() / a;
    let tc = (duration - ta - tb).max(0.0);
    0.5 * (v0 + vc) * ta + vc * tc + 0.5 * (vc + v1) * tb
}

fn max_covered(v0: f64, v1: f64, b: Bounds, duration: f64) -> f64 {
    let vc = (0.5 * (b.acceleration * duration + v0 + v1)).min(b.velocity);
    covered(v0, v1, vc, b.acceleration, duration)
}

/// Shortest duration that covers `d` with the given boundary velocities.
///
/// Boundary velocities must point along `d` and satisfy v²/2a ≤ |d|/2, which
/// makes the feasible durations an upward-closed interval.
fn min_duration(d: f64, v0: f64, v1: f64, b: Bounds) -> f64 {
    let (_, d, v0, v1) = reflect(d, v0, v1);
    if d < EPS && v0.abs() < EPS && v1.abs() < EPS {
        return 0.0;
    }
    let mut lo = (v0 - v1).abs() / b.acceleration;
    if max_covered(v0, v1, b, lo) >= d {
        return lo;
    }
    let mut hi = (2.0 * lo).max(1e-3);
    for _ in 0..64 {
        if max_covered(v0, v1, b, hi) >= d {
            break;
        }
        hi *= 2.0;
    }
    for _ in 0..SOLVER_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if max_covered(v0, v1, b, mid) >= d {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi
}

impl Profile {
    /// Profile covering `d` in exactly `duration`, which must not be shorter
    /// than `min_duration`
    fn solve(origin: f64, d: f64, v0: f64, v1: f64, b: Bounds, duration: f64) -> Self {
        let (sign, d, v0, v1) = reflect(d, v0, v1);
        let a = b.acceleration;
        // Covered distance grows monotonically with the cruise velocity
        let mut lo = (0.5 * (v0 + v1 - a * duration)).max(-b.velocity);
        let mut hi = (0.5 * (a * duration + v0 + v1)).min(b.velocity);
        for _ in 0..SOLVER_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            if covered(v0, v1, mid, a, duration) < d {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let vc = 0.5 * (lo + hi);
        let t_accel = (vc - v0).abs() / a;
        let t_decel = (vc - v1).abs() / a;
        Self {
            origin,
            sign,
            v0,
            vc,
            accel_start: if vc >= v0 { a } else { -a },
            accel_end: if v1 >= vc { a } else { -a },
            t_accel,
            t_cruise: (duration - t_accel - t_decel).max(0.0),
            t_decel,
        }
    }

    fn sample(&self, t: f64) -> (f64, f64) {
        let t = t.max(0.0);
        let (p, v) = if t <= self.t_accel {
            (
                self.v0 * t + 0.5 * self.accel_start * t * t,
                self.v0 + self.accel_start * t,
            )
        } else {
            let p1 = self.v0 * self.t_accel + 0.5 * self.accel_start * self.t_accel * self.t_accel;
            if t <= self.t_accel + self.t_cruise {
                (p1 + self.vc * (t - self.t_accel), self.vc)
            } else {
                let p2 = p1 + self.vc * self.t_cruise;
                let u = (t - self.t_accel - self.t_cruise).min(self.t_decel);
                (
                    p2 + self.vc * u + 0.5 * self.accel_end * u * u,
                    self.vc + self.accel_end * u,
                )
            }
        };
        (self.origin + self.sign * p, self.sign * v)
    }
}

/// Rounds a duration up to whole ticks
fn ticks_for(duration: f64, dt: f64) -> usize {
    (duration / dt - 1e-9).ceil().max(0.0) as usize
}

/// Checked before any waypoint is allocated
fn check_length(ticks: usize) -> Result<(), PlanningError> {
    if ticks > MAX_TRAJECTORY_TICKS {
        return Err(PlanningError::TooLong {
            ticks,
            limit: MAX_TRAJECTORY_TICKS,
        });
    }
    Ok(())
}

/// Converts motion requests into tick-sampled trajectories
#[derive(Debug, Clone)]
pub struct PathPlanner {
    kinematics: ArmKinematics,
    joint_bounds: Vec<Bounds>,
    cartesian: CartesianLimits,
    dt: f64,
    speed_scale: f64,
    max_joint_jump: f64,
}

impl PathPlanner {
    pub fn from_config(config: &ArmConfig) -> Self {
        Self {
            kinematics: ArmKinematics::from_config(config),
            joint_bounds: config
                .motors
                .iter()
                .map(|m| Bounds {
                    velocity: m.max_velocity,
                    acceleration: m.max_acceleration,
                })
                .collect(),
            cartesian: config.cartesian.clone(),
            dt: config.dt(),
            speed_scale: config.speed_scale,
            max_joint_jump: config.max_joint_jump,
        }
    }

    pub fn kinematics(&self) -> &ArmKinematics {
        &self.kinematics
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Resolve a target to joint angles, seeding IK with `seed`
    pub fn resolve(
        &self,
        target: &MotionTarget,
        seed: &JointVector,
    ) -> Result<JointVector, PlanningError> {
        let n = self.joint_bounds.len();
        match target {
            MotionTarget::Joints(q) => {
                q.check(n)?;
                Ok(JointVector::new(q.positions.clone()))
            }
            MotionTarget::Pose(pose) => Ok(self.kinematics.inverse(pose, seed)?),
        }
    }

    /// Plan a single move from rest to rest
    pub fn plan(
        &self,
        from: &JointVector,
        target: &MotionTarget,
        mode: PlanMode,
        speed: Option<f64>,
    ) -> Result<Trajectory, PlanningError> {
        from.check(self.joint_bounds.len())?;
        let scale = self.scale(speed)?;
        match mode {
            PlanMode::JointLinear => {
                let goal = self.resolve(target, from)?;
                self.plan_joint(from, &goal, scale)
            }
            PlanMode::CartesianLinear => {
                let goal = match target {
                    MotionTarget::Pose(pose) => {
                        if !pose.is_finite() {
                            return Err(InvalidInputError::NonFinitePose.into());
                        }
                        *pose
                    }
                    MotionTarget::Joints(q) => self.kinematics.forward(q)?,
                };
                self.plan_cartesian(from, &goal, scale)
            }
        }
    }

    /// Plan a whole program as one trajectory through every entry.
    ///
    /// The robot passes through intermediate entries without stopping unless
    /// a joint reverses there or the entry carries a gripper action.
    pub fn plan_program(
        &self,
        from: &JointVector,
        program: &Program,
        speed: Option<f64>,
    ) -> Result<Trajectory, PlanningError> {
        let n = self.joint_bounds.len();
        from.check(n)?;
        if program.entries.is_empty() {
            return Err(PlanningError::EmptyProgram);
        }
        let scale = self.scale(speed)?;
        let bounds = self.scaled_bounds(scale);

        let mut points = Vec::with_capacity(program.entries.len() + 1);
        points.push(JointVector::new(from.positions.clone()));
        for entry in &program.entries {
            let seed = &points[points.len() - 1];
            let q = self.resolve(&entry.target, seed)?;
            points.push(q);
        }

        // Via velocities; rest at both ends
        let m = points.len();
        let mut via = vec![vec![0.0; n]; m];
        for i in 1..m - 1 {
            if program.entries[i - 1].gripper.is_some() {
                continue;
            }
            for (j, b) in bounds.iter().enumerate() {
                let before = points[i].positions[j] - points[i - 1].positions[j];
                let after = points[i + 1].positions[j] - points[i].positions[j];
                if before.abs() < EPS || after.abs() < EPS || before.signum() != after.signum() {
                    continue;
                }
                let blend = (b.velocity * BLEND_FRACTION)
                    .min((b.acceleration * before.abs()).sqrt())
                    .min((b.acceleration * after.abs()).sqrt());
                via[i][j] = blend * before.signum();
            }
        }

        let mut segment_ticks = Vec::with_capacity(program.entries.len());
        for (s, entry) in program.entries.iter().enumerate() {
            let (a, b) = (&points[s], &points[s + 1]);
            let mut duration = (0..n)
                .map(|j| {
                    min_duration(
                        b.positions[j] - a.positions[j],
                        via[s][j],
                        via[s + 1][j],
                        bounds[j],
                    )
                })
                .fold(0.0, f64::max);
            if let Some(hint) = entry.duration {
                if hint.is_finite() && hint > duration {
                    duration = hint;
                }
            }
            segment_ticks.push(ticks_for(duration, self.dt).max(1));
        }
        let total = segment_ticks
            .iter()
            .fold(0usize, |sum, &ticks| sum.saturating_add(ticks));
        check_length(total)?;

        let mut waypoints = Vec::with_capacity(total + 1);
        waypoints.push(Waypoint::new(
            0.0,
            JointVector::new(from.positions.clone()).with_velocities(vec![0.0; n]),
        ));
        let mut t0 = 0.0;
        for (s, (entry, &ticks)) in program.entries.iter().zip(&segment_ticks).enumerate() {
            let (a, b) = (&points[s], &points[s + 1]);
            let duration = ticks as f64 * self.dt;
            let profiles: Vec<Profile> = (0..n)
                .map(|j| {
                    Profile::solve(
                        a.positions[j],
                        b.positions[j] - a.positions[j],
                        via[s][j],
                        via[s + 1][j],
                        bounds[j],
                        duration,
                    )
                })
                .collect();
            debug!(
                "program segment {} ({}): {} ticks",
                s, entry.name, ticks
            );
            for k in 1..=ticks {
                let mut w = if k == ticks {
                    Waypoint::new(
                        t0 + duration,
                        JointVector::new(b.positions.clone()).with_velocities(via[s + 1].clone()),
                    )
                } else {
                    Self::sample(&profiles, t0, k as f64 * self.dt)
                };
                if k == ticks {
                    w.gripper = entry.gripper;
                }
                waypoints.push(w);
            }
            t0 += duration;
        }

        info!(
            "planned program '{}': {} entries, {:.2} s",
            program.name,
            program.entries.len(),
            t0
        );
        Ok(Trajectory::from_waypoints(waypoints))
    }

    fn scale(&self, speed: Option<f64>) -> Result<f64, InvalidInputError> {
        match speed {
            None => Ok(self.speed_scale),
            Some(s) if s.is_finite() && (MIN_SPEED_SCALE..=1.0).contains(&s) => {
                Ok(self.speed_scale * s)
            }
            Some(s) => Err(InvalidInputError::OutOfRange {
                what: "speed",
                value: s,
            }),
        }
    }

    fn scaled_bounds(&self, scale: f64) -> Vec<Bounds> {
        self.joint_bounds
            .iter()
            .map(|b| Bounds {
                velocity: b.velocity * scale,
                acceleration: b.acceleration * scale,
            })
            .collect()
    }

    fn sample(profiles: &[Profile], t0: f64, t: f64) -> Waypoint {
        let (positions, velocities): (Vec<f64>, Vec<f64>) =
            profiles.iter().map(|p| p.sample(t)).unzip();
        Waypoint::new(t0 + t, JointVector::new(positions).with_velocities(velocities))
    }

    fn plan_joint(
        &self,
        from: &JointVector,
        goal: &JointVector,
        scale: f64,
    ) -> Result<Trajectory, PlanningError> {
        let n = self.joint_bounds.len();
        let bounds = self.scaled_bounds(scale);
        let duration = (0..n)
            .map(|j| min_duration(goal.positions[j] - from.positions[j], 0.0, 0.0, bounds[j]))
            .fold(0.0, f64::max);
        let ticks = ticks_for(duration, self.dt);
        check_length(ticks)?;
        let duration = ticks as f64 * self.dt;

        let mut waypoints = Vec::with_capacity(ticks + 1);
        waypoints.push(Waypoint::new(
            0.0,
            JointVector::new(from.positions.clone()).with_velocities(vec![0.0; n]),
        ));
        if ticks > 0 {
            let profiles: Vec<Profile> = (0..n)
                .map(|j| {
                    Profile::solve(
                        from.positions[j],
                        goal.positions[j] - from.positions[j],
                        0.0,
                        0.0,
                        bounds[j],
                        duration,
                    )
                })
                .collect();
            waypoints.extend((1..ticks).map(|k| Self::sample(&profiles, 0.0, k as f64 * self.dt)));
            waypoints.push(Waypoint::new(
                duration,
                JointVector::new(goal.positions.clone()).with_velocities(vec![0.0; n]),
            ));
        }
        debug!("joint move: {} ticks, {:.2} s", ticks, duration);
        Ok(Trajectory::from_waypoints(waypoints))
    }

    fn plan_cartesian(
        &self,
        from: &JointVector,
        goal: &CartesianPose,
        scale: f64,
    ) -> Result<Trajectory, PlanningError> {
        // Fail early when the goal itself has no solution
        self.kinematics.inverse(goal, from)?;

        let start = self.kinematics.forward(from)?.to_isometry();
        let end = goal.to_isometry();
        let p0 = start.translation.vector;
        let delta: Vector3<f64> = end.translation.vector - p0;
        let length = delta.norm();
        let angle = start.rotation.angle_to(&end.rotation);

        let mut path = Bounds {
            velocity: f64::INFINITY,
            acceleration: f64::INFINITY,
        };
        if length > EPS {
            path.velocity = path.velocity.min(self.cartesian.max_linear_velocity * scale / length);
            path.acceleration = path
                .acceleration
                .min(self.cartesian.max_linear_acceleration * scale / length);
        }
        if angle > EPS {
            path.velocity = path.velocity.min(self.cartesian.max_angular_velocity * scale / angle);
            path.acceleration = path
                .acceleration
                .min(self.cartesian.max_angular_acceleration * scale / angle);
        }
        if !path.velocity.is_finite() {
            return Ok(Trajectory::from_waypoints(vec![Waypoint::new(
                0.0,
                JointVector::new(from.positions.clone()),
            )]));
        }

        let bounds = self.scaled_bounds(scale);
        for attempt in 0..=MAX_RETIME_ATTEMPTS {
            let ticks = ticks_for(min_duration(1.0, 0.0, 0.0, path), self.dt).max(1);
            check_length(ticks)?;
            let profile = Profile::solve(0.0, 1.0, 0.0, 0.0, path, ticks as f64 * self.dt);

            let mut waypoints = Vec::with_capacity(ticks + 1);
            waypoints.push(Waypoint::new(0.0, JointVector::new(from.positions.clone())));
            let mut seed = JointVector::new(from.positions.clone());
            for k in 1..=ticks {
                let t = k as f64 * self.dt;
                let s = if k == ticks { 1.0 } else { profile.sample(t).0 };
                let rotation = start
                    .rotation
                    .try_slerp(&end.rotation, s, 1e-9)
                    .ok_or(PlanningError::AmbiguousRotation)?;
                let pose = CartesianPose::from_isometry(&Isometry3::from_parts(
                    (p0 + delta * s).into(),
                    rotation,
                ));
                let q = self.kinematics.inverse(&pose, &seed).map_err(|source| {
                    PlanningError::PathUnreachable {
                        index: k,
                        total: ticks,
                        source,
                    }
                })?;
                for (joint, (a, b)) in q.positions.iter().zip(&seed.positions).enumerate() {
                    let jump = (a - b).abs();
                    if jump > self.max_joint_jump {
                        return Err(PlanningError::BranchFlip {
                            index: k,
                            joint,
                            jump,
                        });
                    }
                }
                seed = q.clone();
                waypoints.push(Waypoint::new(t, q));
            }

            let (velocity_ratio, accel_ratio) = rate_ratios(&waypoints, &bounds);
            if velocity_ratio <= 1.0 && accel_ratio <= 1.0 {
                debug!(
                    "cartesian move: {} ticks after {} re-timing passes",
                    ticks, attempt
                );
                return Ok(Trajectory::from_waypoints(waypoints));
            }
            let factor = velocity_ratio.max(accel_ratio.sqrt()) * RETIME_MARGIN;
            debug!(
                "cartesian move exceeds joint bounds (v x{:.3}, a x{:.3}), slowing by {:.3}",
                velocity_ratio, accel_ratio, factor
            );
            path.velocity /= factor;
            path.acceleration /= factor * factor;
        }
        Err(PlanningError::RetimeExhausted {
            attempts: MAX_RETIME_ATTEMPTS,
        })
    }
}

/// Largest finite-difference velocity and acceleration, as a multiple of
/// each joint's bound
fn rate_ratios(waypoints: &[Waypoint], bounds: &[Bounds]) -> (f64, f64) {
    let mut velocity: f64 = 0.0;
    let mut accel: f64 = 0.0;
    for pair in waypoints.windows(2) {
        let dt = pair[1].time - pair[0].time;
        for (j, b) in bounds.iter().enumerate() {
            let v = (pair[1].joints.positions[j] - pair[0].joints.positions[j]).abs() / dt;
            velocity = velocity.max(v / b.velocity);
        }
    }
    for triple in waypoints.windows(3) {
        let dt_a = triple[1].time - triple[0].time;
        let dt_b = triple[2].time - triple[1].time;
        for (j, b) in bounds.iter().enumerate() {
            let v_a = (triple[1].joints.positions[j] - triple[0].joints.positions[j]) / dt_a;
            let v_b = (triple[2].joints.positions[j] - triple[1].joints.positions[j]) / dt_b;
            let a = (v_b - v_a).abs() / (0.5 * (dt_a + dt_b));
            accel = accel.max(a / b.acceleration);
        }
    }
    (velocity, accel)
}
