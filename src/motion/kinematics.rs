// Serial-chain kinematics for the arm
//
// Forward: compose each joint's fixed origin and its rotation about the
// joint axis, then the tool offset.
// Inverse: damped least squares on the geometric Jacobian, seeded from the
// caller's configuration so consecutive solves stay on one branch.

use nalgebra::{DMatrix, DVector, Isometry3, Translation3, Unit, UnitQuaternion, Vector3};
use tracing::debug;

use super::types::{CartesianPose, InvalidInputError, JointVector};
use crate::config::ArmConfig;

/// Converged when both errors are below these
pub const POSITION_TOLERANCE: f64 = 1e-5; // m
pub const ORIENTATION_TOLERANCE: f64 = 1e-4; // rad
pub const MAX_ITERATIONS: usize = 300;

/// Baseline damping, always present so the normal equations stay solvable
const BASE_DAMPING_SQ: f64 = 1e-8;
/// Extra damping reached at a singularity
const SINGULAR_DAMPING_SQ: f64 = 2.5e-3;
/// Manipulability below which singular damping ramps in
const MANIPULABILITY_THRESHOLD: f64 = 1e-3;
/// Largest joint-space step per iteration (rad)
const MAX_STEP: f64 = 0.25;
/// Adaptive (Levenberg-Marquardt) damping ceiling before giving up
const MAX_ADAPTIVE_DAMPING: f64 = 1e4;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KinematicsError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(
        "target unreachable: residual {position_error:.5} m / {orientation_error:.5} rad after {iterations} iterations"
    )]
    Unreachable {
        position_error: f64,
        orientation_error: f64,
        iterations: usize,
    },
}

#[derive(Debug, Clone)]
struct Joint {
    origin: Isometry3<f64>,
    axis: Unit<Vector3<f64>>,
}

/// World-frame placement of one joint for a given configuration
#[derive(Debug, Clone, Copy)]
struct JointFrame {
    position: Vector3<f64>,
    axis: Vector3<f64>,
}

fn isometry(xyz: [f64; 3], rpy: [f64; 3]) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(xyz[0], xyz[1], xyz[2]),
        UnitQuaternion::from_euler_angles(rpy[0], rpy[1], rpy[2]),
    )
}

/// Kinematic model of the arm, built once from the configuration
#[derive(Debug, Clone)]
pub struct ArmKinematics {
    joints: Vec<Joint>,
    tool: Isometry3<f64>,
    /// Fixed point every pose's distance is bounded from
    reach_center: Vector3<f64>,
    reach_radius: f64,
}

impl ArmKinematics {
    pub fn from_config(config: &ArmConfig) -> Self {
        let joints: Vec<Joint> = config
            .chain
            .iter()
            .map(|link| Joint {
                origin: isometry(link.xyz, link.rpy),
                axis: Unit::new_normalize(Vector3::new(link.axis[0], link.axis[1], link.axis[2])),
            })
            .collect();
        let tool = isometry(config.tool.xyz, config.tool.rpy);

        // The first joint rotates about its own origin, so the tool can never
        // be further from that point than the sum of the remaining links
        let reach_center = joints
            .first()
            .map(|j| j.origin.translation.vector)
            .unwrap_or_else(Vector3::zeros);
        let reach_radius = joints
            .iter()
            .skip(1)
            .map(|j| j.origin.translation.vector.norm())
            .sum::<f64>()
            + tool.translation.vector.norm();

        Self {
            joints,
            tool,
            reach_center,
            reach_radius,
        }
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn reach_radius(&self) -> f64 {
        self.reach_radius
    }

    /// Forward kinematics: joint angles to tool pose
    pub fn forward(&self, q: &JointVector) -> Result<CartesianPose, InvalidInputError> {
        q.check(self.joints.len())?;
        Ok(CartesianPose::from_isometry(&self.tool_isometry(&q.positions)))
    }

    /// Geometric Jacobian (6 x n): linear rows first, then angular
    pub fn jacobian(&self, q: &JointVector) -> Result<DMatrix<f64>, InvalidInputError> {
        q.check(self.joints.len())?;
        let (frames, tool) = self.frames(&q.positions);
        Ok(Self::jacobian_from(&frames, &tool))
    }

    /// Yoshikawa manipulability, sqrt(det(J Jᵀ)); zero at a singularity
    pub fn manipulability(&self, q: &JointVector) -> Result<f64, InvalidInputError> {
        let j = self.jacobian(q)?;
        Ok(Self::manipulability_of(&j))
    }

    /// Inverse kinematics seeded from `seed`.
    ///
    /// Joint limits are not applied; the result may lie outside them.
    pub fn inverse(
        &self,
        target: &CartesianPose,
        seed: &JointVector,
    ) -> Result<JointVector, KinematicsError> {
        let n = self.joints.len();
        seed.check(n)?;
        if !target.is_finite() {
            return Err(InvalidInputError::NonFinitePose.into());
        }

        let goal = target.to_isometry();
        let distance = (goal.translation.vector - self.reach_center).norm();
        if distance > self.reach_radius + POSITION_TOLERANCE {
            debug!(
                "IK target {:.3} m from base, reach is {:.3} m",
                distance, self.reach_radius
            );
            return Err(KinematicsError::Unreachable {
                position_error: distance - self.reach_radius,
                orientation_error: 0.0,
                iterations: 0,
            });
        }

        let mut q = DVector::from_column_slice(&seed.positions);
        let mut error = self.pose_error(q.as_slice(), &goal);
        let mut adaptive = 0.0f64;
        let mut iterations = 0;

        while iterations < MAX_ITERATIONS {
            let (pos_err, rot_err) = split_norms(&error);
            if pos_err < POSITION_TOLERANCE && rot_err < ORIENTATION_TOLERANCE {
                debug!("IK converged in {} iterations", iterations);
                return Ok(JointVector::new(q.as_slice().to_vec()));
            }
            iterations += 1;

            let (frames, tool) = self.frames(q.as_slice());
            let jac = Self::jacobian_from(&frames, &tool);
            let jjt = &jac * jac.transpose();

            let w = Self::manipulability_of(&jac);
            let mut damping = BASE_DAMPING_SQ + adaptive;
            if w < MANIPULABILITY_THRESHOLD {
                let ramp = 1.0 - w / MANIPULABILITY_THRESHOLD;
                damping += SINGULAR_DAMPING_SQ * ramp * ramp;
            }

            let system = jjt + DMatrix::<f64>::identity(6, 6) * damping;
            let Some(chol) = system.cholesky() else {
                adaptive = (adaptive * 4.0).max(1e-4);
                if adaptive > MAX_ADAPTIVE_DAMPING {
                    break;
                }
                continue;
            };
            let mut step = jac.transpose() * chol.solve(&error);
            let step_norm = step.norm();
            if step_norm > MAX_STEP {
                step *= MAX_STEP / step_norm;
            }

            let candidate = &q + &step;
            let candidate_error = self.pose_error(candidate.as_slice(), &goal);
            if candidate_error.norm() < error.norm() {
                q = candidate;
                error = candidate_error;
                adaptive *= 0.5;
                if adaptive < 1e-12 {
                    adaptive = 0.0;
                }
            } else {
                // Step made things worse: damp harder and retry from the same point
                adaptive = (adaptive * 4.0).max(1e-4);
                if adaptive > MAX_ADAPTIVE_DAMPING {
                    break;
                }
            }
        }

        let (position_error, orientation_error) = split_norms(&error);
        debug!(
            "IK failed: {:.6} m / {:.6} rad after {} iterations",
            position_error, orientation_error, iterations
        );
        Err(KinematicsError::Unreachable {
            position_error,
            orientation_error,
            iterations,
        })
    }

    fn tool_isometry(&self, q: &[f64]) -> Isometry3<f64> {
        let mut t = Isometry3::identity();
        for (joint, &angle) in self.joints.iter().zip(q) {
            t = t * joint.origin * UnitQuaternion::from_axis_angle(&joint.axis, angle);
        }
        t * self.tool
    }

    fn frames(&self, q: &[f64]) -> (Vec<JointFrame>, Isometry3<f64>) {
        let mut t = Isometry3::identity();
        let mut frames = Vec::with_capacity(self.joints.len());
        for (joint, &angle) in self.joints.iter().zip(q) {
            t *= joint.origin;
            frames.push(JointFrame {
                position: t.translation.vector,
                axis: t.rotation * joint.axis.into_inner(),
            });
            t *= UnitQuaternion::from_axis_angle(&joint.axis, angle);
        }
        (frames, t * self.tool)
    }

    fn jacobian_from(frames: &[JointFrame], tool: &Isometry3<f64>) -> DMatrix<f64> {
        let p_tool = tool.translation.vector;
        let mut jac = DMatrix::zeros(6, frames.len());
        for (i, frame) in frames.iter().enumerate() {
            let linear = frame.axis.cross(&(p_tool - frame.position));
            jac.fixed_view_mut::<3, 1>(0, i).copy_from(&linear);
            jac.fixed_view_mut::<3, 1>(3, i).copy_from(&frame.axis);
        }
        jac
    }

    fn manipulability_of(jac: &DMatrix<f64>) -> f64 {
        (jac * jac.transpose()).determinant().max(0.0).sqrt()
    }

    /// 6-vector error: position difference, then rotation as a world-frame
    /// scaled axis
    fn pose_error(&self, q: &[f64], goal: &Isometry3<f64>) -> DVector<f64> {
        let current = self.tool_isometry(q);
        let dp = goal.translation.vector - current.translation.vector;
        let dr = (goal.rotation * current.rotation.inverse()).scaled_axis();
        DVector::from_column_slice(&[dp.x, dp.y, dp.z, dr.x, dr.y, dr.z])
    }
}

fn split_norms(error: &DVector<f64>) -> (f64, f64) {
    (
        error.rows(0, 3).norm(),
        error.rows(3, 3).norm(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kinematics() -> ArmKinematics {
        ArmKinematics::from_config(&ArmConfig::default())
    }

    fn assert_pose_close(a: &CartesianPose, b: &CartesianPose) {
        let (linear, angular) = a.distance_to(b);
        assert!(linear < 1e-4, "position differs by {linear}");
        assert!(angular < 1e-3, "orientation differs by {angular}");
    }

    #[test]
    fn test_forward_zero_configuration() {
        // Straight up to the elbow, forearm horizontal along +x
        let pose = kinematics().forward(&JointVector::zeros(6)).unwrap();
        assert!((pose.x - 0.36).abs() < 1e-12);
        assert!(pose.y.abs() < 1e-12);
        assert!((pose.z - 0.59).abs() < 1e-12);
        assert!(pose.roll.abs() < 1e-12 && pose.pitch.abs() < 1e-12 && pose.yaw.abs() < 1e-12);
    }

    #[test]
    fn test_forward_base_rotation() {
        let q = JointVector::new(vec![std::f64::consts::FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let pose = kinematics().forward(&q).unwrap();
        assert!(pose.x.abs() < 1e-12);
        assert!((pose.y - 0.36).abs() < 1e-12);
        assert!((pose.yaw - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_forward_rejects_wrong_length() {
        let err = kinematics().forward(&JointVector::zeros(5)).unwrap_err();
        assert_eq!(
            err,
            InvalidInputError::Length {
                expected: 6,
                got: 5
            }
        );
    }

    #[test]
    fn test_out_of_reach_is_unreachable() {
        let k = kinematics();
        let far = CartesianPose::new([1.5, 0.0, 0.4], [0.0; 3]);
        let err = k.inverse(&far, &JointVector::zeros(6)).unwrap_err();
        assert!(matches!(err, KinematicsError::Unreachable { .. }));
    }

    #[test]
    fn test_inverse_from_nearby_seed() {
        let k = kinematics();
        let q = JointVector::new(vec![0.3, 0.2, -0.4, 0.5, 0.9, -0.2]);
        let target = k.forward(&q).unwrap();
        let seed = JointVector::new(vec![0.25, 0.25, -0.35, 0.45, 0.95, -0.15]);
        let solution = k.inverse(&target, &seed).unwrap();
        assert_pose_close(&k.forward(&solution).unwrap(), &target);
        assert!(solution.max_abs_diff(&q) < 1e-3);
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let k = kinematics();
        let q = JointVector::new(vec![0.1, -0.3, 0.6, 0.2, 0.7, 0.4]);
        let jac = k.jacobian(&q).unwrap();
        let base = k.forward(&q).unwrap();
        let h = 1e-7;
        for i in 0..6 {
            let mut shifted = q.clone();
            shifted.positions[i] += h;
            let moved = k.forward(&shifted).unwrap();
            let dx = (moved.x - base.x) / h;
            let dy = (moved.y - base.y) / h;
            let dz = (moved.z - base.z) / h;
            assert!((jac[(0, i)] - dx).abs() < 1e-5);
            assert!((jac[(1, i)] - dy).abs() < 1e-5);
            assert!((jac[(2, i)] - dz).abs() < 1e-5);
        }
    }

    #[test]
    fn test_manipulability_drops_at_wrist_singularity() {
        let k = kinematics();
        // Wrist pitch at zero lines up the two roll axes
        let singular = JointVector::new(vec![0.0, 0.2, -0.3, 0.0, 0.0, 0.0]);
        let regular = JointVector::new(vec![0.0, 0.2, -0.3, 0.0, 0.8, 0.0]);
        assert!(k.manipulability(&singular).unwrap() < 1e-6);
        assert!(k.manipulability(&regular).unwrap() > 1e-3);
    }

    #[test]
    fn test_inverse_at_singularity_does_not_diverge() {
        let k = kinematics();
        let start = JointVector::new(vec![0.0, 0.2, -0.3, 0.0, 0.0, 0.0]);
        let mut target = k.forward(&start).unwrap();
        target.x -= 0.01;
        let solution = k.inverse(&target, &start).unwrap();
        assert_pose_close(&k.forward(&solution).unwrap(), &target);
        assert!(solution.max_abs_diff(&start) < 0.5);
    }

    proptest! {
        #[test]
        fn prop_round_trip_from_own_seed(
            q0 in -2.9f64..2.9, q1 in -1.5f64..1.5, q2 in -2.3f64..2.3,
            q3 in -2.9f64..2.9, q4 in -2.0f64..2.0, q5 in -2.9f64..2.9,
        ) {
            let k = kinematics();
            let q = JointVector::new(vec![q0, q1, q2, q3, q4, q5]);
            let pose = k.forward(&q).unwrap();
            let solution = k.inverse(&pose, &q).unwrap();
            prop_assert!(solution.max_abs_diff(&q) < 1e-6);
        }

        #[test]
        fn prop_converges_from_perturbed_seed(
            q0 in -1.5f64..1.5, q1 in -0.6f64..0.6, q2 in -0.9f64..0.9,
            q3 in -1.2f64..1.2, q4 in 0.5f64..1.5, q5 in -1.5f64..1.5,
            d in -0.03f64..0.03,
        ) {
            let k = kinematics();
            let q = JointVector::new(vec![q0, q1, q2, q3, q4, q5]);
            let pose = k.forward(&q).unwrap();
            let seed = JointVector::new(q.positions.iter().map(|v| v + d).collect());
            let solution = k.inverse(&pose, &seed).unwrap();
            let (linear, angular) = k.forward(&solution).unwrap().distance_to(&pose);
            prop_assert!(linear < 1e-4);
            prop_assert!(angular < 1e-3);
        }
    }
}
