//! Solve for the ICP increment.
//!
//! The reduced system `A·x = b` is solved with Cholesky, which succeeds for
//! any well-posed point-to-plane problem since `A = Σ J·Jᵀ` is positive
//! semi-definite. LU is used as a fallback when rounding leaves `A`
//! slightly indefinite.

use nalgebra::{Matrix6, Vector6};

use super::accumulator::IcpAccumulator;
use super::types::IcpFailure;

/// Solved increment plus the diagnostics of the system it came from.
#[derive(Debug, Clone, Copy)]
pub struct IcpStep {
    /// `[rx, ry, rz, tx, ty, tz]`.
    pub increment: Vector6<f64>,
    pub determinant: f64,
}

/// Solve the normal equations held by `acc`.
///
/// Fails when there are no correspondences, when `|det(A)|` is below
/// `det_threshold`, or when the system or its solution is not finite.
pub fn solve_increment(acc: &IcpAccumulator, det_threshold: f64) -> Result<IcpStep, IcpFailure> {
    if acc.correspondences == 0 {
        return Err(IcpFailure::NoCorrespondences);
    }

    let (a, b) = acc.normal_equations();
    let determinant = a.determinant();
    if !determinant.is_finite() || b.iter().any(|v| !v.is_finite()) {
        return Err(IcpFailure::NonFinite);
    }
    if determinant.abs() < det_threshold {
        return Err(IcpFailure::Singular);
    }

    let increment = solve(&a, &b).ok_or(IcpFailure::Singular)?;
    if increment.iter().any(|v| !v.is_finite()) {
        return Err(IcpFailure::NonFinite);
    }

    Ok(IcpStep {
        increment,
        determinant,
    })
}

fn solve(a: &Matrix6<f64>, b: &Vector6<f64>) -> Option<Vector6<f64>> {
    if let Some(chol) = a.cholesky() {
        return Some(chol.solve(b));
    }
    a.lu().solve(b)
}

/// Ratio of the largest to the smallest singular value of `a`, or infinity
/// for a singular matrix.
pub fn condition_number(a: &Matrix6<f64>) -> f64 {
    let svd = a.svd(false, false);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();

    if min_sv < 1e-15 {
        f64::INFINITY
    } else {
        max_sv / min_sv
    }
}
