//! Point-to-plane normal equations and their two-phase reduction.
//!
//! Each correspondence contributes `A += J·Jᵀ` and `b −= J·r` for the
//! Jacobian `J = [p × n, n]` and residual `r = n·(p − m)`. `A` is symmetric,
//! so only its 21 upper-triangle entries are stored, row-major, followed by
//! the 6 entries of `b`.
//!
//! Work groups first sum their own correspondences
//! ([`IcpAccumulator::partial_reduce`]); the partial sums are then combined
//! pairwise ([`IcpAccumulator::combine`]), which is associative, so any
//! reduction order gives the same system up to rounding.

use nalgebra::{Matrix6, Vector6};

/// Upper-triangle entries of the 6×6 normal matrix.
const UPPER_TRIANGLE: usize = 21;

/// Length of the packed system.
pub const ACCUMULATOR_SIZE: usize = UPPER_TRIANGLE + 6;

/// Packed normal equations plus diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IcpAccumulator {
    /// Upper triangle of `A` (row-major), then `b`.
    pub values: [f64; ACCUMULATOR_SIZE],
    /// Number of accumulated correspondences.
    pub correspondences: u32,
    /// Sum of squared residuals.
    pub squared_error: f64,
}

impl Default for IcpAccumulator {
    fn default() -> Self {
        Self {
            values: [0.0; ACCUMULATOR_SIZE],
            correspondences: 0,
            squared_error: 0.0,
        }
    }
}

impl IcpAccumulator {
    /// Add one linearized correspondence.
    #[inline]
    pub fn add(&mut self, jacobian: &Vector6<f64>, residual: f64) {
        let mut k = 0;
        for i in 0..6 {
            for j in i..6 {
                self.values[k] += jacobian[i] * jacobian[j];
                k += 1;
            }
        }
        for i in 0..6 {
            self.values[UPPER_TRIANGLE + i] -= jacobian[i] * residual;
        }
        self.correspondences += 1;
        self.squared_error += residual * residual;
    }

    /// Sum the correspondences of one work group.
    pub fn partial_reduce<I>(terms: I) -> Self
    where
        I: IntoIterator<Item = (Vector6<f64>, f64)>,
    {
        let mut acc = Self::default();
        for (jacobian, residual) in terms {
            acc.add(&jacobian, residual);
        }
        acc
    }

    /// Merge two partial sums.
    pub fn combine(mut self, other: Self) -> Self {
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a += b;
        }
        self.correspondences += other.correspondences;
        self.squared_error += other.squared_error;
        self
    }

    /// Unpack into the symmetric matrix `A` and vector `b`.
    pub fn normal_equations(&self) -> (Matrix6<f64>, Vector6<f64>) {
        let mut a = Matrix6::zeros();
        let mut k = 0;
        for i in 0..6 {
            for j in i..6 {
                a[(i, j)] = self.values[k];
                a[(j, i)] = self.values[k];
                k += 1;
            }
        }
        let b = Vector6::from_fn(|i, _| self.values[UPPER_TRIANGLE + i]);
        (a, b)
    }

    /// Root-mean-square point-to-plane residual.
    pub fn rms_error(&self) -> f64 {
        if self.correspondences == 0 {
            return 0.0;
        }
        (self.squared_error / self.correspondences as f64).sqrt()
    }
}
