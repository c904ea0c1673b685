//! ICP configuration and outcome types.

use serde::{Deserialize, Serialize};

use crate::error::KinfuError;
use crate::pyramid::NUM_PYRAMID_LEVELS;

/// Iterations per pyramid level, finest first.
pub const ICP_ITERATIONS: [usize; NUM_PYRAMID_LEVELS] = [10, 5, 4];

/// Configuration for the coarse-to-fine pose estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Iterations per level, finest first. Levels are visited coarsest
    /// first.
    pub iterations: [usize; NUM_PYRAMID_LEVELS],

    /// Maximum point distance (meters) for a correspondence.
    pub distance_threshold: f32,

    /// Maximum angle (radians) between corresponding normals.
    pub angle_threshold: f32,

    /// The solve is abandoned when `|det(A)|` falls below this.
    pub det_threshold: f64,

    /// A warning is logged when the normal matrix is conditioned worse
    /// than this.
    pub condition_warning_threshold: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            iterations: ICP_ITERATIONS,
            distance_threshold: 0.08,
            angle_threshold: std::f32::consts::PI / 15.0,
            det_threshold: 1e-15,
            condition_warning_threshold: 1e10,
        }
    }
}

impl IcpConfig {
    pub fn validate(&self) -> Result<(), KinfuError> {
        if !(self.distance_threshold.is_finite() && self.distance_threshold > 0.0) {
            return Err(KinfuError::config(format!(
                "ICP distance threshold must be positive, got {}",
                self.distance_threshold
            )));
        }
        if !(self.angle_threshold > 0.0 && self.angle_threshold <= std::f32::consts::PI) {
            return Err(KinfuError::config(format!(
                "ICP angle threshold must be in (0, pi], got {}",
                self.angle_threshold
            )));
        }
        if !(self.det_threshold >= 0.0) {
            return Err(KinfuError::config("ICP determinant threshold must be non-negative"));
        }
        Ok(())
    }

    /// Total iterations over all levels.
    pub fn total_iterations(&self) -> usize {
        self.iterations.iter().sum()
    }
}

/// Why a pose estimate was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IcpFailure {
    /// No live pixel found a model correspondence.
    NoCorrespondences,
    /// The normal matrix determinant fell below the floor.
    Singular,
    /// The system or its solution contained NaN or infinity.
    NonFinite,
}

impl IcpFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            IcpFailure::NoCorrespondences => "no_correspondences",
            IcpFailure::Singular => "singular",
            IcpFailure::NonFinite => "non_finite",
        }
    }
}

impl std::fmt::Display for IcpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IcpConfig::default();
        assert_eq!(config.iterations, [10, 5, 4]);
        assert_eq!(config.total_iterations(), 19);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = IcpConfig {
            distance_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IcpConfig {
            angle_threshold: 4.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(IcpFailure::Singular.to_string(), "singular");
    }
}
