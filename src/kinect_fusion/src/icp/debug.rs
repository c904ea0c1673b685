//! Per-iteration diagnostics for pose estimation.

use nalgebra::{Matrix4, Vector6};
use serde::Serialize;

/// State captured after one ICP iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IcpIterationDebug {
    /// Pyramid level (0 = finest).
    pub level: usize,

    /// Iteration within the level (0-indexed).
    pub iteration: usize,

    /// Accepted correspondences.
    pub correspondences: u32,

    /// Root-mean-square point-to-plane residual before the update.
    pub rms_error: f64,

    /// Determinant of the normal matrix.
    pub determinant: f64,

    /// Condition number of the normal matrix.
    pub condition_number: f64,

    /// Solved increment `[rx, ry, rz, tx, ty, tz]`; empty when the solve
    /// failed.
    pub increment: Vec<f64>,

    /// Norm of the increment.
    pub increment_norm: f64,
}

impl IcpIterationDebug {
    pub fn new(level: usize, iteration: usize) -> Self {
        Self {
            level,
            iteration,
            correspondences: 0,
            rms_error: 0.0,
            determinant: 0.0,
            condition_number: f64::INFINITY,
            increment: Vec::new(),
            increment_norm: 0.0,
        }
    }

    pub fn set_increment(&mut self, x: &Vector6<f64>) {
        self.increment = x.iter().copied().collect();
        self.increment_norm = x.norm();
    }

    pub fn to_log_line(&self) -> String {
        format!(
            "level={} iter={} corr={} rms={:.6} det={:.3e} cond={:.3e} step={:.6}",
            self.level,
            self.iteration,
            self.correspondences,
            self.rms_error,
            self.determinant,
            self.condition_number,
            self.increment_norm,
        )
    }
}

/// Debug history of one pose estimate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IcpDebug {
    /// Prior view, column-major.
    pub initial_pose: Vec<f32>,

    /// Estimated view, column-major; empty on failure.
    pub final_pose: Vec<f32>,

    /// Iteration history, coarsest level first.
    pub iterations: Vec<IcpIterationDebug>,

    /// `"converged"` or the failure reason.
    pub status: String,
}

impl IcpDebug {
    pub fn new(initial_pose: &Matrix4<f32>) -> Self {
        Self {
            initial_pose: initial_pose.as_slice().to_vec(),
            ..Default::default()
        }
    }

    pub fn set_final_pose(&mut self, pose: &Matrix4<f32>) {
        self.final_pose = pose.as_slice().to_vec();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Multi-line summary.
    pub fn to_log(&self) -> String {
        let mut lines = Vec::with_capacity(self.iterations.len() + 1);
        lines.push(format!(
            "=== ICP status={} iters={} ===",
            self.status,
            self.iterations.len()
        ));
        for iter in &self.iterations {
            lines.push(format!("  {}", iter.to_log_line()));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_increment() {
        let mut debug = IcpIterationDebug::new(2, 3);
        debug.set_increment(&Vector6::new(0.0, 0.0, 0.0, 3.0, 4.0, 0.0));
        assert_eq!(debug.increment.len(), 6);
        assert_eq!(debug.increment_norm, 5.0);

        let line = debug.to_log_line();
        assert!(line.contains("level=2"));
        assert!(line.contains("iter=3"));
    }

    #[test]
    fn test_debug_json() {
        let mut debug = IcpDebug::new(&Matrix4::identity());
        debug.status = "singular".to_string();
        debug.iterations.push(IcpIterationDebug::new(2, 0));

        let json = debug.to_json().unwrap();
        assert!(json.contains("\"status\":\"singular\""));
        assert!(json.contains("\"level\":2"));
        assert_eq!(debug.initial_pose.len(), 16);
        assert!(debug.to_log().contains("iters=1"));
    }
}
