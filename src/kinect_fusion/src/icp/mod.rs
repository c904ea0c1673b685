//! Point-to-plane ICP for frame-to-model tracking.
//!
//! Each iteration:
//! 1. Associate live pixels with model pixels by projecting through the
//!    prior view (no nearest-neighbor search)
//! 2. Linearize the point-to-plane error and reduce the 6×6 normal
//!    equations across work groups
//! 3. Solve for an incremental twist and left-multiply it onto the running
//!    camera → world estimate
//!
//! Levels are visited coarsest first with a fixed iteration count each.
//! A degenerate system at any iteration ends the estimate with no pose.

pub mod accumulator;
pub mod debug;
pub mod estimator;
pub mod solver;
pub mod types;

pub use accumulator::{IcpAccumulator, ACCUMULATOR_SIZE};
pub use debug::{IcpDebug, IcpIterationDebug};
pub use estimator::PoseEstimator;
pub use solver::{condition_number, solve_increment, IcpStep};
pub use types::{IcpConfig, IcpFailure, ICP_ITERATIONS};
