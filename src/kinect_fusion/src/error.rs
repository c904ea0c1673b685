//! Error types for the reconstruction pipeline.
//!
//! Only configuration and resource problems surface as errors. A failed pose
//! estimate is reported as `None` by [`crate::KinectFusion::estimate_pose`],
//! and invalid pixels or voxels are skipped where they are encountered.

use thiserror::Error;

/// Errors raised by the reconstruction pipeline.
#[derive(Debug, Error)]
pub enum KinfuError {
    /// Inconsistent parameters detected while constructing a component.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The compute runtime could not be created.
    #[error("resource failure: {0}")]
    Resource(String),

    /// A serialized volume buffer does not match its header.
    #[error("invalid volume buffer: {0}")]
    InvalidVolumeBuffer(String),
}

impl KinfuError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
