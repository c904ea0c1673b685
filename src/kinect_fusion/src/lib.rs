//! Dense RGB-D reconstruction with KinectFusion.
//!
//! Depth frames are fused into a truncated signed distance volume while the
//! camera is tracked by aligning each new frame against a surface ray cast
//! from the volume itself (frame-to-model ICP).
//!
//! # Architecture
//!
//! Every per-voxel and per-pixel step runs as one blocking data-parallel
//! dispatch on a [`ComputeRuntime`]:
//! - [`volume`]: the TSDF grid, its packed voxel records and buffer layout
//! - [`fusion`]: projective integration of a frame into the volume
//! - [`raycast`]: zero-crossing search producing depth, color and normals
//! - [`pyramid`]: bilateral filtering, half-sampling, vertex/normal maps
//! - [`icp`]: coarse-to-fine point-to-plane pose estimation
//! - [`pipeline`]: the [`KinectFusion`] session tying them together
//!
//! # Usage
//!
//! ```ignore
//! use kinect_fusion::{CameraIntrinsics, DepthRange, Frame, KinectFusion};
//!
//! let intrinsics = CameraIntrinsics::new(525.0, 525.0, 319.5, 239.5, 640, 480);
//! let mut kinfu = KinectFusion::builder()
//!     .volume_resolution([512, 512, 512])
//!     .voxel_size(0.01)
//!     .build(640, 480)?;
//!
//! let frame = Frame::new(color, depth, intrinsics, DepthRange::new(0.3, 4.0, 0.0))?;
//! let outcome = kinfu.track(&frame)?;
//! println!("pose: {}, state: {:?}", outcome.pose, outcome.state);
//!
//! kinfu.volume().write_to("scene.tsdf")?;
//! ```

pub mod camera;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod icp;
pub mod pipeline;
pub mod pose;
pub mod pyramid;
pub mod raycast;
pub mod runtime;
pub mod test_utils;
pub mod timing;
pub mod volume;

pub use camera::CameraIntrinsics;
pub use error::KinfuError;
pub use frame::{DepthRange, Frame};
pub use fusion::FusionConfig;
pub use icp::{IcpConfig, IcpDebug, IcpFailure, PoseEstimator};
pub use pyramid::{Pyramid, PyramidConfig, NUM_PYRAMID_LEVELS};
pub use raycast::Surface;
pub use timing::FrameTiming;
pub use volume::{TsdfVolume, Voxel, VolumeConfig};

// High-level API
pub use pipeline::{
    KinectFusion, KinectFusionBuilder, KinectFusionConfig, TrackingOutcome, TrackingState,
};

// Compute runtime
pub use runtime::{ComputeRuntime, RuntimeConfig, Stage};
