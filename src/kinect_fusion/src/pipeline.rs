//! High-level reconstruction API.
//!
//! [`KinectFusion`] owns every resource of a reconstruction session: the
//! compute runtime, the TSDF volume and the pose estimator with its
//! pyramids. Stages that write the volume take `&mut self`, so at most one
//! stage can touch a session at a time.
//!
//! # Example
//!
//! ```ignore
//! use kinect_fusion::{KinectFusion, TrackingState};
//!
//! let mut kinfu = KinectFusion::builder()
//!     .volume_resolution([256, 256, 256])
//!     .voxel_size(0.01)
//!     .build(640, 480)?;
//!
//! for frame in frames {
//!     let outcome = kinfu.track(&frame)?;
//!     if outcome.state == TrackingState::Lost {
//!         eprintln!("tracking lost, kept previous pose");
//!     }
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::CameraIntrinsics;
use crate::error::KinfuError;
use crate::frame::{DepthRange, Frame};
use crate::fusion::{self, FusionConfig};
use crate::icp::{IcpConfig, IcpDebug, PoseEstimator};
use crate::pyramid::{check_extent, PyramidConfig};
use crate::raycast::{self, Surface};
use crate::runtime::{ComputeRuntime, RuntimeConfig};
use crate::timing::{FrameTiming, Timer};
use crate::volume::{TsdfVolume, VolumeConfig};

/// Identity pose, column-major.
const IDENTITY_POSE: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Configuration of a reconstruction session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KinectFusionConfig {
    pub volume: VolumeConfig,
    pub fusion: FusionConfig,
    pub pyramid: PyramidConfig,
    pub icp: IcpConfig,
    pub runtime: RuntimeConfig,

    /// View (world → camera) of the first tracked frame, column-major.
    pub initial_pose: [f32; 16],

    /// Ray marching step in meters. Defaults to half a voxel.
    pub marching_step: Option<f32>,
}

impl Default for KinectFusionConfig {
    fn default() -> Self {
        Self {
            volume: VolumeConfig::default(),
            fusion: FusionConfig::default(),
            pyramid: PyramidConfig::default(),
            icp: IcpConfig::default(),
            runtime: RuntimeConfig::default(),
            initial_pose: IDENTITY_POSE,
            marching_step: None,
        }
    }
}

impl KinectFusionConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, KinfuError> {
        serde_json::from_str(json)
            .map_err(|e| KinfuError::config(format!("malformed configuration: {e}")))
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn initial_pose(&self) -> Matrix4<f32> {
        Matrix4::from_column_slice(&self.initial_pose)
    }

    /// Check every component configuration.
    pub fn validate(&self) -> Result<(), KinfuError> {
        self.volume.validate()?;
        self.fusion.validate()?;
        self.pyramid.validate()?;
        self.icp.validate()?;
        if self.initial_pose.iter().any(|v| !v.is_finite()) {
            return Err(KinfuError::config("initial pose must be finite"));
        }
        if let Some(step) = self.marching_step {
            if !(step.is_finite() && step > 0.0) {
                return Err(KinfuError::config(format!(
                    "marching step must be positive, got {step}"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`KinectFusion`].
#[derive(Debug, Clone, Default)]
pub struct KinectFusionBuilder {
    config: KinectFusionConfig,
}

impl KinectFusionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(config: KinectFusionConfig) -> Self {
        Self { config }
    }

    pub fn volume(mut self, volume: VolumeConfig) -> Self {
        self.config.volume = volume;
        self
    }

    pub fn volume_resolution(mut self, resolution: [u32; 3]) -> Self {
        self.config.volume.resolution = resolution;
        self
    }

    pub fn voxel_size(mut self, voxel_size: f32) -> Self {
        self.config.volume.voxel_size = voxel_size;
        self
    }

    /// World position of the center of voxel (0, 0, 0).
    pub fn volume_corner(mut self, corner: [f32; 3]) -> Self {
        self.config.volume.corner = Some(corner);
        self
    }

    pub fn truncation_distance(mut self, distance: f32) -> Self {
        self.config.volume.truncation_distance = Some(distance);
        self
    }

    pub fn truncation_weight(mut self, weight: u16) -> Self {
        self.config.fusion.truncation_weight = weight;
        self
    }

    /// Bilateral filter parameters.
    pub fn bilateral(mut self, sigma_color: f32, sigma_space: f32, kernel_size: u32) -> Self {
        self.config.pyramid.sigma_color = sigma_color;
        self.config.pyramid.sigma_space = sigma_space;
        self.config.pyramid.kernel_size = kernel_size;
        self
    }

    pub fn distance_threshold(mut self, meters: f32) -> Self {
        self.config.icp.distance_threshold = meters;
        self
    }

    pub fn angle_threshold(mut self, radians: f32) -> Self {
        self.config.icp.angle_threshold = radians;
        self
    }

    /// ICP iterations per level, finest first.
    pub fn icp_iterations(mut self, iterations: [usize; 3]) -> Self {
        self.config.icp.iterations = iterations;
        self
    }

    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.runtime.num_threads = Some(threads);
        self
    }

    pub fn initial_pose(mut self, view: &Matrix4<f32>) -> Self {
        self.config.initial_pose.copy_from_slice(view.as_slice());
        self
    }

    pub fn marching_step(mut self, step: f32) -> Self {
        self.config.marching_step = Some(step);
        self
    }

    pub fn build(self, frame_width: u32, frame_height: u32) -> Result<KinectFusion, KinfuError> {
        KinectFusion::new(self.config, frame_width, frame_height)
    }
}

/// How the pose of a tracked frame was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    /// First frame of the session, placed at the configured initial pose.
    Initialized,
    /// Pose estimated against the model.
    Tracked,
    /// Estimation failed; the previous pose was kept.
    Lost,
}

/// Result of [`KinectFusion::track`].
#[derive(Debug, Clone)]
pub struct TrackingOutcome {
    /// View the frame was fused with.
    pub pose: Matrix4<f32>,
    pub state: TrackingState,
    pub timing: FrameTiming,
}

/// A reconstruction session.
pub struct KinectFusion {
    config: KinectFusionConfig,
    runtime: ComputeRuntime,
    volume: TsdfVolume,
    estimator: PoseEstimator,
    frame_width: u32,
    frame_height: u32,
    /// View of the last tracked frame
    current_pose: Option<Matrix4<f32>>,
    frame_count: u64,
    last_timing: FrameTiming,
}

impl KinectFusion {
    /// Validate `config` and allocate every resource for
    /// `frame_width × frame_height` input.
    pub fn new(
        config: KinectFusionConfig,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Self, KinfuError> {
        config.validate()?;
        check_extent(frame_width, frame_height)?;

        let runtime = ComputeRuntime::new(&config.runtime)?;
        let volume = TsdfVolume::new(&config.volume)?;
        let estimator = PoseEstimator::new(
            frame_width,
            frame_height,
            config.icp.clone(),
            config.pyramid.clone(),
        )?;

        info!(
            frame_width,
            frame_height,
            resolution = ?config.volume.resolution,
            voxel_size = config.volume.voxel_size,
            threads = runtime.num_threads(),
            "KinectFusion session created"
        );

        Ok(Self {
            config,
            runtime,
            volume,
            estimator,
            frame_width,
            frame_height,
            current_pose: None,
            frame_count: 0,
            last_timing: FrameTiming::default(),
        })
    }

    pub fn builder() -> KinectFusionBuilder {
        KinectFusionBuilder::new()
    }

    pub fn config(&self) -> &KinectFusionConfig {
        &self.config
    }

    pub fn volume(&self) -> &TsdfVolume {
        &self.volume
    }

    pub fn runtime(&self) -> &ComputeRuntime {
        &self.runtime
    }

    /// View of the last tracked frame, if any.
    pub fn current_pose(&self) -> Option<Matrix4<f32>> {
        self.current_pose
    }

    /// Frames tracked since creation or the last reset.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Stage timing of the last tracked frame.
    pub fn last_timing(&self) -> &FrameTiming {
        &self.last_timing
    }

    pub fn frame_extent(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    /// Reset every voxel to unobserved.
    pub fn init(&mut self) {
        self.volume.init(&self.runtime);
        debug!("volume initialized");
    }

    /// Clear the volume and forget the tracked trajectory.
    pub fn reset(&mut self) {
        self.init();
        self.current_pose = None;
        self.frame_count = 0;
        self.last_timing = FrameTiming::default();
        info!("session reset");
    }

    /// Fuse `frame` observed from `view` into the volume.
    pub fn fuse(&mut self, frame: &Frame, view: &Matrix4<f32>) -> Result<(), KinfuError> {
        self.check_frame(frame)?;
        fusion::fuse(
            &self.runtime,
            &mut self.volume,
            frame,
            view,
            &self.config.fusion,
        );
        Ok(())
    }

    /// Estimate the view of `frame` by aligning it with the model rendered
    /// from `prior`. `Ok(None)` means the estimate degenerated.
    pub fn estimate_pose(
        &mut self,
        frame: &Frame,
        prior: &Matrix4<f32>,
    ) -> Result<Option<Matrix4<f32>>, KinfuError> {
        self.check_frame(frame)?;
        self.estimator
            .estimate(&self.runtime, &self.volume, frame, prior)
    }

    /// Like [`KinectFusion::estimate_pose`], also returning the iteration
    /// history.
    pub fn estimate_pose_with_debug(
        &mut self,
        frame: &Frame,
        prior: &Matrix4<f32>,
    ) -> Result<(Option<Matrix4<f32>>, IcpDebug), KinfuError> {
        self.check_frame(frame)?;
        self.estimator
            .estimate_with_debug(&self.runtime, &self.volume, frame, prior)
    }

    /// Render the model surface seen from `view`.
    ///
    /// `marching_step` falls back to the configured step, then to half a
    /// voxel.
    pub fn ray_casting(
        &self,
        intrinsics: &CameraIntrinsics,
        view: &Matrix4<f32>,
        range: &DepthRange,
        marching_step: Option<f32>,
    ) -> Surface {
        let mut surface = Surface::new(intrinsics.width, intrinsics.height);
        self.ray_casting_into(&mut surface, intrinsics, view, range, marching_step);
        surface
    }

    /// Render into a caller-owned surface.
    pub fn ray_casting_into(
        &self,
        surface: &mut Surface,
        intrinsics: &CameraIntrinsics,
        view: &Matrix4<f32>,
        range: &DepthRange,
        marching_step: Option<f32>,
    ) {
        raycast::ray_cast_into(
            &self.runtime,
            &self.volume,
            intrinsics,
            view,
            range,
            marching_step.or(self.config.marching_step),
            surface,
        );
    }

    /// Process one input frame: estimate its pose against the model (or
    /// place it at the initial pose if it is the first), then fuse it.
    ///
    /// If estimation fails the previous pose is kept and the frame is still
    /// fused there.
    pub fn track(&mut self, frame: &Frame) -> Result<TrackingOutcome, KinfuError> {
        self.check_frame(frame)?;
        let timer = Timer::new();
        // Drop stage records from calls made outside of tracking.
        self.runtime.take_timing();

        let (pose, state) = match self.current_pose {
            None => (self.config.initial_pose(), TrackingState::Initialized),
            Some(last) => {
                match self
                    .estimator
                    .estimate(&self.runtime, &self.volume, frame, &last)?
                {
                    Some(view) => (view, TrackingState::Tracked),
                    None => {
                        warn!(frame = self.frame_count, "pose estimation failed, keeping last pose");
                        (last, TrackingState::Lost)
                    }
                }
            }
        };

        fusion::fuse(
            &self.runtime,
            &mut self.volume,
            frame,
            &pose,
            &self.config.fusion,
        );

        let mut timing = self.runtime.take_timing();
        timing.total_ms = timer.elapsed_ms();
        debug!(
            frame = self.frame_count,
            ?state,
            total_ms = timing.total_ms,
            "frame tracked"
        );

        self.current_pose = Some(pose);
        self.frame_count += 1;
        self.last_timing = timing.clone();

        Ok(TrackingOutcome {
            pose,
            state,
            timing,
        })
    }

    fn check_frame(&self, frame: &Frame) -> Result<(), KinfuError> {
        if frame.width() != self.frame_width || frame.height() != self.frame_height {
            return Err(KinfuError::config(format!(
                "frame extent {}x{} does not match session extent {}x{}",
                frame.width(),
                frame.height(),
                self.frame_width,
                self.frame_height
            )));
        }
        Ok(())
    }
}
