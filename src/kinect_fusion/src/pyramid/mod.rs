//! Multi-resolution depth pyramids.
//!
//! A pyramid holds [`NUM_PYRAMID_LEVELS`] levels; level `L` has extent
//! `(w / 2^L, h / 2^L)` and intrinsics scaled accordingly. Each level keeps
//! a filtered depth map plus camera-space vertex and normal maps.
//!
//! # Architecture
//!
//! A *live* pyramid is built from an input frame:
//!
//! 1. Level 0 depth: bilateral filter of the raw depth ([`filter`])
//! 2. Level `L > 0` depth: edge-aware half-sample of level `L − 1`
//! 3. Every level: vertex map by back-projection, normal map from
//!    neighboring vertices ([`maps`])
//!
//! A *model* pyramid is filled from ray-cast surfaces instead, one per level
//! ([`Pyramid::load_surface`]). Both kinds are allocated once and rebuilt in
//! place for every frame.

pub mod filter;
pub mod maps;

pub use maps::{is_valid, INVALID};

use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::camera::CameraIntrinsics;
use crate::error::KinfuError;
use crate::frame::{DepthRange, Frame};
use crate::raycast::Surface;
use crate::runtime::ComputeRuntime;

/// Number of pyramid levels, finest first.
pub const NUM_PYRAMID_LEVELS: usize = 3;

/// Filtering parameters for live pyramids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    /// Bilateral range sigma, in meters of depth difference.
    pub sigma_color: f32,
    /// Bilateral spatial sigma, in pixels.
    pub sigma_space: f32,
    /// Bilateral kernel diameter in pixels (odd).
    pub kernel_size: u32,
    /// Maximum depth difference accepted when half-sampling. Defaults to
    /// `3 · sigma_color`.
    pub half_sample_threshold: Option<f32>,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            sigma_color: 0.75,
            sigma_space: 0.75,
            kernel_size: 5,
            half_sample_threshold: None,
        }
    }
}

impl PyramidConfig {
    pub fn half_sample_threshold(&self) -> f32 {
        self.half_sample_threshold.unwrap_or(3.0 * self.sigma_color)
    }

    pub fn validate(&self) -> Result<(), KinfuError> {
        if self.kernel_size % 2 == 0 {
            return Err(KinfuError::config(format!(
                "bilateral kernel size must be odd, got {}",
                self.kernel_size
            )));
        }
        if !(self.sigma_color > 0.0 && self.sigma_space > 0.0) {
            return Err(KinfuError::config(format!(
                "bilateral sigmas must be positive, got color {} space {}",
                self.sigma_color, self.sigma_space
            )));
        }
        let threshold = self.half_sample_threshold();
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(KinfuError::config("half-sample threshold must be positive"));
        }
        Ok(())
    }
}

/// Check that a frame extent halves cleanly down to the coarsest level.
pub fn check_extent(width: u32, height: u32) -> Result<(), KinfuError> {
    let factor = 1u32 << (NUM_PYRAMID_LEVELS - 1);
    if width == 0 || height == 0 || width % factor != 0 || height % factor != 0 {
        return Err(KinfuError::config(format!(
            "frame extent {width}x{height} is not a nonzero multiple of {factor}"
        )));
    }
    Ok(())
}

/// One pyramid level.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    intrinsics: CameraIntrinsics,
    /// Filtered depth; invalid pixels hold the invalid sentinel.
    pub depth: Vec<f32>,
    /// Camera-space vertices, validity in `w`.
    pub vertex: Vec<Vector4<f32>>,
    /// Camera-space unit normals, validity in `w`.
    pub normal: Vec<Vector4<f32>>,
}

impl PyramidLevel {
    fn new(intrinsics: CameraIntrinsics, invalid_depth: f32) -> Self {
        let n = intrinsics.pixel_count();
        Self {
            intrinsics,
            depth: vec![invalid_depth; n],
            vertex: vec![INVALID; n],
            normal: vec![INVALID; n],
        }
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn width(&self) -> u32 {
        self.intrinsics.width
    }

    pub fn height(&self) -> u32 {
        self.intrinsics.height
    }

    /// Pixels with both a valid vertex and a valid normal.
    pub fn valid_count(&self) -> usize {
        self.vertex
            .iter()
            .zip(&self.normal)
            .filter(|(v, n)| is_valid(v) && is_valid(n))
            .count()
    }
}

/// Fixed-depth image pyramid.
#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<PyramidLevel>,
    range: DepthRange,
}

impl Pyramid {
    /// Allocate a pyramid for frames described by `intrinsics`.
    pub fn new(intrinsics: &CameraIntrinsics, range: DepthRange) -> Result<Self, KinfuError> {
        check_extent(intrinsics.width, intrinsics.height)?;
        let levels = (0..NUM_PYRAMID_LEVELS)
            .map(|l| PyramidLevel::new(intrinsics.scaled(l), range.invalid_depth))
            .collect();
        Ok(Self { levels, range })
    }

    /// Allocate a pyramid for `width × height` frames. Level intrinsics are
    /// replaced by those of each frame or surface loaded into it.
    pub fn with_extent(width: u32, height: u32) -> Result<Self, KinfuError> {
        let placeholder = CameraIntrinsics::new(1.0, 1.0, 0.0, 0.0, width, height);
        Self::new(&placeholder, DepthRange::default())
    }

    /// Allocate and build a live pyramid from `frame`.
    pub fn build(
        runtime: &ComputeRuntime,
        frame: &Frame,
        config: &PyramidConfig,
    ) -> Result<Self, KinfuError> {
        let mut pyramid = Self::new(frame.intrinsics(), *frame.range())?;
        pyramid.build_into(runtime, frame, config)?;
        Ok(pyramid)
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn level(&self, level: usize) -> &PyramidLevel {
        &self.levels[level]
    }

    pub fn range(&self) -> &DepthRange {
        &self.range
    }

    fn check_frame(&self, intrinsics: &CameraIntrinsics) -> Result<(), KinfuError> {
        let base = &self.levels[0].intrinsics;
        if base.width != intrinsics.width || base.height != intrinsics.height {
            return Err(KinfuError::config(format!(
                "frame extent {}x{} does not match pyramid extent {}x{}",
                intrinsics.width, intrinsics.height, base.width, base.height
            )));
        }
        Ok(())
    }

    /// Rebuild every level from `frame` in place.
    pub fn build_into(
        &mut self,
        runtime: &ComputeRuntime,
        frame: &Frame,
        config: &PyramidConfig,
    ) -> Result<(), KinfuError> {
        self.check_frame(frame.intrinsics())?;
        self.range = *frame.range();
        for (l, level) in self.levels.iter_mut().enumerate() {
            level.intrinsics = frame.intrinsics().scaled(l);
        }

        let range = self.range;
        let width = frame.width() as usize;
        filter::bilateral_filter(
            runtime,
            frame.depth(),
            &mut self.levels[0].depth,
            width,
            frame.height() as usize,
            &range,
            config.sigma_color,
            config.sigma_space,
            config.kernel_size,
        );

        let threshold = config.half_sample_threshold();
        for l in 1..NUM_PYRAMID_LEVELS {
            let (finer, coarser) = self.levels.split_at_mut(l);
            let src = &finer[l - 1];
            filter::half_sample(
                runtime,
                &src.depth,
                src.width() as usize,
                &mut coarser[0].depth,
                &range,
                threshold,
            );
        }

        for level in &mut self.levels {
            let intrinsics = level.intrinsics;
            maps::compute_vertex_map(runtime, &level.depth, &intrinsics, &range, &mut level.vertex);
            maps::compute_normal_map(
                runtime,
                &level.vertex,
                intrinsics.width as usize,
                &mut level.normal,
            );
            trace!(
                width = intrinsics.width,
                height = intrinsics.height,
                valid = level.valid_count(),
                "built live pyramid level"
            );
        }
        Ok(())
    }

    /// Fill `level` from a surface ray cast with `intrinsics` (that level's
    /// intrinsics) from `view`.
    ///
    /// Errors if the surface or the intrinsics do not match the level's
    /// extent.
    pub fn load_surface(
        &mut self,
        runtime: &ComputeRuntime,
        level: usize,
        surface: &Surface,
        intrinsics: &CameraIntrinsics,
        view: &Matrix4<f32>,
        range: &DepthRange,
    ) -> Result<(), KinfuError> {
        let Some(target) = self.levels.get(level) else {
            return Err(KinfuError::config(format!(
                "pyramid has no level {level}, only {NUM_PYRAMID_LEVELS}"
            )));
        };
        let extent = (target.width(), target.height());
        if (surface.width(), surface.height()) != extent
            || (intrinsics.width, intrinsics.height) != extent
        {
            return Err(KinfuError::config(format!(
                "surface {}x{} with intrinsics {}x{} does not match level {level} extent {}x{}",
                surface.width(),
                surface.height(),
                intrinsics.width,
                intrinsics.height,
                extent.0,
                extent.1
            )));
        }

        self.range = *range;
        let target = &mut self.levels[level];
        target.intrinsics = *intrinsics;
        target.depth.copy_from_slice(&surface.depth);
        maps::load_surface(
            runtime,
            surface,
            intrinsics,
            view,
            range,
            &mut target.vertex,
            &mut target.normal,
        );
        Ok(())
    }
}
