//! Ray casting of the implicit TSDF surface.
//!
//! One ray per pixel starts at the camera center and is marched through the
//! volume. The march is clipped to the volume box and to the depth window.
//! The first sign change between consecutive valid samples is taken as the
//! surface and refined by linear interpolation.
//!
//! Ray directions keep a unit camera-space z component, so the ray
//! parameter at the hit is the camera-space depth.
//!
//! Samples touching an unobserved voxel are invalid: the march skips ahead
//! by most of a truncation distance and forgets the previous sample. In
//! free space (positive TSDF) the step grows with the TSDF value, since the
//! surface is at least `tsdf·τ` away.

use nalgebra::{Matrix4, Vector3};
use rayon::prelude::*;

use crate::camera::CameraIntrinsics;
use crate::frame::DepthRange;
use crate::pose;
use crate::runtime::{ComputeRuntime, Stage};
use crate::volume::TsdfVolume;

/// Fraction of the truncation distance used for skipping.
const SKIP_FACTOR: f32 = 0.95;

/// Direction components smaller than this are treated as this value.
const MIN_DIRECTION: f32 = 1e-5;

/// Surface maps produced by [`ray_cast`].
#[derive(Debug, Clone)]
pub struct Surface {
    width: u32,
    height: u32,
    /// RGBA8 color per pixel, zero on misses.
    pub color: Vec<[u8; 4]>,
    /// Camera-space depth per pixel, the invalid sentinel on misses.
    pub depth: Vec<f32>,
    /// World-space unit normal per pixel, zero on misses.
    pub normal: Vec<Vector3<f32>>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        let n = width as usize * height as usize;
        Self {
            width,
            height,
            color: vec![[0; 4]; n],
            depth: vec![0.0; n],
            normal: vec![Vector3::zeros(); n],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        *self = Self::new(width, height);
    }

    /// Number of pixels whose depth is valid under `range`.
    pub fn hit_count(&self, range: &DepthRange) -> usize {
        self.depth.iter().filter(|&&d| range.is_valid(d)).count()
    }
}

/// Parametric interval `[t_near, t_far]` in which `origin + t·dir` lies
/// inside the box `[lo, hi]`.
pub fn intersect_box(
    origin: &Vector3<f32>,
    dir: &Vector3<f32>,
    lo: &Vector3<f32>,
    hi: &Vector3<f32>,
) -> Option<(f32, f32)> {
    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    for axis in 0..3 {
        let mut d = dir[axis];
        if d.abs() < MIN_DIRECTION {
            d = MIN_DIRECTION.copysign(d);
        }
        let t0 = (lo[axis] - origin[axis]) / d;
        let t1 = (hi[axis] - origin[axis]) / d;
        t_near = t_near.max(t0.min(t1));
        t_far = t_far.min(t0.max(t1));
    }
    (t_near <= t_far).then_some((t_near, t_far))
}

/// March one ray and return the ray parameter of the first zero crossing.
fn march(
    volume: &TsdfVolume,
    origin: &Vector3<f32>,
    dir: &Vector3<f32>,
    range: &DepthRange,
    marching_step: f32,
) -> Option<f32> {
    let (box_near, box_far) =
        intersect_box(origin, dir, &volume.corner(), &volume.far_corner())?;
    let mut t = box_near.max(range.min_depth);
    let t_end = box_far.min(range.max_depth);

    let inv_len = 1.0 / dir.norm();
    let min_step = marching_step * inv_len;
    let skip = SKIP_FACTOR * volume.truncation_distance() * inv_len;

    let mut prev: Option<(f32, f32)> = None;
    while t <= t_end {
        let p = origin + dir * t;
        let Some(f) = volume.interpolate_tsdf(&p) else {
            prev = None;
            t += skip;
            continue;
        };

        if f == 0.0 {
            return Some(t);
        }
        if let Some((prev_t, prev_f)) = prev {
            if prev_f.signum() != f.signum() {
                return Some(prev_t + (t - prev_t) * prev_f / (prev_f - f));
            }
        }
        prev = Some((t, f));

        t += if f > 0.0 {
            (skip * f).max(min_step)
        } else {
            min_step
        };
    }
    None
}

/// Ray cast `volume` from `view` into a newly allocated [`Surface`].
///
/// `marching_step` defaults to half a voxel; non-positive values also fall
/// back to the default.
pub fn ray_cast(
    runtime: &ComputeRuntime,
    volume: &TsdfVolume,
    intrinsics: &CameraIntrinsics,
    view: &Matrix4<f32>,
    range: &DepthRange,
    marching_step: Option<f32>,
) -> Surface {
    let mut surface = Surface::new(intrinsics.width, intrinsics.height);
    ray_cast_into(
        runtime,
        volume,
        intrinsics,
        view,
        range,
        marching_step,
        &mut surface,
    );
    surface
}

/// Ray cast into a caller-owned surface, resizing it if needed.
pub fn ray_cast_into(
    runtime: &ComputeRuntime,
    volume: &TsdfVolume,
    intrinsics: &CameraIntrinsics,
    view: &Matrix4<f32>,
    range: &DepthRange,
    marching_step: Option<f32>,
    surface: &mut Surface,
) {
    surface.resize(intrinsics.width, intrinsics.height);
    if intrinsics.pixel_count() == 0 {
        return;
    }
    let width = intrinsics.width as usize;
    let step = marching_step
        .filter(|s| *s > 0.0)
        .unwrap_or(0.5 * volume.voxel_size());

    let camera_to_world = pose::invert_rigid(view);
    let rot = pose::rotation(&camera_to_world);
    let origin = pose::camera_position(view);
    let invalid = range.invalid_depth;

    let Surface {
        color,
        depth,
        normal,
        ..
    } = surface;

    runtime.dispatch(
        Stage::RayCast,
        [intrinsics.width, intrinsics.height, 1],
        || {
            depth
                .par_chunks_mut(width)
                .zip(color.par_chunks_mut(width))
                .zip(normal.par_chunks_mut(width))
                .enumerate()
                .for_each(|(v, ((depth_row, color_row), normal_row))| {
                    for u in 0..width {
                        let dir = rot * intrinsics.ray_direction(u as f32, v as f32);
                        let hit = march(volume, &origin, &dir, range, step);

                        let Some(t) = hit else {
                            depth_row[u] = invalid;
                            color_row[u] = [0; 4];
                            normal_row[u] = Vector3::zeros();
                            continue;
                        };

                        let p = origin + dir * t;
                        depth_row[u] = t;
                        color_row[u] = volume
                            .interpolate_color(&p)
                            .map(|c| c.map(|ch| ch.round().clamp(0.0, 255.0) as u8))
                            .unwrap_or([0; 4]);
                        normal_row[u] = volume
                            .tsdf_gradient(&p)
                            .and_then(|g| g.try_normalize(f32::EPSILON))
                            .map(|n| -n)
                            .unwrap_or_else(Vector3::zeros);
                    }
                });
        },
    );
}
