//! Projective TSDF fusion.
//!
//! Every voxel center is transformed into the camera, projected to the
//! nearest pixel and compared against the measured depth there. Voxels in
//! front of the surface or within the truncation band behind it are blended
//! into the volume with a capped running average:
//!
//! ```text
//! tsdf'  = (w·tsdf + sdf) / (w + 1)
//! color' = (w·color + c) / (w + 1)
//! w'     = min(w + 1, w_max)
//! ```
//!
//! Once `w` reaches `w_max` the denominator stays fixed, so old
//! observations decay exponentially.

use nalgebra::{Matrix4, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::KinfuError;
use crate::frame::Frame;
use crate::pose;
use crate::runtime::{ComputeRuntime, Stage};
use crate::volume::{TsdfVolume, Voxel};

/// Fusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Maximum integration weight per voxel.
    pub truncation_weight: u16,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            truncation_weight: 100,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), KinfuError> {
        if self.truncation_weight == 0 {
            return Err(KinfuError::config("truncation weight must be at least 1"));
        }
        Ok(())
    }
}

/// Blend one normalized observation into a voxel.
#[inline]
pub fn integrate(voxel: Voxel, tsdf: f32, color: [u8; 4], max_weight: u16) -> Voxel {
    let w = voxel.weight.min(max_weight) as f32;
    let denom = w + 1.0;

    let mut blended = [0u8; 4];
    for (c, out) in blended.iter_mut().enumerate() {
        let value = (w * voxel.color[c] as f32 + color[c] as f32) / denom;
        *out = value.round().clamp(0.0, 255.0) as u8;
    }

    Voxel {
        tsdf: ((w * voxel.tsdf + tsdf) / denom).clamp(-1.0, 1.0),
        weight: voxel.weight.saturating_add(1).min(max_weight),
        color: blended,
    }
}

/// Fuse `frame`, observed from `view` (world → camera), into `volume`.
pub fn fuse(
    runtime: &ComputeRuntime,
    volume: &mut TsdfVolume,
    frame: &Frame,
    view: &Matrix4<f32>,
    config: &FusionConfig,
) {
    let [_, ry, rz] = volume.resolution();
    let (ry, rz) = (ry as usize, rz as usize);
    let extent = volume.resolution();
    let corner = volume.corner();
    let voxel_size = volume.voxel_size();
    let tau = volume.truncation_distance();
    let max_weight = config.truncation_weight;

    let rot = pose::rotation(view);
    let trans: Vector3<f32> = view.fixed_view::<3, 1>(0, 3).into_owned();
    let intrinsics = *frame.intrinsics();
    let width = intrinsics.width as usize;
    let colors = frame.color();

    let voxels = volume.voxels_mut();
    runtime.dispatch(Stage::Fuse, extent, || {
        voxels
            .par_chunks_mut(rz)
            .enumerate()
            .for_each(|(column, column_voxels)| {
                let x = (column / ry) as f32;
                let y = (column % ry) as f32;
                for (z, packed) in column_voxels.iter_mut().enumerate() {
                    let world = corner + Vector3::new(x, y, z as f32) * voxel_size;
                    let cam = rot * world + trans;

                    let Some((u, v)) = intrinsics.project_to_pixel(&cam) else {
                        continue;
                    };
                    let Some(depth) = frame.valid_depth(u, v) else {
                        continue;
                    };

                    let sdf = depth - cam.z;
                    if sdf < -tau {
                        continue;
                    }
                    let tsdf = (sdf / tau).clamp(-1.0, 1.0);
                    *packed =
                        integrate(packed.unpack(), tsdf, colors[v * width + u], max_weight).pack();
                }
            });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::test_utils::{plane_frame, test_intrinsics};
    use crate::volume::{VolumeConfig, TSDF_SCALE};
    use approx::assert_relative_eq;

    fn runtime() -> ComputeRuntime {
        ComputeRuntime::new(&RuntimeConfig::default()).unwrap()
    }

    /// 16³ volume at 5 cm spanning z ∈ [0.5, 1.25] in front of the camera.
    fn volume() -> TsdfVolume {
        TsdfVolume::new(&VolumeConfig {
            resolution: [16, 16, 16],
            voxel_size: 0.05,
            corner: Some([-0.375, -0.375, 0.5]),
            truncation_distance: None,
        })
        .unwrap()
    }

    #[test]
    fn test_integrate_first_observation() {
        let empty = Voxel {
            tsdf: 0.0,
            weight: 0,
            color: [0; 4],
        };
        let v = integrate(empty, -0.4, [10, 20, 30, 255], 100);
        assert_relative_eq!(v.tsdf, -0.4);
        assert_eq!(v.weight, 1);
        assert_eq!(v.color, [10, 20, 30, 255]);
    }

    #[test]
    fn test_integrate_running_average() {
        let voxel = Voxel {
            tsdf: 0.5,
            weight: 3,
            color: [100, 0, 0, 255],
        };
        let v = integrate(voxel, -0.5, [200, 0, 0, 255], 100);
        assert_relative_eq!(v.tsdf, 0.25);
        assert_eq!(v.weight, 4);
        assert_eq!(v.color, [125, 0, 0, 255]);
    }

    #[test]
    fn test_integrate_weight_cap() {
        let voxel = Voxel {
            tsdf: 1.0,
            weight: 4,
            color: [0; 4],
        };
        let v = integrate(voxel, 0.0, [0; 4], 4);
        assert_eq!(v.weight, 4);
        // Denominator fixed at w_max + 1
        assert_relative_eq!(v.tsdf, 0.8);
    }

    #[test]
    fn test_fuse_plane() {
        let rt = runtime();
        let mut volume = volume();
        let frame = plane_frame(&test_intrinsics(), 1.0, [50, 60, 70, 255]);
        fuse(&rt, &mut volume, &frame, &Matrix4::identity(), &FusionConfig::default());

        let tau = volume.truncation_distance();
        // z = 0.9: 10 cm in front of the plane
        let v = volume.voxel(8, 8, 8).unwrap();
        assert_relative_eq!(v.tsdf, 0.1 / tau, epsilon = 1e-3);
        assert_eq!(v.weight, 1);
        assert_eq!(v.color, [50, 60, 70, 255]);

        // z = 0.5: beyond the truncation band in front, clamped
        let v = volume.voxel(8, 8, 0).unwrap();
        assert_eq!(v.tsdf, 1.0);
        assert_eq!(v.weight, 1);

        // On the surface
        let v = volume.voxel(8, 8, 10).unwrap();
        assert_relative_eq!(v.tsdf, 0.0, epsilon = 1e-3);

        // Inside the truncation band behind the surface
        let v = volume.voxel(8, 8, 12).unwrap();
        assert_relative_eq!(v.tsdf, -0.1 / tau, epsilon = 1e-3);

        // Far behind the surface
        assert_eq!(volume.voxel(8, 8, 14).unwrap().weight, 0);
    }

    #[test]
    fn test_fuse_skips_voxels_outside_image() {
        let rt = runtime();
        let mut volume = volume();
        let frame = plane_frame(&test_intrinsics(), 1.0, [255; 4]);
        fuse(&rt, &mut volume, &frame, &Matrix4::identity(), &FusionConfig::default());

        // x = -0.375 at z = 0.5 projects left of the image
        assert_eq!(volume.voxel(0, 8, 0).unwrap().weight, 0);

        // Camera looking away from the volume
        let mut volume2 = self::volume();
        let mut behind = Matrix4::identity();
        behind[(2, 2)] = -1.0;
        behind[(0, 0)] = -1.0;
        fuse(&rt, &mut volume2, &frame, &behind, &FusionConfig::default());
        assert_eq!(volume2.observed_count(), 0);
    }

    #[test]
    fn test_fuse_skips_invalid_depth() {
        let rt = runtime();
        let mut volume = volume();
        let frame = plane_frame(&test_intrinsics(), 0.0, [255; 4]);
        fuse(&rt, &mut volume, &frame, &Matrix4::identity(), &FusionConfig::default());
        assert_eq!(volume.observed_count(), 0);
    }

    #[test]
    fn test_fuse_convergence() {
        let rt = runtime();
        let mut volume = volume();
        let config = FusionConfig {
            truncation_weight: 5,
        };
        let frame = plane_frame(&test_intrinsics(), 1.0, [80, 80, 80, 255]);
        let expected = 0.1 / volume.truncation_distance();

        let mut last_weight = 0;
        for _ in 0..8 {
            fuse(&rt, &mut volume, &frame, &Matrix4::identity(), &config);
            let v = volume.voxel(8, 8, 8).unwrap();
            assert!(v.weight >= last_weight);
            assert!(v.weight <= 5);
            assert_relative_eq!(v.tsdf, expected, epsilon = 1e-3 + 8.0 / TSDF_SCALE);
            last_weight = v.weight;
        }
        assert_eq!(last_weight, 5);
    }

    #[test]
    fn test_zero_truncation_weight_rejected() {
        let config = FusionConfig {
            truncation_weight: 0,
        };
        assert!(config.validate().is_err());
        assert!(FusionConfig::default().validate().is_ok());
    }
}
