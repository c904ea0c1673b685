//! TSDF voxel volume.
//!
//! The volume is a dense grid of packed voxel records covering an
//! axis-aligned box in world space. Voxel `(x, y, z)` sits at
//! `corner + voxel_size·(x, y, z)` and is stored at linear index
//! `(x·Ry + y)·Rz + z`.
//!
//! # Architecture
//!
//! - [`types`]: packed record encoding and [`VolumeConfig`]
//! - [`sampling`]: trilinear TSDF/color lookups used by the ray caster
//! - [`layout`]: the serialized buffer (32-byte header + records)
//!
//! Fusion and ray casting live in [`crate::fusion`] and [`crate::raycast`];
//! both borrow the volume for the duration of one dispatch.

pub mod layout;
pub mod sampling;
pub mod types;

pub use layout::HEADER_SIZE;
pub use types::{
    pack_color, pack_tsdf_weight, unpack_color, unpack_tsdf_weight, PackedVoxel, Voxel,
    VolumeConfig, TSDF_SCALE,
};

use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::debug;

use crate::error::KinfuError;
use crate::runtime::{ComputeRuntime, Stage};

/// Dense TSDF volume.
#[derive(Debug, Clone)]
pub struct TsdfVolume {
    resolution: [u32; 3],
    voxel_size: f32,
    corner: Vector3<f32>,
    truncation_distance: f32,
    voxels: Vec<PackedVoxel>,
}

impl TsdfVolume {
    /// Allocate a volume with every voxel unobserved.
    pub fn new(config: &VolumeConfig) -> Result<Self, KinfuError> {
        config.validate()?;

        let volume = Self {
            resolution: config.resolution,
            voxel_size: config.voxel_size,
            corner: config.corner(),
            truncation_distance: config.truncation_distance(),
            voxels: vec![PackedVoxel::EMPTY; config.voxel_count()],
        };

        debug!(
            resolution = ?volume.resolution,
            voxel_size = volume.voxel_size,
            truncation = volume.truncation_distance,
            bytes = volume.buffer_size(),
            "allocated TSDF volume"
        );
        Ok(volume)
    }

    /// Reset every voxel to tsdf 0, weight 0, color 0.
    pub fn init(&mut self, runtime: &ComputeRuntime) {
        let extent = self.resolution;
        let voxels = &mut self.voxels;
        runtime.dispatch(Stage::InitVolume, extent, || {
            voxels
                .par_iter_mut()
                .for_each(|v| *v = PackedVoxel::EMPTY);
        });
    }

    pub fn resolution(&self) -> [u32; 3] {
        self.resolution
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// World position of the center of voxel (0, 0, 0).
    pub fn corner(&self) -> Vector3<f32> {
        self.corner
    }

    pub fn truncation_distance(&self) -> f32 {
        self.truncation_distance
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Size in bytes of the serialized volume.
    pub fn buffer_size(&self) -> usize {
        HEADER_SIZE + self.voxels.len() * std::mem::size_of::<PackedVoxel>()
    }

    /// World position of the center of the last voxel.
    pub fn far_corner(&self) -> Vector3<f32> {
        self.corner + self.extent_vector() * self.voxel_size
    }

    fn extent_vector(&self) -> Vector3<f32> {
        Vector3::new(
            (self.resolution[0] - 1) as f32,
            (self.resolution[1] - 1) as f32,
            (self.resolution[2] - 1) as f32,
        )
    }

    /// Linear index of voxel `(x, y, z)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.resolution[1] as usize + y) * self.resolution[2] as usize + z
    }

    /// World-space center of voxel `(x, y, z)`.
    #[inline]
    pub fn voxel_center(&self, x: usize, y: usize, z: usize) -> Vector3<f32> {
        self.corner + Vector3::new(x as f32, y as f32, z as f32) * self.voxel_size
    }

    /// Decoded voxel, or `None` outside the grid.
    pub fn voxel(&self, x: usize, y: usize, z: usize) -> Option<Voxel> {
        let [rx, ry, rz] = self.resolution;
        if x >= rx as usize || y >= ry as usize || z >= rz as usize {
            return None;
        }
        Some(self.voxels[self.index(x, y, z)].unpack())
    }

    /// Voxel containing world point `p`, if inside the grid.
    pub fn world_to_voxel(&self, p: &Vector3<f32>) -> Option<[usize; 3]> {
        let g = (p - self.corner) / self.voxel_size;
        let mut out = [0usize; 3];
        for axis in 0..3 {
            let i = g[axis].round();
            if i < 0.0 || i >= self.resolution[axis] as f32 {
                return None;
            }
            out[axis] = i as usize;
        }
        Some(out)
    }

    /// Packed voxel records in linear-index order.
    pub fn voxels(&self) -> &[PackedVoxel] {
        &self.voxels
    }

    pub(crate) fn voxels_mut(&mut self) -> &mut [PackedVoxel] {
        &mut self.voxels
    }

    /// Number of voxels with nonzero weight.
    pub fn observed_count(&self) -> usize {
        self.voxels.par_iter().filter(|v| v.weight() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use approx::assert_relative_eq;

    fn runtime() -> ComputeRuntime {
        ComputeRuntime::new(&RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_new_volume_is_unobserved() {
        let volume = TsdfVolume::new(&VolumeConfig::cubic(8, 0.1)).unwrap();
        assert_eq!(volume.len(), 512);
        assert!(!volume.is_empty());
        assert_eq!(volume.observed_count(), 0);
        assert_eq!(volume.buffer_size(), 32 + 8 * 512);

        let v = volume.voxel(3, 4, 5).unwrap();
        assert_eq!(v.tsdf, 0.0);
        assert_eq!(v.weight, 0);
        assert_eq!(v.color, [0, 0, 0, 0]);
    }

    #[test]
    fn test_index_layout() {
        let config = VolumeConfig {
            resolution: [4, 6, 8],
            ..VolumeConfig::cubic(4, 0.1)
        };
        let volume = TsdfVolume::new(&config).unwrap();
        assert_eq!(volume.index(0, 0, 1), 1);
        assert_eq!(volume.index(0, 1, 0), 8);
        assert_eq!(volume.index(1, 0, 0), 48);
        assert_eq!(volume.index(3, 5, 7), volume.len() - 1);
    }

    #[test]
    fn test_voxel_centers() {
        let volume = TsdfVolume::new(&VolumeConfig::cubic(4, 0.5)).unwrap();
        assert_relative_eq!(volume.voxel_center(0, 0, 0), Vector3::new(-0.75, -0.75, -0.75));
        assert_relative_eq!(volume.far_corner(), Vector3::new(0.75, 0.75, 0.75));
        assert_eq!(
            volume.world_to_voxel(&Vector3::new(0.3, -0.3, 0.8)),
            Some([2, 1, 3])
        );
        assert!(volume.world_to_voxel(&Vector3::new(2.0, 0.0, 0.0)).is_none());
        assert!(volume.voxel(4, 0, 0).is_none());
    }

    #[test]
    fn test_init_resets_voxels() {
        let rt = runtime();
        let mut volume = TsdfVolume::new(&VolumeConfig::cubic(4, 0.1)).unwrap();
        volume.voxels_mut()[5] = Voxel {
            tsdf: 0.5,
            weight: 3,
            color: [1, 2, 3, 4],
        }
        .pack();
        assert_eq!(volume.observed_count(), 1);

        volume.init(&rt);
        assert_eq!(volume.observed_count(), 0);
        assert!(volume.voxels().iter().all(|v| *v == PackedVoxel::EMPTY));
    }
}
