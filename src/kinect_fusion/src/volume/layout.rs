//! Serialized volume buffer.
//!
//! Little-endian layout:
//!
//! | offset | field                      |
//! |--------|----------------------------|
//! | 0      | resolution, 3 × u32        |
//! | 12     | voxel size, f32            |
//! | 16     | corner, 3 × f32            |
//! | 28     | truncation distance, f32   |
//! | 32     | `Rx·Ry·Rz` × (u32, u32)    |
//!
//! Each record is the `tsdf_weight` word followed by the `color` word.

use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector3;

use super::{PackedVoxel, TsdfVolume, VolumeConfig};
use crate::error::KinfuError;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

const RECORD_SIZE: usize = 8;

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[self.offset..self.offset + 4]);
        self.offset += 4;
        u32::from_le_bytes(word)
    }

    fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }
}

impl TsdfVolume {
    /// Serialize header and voxel records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buffer_size());
        for r in self.resolution {
            out.extend_from_slice(&r.to_le_bytes());
        }
        out.extend_from_slice(&self.voxel_size.to_le_bytes());
        for c in self.corner.iter() {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.extend_from_slice(&self.truncation_distance.to_le_bytes());

        for v in &self.voxels {
            out.extend_from_slice(&v.tsdf_weight.to_le_bytes());
            out.extend_from_slice(&v.color.to_le_bytes());
        }
        out
    }

    /// Rebuild a volume from [`TsdfVolume::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KinfuError> {
        if bytes.len() < HEADER_SIZE {
            return Err(KinfuError::InvalidVolumeBuffer(format!(
                "buffer of {} bytes is shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            )));
        }

        let mut reader = Reader { bytes, offset: 0 };
        let resolution = [reader.u32(), reader.u32(), reader.u32()];
        let voxel_size = reader.f32();
        let corner = [reader.f32(), reader.f32(), reader.f32()];
        let truncation_distance = reader.f32();

        let config = VolumeConfig {
            resolution,
            voxel_size,
            corner: Some(corner),
            truncation_distance: Some(truncation_distance),
        };
        config
            .validate()
            .map_err(|e| KinfuError::InvalidVolumeBuffer(format!("bad header: {e}")))?;

        let count = config.voxel_count();
        let expected = count
            .checked_mul(RECORD_SIZE)
            .and_then(|records| records.checked_add(HEADER_SIZE))
            .ok_or_else(|| {
                KinfuError::InvalidVolumeBuffer(format!(
                    "{resolution:?} voxels exceed the addressable buffer size"
                ))
            })?;
        if bytes.len() != expected {
            return Err(KinfuError::InvalidVolumeBuffer(format!(
                "expected {expected} bytes for {resolution:?} voxels, got {}",
                bytes.len()
            )));
        }

        let voxels = (0..count)
            .map(|_| PackedVoxel {
                tsdf_weight: reader.u32(),
                color: reader.u32(),
            })
            .collect();

        Ok(Self {
            resolution,
            voxel_size,
            corner: Vector3::from(corner),
            truncation_distance,
            voxels,
        })
    }

    /// Write the serialized volume to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes())
            .with_context(|| format!("failed to write volume to {}", path.display()))
    }

    /// Read a volume written by [`TsdfVolume::write_to`].
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read volume from {}", path.display()))?;
        let volume = Self::from_bytes(&bytes)
            .with_context(|| format!("failed to decode volume from {}", path.display()))?;
        Ok(volume)
    }
}
