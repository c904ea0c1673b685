//! Voxel records and volume configuration.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::KinfuError;

/// Scale between the normalized TSDF and its 16-bit fixed-point encoding.
pub const TSDF_SCALE: f32 = 32767.0;

/// Volume extents must be a multiple of the pyramid downsample factor.
pub const RESOLUTION_MULTIPLE: u32 = 2;

/// Voxel record as stored in the volume buffer.
///
/// `tsdf_weight` holds the quantized TSDF in the high 16 bits (two's
/// complement) and the integration weight in the low 16 bits. `color` holds
/// RGBA8 with R in the lowest byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PackedVoxel {
    pub tsdf_weight: u32,
    pub color: u32,
}

impl PackedVoxel {
    /// Unobserved voxel: tsdf 0, weight 0, black transparent color.
    pub const EMPTY: Self = Self {
        tsdf_weight: 0,
        color: 0,
    };

    #[inline]
    pub fn weight(&self) -> u16 {
        (self.tsdf_weight & 0xFFFF) as u16
    }

    #[inline]
    pub fn unpack(&self) -> Voxel {
        let (tsdf, weight) = unpack_tsdf_weight(self.tsdf_weight);
        Voxel {
            tsdf,
            weight,
            color: unpack_color(self.color),
        }
    }
}

/// Decoded voxel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voxel {
    /// Normalized signed distance in [-1, 1]; positive in front of the surface.
    pub tsdf: f32,
    /// Number of fused observations, capped at the truncation weight.
    pub weight: u16,
    pub color: [u8; 4],
}

impl Voxel {
    #[inline]
    pub fn pack(&self) -> PackedVoxel {
        PackedVoxel {
            tsdf_weight: pack_tsdf_weight(self.tsdf, self.weight),
            color: pack_color(self.color),
        }
    }
}

/// Encode a TSDF value and weight into one word.
///
/// The TSDF is clamped to [-1, 1] and rounded to the nearest step of
/// `1/32767`.
#[inline]
pub fn pack_tsdf_weight(tsdf: f32, weight: u16) -> u32 {
    let quantized = (tsdf.clamp(-1.0, 1.0) * TSDF_SCALE).round() as i16;
    ((quantized as u16 as u32) << 16) | weight as u32
}

/// Decode a word produced by [`pack_tsdf_weight`].
#[inline]
pub fn unpack_tsdf_weight(word: u32) -> (f32, u16) {
    let quantized = (word >> 16) as u16 as i16;
    (quantized as f32 / TSDF_SCALE, (word & 0xFFFF) as u16)
}

#[inline]
pub fn pack_color(rgba: [u8; 4]) -> u32 {
    u32::from_le_bytes(rgba)
}

#[inline]
pub fn unpack_color(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}

/// Volume geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Voxel count per axis.
    pub resolution: [u32; 3],
    /// Voxel edge length in meters.
    pub voxel_size: f32,
    /// World position of the center of voxel (0, 0, 0). Defaults to the
    /// value that centers the volume on the world origin.
    pub corner: Option<[f32; 3]>,
    /// Truncation distance in meters. Defaults to three voxels.
    pub truncation_distance: Option<f32>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            resolution: [512, 512, 512],
            voxel_size: 0.02,
            corner: None,
            truncation_distance: None,
        }
    }
}

impl VolumeConfig {
    /// Cubic volume of `resolution³` voxels.
    pub fn cubic(resolution: u32, voxel_size: f32) -> Self {
        Self {
            resolution: [resolution; 3],
            voxel_size,
            ..Default::default()
        }
    }

    pub fn corner(&self) -> Vector3<f32> {
        match self.corner {
            Some(c) => Vector3::from(c),
            None => Vector3::new(
                -((self.resolution[0] as f32 - 1.0) * self.voxel_size) * 0.5,
                -((self.resolution[1] as f32 - 1.0) * self.voxel_size) * 0.5,
                -((self.resolution[2] as f32 - 1.0) * self.voxel_size) * 0.5,
            ),
        }
    }

    pub fn truncation_distance(&self) -> f32 {
        self.truncation_distance.unwrap_or(3.0 * self.voxel_size)
    }

    /// Total voxel count, `None` if it does not fit in `usize`.
    pub fn checked_voxel_count(&self) -> Option<usize> {
        self.resolution
            .iter()
            .try_fold(1usize, |acc, &r| acc.checked_mul(r as usize))
    }

    /// Total voxel count. Saturates for resolutions rejected by
    /// [`VolumeConfig::validate`].
    pub fn voxel_count(&self) -> usize {
        self.checked_voxel_count().unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<(), KinfuError> {
        for (axis, &r) in self.resolution.iter().enumerate() {
            if r == 0 || r % RESOLUTION_MULTIPLE != 0 {
                return Err(KinfuError::config(format!(
                    "volume resolution {r} on axis {axis} is not a nonzero multiple of {RESOLUTION_MULTIPLE}"
                )));
            }
        }
        if self.checked_voxel_count().is_none() {
            return Err(KinfuError::config(format!(
                "volume resolution {:?} has more voxels than can be addressed",
                self.resolution
            )));
        }
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(KinfuError::config(format!(
                "voxel size must be positive, got {}",
                self.voxel_size
            )));
        }
        let tau = self.truncation_distance();
        if !(tau.is_finite() && tau > 0.0) {
            return Err(KinfuError::config(format!(
                "truncation distance must be positive, got {tau}"
            )));
        }
        if self.corner().iter().any(|c| !c.is_finite()) {
            return Err(KinfuError::config("volume corner must be finite"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pack_round_trip() {
        for &tsdf in &[-1.0f32, -0.5, -1e-4, 0.0, 0.25, 0.999, 1.0] {
            for &weight in &[0u16, 1, 100, u16::MAX] {
                let (t, w) = unpack_tsdf_weight(pack_tsdf_weight(tsdf, weight));
                assert!((t - tsdf).abs() <= 1.0 / TSDF_SCALE, "tsdf {tsdf} -> {t}");
                assert_eq!(w, weight);
            }
        }
    }

    #[test]
    fn test_pack_bit_layout() {
        assert_eq!(pack_tsdf_weight(1.0, 7), (32767 << 16) | 7);
        assert_eq!(pack_tsdf_weight(-1.0, 0), 0x8001_0000);
        assert_eq!(pack_tsdf_weight(0.0, 0xFFFF), 0x0000_FFFF);
        // Rounds to nearest rather than truncating
        assert_eq!(pack_tsdf_weight(0.7 / TSDF_SCALE, 0) >> 16, 1);
    }

    #[test]
    fn test_pack_clamps_out_of_range() {
        let (t, _) = unpack_tsdf_weight(pack_tsdf_weight(3.0, 1));
        assert_eq!(t, 1.0);
        let (t, _) = unpack_tsdf_weight(pack_tsdf_weight(-3.0, 1));
        assert_eq!(t, -1.0);
    }

    #[test]
    fn test_color_little_endian() {
        let word = pack_color([0x11, 0x22, 0x33, 0x44]);
        assert_eq!(word, 0x4433_2211);
        assert_eq!(unpack_color(word), [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_voxel_pack_unpack() {
        let v = Voxel {
            tsdf: -0.3,
            weight: 12,
            color: [200, 100, 50, 255],
        };
        let packed = v.pack();
        assert_eq!(packed.weight(), 12);
        let back = packed.unpack();
        assert_relative_eq!(back.tsdf, -0.3, epsilon = 1.0 / TSDF_SCALE);
        assert_eq!(back.weight, 12);
        assert_eq!(back.color, v.color);
        assert_eq!(PackedVoxel::EMPTY.unpack().weight, 0);
    }

    #[test]
    fn test_default_geometry() {
        let config = VolumeConfig::cubic(4, 0.5);
        assert_relative_eq!(config.corner(), Vector3::new(-0.75, -0.75, -0.75));
        assert_relative_eq!(config.truncation_distance(), 1.5);
        assert_eq!(config.voxel_count(), 64);
        assert!(config.validate().is_ok());

        let config = VolumeConfig::default();
        assert_eq!(config.resolution, [512, 512, 512]);
        assert_relative_eq!(config.truncation_distance(), 0.06, epsilon = 1e-6);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        assert!(VolumeConfig::cubic(3, 0.1).validate().is_err());
        assert!(VolumeConfig::cubic(0, 0.1).validate().is_err());
        assert!(VolumeConfig::cubic(4, 0.0).validate().is_err());

        let config = VolumeConfig {
            truncation_distance: Some(-1.0),
            ..VolumeConfig::cubic(4, 0.1)
        };
        assert!(matches!(
            config.validate(),
            Err(KinfuError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unaddressable_volume() {
        let config = VolumeConfig {
            corner: Some([0.0; 3]),
            ..VolumeConfig::cubic(0xFFFF_FFFE, 0.01)
        };
        assert_eq!(config.checked_voxel_count(), None);
        assert_eq!(config.voxel_count(), usize::MAX);
        assert!(matches!(
            config.validate(),
            Err(KinfuError::Configuration(_))
        ));
    }
}
