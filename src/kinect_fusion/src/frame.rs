//! Input frames and depth validity.

use serde::{Deserialize, Serialize};

use crate::camera::CameraIntrinsics;
use crate::error::KinfuError;

/// Accepted depth window and the sentinel marking missing measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthRange {
    pub min_depth: f32,
    pub max_depth: f32,
    pub invalid_depth: f32,
}

impl DepthRange {
    pub fn new(min_depth: f32, max_depth: f32, invalid_depth: f32) -> Self {
        Self {
            min_depth,
            max_depth,
            invalid_depth,
        }
    }

    /// Whether `depth` is a usable measurement.
    #[inline]
    pub fn is_valid(&self, depth: f32) -> bool {
        depth.is_finite()
            && depth != self.invalid_depth
            && depth >= self.min_depth
            && depth <= self.max_depth
    }
}

impl Default for DepthRange {
    fn default() -> Self {
        Self {
            min_depth: 0.1,
            max_depth: 10.0,
            invalid_depth: 0.0,
        }
    }
}

/// One RGB-D frame: RGBA8 color and metric depth, row-major, y down.
#[derive(Debug, Clone)]
pub struct Frame {
    color: Vec<[u8; 4]>,
    depth: Vec<f32>,
    intrinsics: CameraIntrinsics,
    range: DepthRange,
}

impl Frame {
    /// Create a frame, checking that both maps cover the intrinsics' extent.
    pub fn new(
        color: Vec<[u8; 4]>,
        depth: Vec<f32>,
        intrinsics: CameraIntrinsics,
        range: DepthRange,
    ) -> Result<Self, KinfuError> {
        let expected = intrinsics.pixel_count();
        if color.len() != depth.len() {
            return Err(KinfuError::config(format!(
                "color map has {} pixels but depth map has {}",
                color.len(),
                depth.len()
            )));
        }
        if depth.len() != expected {
            return Err(KinfuError::config(format!(
                "frame maps have {} pixels, intrinsics describe {}x{}",
                depth.len(),
                intrinsics.width,
                intrinsics.height
            )));
        }
        if range.min_depth > range.max_depth {
            return Err(KinfuError::config(format!(
                "min depth {} exceeds max depth {}",
                range.min_depth, range.max_depth
            )));
        }
        Ok(Self {
            color,
            depth,
            intrinsics,
            range,
        })
    }

    pub fn width(&self) -> u32 {
        self.intrinsics.width
    }

    pub fn height(&self) -> u32 {
        self.intrinsics.height
    }

    pub fn color(&self) -> &[[u8; 4]] {
        &self.color
    }

    pub fn depth(&self) -> &[f32] {
        &self.depth
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn range(&self) -> &DepthRange {
        &self.range
    }

    /// Depth at pixel `(u, v)` if it is a valid measurement.
    #[inline]
    pub fn valid_depth(&self, u: usize, v: usize) -> Option<f32> {
        let d = self.depth[v * self.intrinsics.width as usize + u];
        self.range.is_valid(d).then_some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(10.0, 10.0, 1.5, 1.5, 4, 4)
    }

    #[test]
    fn test_depth_validity() {
        let range = DepthRange::new(0.2, 5.0, 0.0);
        assert!(range.is_valid(1.0));
        assert!(range.is_valid(0.2));
        assert!(range.is_valid(5.0));
        assert!(!range.is_valid(0.0));
        assert!(!range.is_valid(0.1));
        assert!(!range.is_valid(5.5));
        assert!(!range.is_valid(f32::NAN));
    }

    #[test]
    fn test_frame_extent_mismatch() {
        let result = Frame::new(
            vec![[0; 4]; 15],
            vec![1.0; 16],
            intrinsics(),
            DepthRange::default(),
        );
        assert!(matches!(result, Err(KinfuError::Configuration(_))));

        let result = Frame::new(
            vec![[0; 4]; 8],
            vec![1.0; 8],
            intrinsics(),
            DepthRange::default(),
        );
        assert!(matches!(result, Err(KinfuError::Configuration(_))));
    }

    #[test]
    fn test_valid_depth() {
        let mut depth = vec![1.0; 16];
        depth[5] = 0.0;
        let frame = Frame::new(vec![[0; 4]; 16], depth, intrinsics(), DepthRange::default())
            .unwrap();
        assert_eq!(frame.valid_depth(0, 0), Some(1.0));
        assert_eq!(frame.valid_depth(1, 1), None);
    }
}
