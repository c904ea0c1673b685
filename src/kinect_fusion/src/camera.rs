//! Pinhole camera intrinsics.

use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics in pixels. Image y points down, camera z forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Intrinsics for pyramid level `level` (extent halved per level).
    ///
    /// The principal point is scaled about pixel centers, so that pixel
    /// `(2u, 2v)` of level L maps to pixel `(u, v)` of level L+1.
    pub fn scaled(&self, level: usize) -> Self {
        let scale = (1u32 << level) as f32;
        Self {
            fx: self.fx / scale,
            fy: self.fy / scale,
            cx: (self.cx + 0.5) / scale - 0.5,
            cy: (self.cy + 0.5) / scale - 0.5,
            width: self.width >> level,
            height: self.height >> level,
        }
    }

    /// Number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Project a camera-space point onto the image plane.
    ///
    /// Returns `None` for points on or behind the camera plane.
    #[inline]
    pub fn project(&self, p: &Vector3<f32>) -> Option<Point2<f32>> {
        if p.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Project and round to the nearest pixel, returning `(u, v)` if it lies
    /// inside the image.
    #[inline]
    pub fn project_to_pixel(&self, p: &Vector3<f32>) -> Option<(usize, usize)> {
        let uv = self.project(p)?;
        let u = uv.x.round();
        let v = uv.y.round();
        if u < 0.0 || v < 0.0 || u >= self.width as f32 || v >= self.height as f32 {
            return None;
        }
        Some((u as usize, v as usize))
    }

    /// Back-project pixel `(u, v)` at camera-space depth `depth`.
    #[inline]
    pub fn back_project(&self, u: f32, v: f32, depth: f32) -> Vector3<f32> {
        Vector3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Camera-space ray through pixel `(u, v)` with unit z component.
    #[inline]
    pub fn ray_direction(&self, u: f32, v: f32) -> Vector3<f32> {
        Vector3::new((u - self.cx) / self.fx, (v - self.cy) / self.fy, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(525.0, 525.0, 319.5, 239.5, 640, 480)
    }

    #[test]
    fn test_project_back_project() {
        let cam = camera();
        let p = cam.back_project(100.0, 50.0, 2.0);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(uv.x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(uv.y, 50.0, epsilon = 1e-3);
        assert_eq!(p.z, 2.0);
    }

    #[test]
    fn test_project_behind_camera() {
        let cam = camera();
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project_to_pixel(&Vector3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_project_to_pixel_bounds() {
        let cam = camera();
        assert_eq!(
            cam.project_to_pixel(&Vector3::new(0.0, 0.0, 1.0)),
            Some((320, 240))
        );
        // Far to the left of the image
        assert!(cam.project_to_pixel(&Vector3::new(-2.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn test_scaled_intrinsics() {
        let cam = camera();
        let l1 = cam.scaled(1);
        assert_eq!((l1.width, l1.height), (320, 240));
        assert_relative_eq!(l1.fx, 262.5);
        assert_relative_eq!(l1.cx, 159.5);

        let l2 = cam.scaled(2);
        assert_eq!((l2.width, l2.height), (160, 120));
        assert_relative_eq!(l2.cy, 59.5);
        assert_eq!(cam.scaled(0), cam);
    }

    #[test]
    fn test_ray_direction_unit_depth() {
        let cam = camera();
        let d = cam.ray_direction(0.0, 0.0);
        assert_eq!(d.z, 1.0);
        assert_relative_eq!(d * 3.0, cam.back_project(0.0, 0.0, 3.0), epsilon = 1e-5);
    }
}
