//! Synthetic frames and scenes with known ground truth.
//!
//! Scenes are unions of infinite planes rendered analytically, so the
//! depth of every pixel is exact and pose estimates can be checked against
//! the camera pose the frame was rendered from.

use nalgebra::{Isometry3, Matrix4, Translation3, UnitQuaternion, Vector3};

use crate::camera::CameraIntrinsics;
use crate::frame::{DepthRange, Frame};
use crate::pose;
use crate::volume::VolumeConfig;

/// 80×60 camera with a ~70° horizontal field of view.
///
/// Small enough for fast tests, and divisible by four so every pyramid
/// level has integral extents.
pub fn test_intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(70.0, 70.0, 39.5, 29.5, 80, 60)
}

/// Fronto-parallel plane at `depth` covering the whole image.
pub fn plane_frame(intrinsics: &CameraIntrinsics, depth: f32, color: [u8; 4]) -> Frame {
    plane_frame_with_footprint(
        intrinsics,
        depth,
        color,
        (0, 0, intrinsics.width, intrinsics.height),
    )
}

/// Fronto-parallel plane at `depth` visible only inside the pixel rectangle
/// `(u0, v0, u1, v1)` (half-open). Other pixels hold the invalid depth.
pub fn plane_frame_with_footprint(
    intrinsics: &CameraIntrinsics,
    depth: f32,
    color: [u8; 4],
    footprint: (u32, u32, u32, u32),
) -> Frame {
    let (u0, v0, u1, v1) = footprint;
    let range = DepthRange::default();
    let mut depths = vec![range.invalid_depth; intrinsics.pixel_count()];
    let mut colors = vec![[0u8; 4]; intrinsics.pixel_count()];
    for v in v0..v1.min(intrinsics.height) {
        for u in u0..u1.min(intrinsics.width) {
            let i = (v * intrinsics.width + u) as usize;
            depths[i] = depth;
            colors[i] = color;
        }
    }
    frame_from_maps(colors, depths, intrinsics, range)
}

fn frame_from_maps(
    colors: Vec<[u8; 4]>,
    depths: Vec<f32>,
    intrinsics: &CameraIntrinsics,
    range: DepthRange,
) -> Frame {
    match Frame::new(colors, depths, *intrinsics, range) {
        Ok(frame) => frame,
        Err(e) => panic!("synthetic frame does not match its intrinsics: {e}"),
    }
}

/// View matrix (world → camera) of a camera at `position` with the given
/// roll/pitch/yaw (radians).
pub fn view_from_camera_pose(position: Vector3<f32>, roll: f32, pitch: f32, yaw: f32) -> Matrix4<f32> {
    let camera_to_world = Isometry3::from_parts(
        Translation3::from(position),
        UnitQuaternion::from_euler_angles(roll, pitch, yaw),
    );
    camera_to_world.inverse().to_homogeneous()
}

/// Move a camera by `translation` and `rotation` (roll/pitch/yaw, radians)
/// expressed in its own frame.
pub fn perturb_view(view: &Matrix4<f32>, translation: Vector3<f32>, rotation: [f32; 3]) -> Matrix4<f32> {
    let delta = Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_euler_angles(rotation[0], rotation[1], rotation[2]),
    )
    .to_homogeneous();
    let camera_to_world = pose::invert_rigid(view) * delta;
    pose::invert_rigid(&camera_to_world)
}

/// Infinite plane `normal · x = offset`.
#[derive(Debug, Clone, Copy)]
pub struct ScenePlane {
    pub normal: Vector3<f32>,
    pub offset: f32,
    pub color: [u8; 4],
}

/// Union of planes, seen from inside the region they enclose.
#[derive(Debug, Clone, Default)]
pub struct SyntheticScene {
    pub planes: Vec<ScenePlane>,
}

impl SyntheticScene {
    /// Three orthogonal planes forming a room corner in front of a camera at
    /// the origin looking down +z (y down): a left wall at `x = -0.25`, a
    /// floor at `y = 0.2` and a back wall at `z = 0.9`.
    ///
    /// The three normals span all of R³, so the corner constrains all six
    /// pose degrees of freedom.
    pub fn half_cubic_room() -> Self {
        Self {
            planes: vec![
                ScenePlane {
                    normal: Vector3::x(),
                    offset: -0.25,
                    color: [200, 60, 60, 255],
                },
                ScenePlane {
                    normal: Vector3::y(),
                    offset: 0.2,
                    color: [60, 200, 60, 255],
                },
                ScenePlane {
                    normal: Vector3::z(),
                    offset: 0.9,
                    color: [60, 60, 200, 255],
                },
            ],
        }
    }

    /// Volume geometry enclosing [`SyntheticScene::half_cubic_room`] as seen
    /// by [`test_intrinsics`] from near the origin.
    pub fn half_cubic_volume() -> VolumeConfig {
        VolumeConfig {
            resolution: [64, 64, 64],
            voxel_size: 0.02,
            corner: Some([-0.5, -0.6, 0.1]),
            truncation_distance: None,
        }
    }

    /// Render exact depth and color from `view`.
    pub fn render(&self, intrinsics: &CameraIntrinsics, view: &Matrix4<f32>, range: DepthRange) -> Frame {
        let camera_to_world = pose::invert_rigid(view);
        let rot = pose::rotation(&camera_to_world);
        let origin = pose::camera_position(view);

        let n = intrinsics.pixel_count();
        let mut depths = vec![range.invalid_depth; n];
        let mut colors = vec![[0u8; 4]; n];

        for v in 0..intrinsics.height {
            for u in 0..intrinsics.width {
                let dir = rot * intrinsics.ray_direction(u as f32, v as f32);
                let nearest = self
                    .planes
                    .iter()
                    .filter_map(|plane| {
                        let denom = plane.normal.dot(&dir);
                        if denom.abs() < 1e-9 {
                            return None;
                        }
                        let t = (plane.offset - plane.normal.dot(&origin)) / denom;
                        (t > 0.0).then_some((t, plane.color))
                    })
                    .min_by(|a, b| a.0.total_cmp(&b.0));

                if let Some((t, color)) = nearest {
                    if range.is_valid(t) {
                        let i = (v * intrinsics.width + u) as usize;
                        depths[i] = t;
                        colors[i] = color;
                    }
                }
            }
        }

        frame_from_maps(colors, depths, intrinsics, range)
    }
}
