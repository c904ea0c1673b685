//! Vertex and normal maps.
//!
//! Maps store `xyz` in camera space and a validity flag in `w`
//! (1 = valid, 0 = invalid).

use nalgebra::{Matrix4, Vector3, Vector4};
use rayon::prelude::*;

use crate::camera::CameraIntrinsics;
use crate::frame::DepthRange;
use crate::pose;
use crate::raycast::Surface;
use crate::runtime::{ComputeRuntime, Stage};

pub const INVALID: Vector4<f32> = Vector4::new(0.0, 0.0, 0.0, 0.0);

#[inline]
pub fn is_valid(v: &Vector4<f32>) -> bool {
    v.w > 0.5
}

#[inline]
fn valid(p: Vector3<f32>) -> Vector4<f32> {
    p.push(1.0)
}

/// Back-project every valid depth pixel into camera space.
pub fn compute_vertex_map(
    runtime: &ComputeRuntime,
    depth: &[f32],
    intrinsics: &CameraIntrinsics,
    range: &DepthRange,
    vertex: &mut [Vector4<f32>],
) {
    let width = intrinsics.width as usize;
    runtime.dispatch(
        Stage::VertexMap,
        [intrinsics.width, intrinsics.height, 1],
        || {
            vertex
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, out) in row.iter_mut().enumerate() {
                        let d = depth[y * width + x];
                        *out = if range.is_valid(d) {
                            valid(intrinsics.back_project(x as f32, y as f32, d))
                        } else {
                            INVALID
                        };
                    }
                });
        },
    );
}

/// Normals from forward differences:
/// `normalize((V(x+1, y) − V(x, y)) × (V(x, y+1) − V(x, y)))`.
///
/// The last row and column, and pixels next to an invalid vertex, are
/// invalid.
pub fn compute_normal_map(
    runtime: &ComputeRuntime,
    vertex: &[Vector4<f32>],
    width: usize,
    normal: &mut [Vector4<f32>],
) {
    let height = vertex.len() / width.max(1);
    runtime.dispatch(Stage::NormalMap, [width as u32, height as u32, 1], || {
        normal
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    *out = INVALID;
                    if x + 1 >= width || y + 1 >= height {
                        continue;
                    }
                    let center = &vertex[y * width + x];
                    let right = &vertex[y * width + x + 1];
                    let down = &vertex[(y + 1) * width + x];
                    if !(is_valid(center) && is_valid(right) && is_valid(down)) {
                        continue;
                    }
                    let n = (right.xyz() - center.xyz()).cross(&(down.xyz() - center.xyz()));
                    if let Some(n) = n.try_normalize(f32::EPSILON) {
                        *out = valid(n);
                    }
                }
            });
    });
}

/// Convert a ray-cast surface into camera-space vertex and normal maps.
///
/// Surface normals are world-space; they are rotated into the camera of
/// `view`. Pixels with invalid depth or a zero normal are invalid.
pub fn load_surface(
    runtime: &ComputeRuntime,
    surface: &Surface,
    intrinsics: &CameraIntrinsics,
    view: &Matrix4<f32>,
    range: &DepthRange,
    vertex: &mut [Vector4<f32>],
    normal: &mut [Vector4<f32>],
) {
    let width = intrinsics.width as usize;
    let rot = pose::rotation(view);
    runtime.dispatch(
        Stage::LoadModel,
        [intrinsics.width, intrinsics.height, 1],
        || {
            vertex
                .par_chunks_mut(width)
                .zip(normal.par_chunks_mut(width))
                .enumerate()
                .for_each(|(y, (vertex_row, normal_row))| {
                    for x in 0..width {
                        let i = y * width + x;
                        let d = surface.depth[i];
                        let n = surface.normal[i];
                        if !range.is_valid(d) || n == Vector3::zeros() {
                            vertex_row[x] = INVALID;
                            normal_row[x] = INVALID;
                            continue;
                        }
                        vertex_row[x] = valid(intrinsics.back_project(x as f32, y as f32, d));
                        normal_row[x] = valid(rot * n);
                    }
                });
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use approx::assert_relative_eq;

    fn runtime() -> ComputeRuntime {
        ComputeRuntime::new(&RuntimeConfig::default()).unwrap()
    }

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(20.0, 20.0, 7.5, 5.5, 16, 12)
    }

    #[test]
    fn test_vertex_map_back_projection() {
        let rt = runtime();
        let cam = intrinsics();
        let mut depth = vec![2.0f32; 16 * 12];
        depth[5] = 0.0;
        let mut vertex = vec![INVALID; 16 * 12];
        compute_vertex_map(&rt, &depth, &cam, &DepthRange::default(), &mut vertex);

        assert!(!is_valid(&vertex[5]));
        let v = vertex[3 * 16 + 10];
        assert!(is_valid(&v));
        assert_relative_eq!(v.x, (10.0 - 7.5) * 2.0 / 20.0);
        assert_relative_eq!(v.y, (3.0 - 5.5) * 2.0 / 20.0);
        assert_eq!(v.z, 2.0);
    }

    #[test]
    fn test_normal_map_fronto_parallel_plane() {
        let rt = runtime();
        let cam = intrinsics();
        let depth = vec![1.0f32; 16 * 12];
        let mut vertex = vec![INVALID; 16 * 12];
        let mut normal = vec![INVALID; 16 * 12];
        compute_vertex_map(&rt, &depth, &cam, &DepthRange::default(), &mut vertex);
        compute_normal_map(&rt, &vertex, 16, &mut normal);

        for y in 0..11 {
            for x in 0..15 {
                let n = normal[y * 16 + x];
                assert!(is_valid(&n));
                assert_relative_eq!(n.xyz(), Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-5);
            }
        }
        // Last column and row
        assert!(!is_valid(&normal[15]));
        assert!(!is_valid(&normal[11 * 16 + 3]));
    }

    #[test]
    fn test_normal_map_tilted_plane() {
        let rt = runtime();
        let cam = intrinsics();
        // Plane z = 1 + 0.5·x, i.e. normal ∝ (-0.5, 0, 1) up to sign
        let mut depth = vec![0.0f32; 16 * 12];
        for y in 0..12 {
            for x in 0..16 {
                let ray = cam.ray_direction(x as f32, y as f32);
                depth[y * 16 + x] = 1.0 / (1.0 - 0.5 * ray.x);
            }
        }
        let mut vertex = vec![INVALID; 16 * 12];
        let mut normal = vec![INVALID; 16 * 12];
        compute_vertex_map(&rt, &depth, &cam, &DepthRange::default(), &mut vertex);
        compute_normal_map(&rt, &vertex, 16, &mut normal);

        let expected = Vector3::new(-0.5, 0.0, 1.0).normalize();
        let n = normal[5 * 16 + 7].xyz();
        assert_relative_eq!(n, expected, epsilon = 1e-3);
    }

    #[test]
    fn test_normal_map_invalid_neighbor() {
        let rt = runtime();
        let cam = intrinsics();
        let mut depth = vec![1.0f32; 16 * 12];
        depth[4 * 16 + 6] = 0.0;
        let mut vertex = vec![INVALID; 16 * 12];
        let mut normal = vec![INVALID; 16 * 12];
        compute_vertex_map(&rt, &depth, &cam, &DepthRange::default(), &mut vertex);
        compute_normal_map(&rt, &vertex, 16, &mut normal);

        assert!(!is_valid(&normal[4 * 16 + 6]));
        assert!(!is_valid(&normal[4 * 16 + 5]));
        assert!(!is_valid(&normal[3 * 16 + 6]));
        assert!(is_valid(&normal[2 * 16 + 2]));
    }

    #[test]
    fn test_load_surface_rotates_normals() {
        let rt = runtime();
        let cam = intrinsics();
        let mut surface = Surface::new(16, 12);
        surface.depth.fill(1.0);
        surface.normal.fill(Vector3::new(0.0, 0.0, 1.0));
        surface.depth[0] = 0.0;

        // Camera rotated 90° about y
        let mut view = Matrix4::zeros();
        view[(0, 2)] = 1.0;
        view[(1, 1)] = 1.0;
        view[(2, 0)] = -1.0;
        view[(3, 3)] = 1.0;

        let mut vertex = vec![INVALID; 16 * 12];
        let mut normal = vec![INVALID; 16 * 12];
        load_surface(&rt, &surface, &cam, &view, &DepthRange::default(), &mut vertex, &mut normal);

        assert!(!is_valid(&vertex[0]));
        assert!(!is_valid(&normal[0]));
        assert_eq!(vertex[20].z, 1.0);
        assert_relative_eq!(normal[20].xyz(), Vector3::new(1.0, 0.0, 0.0));

        let timing = rt.take_timing();
        assert_eq!(timing.stage(Stage::LoadModel).map(|s| s.dispatches), Some(1));
        assert!(timing.stage(Stage::VertexMap).is_none());
    }
}
