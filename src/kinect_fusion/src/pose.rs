//! Pose helpers.
//!
//! Poses are 4×4 homogeneous matrices in nalgebra's column-major storage.
//! A *view* maps world coordinates into camera coordinates; its rigid
//! inverse maps camera into world, and the inverse's translation is the
//! camera position.

use nalgebra::{Matrix3, Matrix4, RealField, Rotation3, Vector3, Vector6};

/// Invert a rigid transform without a general matrix inverse.
pub fn invert_rigid<T: RealField + Copy>(m: &Matrix4<T>) -> Matrix4<T> {
    let r_t = m.fixed_view::<3, 3>(0, 0).transpose();
    let t = -(r_t * m.fixed_view::<3, 1>(0, 3));

    let mut out = Matrix4::identity();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_t);
    out.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    out
}

/// World-space camera position of a view matrix.
pub fn camera_position(view: &Matrix4<f32>) -> Vector3<f32> {
    invert_rigid(view).fixed_view::<3, 1>(0, 3).into_owned()
}

/// Rotation block of a homogeneous transform.
#[inline]
pub fn rotation<T: RealField + Copy>(m: &Matrix4<T>) -> Matrix3<T> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Apply a homogeneous transform to a point.
#[inline]
pub fn transform_point<T: RealField + Copy>(m: &Matrix4<T>, p: &Vector3<T>) -> Vector3<T> {
    m.fixed_view::<3, 3>(0, 0) * p + m.fixed_view::<3, 1>(0, 3)
}

/// Apply the rotation of a homogeneous transform to a direction.
#[inline]
pub fn transform_vector<T: RealField + Copy>(m: &Matrix4<T>, v: &Vector3<T>) -> Vector3<T> {
    m.fixed_view::<3, 3>(0, 0) * v
}

/// Build a transform from a solved ICP increment `[rx, ry, rz, tx, ty, tz]`.
///
/// The rotation is composed from successive axis rotations, `Rz·Ry·Rx`.
pub fn incremental_transform(x: &Vector6<f64>) -> Matrix4<f64> {
    let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), x[2])
        * Rotation3::from_axis_angle(&Vector3::y_axis(), x[1])
        * Rotation3::from_axis_angle(&Vector3::x_axis(), x[0]);

    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rot.matrix());
    m[(0, 3)] = x[3];
    m[(1, 3)] = x[4];
    m[(2, 3)] = x[5];
    m
}

/// Translation distance (meters) and rotation angle (radians) between two
/// poses.
pub fn pose_difference(a: &Matrix4<f32>, b: &Matrix4<f32>) -> (f32, f32) {
    let delta = invert_rigid(a) * b;
    let translation = delta.fixed_view::<3, 1>(0, 3).norm();
    let trace = delta[(0, 0)] + delta[(1, 1)] + delta[(2, 2)];
    let angle = ((trace - 1.0) * 0.5).clamp(-1.0, 1.0).acos();
    (translation, angle)
}
