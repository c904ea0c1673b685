//! Trilinear sampling of the TSDF field.
//!
//! A sample is only defined when all eight surrounding voxels have been
//! observed (nonzero weight); otherwise the lookup returns `None`.

use nalgebra::Vector3;

use super::{TsdfVolume, Voxel};

/// Corner order: index `dx·4 + dy·2 + dz`.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [0, 0, 1],
    [0, 1, 0],
    [0, 1, 1],
    [1, 0, 0],
    [1, 0, 1],
    [1, 1, 0],
    [1, 1, 1],
];

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
fn trilinear(v: &[f32; 8], f: &Vector3<f32>) -> f32 {
    let c00 = lerp(v[0], v[4], f.x);
    let c01 = lerp(v[1], v[5], f.x);
    let c10 = lerp(v[2], v[6], f.x);
    let c11 = lerp(v[3], v[7], f.x);
    let c0 = lerp(c00, c10, f.y);
    let c1 = lerp(c01, c11, f.y);
    lerp(c0, c1, f.z)
}

impl TsdfVolume {
    /// Base voxel and fractional offset of the cell containing `p`.
    fn cell(&self, p: &Vector3<f32>) -> Option<([usize; 3], Vector3<f32>)> {
        let g = (p - self.corner) / self.voxel_size;
        let mut base = [0usize; 3];
        let mut frac = Vector3::zeros();
        for axis in 0..3 {
            let b = g[axis].floor();
            if !(b >= 0.0 && b <= (self.resolution[axis] - 2) as f32) {
                return None;
            }
            base[axis] = b as usize;
            frac[axis] = g[axis] - b;
        }
        Some((base, frac))
    }

    fn cell_voxels(&self, base: &[usize; 3]) -> [Voxel; 8] {
        CORNERS.map(|[dx, dy, dz]| {
            self.voxels[self.index(base[0] + dx, base[1] + dy, base[2] + dz)].unpack()
        })
    }

    /// Interpolated TSDF at world point `p`.
    pub fn interpolate_tsdf(&self, p: &Vector3<f32>) -> Option<f32> {
        let (base, frac) = self.cell(p)?;
        let voxels = self.cell_voxels(&base);
        if voxels.iter().any(|v| v.weight == 0) {
            return None;
        }
        Some(trilinear(&voxels.map(|v| v.tsdf), &frac))
    }

    /// Interpolated RGBA color (0–255 per channel) at world point `p`.
    pub fn interpolate_color(&self, p: &Vector3<f32>) -> Option<[f32; 4]> {
        let (base, frac) = self.cell(p)?;
        let voxels = self.cell_voxels(&base);
        let mut out = [0.0f32; 4];
        for (channel, value) in out.iter_mut().enumerate() {
            *value = trilinear(&voxels.map(|v| v.color[channel] as f32), &frac);
        }
        Some(out)
    }

    /// Central-difference gradient of the interpolated TSDF, one voxel step
    /// per axis.
    pub fn tsdf_gradient(&self, p: &Vector3<f32>) -> Option<Vector3<f32>> {
        let h = self.voxel_size;
        let mut grad = Vector3::zeros();
        for axis in 0..3 {
            let mut offset = Vector3::zeros();
            offset[axis] = h;
            let fwd = self.interpolate_tsdf(&(p + offset))?;
            let back = self.interpolate_tsdf(&(p - offset))?;
            grad[axis] = (fwd - back) / (2.0 * h);
        }
        Some(grad)
    }
}
