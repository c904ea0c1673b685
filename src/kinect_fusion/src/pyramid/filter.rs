//! Depth map filters: bilateral smoothing and edge-aware half-sampling.

use rayon::prelude::*;

use crate::frame::DepthRange;
use crate::runtime::{ComputeRuntime, Stage};

/// Edge-preserving bilateral filter over a `width × height` depth map.
///
/// Invalid pixels stay invalid and never contribute to their neighbors.
#[allow(clippy::too_many_arguments)]
pub fn bilateral_filter(
    runtime: &ComputeRuntime,
    src: &[f32],
    dst: &mut [f32],
    width: usize,
    height: usize,
    range: &DepthRange,
    sigma_color: f32,
    sigma_space: f32,
    kernel_size: u32,
) {
    let radius = (kernel_size / 2) as isize;
    let color_factor = -0.5 / (sigma_color * sigma_color);
    let space_factor = -0.5 / (sigma_space * sigma_space);

    runtime.dispatch(
        Stage::BilateralFilter,
        [width as u32, height as u32, 1],
        || {
            dst.par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, out) in row.iter_mut().enumerate() {
                        let center = src[y * width + x];
                        if !range.is_valid(center) {
                            *out = range.invalid_depth;
                            continue;
                        }

                        let mut sum = 0.0f32;
                        let mut weight_sum = 0.0f32;
                        for dy in -radius..=radius {
                            let ny = y as isize + dy;
                            if ny < 0 || ny >= height as isize {
                                continue;
                            }
                            for dx in -radius..=radius {
                                let nx = x as isize + dx;
                                if nx < 0 || nx >= width as isize {
                                    continue;
                                }
                                let d = src[ny as usize * width + nx as usize];
                                if !range.is_valid(d) {
                                    continue;
                                }
                                let spatial = (dx * dx + dy * dy) as f32 * space_factor;
                                let diff = d - center;
                                let w = (spatial + diff * diff * color_factor).exp();
                                sum += w * d;
                                weight_sum += w;
                            }
                        }
                        // The center always contributes with weight 1.
                        *out = sum / weight_sum;
                    }
                });
        },
    );
}

/// Halve a depth map, averaging each 2×2 block over the samples within
/// `threshold` of the block's top-left sample.
///
/// A block whose top-left sample is invalid produces an invalid pixel.
pub fn half_sample(
    runtime: &ComputeRuntime,
    src: &[f32],
    src_width: usize,
    dst: &mut [f32],
    range: &DepthRange,
    threshold: f32,
) {
    let dst_width = src_width / 2;
    let dst_height = dst.len() / dst_width.max(1);

    runtime.dispatch(
        Stage::HalfSample,
        [dst_width as u32, dst_height as u32, 1],
        || {
            dst.par_chunks_mut(dst_width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, out) in row.iter_mut().enumerate() {
                        let (sx, sy) = (2 * x, 2 * y);
                        let reference = src[sy * src_width + sx];
                        if !range.is_valid(reference) {
                            *out = range.invalid_depth;
                            continue;
                        }

                        let mut sum = 0.0f32;
                        let mut count = 0u32;
                        for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                            let d = src[(sy + oy) * src_width + sx + ox];
                            if range.is_valid(d) && (d - reference).abs() <= threshold {
                                sum += d;
                                count += 1;
                            }
                        }
                        *out = sum / count as f32;
                    }
                });
        },
    );
}
