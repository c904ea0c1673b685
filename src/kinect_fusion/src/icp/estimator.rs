//! Frame-to-model pose estimation.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4, Vector6};
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use super::accumulator::IcpAccumulator;
use super::debug::{IcpDebug, IcpIterationDebug};
use super::solver::{condition_number, solve_increment};
use super::types::IcpConfig;
use crate::error::KinfuError;
use crate::frame::Frame;
use crate::pose;
use crate::pyramid::{is_valid, Pyramid, PyramidConfig, PyramidLevel, NUM_PYRAMID_LEVELS};
use crate::raycast::{ray_cast_into, Surface};
use crate::runtime::{ComputeRuntime, Stage};
use crate::volume::TsdfVolume;

/// Coarse-to-fine point-to-plane ICP against ray-cast model views.
///
/// Owns the live and model pyramids and the per-level ray-cast surfaces, all
/// allocated once for a fixed frame extent and reused for every estimate.
pub struct PoseEstimator {
    config: IcpConfig,
    pyramid_config: PyramidConfig,
    live: Pyramid,
    model: Pyramid,
    surfaces: Vec<Surface>,
}

impl PoseEstimator {
    /// Allocate for `width × height` frames.
    pub fn new(
        width: u32,
        height: u32,
        config: IcpConfig,
        pyramid_config: PyramidConfig,
    ) -> Result<Self, KinfuError> {
        config.validate()?;
        pyramid_config.validate()?;

        let live = Pyramid::with_extent(width, height)?;
        let model = Pyramid::with_extent(width, height)?;
        let surfaces = (0..NUM_PYRAMID_LEVELS)
            .map(|l| Surface::new(width >> l, height >> l))
            .collect();

        Ok(Self {
            config,
            pyramid_config,
            live,
            model,
            surfaces,
        })
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    /// Live pyramid of the most recent estimate.
    pub fn live_pyramid(&self) -> &Pyramid {
        &self.live
    }

    /// Model pyramid of the most recent estimate.
    pub fn model_pyramid(&self) -> &Pyramid {
        &self.model
    }

    /// Estimate the view of `frame` given the view `prior` the model is
    /// rendered from.
    ///
    /// Returns `Ok(None)` when the normal equations degenerate at any
    /// iteration. Errors only if `frame` does not match the allocated
    /// extent.
    pub fn estimate(
        &mut self,
        runtime: &ComputeRuntime,
        volume: &TsdfVolume,
        frame: &Frame,
        prior: &Matrix4<f32>,
    ) -> Result<Option<Matrix4<f32>>, KinfuError> {
        self.run(runtime, volume, frame, prior, None)
    }

    /// Like [`PoseEstimator::estimate`], also recording every iteration.
    pub fn estimate_with_debug(
        &mut self,
        runtime: &ComputeRuntime,
        volume: &TsdfVolume,
        frame: &Frame,
        prior: &Matrix4<f32>,
    ) -> Result<(Option<Matrix4<f32>>, IcpDebug), KinfuError> {
        let mut debug = IcpDebug::new(prior);
        let result = self.run(runtime, volume, frame, prior, Some(&mut debug))?;
        match &result {
            Some(view) => {
                debug.set_final_pose(view);
                debug.status = "converged".to_string();
            }
            None if debug.status.is_empty() => debug.status = "failed".to_string(),
            None => {}
        }
        Ok((result, debug))
    }

    fn run(
        &mut self,
        runtime: &ComputeRuntime,
        volume: &TsdfVolume,
        frame: &Frame,
        prior: &Matrix4<f32>,
        mut debug: Option<&mut IcpDebug>,
    ) -> Result<Option<Matrix4<f32>>, KinfuError> {
        self.live.build_into(runtime, frame, &self.pyramid_config)?;
        self.build_model(runtime, volume, frame, prior)?;

        let prior: Matrix4<f64> = prior.cast();
        // Camera → world estimate for the live frame.
        let mut estimate = pose::invert_rigid(&prior);

        for level in (0..NUM_PYRAMID_LEVELS).rev() {
            for iteration in 0..self.config.iterations[level] {
                let acc = self.accumulate(runtime, level, &estimate, &prior);
                let (a, _) = acc.normal_equations();
                let cond = condition_number(&a);
                if cond > self.config.condition_warning_threshold {
                    warn!(
                        level,
                        iteration,
                        condition_number = cond,
                        "ICP normal matrix is ill-conditioned"
                    );
                }

                let mut record = IcpIterationDebug::new(level, iteration);
                record.correspondences = acc.correspondences;
                record.rms_error = acc.rms_error();
                record.condition_number = cond;

                let step = match solve_increment(&acc, self.config.det_threshold) {
                    Ok(step) => step,
                    Err(failure) => {
                        debug!(
                            level,
                            iteration,
                            correspondences = acc.correspondences,
                            reason = %failure,
                            "ICP aborted"
                        );
                        if let Some(d) = debug.as_deref_mut() {
                            record.determinant = a.determinant();
                            d.iterations.push(record);
                            d.status = failure.to_string();
                        }
                        return Ok(None);
                    }
                };

                estimate = pose::incremental_transform(&step.increment) * estimate;

                trace!(
                    level,
                    iteration,
                    correspondences = acc.correspondences,
                    rms = acc.rms_error(),
                    step = step.increment.norm(),
                    "ICP iteration"
                );
                if let Some(d) = debug.as_deref_mut() {
                    record.determinant = step.determinant;
                    record.set_increment(&step.increment);
                    d.iterations.push(record);
                }
            }
            debug!(level, "ICP level done");
        }

        Ok(Some(pose::invert_rigid(&estimate).cast()))
    }

    /// Ray cast the model at every level from `prior`.
    fn build_model(
        &mut self,
        runtime: &ComputeRuntime,
        volume: &TsdfVolume,
        frame: &Frame,
        prior: &Matrix4<f32>,
    ) -> Result<(), KinfuError> {
        let range = *frame.range();
        for (level, surface) in self.surfaces.iter_mut().enumerate() {
            let intrinsics = frame.intrinsics().scaled(level);
            ray_cast_into(runtime, volume, &intrinsics, prior, &range, None, surface);
            self.model
                .load_surface(runtime, level, surface, &intrinsics, prior, &range)?;
        }
        Ok(())
    }

    /// Build and reduce the normal equations of one level at `estimate`.
    fn accumulate(
        &self,
        runtime: &ComputeRuntime,
        level: usize,
        estimate: &Matrix4<f64>,
        prior: &Matrix4<f64>,
    ) -> IcpAccumulator {
        let live = self.live.level(level);
        let association = Association::new(
            self.model.level(level),
            estimate,
            prior,
            &self.config,
        );

        let width = live.width() as usize;
        let group = width * runtime.rows_per_group();
        let extent = [live.width(), live.height(), 1];

        let partials: Vec<IcpAccumulator> = runtime.dispatch(Stage::IcpBuild, extent, || {
            live.vertex
                .par_chunks(group)
                .zip(live.normal.par_chunks(group))
                .map(|(vertices, normals)| {
                    IcpAccumulator::partial_reduce(
                        vertices
                            .iter()
                            .zip(normals)
                            .filter_map(|(v, n)| association.linearize(v, n)),
                    )
                })
                .collect()
        });

        runtime.dispatch(Stage::IcpReduce, [partials.len() as u32, 1, 1], || {
            partials
                .into_par_iter()
                .reduce(IcpAccumulator::default, IcpAccumulator::combine)
        })
    }
}

/// Projective data association against one model level.
struct Association<'a> {
    model: &'a PyramidLevel,
    /// Live camera → world.
    estimate: Matrix4<f64>,
    /// World → model camera.
    prior: Matrix4<f64>,
    /// Model camera → world.
    prior_inv: Matrix4<f64>,
    prior_inv_rot: Matrix3<f64>,
    distance_threshold: f64,
    cos_angle_threshold: f64,
}

impl<'a> Association<'a> {
    fn new(
        model: &'a PyramidLevel,
        estimate: &Matrix4<f64>,
        prior: &Matrix4<f64>,
        config: &IcpConfig,
    ) -> Self {
        let prior_inv = pose::invert_rigid(prior);
        Self {
            model,
            estimate: *estimate,
            prior: *prior,
            prior_inv,
            prior_inv_rot: pose::rotation(&prior_inv),
            distance_threshold: config.distance_threshold as f64,
            cos_angle_threshold: (config.angle_threshold as f64).cos(),
        }
    }

    /// Jacobian and residual of one live pixel, if it has a model match.
    fn linearize(&self, v: &Vector4<f32>, n: &Vector4<f32>) -> Option<(Vector6<f64>, f64)> {
        if !(is_valid(v) && is_valid(n)) {
            return None;
        }
        let p = pose::transform_point(&self.estimate, &v.xyz().cast::<f64>());
        let live_normal = pose::transform_vector(&self.estimate, &n.xyz().cast::<f64>());

        let in_model: Vector3<f32> = pose::transform_point(&self.prior, &p).cast();
        let (u, row) = self.model.intrinsics().project_to_pixel(&in_model)?;
        let i = row * self.model.width() as usize + u;
        let (mv, mn) = (&self.model.vertex[i], &self.model.normal[i]);
        if !(is_valid(mv) && is_valid(mn)) {
            return None;
        }

        let m = pose::transform_point(&self.prior_inv, &mv.xyz().cast::<f64>());
        let normal = self.prior_inv_rot * mn.xyz().cast::<f64>();

        let diff = p - m;
        if diff.norm() > self.distance_threshold
            || live_normal.dot(&normal) < self.cos_angle_threshold
        {
            return None;
        }

        let r = normal.dot(&diff);
        let rot = p.cross(&normal);
        Some((
            Vector6::new(rot.x, rot.y, rot.z, normal.x, normal.y, normal.z),
            r,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use crate::frame::DepthRange;
    use crate::fusion::{fuse, FusionConfig};
    use crate::runtime::RuntimeConfig;
    use crate::test_utils::{perturb_view, plane_frame, test_intrinsics, SyntheticScene};
    use crate::volume::VolumeConfig;

    fn runtime() -> ComputeRuntime {
        ComputeRuntime::new(&RuntimeConfig::default()).unwrap()
    }

    fn estimator() -> PoseEstimator {
        let intrinsics = test_intrinsics();
        PoseEstimator::new(
            intrinsics.width,
            intrinsics.height,
            IcpConfig::default(),
            PyramidConfig::default(),
        )
        .unwrap()
    }

    /// Room corner fused once from the identity view.
    fn room_volume(rt: &ComputeRuntime, scene: &SyntheticScene) -> TsdfVolume {
        let mut volume = TsdfVolume::new(&SyntheticScene::half_cubic_volume()).unwrap();
        let frame = scene.render(&test_intrinsics(), &Matrix4::identity(), DepthRange::default());
        fuse(rt, &mut volume, &frame, &Matrix4::identity(), &FusionConfig::default());
        volume
    }

    #[test]
    fn test_recovers_small_motion() {
        let rt = runtime();
        let scene = SyntheticScene::half_cubic_room();
        let volume = room_volume(&rt, &scene);

        let degree = 1f32.to_radians();
        let truth = perturb_view(
            &Matrix4::identity(),
            Vector3::new(0.005, -0.005, 0.007),
            [0.0, degree, 0.0],
        );
        let frame = scene.render(&test_intrinsics(), &truth, DepthRange::default());

        let mut icp = estimator();
        let view = icp
            .estimate(&rt, &volume, &frame, &Matrix4::identity())
            .unwrap()
            .expect("room corner constrains every degree of freedom");

        let (dt, da) = pose::pose_difference(&view, &truth);
        assert!(dt < 0.005, "translation error {dt}");
        assert!(da < 0.5f32.to_radians(), "rotation error {da}");
    }

    #[test]
    fn test_same_frame_stays_put() {
        let rt = runtime();
        let scene = SyntheticScene::half_cubic_room();
        let volume = room_volume(&rt, &scene);
        let frame = scene.render(&test_intrinsics(), &Matrix4::identity(), DepthRange::default());

        let mut icp = estimator();
        let view = icp
            .estimate(&rt, &volume, &frame, &Matrix4::identity())
            .unwrap()
            .unwrap();

        let (dt, da) = pose::pose_difference(&view, &Matrix4::identity());
        assert!(dt < 0.002, "translation drift {dt}");
        assert!(da < 0.25f32.to_radians(), "rotation drift {da}");
    }

    #[test]
    fn test_plane_is_degenerate() {
        let rt = runtime();
        let mut volume = TsdfVolume::new(&VolumeConfig {
            resolution: [64, 64, 64],
            voxel_size: 0.02,
            corner: Some([-0.64, -0.64, 0.4]),
            truncation_distance: None,
        })
        .unwrap();
        let frame = plane_frame(&test_intrinsics(), 1.0, [255; 4]);
        fuse(&rt, &mut volume, &frame, &Matrix4::identity(), &FusionConfig::default());

        let mut icp = estimator();
        let (view, debug) = icp
            .estimate_with_debug(&rt, &volume, &frame, &Matrix4::identity())
            .unwrap();

        assert!(view.is_none());
        assert_eq!(debug.status, "singular");
        assert!(debug.final_pose.is_empty());
        // Fails on the first iteration of the coarsest level
        assert_eq!(debug.iterations.len(), 1);
        assert_eq!(debug.iterations[0].level, NUM_PYRAMID_LEVELS - 1);
        assert!(debug.iterations[0].correspondences > 0);
    }

    #[test]
    fn test_empty_volume_fails() {
        let rt = runtime();
        let volume = TsdfVolume::new(&SyntheticScene::half_cubic_volume()).unwrap();
        let frame = SyntheticScene::half_cubic_room().render(
            &test_intrinsics(),
            &Matrix4::identity(),
            DepthRange::default(),
        );

        let mut icp = estimator();
        let (view, debug) = icp
            .estimate_with_debug(&rt, &volume, &frame, &Matrix4::identity())
            .unwrap();
        assert!(view.is_none());
        assert_eq!(debug.status, "no_correspondences");
        assert_eq!(icp.model_pyramid().level(0).valid_count(), 0);
    }

    #[test]
    fn test_debug_records_every_iteration() {
        let rt = runtime();
        let scene = SyntheticScene::half_cubic_room();
        let volume = room_volume(&rt, &scene);
        let frame = scene.render(&test_intrinsics(), &Matrix4::identity(), DepthRange::default());

        let mut icp = estimator();
        let (view, debug) = icp
            .estimate_with_debug(&rt, &volume, &frame, &Matrix4::identity())
            .unwrap();

        assert!(view.is_some());
        assert_eq!(debug.status, "converged");
        assert_eq!(debug.iterations.len(), IcpConfig::default().total_iterations());
        let levels: Vec<_> = debug.iterations.iter().map(|i| i.level).collect();
        assert_eq!(levels[0], 2);
        assert_eq!(levels[4], 1);
        assert_eq!(levels[9], 0);
        assert_eq!(debug.final_pose.len(), 16);
        assert!(debug.to_json().is_ok());
    }

    #[test]
    fn test_rejects_other_extent() {
        let rt = runtime();
        let volume = TsdfVolume::new(&SyntheticScene::half_cubic_volume()).unwrap();
        let other = CameraIntrinsics::new(70.0, 70.0, 19.5, 19.5, 40, 40);
        let frame = plane_frame(&other, 1.0, [255; 4]);

        let mut icp = estimator();
        assert!(icp
            .estimate(&rt, &volume, &frame, &Matrix4::identity())
            .is_err());
    }
}
