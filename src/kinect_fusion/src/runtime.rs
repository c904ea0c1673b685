//! Compute runtime for kernel dispatch.
//!
//! Every pipeline stage runs as one data-parallel dispatch over a declared
//! index range. The runtime owns a dedicated rayon thread pool; a dispatch
//! runs its kernel inside that pool and returns only after every work item
//! has retired, so consecutive dispatches never overlap.
//!
//! # Example
//!
//! ```ignore
//! use kinect_fusion::runtime::{ComputeRuntime, RuntimeConfig, Stage};
//!
//! let runtime = ComputeRuntime::new(&RuntimeConfig::default())?;
//! let sum: u64 = runtime.dispatch(Stage::Fuse, [64, 64, 64], || {
//!     (0..64u64).into_par_iter().sum()
//! });
//! ```

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::KinfuError;
use crate::timing::{FrameTiming, Timer};

/// Work-group size used by every stage unless configured otherwise.
pub const DEFAULT_LOCAL_SIZE: [u32; 3] = [32, 32, 1];

/// Pipeline stage a dispatch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    InitVolume,
    Fuse,
    RayCast,
    BilateralFilter,
    HalfSample,
    VertexMap,
    NormalMap,
    LoadModel,
    IcpBuild,
    IcpReduce,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::InitVolume => "init_volume",
            Stage::Fuse => "fuse",
            Stage::RayCast => "ray_cast",
            Stage::BilateralFilter => "bilateral_filter",
            Stage::HalfSample => "half_sample",
            Stage::VertexMap => "vertex_map",
            Stage::NormalMap => "normal_map",
            Stage::LoadModel => "load_model",
            Stage::IcpBuild => "icp_build",
            Stage::IcpReduce => "icp_reduce",
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; `None` uses one per logical core.
    pub num_threads: Option<usize>,
    /// Work-group size per dispatch axis.
    pub local_size: [u32; 3],
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            local_size: DEFAULT_LOCAL_SIZE,
        }
    }
}

/// Blocking data-parallel executor shared by all pipeline stages.
pub struct ComputeRuntime {
    pool: ThreadPool,
    local_size: [u32; 3],
    /// Stage log for the frame currently being processed
    timing: Mutex<FrameTiming>,
}

impl ComputeRuntime {
    /// Create a runtime with its own worker pool.
    pub fn new(config: &RuntimeConfig) -> Result<Self, KinfuError> {
        if config.local_size.contains(&0) {
            return Err(KinfuError::config(format!(
                "work-group size must be nonzero on every axis, got {:?}",
                config.local_size
            )));
        }

        let mut builder =
            ThreadPoolBuilder::new().thread_name(|i| format!("kinfu-worker-{i}"));
        if let Some(n) = config.num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| KinfuError::Resource(format!("failed to create worker pool: {e}")))?;

        debug!(
            threads = pool.current_num_threads(),
            local_size = ?config.local_size,
            "compute runtime initialized"
        );

        Ok(Self {
            pool,
            local_size: config.local_size,
            timing: Mutex::new(FrameTiming::default()),
        })
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }

    /// Number of work groups needed to cover `extent`.
    pub fn group_count(&self, extent: [u32; 3]) -> [u32; 3] {
        [
            extent[0].div_ceil(self.local_size[0]),
            extent[1].div_ceil(self.local_size[1]),
            extent[2].div_ceil(self.local_size[2]),
        ]
    }

    /// Rows of a 2D map processed by one work group.
    pub fn rows_per_group(&self) -> usize {
        self.local_size[1] as usize
    }

    /// Run `kernel` over `extent` and block until it has completed.
    pub fn dispatch<F, R>(&self, stage: Stage, extent: [u32; 3], kernel: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let groups = self.group_count(extent);
        trace!(stage = stage.name(), ?extent, ?groups, "dispatch");

        let timer = Timer::new();
        let result = self.pool.install(kernel);
        self.timing.lock().record(stage, timer.elapsed_ms());
        result
    }

    /// Take the stage log accumulated since the previous call.
    pub fn take_timing(&self) -> FrameTiming {
        std::mem::take(&mut *self.timing.lock())
    }
}
