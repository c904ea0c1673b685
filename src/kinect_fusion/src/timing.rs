//! Per-stage timing instrumentation.
//!
//! Wall-clock timing is only collected when the `profiling` feature is
//! enabled. Without the feature, [`Timer`] reports zero and the recorded
//! [`FrameTiming`] stays empty apart from stage names and dispatch counts.

use serde::{Deserialize, Serialize};
use std::time::Duration;
#[cfg(feature = "profiling")]
use std::time::Instant;

use crate::runtime::Stage;

/// Accumulated time spent in one pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    /// Number of dispatches issued for this stage.
    pub dispatches: usize,
    pub total_ms: f64,
}

/// Timing breakdown for one processed frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameTiming {
    /// Total time for the tracked frame
    pub total_ms: f64,
    /// Per-stage breakdown in first-dispatch order
    pub stages: Vec<StageTiming>,
}

impl FrameTiming {
    /// Add one dispatch of `stage` to the breakdown.
    pub fn record(&mut self, stage: Stage, elapsed_ms: f64) {
        let name = stage.name();
        match self.stages.iter_mut().find(|s| s.stage == name) {
            Some(entry) => {
                entry.dispatches += 1;
                entry.total_ms += elapsed_ms;
            }
            None => self.stages.push(StageTiming {
                stage: name.to_string(),
                dispatches: 1,
                total_ms: elapsed_ms,
            }),
        }
    }

    /// Look up the accumulated timing for a stage.
    pub fn stage(&self, stage: Stage) -> Option<&StageTiming> {
        self.stages.iter().find(|s| s.stage == stage.name())
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Timer that can be enabled/disabled at compile time.
#[cfg(feature = "profiling")]
pub struct Timer {
    start: Instant,
}

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// No-op timer when profiling is disabled.
#[cfg(not(feature = "profiling"))]
pub struct Timer;

#[cfg(not(feature = "profiling"))]
impl Timer {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn elapsed_ms(&self) -> f64 {
        0.0
    }

    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Duration::ZERO
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_timing_groups_by_stage() {
        let mut timing = FrameTiming::default();
        timing.record(Stage::Fuse, 2.0);
        timing.record(Stage::RayCast, 1.0);
        timing.record(Stage::RayCast, 0.5);

        assert_eq!(timing.stages.len(), 2);
        let raycast = timing.stage(Stage::RayCast).unwrap();
        assert_eq!(raycast.dispatches, 2);
        assert_eq!(raycast.total_ms, 1.5);
        assert!(timing.stage(Stage::IcpReduce).is_none());
    }

    #[test]
    fn test_frame_timing_to_json() {
        let mut timing = FrameTiming::default();
        timing.record(Stage::Fuse, 0.0);
        let json = timing.to_json().unwrap();
        assert!(json.contains("\"fuse\""));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        let elapsed = timer.elapsed_ms();

        #[cfg(feature = "profiling")]
        assert!(elapsed >= 0.0);

        #[cfg(not(feature = "profiling"))]
        assert_eq!(elapsed, 0.0);
    }
}
