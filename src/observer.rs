use crate::error::PipelineError;
use crate::processor::LifecycleState;
use std::time::Duration;

/// Averaged per-stage timings over one stats interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Frames submitted to the processor since creation
    pub frame_index: u64,
    /// Frames in this interval that ran the full segmentation chain
    pub segmented_frames: u32,
    /// Frames in this interval that reused the cached mask
    pub reused_frames: u32,
    /// Frames in this interval forwarded without blur
    pub passthrough_frames: u32,
    pub avg_segment: Duration,
    pub avg_refine: Duration,
    pub avg_smooth: Duration,
    pub avg_edge: Duration,
    pub avg_composite: Duration,
}

impl FrameStats {
    /// Sum of the averaged stage times.
    pub fn avg_total(&self) -> Duration {
        self.avg_segment + self.avg_refine + self.avg_smooth + self.avg_edge + self.avg_composite
    }
}

/// Observability hook injected into the processor
///
/// Called on lifecycle transitions, failures, and every stats interval; never
/// once per healthy frame.
pub trait PipelineObserver: Send {
    fn state_changed(&mut self, _from: LifecycleState, _to: LifecycleState) {}

    /// Reported exactly once per processor instance.
    fn model_load_failed(&mut self, _error: &PipelineError) {}

    /// `consecutive` counts failures since the last successful inference.
    fn inference_failed(&mut self, _error: &PipelineError, _consecutive: u32) {}

    fn frame_dropped(&mut self, _error: &PipelineError) {}

    fn frame_stats(&mut self, _stats: &FrameStats) {}
}

/// Default observer writing through `tracing`
pub struct TracingObserver {
    /// Log every Nth consecutive inference failure after the first
    failure_log_interval: u32,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self {
            failure_log_interval: 30,
        }
    }

    pub fn with_failure_log_interval(failure_log_interval: u32) -> Self {
        Self {
            failure_log_interval: failure_log_interval.max(1),
        }
    }

    fn should_log_failure(&self, consecutive: u32) -> bool {
        consecutive == 1 || consecutive % self.failure_log_interval == 0
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineObserver for TracingObserver {
    fn state_changed(&mut self, from: LifecycleState, to: LifecycleState) {
        tracing::info!("Blur pipeline {:?} -> {:?}", from, to);
    }

    fn model_load_failed(&mut self, error: &PipelineError) {
        tracing::error!("{}; frames will pass through unblurred", error);
    }

    fn inference_failed(&mut self, error: &PipelineError, consecutive: u32) {
        if self.should_log_failure(consecutive) {
            tracing::warn!("{} ({} consecutive), frame passed through", error, consecutive);
        }
    }

    fn frame_dropped(&mut self, error: &PipelineError) {
        tracing::debug!("Dropping frame: {}", error);
    }

    fn frame_stats(&mut self, stats: &FrameStats) {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        tracing::info!(
            "Frame {}: segment={:.1}ms, refine={:.1}ms, smooth={:.1}ms, edge={:.1}ms, composite={:.1}ms, total={:.1}ms (segmented={}, reused={}, passthrough={})",
            stats.frame_index,
            ms(stats.avg_segment),
            ms(stats.avg_refine),
            ms(stats.avg_smooth),
            ms(stats.avg_edge),
            ms(stats.avg_composite),
            ms(stats.avg_total()),
            stats.segmented_frames,
            stats.reused_frames,
            stats.passthrough_frames
        );
    }
}
