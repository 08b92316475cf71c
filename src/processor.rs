//! Per-track blur scheduler and lifecycle.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> Processing
//!                              \-> Failed (frames pass through for good)
//! any state -> Destroyed (terminal)
//! ```
//!
//! The model loads on a worker thread. Frames that arrive before it is ready
//! are forwarded unmodified; nothing ever waits on the load.

use crate::compositor::Compositor;
use crate::error::PipelineError;
use crate::frame::VideoFrame;
use crate::mask::{self, EdgeRefiner, Mask, SmoothingState, TemporalSmoother};
use crate::observer::{FrameStats, PipelineObserver, TracingObserver};
use crate::options::{OptionsUpdate, ProcessorOptions};
use crate::segmentation::{ModelLoader, Preprocessor, SegmentationModel};
use image::RgbImage;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type LoadResult = anyhow::Result<Box<dyn SegmentationModel>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    /// Only observable from inside `process_frame`; not reported to observers
    Processing,
    Failed,
    Destroyed,
}

/// Why a frame left the processor without blur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    /// Model not loaded yet
    NotReady,
    /// Model failed to load; permanent for this processor
    ModelUnavailable,
    /// This frame's inference call failed
    InferenceFailed,
    /// Mask could not be applied to this frame
    CompositeFailed,
    Destroyed,
}

/// What happened to one submitted frame
#[derive(Debug)]
pub enum FrameOutcome {
    /// Segmentation ran and the output is blurred
    Blurred(VideoFrame),
    /// The cached mask from an earlier frame was applied
    Reused(VideoFrame),
    /// The input frame, forwarded unmodified
    PassedThrough(VideoFrame, PassThroughReason),
    /// The input was already closed; nothing to emit
    Dropped,
}

impl FrameOutcome {
    pub fn into_frame(self) -> Option<VideoFrame> {
        match self {
            Self::Blurred(frame) | Self::Reused(frame) | Self::PassedThrough(frame, _) => {
                Some(frame)
            }
            Self::Dropped => None,
        }
    }

    pub fn is_blurred(&self) -> bool {
        matches!(self, Self::Blurred(_) | Self::Reused(_))
    }
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    frames: u32,
    segmented: u32,
    reused: u32,
    passthrough: u32,
    segment: Duration,
    refine: Duration,
    smooth: Duration,
    edge: Duration,
    composite: Duration,
}

impl StatsAccumulator {
    fn take(&mut self, frame_index: u64) -> FrameStats {
        let acc = std::mem::take(self);
        let n = acc.frames.max(1);
        FrameStats {
            frame_index,
            segmented_frames: acc.segmented,
            reused_frames: acc.reused,
            passthrough_frames: acc.passthrough,
            avg_segment: acc.segment / n,
            avg_refine: acc.refine / n,
            avg_smooth: acc.smooth / n,
            avg_edge: acc.edge / n,
            avg_composite: acc.composite / n,
        }
    }
}

/// Background-blur pipeline for one video track
pub struct BlurProcessor {
    options: ProcessorOptions,
    loader: Arc<dyn ModelLoader>,
    observer: Box<dyn PipelineObserver>,
    state: LifecycleState,
    model: Option<Box<dyn SegmentationModel>>,
    pending: Option<Receiver<LoadResult>>,
    smoothing: SmoothingState,
    edge: EdgeRefiner,
    compositor: Compositor,
    /// Last composited mask, reused on skipped frames
    cached_mask: Option<Mask>,
    /// Frames handled while ready since the last restart; drives frame-skip
    frame_index: u64,
    frames_seen: u64,
    consecutive_failures: u32,
    stats: StatsAccumulator,
    stats_interval: u32,
}

impl BlurProcessor {
    pub fn new(options: ProcessorOptions, loader: Arc<dyn ModelLoader>) -> Self {
        let options = options.validated();
        Self {
            compositor: Compositor::new(options.blur_radius),
            options,
            loader,
            observer: Box::new(TracingObserver::new()),
            state: LifecycleState::Uninitialized,
            model: None,
            pending: None,
            smoothing: SmoothingState::new(),
            edge: EdgeRefiner::default(),
            cached_mask: None,
            frame_index: 0,
            frames_seen: 0,
            consecutive_failures: 0,
            stats: StatsAccumulator::default(),
            stats_interval: 30,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Report frame stats every `interval` frames (default 30).
    pub fn with_stats_interval(mut self, interval: u32) -> Self {
        self.stats_interval = interval.max(1);
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Mask applied to the most recent blurred frame
    pub fn last_mask(&self) -> Option<&Mask> {
        self.cached_mask.as_ref()
    }

    /// Start loading the model. No-op unless uninitialized.
    pub fn init(&mut self) {
        match self.state {
            LifecycleState::Uninitialized => self.start_loading(),
            LifecycleState::Destroyed => tracing::debug!("init() after destroy ignored"),
            _ => {}
        }
    }

    /// Block until a pending model load finishes or `timeout` elapses.
    pub fn wait_until_settled(&mut self, timeout: Duration) -> LifecycleState {
        let received = match &self.pending {
            Some(rx) => rx.recv_timeout(timeout),
            None => return self.state,
        };
        match received {
            Ok(result) => self.finish_loading(result),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.finish_loading(Err(anyhow::anyhow!(
                "model loader exited without a result"
            ))),
        }
        self.state
    }

    /// Apply non-structural option changes without reloading the model.
    pub fn update(&mut self, update: &OptionsUpdate) {
        if self.state == LifecycleState::Destroyed {
            tracing::debug!("update() after destroy ignored");
            return;
        }
        if self.options.apply(update) {
            tracing::info!(
                "Delegate set to {:?}; takes effect on the next model load",
                self.options.delegate
            );
        }
        self.compositor.set_blur_radius(self.options.blur_radius);

        let mask_changed = update.enhanced_person_detection.is_some()
            || update.temporal_smoothing_alpha.is_some()
            || update.mask_gamma.is_some()
            || update.edge_refinement.is_some();
        if mask_changed {
            self.cached_mask = None;
        }
        tracing::debug!("Processor options updated: {:?}", self.options);
    }

    /// Clear temporal history and the cached mask, keeping the loaded model.
    pub fn restart(&mut self) {
        match self.state {
            LifecycleState::Ready | LifecycleState::Processing => {
                self.transition(LifecycleState::Initializing);
                self.clear_track_state();
                self.transition(LifecycleState::Ready);
            }
            LifecycleState::Initializing => self.clear_track_state(),
            LifecycleState::Uninitialized => self.init(),
            LifecycleState::Failed | LifecycleState::Destroyed => {
                tracing::debug!("restart() in {:?} ignored", self.state)
            }
        }
    }

    /// The track's source was swapped; its history no longer applies.
    pub fn replace_track(&mut self) {
        if self.state != LifecycleState::Destroyed {
            self.clear_track_state();
        }
    }

    /// Release the model and all buffers. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == LifecycleState::Destroyed {
            return;
        }
        // A load still in flight drops its model when the send fails
        self.pending = None;
        self.model = None;
        self.smoothing.reset();
        self.cached_mask = None;
        self.transition(LifecycleState::Destroyed);
    }

    /// Run one frame through the pipeline.
    ///
    /// The input frame is always consumed: released after blurring, handed
    /// back on pass-through, or dropped if it arrived closed.
    pub fn process_frame(&mut self, frame: VideoFrame) -> FrameOutcome {
        if frame.is_closed() {
            let err = PipelineError::FrameState {
                timestamp_us: frame.timestamp().as_micros(),
            };
            self.observer.frame_dropped(&err);
            return FrameOutcome::Dropped;
        }

        self.poll_loading();
        if self.state == LifecycleState::Uninitialized {
            self.init();
        }

        let outcome = match self.state {
            LifecycleState::Ready => {
                self.state = LifecycleState::Processing;
                let outcome = self.run_ready(frame);
                self.state = LifecycleState::Ready;
                self.frame_index += 1;
                outcome
            }
            LifecycleState::Failed => {
                FrameOutcome::PassedThrough(frame, PassThroughReason::ModelUnavailable)
            }
            LifecycleState::Destroyed => {
                FrameOutcome::PassedThrough(frame, PassThroughReason::Destroyed)
            }
            _ => FrameOutcome::PassedThrough(frame, PassThroughReason::NotReady),
        };

        self.record(&outcome);
        outcome
    }

    fn run_ready(&mut self, frame: VideoFrame) -> FrameOutcome {
        let Ok(image) = frame.image() else {
            return FrameOutcome::Dropped;
        };

        let every_n = self.options.process_every_n_frames.max(1) as u64;
        let cache_fits = self
            .cached_mask
            .as_ref()
            .is_some_and(|m| m.dimensions() == image.dimensions());
        let reuse = self.frame_index % every_n != 0 && cache_fits;

        if !reuse {
            if let Err(err) = self.compute_mask(image) {
                self.consecutive_failures += 1;
                self.observer
                    .inference_failed(&err, self.consecutive_failures);
                return FrameOutcome::PassedThrough(frame, PassThroughReason::InferenceFailed);
            }
            self.consecutive_failures = 0;
        }

        let Some(mask) = self.cached_mask.as_ref() else {
            return FrameOutcome::PassedThrough(frame, PassThroughReason::CompositeFailed);
        };
        let started = Instant::now();
        let composited = self.compositor.composite(image, mask);
        self.stats.composite += started.elapsed();

        match composited {
            Ok(blurred) => {
                let output = frame.derive(blurred);
                frame.close();
                if reuse {
                    FrameOutcome::Reused(output)
                } else {
                    FrameOutcome::Blurred(output)
                }
            }
            Err(err) => {
                tracing::warn!("{}; frame passed through", err);
                self.cached_mask = None;
                FrameOutcome::PassedThrough(frame, PassThroughReason::CompositeFailed)
            }
        }
    }

    /// Full chain: segment, convert, refine, smooth, edge-refine.
    fn compute_mask(&mut self, image: &RgbImage) -> Result<(), PipelineError> {
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| PipelineError::Inference("no model loaded".to_string()))?;
        let (width, height) = image.dimensions();

        let started = Instant::now();
        let output = model
            .segment(image)
            .map_err(|e| PipelineError::inference(&e))?;
        let raw = mask::convert(&output, self.options.mask_gamma)
            .map_err(|e| PipelineError::inference(&e))?;
        let raw = Preprocessor::resize_mask(raw, width, height);
        self.stats.segment += started.elapsed();

        let started = Instant::now();
        let refine_config = &self.options.enhanced_person_detection;
        let refined = if refine_config.enabled {
            mask::refine(&raw, refine_config)
        } else {
            raw
        };
        self.stats.refine += started.elapsed();

        let started = Instant::now();
        let smoother = TemporalSmoother::new(self.options.temporal_smoothing_alpha);
        let smoothed = smoother.smooth(&mut self.smoothing, &refined);
        let smooth_time = started.elapsed();

        let started = Instant::now();
        let final_mask = if self.options.edge_refinement {
            self.edge.refine(smoothed)
        } else {
            smoothed.clone()
        };
        self.stats.smooth += smooth_time;
        self.stats.edge += started.elapsed();

        self.cached_mask = Some(final_mask);
        Ok(())
    }

    fn record(&mut self, outcome: &FrameOutcome) {
        self.frames_seen += 1;
        self.stats.frames += 1;
        match outcome {
            FrameOutcome::Blurred(_) => self.stats.segmented += 1,
            FrameOutcome::Reused(_) => self.stats.reused += 1,
            FrameOutcome::PassedThrough(..) => self.stats.passthrough += 1,
            FrameOutcome::Dropped => {}
        }
        if self.stats.frames >= self.stats_interval {
            let stats = self.stats.take(self.frames_seen);
            self.observer.frame_stats(&stats);
        }
    }

    fn start_loading(&mut self) {
        self.transition(LifecycleState::Initializing);

        let (tx, rx) = mpsc::channel();
        let loader = Arc::clone(&self.loader);
        let delegate = self.options.delegate;
        let spawned = thread::Builder::new()
            .name("segmentation-init".to_string())
            .spawn(move || {
                let _span = tracing::info_span!("model_load").entered();
                let result = loader.load(delegate);
                // Receiver is gone if the processor was destroyed meanwhile
                let _ = tx.send(result);
            });

        match spawned {
            Ok(_) => self.pending = Some(rx),
            Err(e) => self.finish_loading(Err(anyhow::Error::new(e).context("Failed to spawn model loader"))),
        }
    }

    fn poll_loading(&mut self) {
        let received = match &self.pending {
            Some(rx) => rx.try_recv(),
            None => return,
        };
        match received {
            Ok(result) => self.finish_loading(result),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => self.finish_loading(Err(anyhow::anyhow!(
                "model loader exited without a result"
            ))),
        }
    }

    fn finish_loading(&mut self, result: LoadResult) {
        self.pending = None;
        if self.state != LifecycleState::Initializing {
            return;
        }
        match result {
            Ok(model) => {
                let (width, height) = model.input_size();
                tracing::debug!("Segmentation model ready, input {}x{}", width, height);
                self.model = Some(model);
                self.transition(LifecycleState::Ready);
            }
            Err(e) => {
                let err = PipelineError::model_load(&e);
                self.observer.model_load_failed(&err);
                self.transition(LifecycleState::Failed);
            }
        }
    }

    fn clear_track_state(&mut self) {
        self.smoothing.reset();
        self.cached_mask = None;
        self.frame_index = 0;
        self.consecutive_failures = 0;
        if let Some(model) = self.model.as_mut() {
            model.reset_state();
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state;
        if from != to {
            self.state = to;
            self.observer.state_changed(from, to);
        }
    }
}
