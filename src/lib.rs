//! Real-time video background blur.
//!
//! Each frame runs through segmentation, mask refinement, temporal
//! smoothing, edge refinement and compositing; [`BlurProcessor`] decides per
//! frame whether to run that chain or reuse the previous mask, and owns the
//! model lifecycle.

pub mod capture;
pub mod compositor;
pub mod error;
pub mod frame;
pub mod mask;
pub mod observer;
pub mod options;
pub mod output;
pub mod processor;
pub mod segmentation;

pub use compositor::Compositor;
pub use error::{PipelineError, PipelineResult};
pub use frame::{FrameRelease, VideoFrame};
pub use mask::Mask;
pub use observer::{FrameStats, PipelineObserver, TracingObserver};
pub use options::{Delegate, OptionsUpdate, ProcessorOptions, RefinementConfig};
pub use processor::{BlurProcessor, FrameOutcome, LifecycleState, PassThroughReason};
