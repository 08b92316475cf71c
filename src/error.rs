use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the blur pipeline.
///
/// None of these ever escape `BlurProcessor::process_frame`: each one maps to
/// a fail-open outcome (pass-through or drop) and is reported to the observer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// The model or its runtime failed to initialize. Terminal for the instance.
    #[error("segmentation model failed to load: {0}")]
    ModelLoad(String),

    /// A single frame's inference call failed. Transient.
    #[error("segmentation inference failed: {0}")]
    Inference(String),

    /// The input frame was already closed when it reached the pipeline.
    #[error("frame at {timestamp_us}us was already closed on receipt")]
    FrameState { timestamp_us: u128 },

    /// A mask did not match the frame it was meant for.
    #[error("mask is {mask_width}x{mask_height} but frame is {frame_width}x{frame_height}")]
    DimensionMismatch {
        mask_width: u32,
        mask_height: u32,
        frame_width: u32,
        frame_height: u32,
    },
}

impl PipelineError {
    /// Fold a backend error chain into a model-load error.
    pub fn model_load(err: &anyhow::Error) -> Self {
        Self::ModelLoad(format!("{err:#}"))
    }

    /// Fold a backend error chain into an inference error.
    pub fn inference(err: &anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }
}
