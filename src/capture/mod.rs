mod v4l_capture;

pub use v4l_capture::WebcamCapture;

use crate::frame::VideoFrame;
use anyhow::Result;

/// Trait for camera capture sources
pub trait CaptureSource {
    /// Capture a single frame, stamped relative to the start of capture
    fn capture_frame(&mut self) -> Result<VideoFrame>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);
}
