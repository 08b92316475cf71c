mod loopback;

pub use loopback::V4L2Output;

use crate::frame::VideoFrame;
use anyhow::Result;

/// Trait for output destinations
pub trait OutputSink {
    /// Write a frame to the output
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;

    /// Get the negotiated output resolution
    fn resolution(&self) -> (u32, u32);
}
