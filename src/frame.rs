use crate::error::{PipelineError, PipelineResult};
use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Release hook for the native buffer behind a frame
///
/// The transport that allocated a frame's buffer supplies one of these; the
/// pipeline guarantees `release` runs exactly once per `VideoFrame` holding
/// the hook. Output frames built with [`VideoFrame::derive`] hold their
/// source's hook and timestamp, so a blurred frame reports two releases for
/// one timestamp: the consumed input first, then the output when the caller
/// drops or closes it. Transports that key buffers by timestamp should count
/// releases rather than expect one.
pub trait FrameRelease: Send + Sync {
    fn release(&self, timestamp: Duration);
}

/// A captured video frame owned by the pipeline until released
///
/// Release happens exactly once: explicitly through [`VideoFrame::close`], or
/// on drop if the frame was never closed. Frames built with
/// [`VideoFrame::closed`] model buffers the transport already released and
/// never call the hook.
pub struct VideoFrame {
    image: Option<RgbImage>,
    timestamp: Duration,
    duration: Option<Duration>,
    release: Option<Arc<dyn FrameRelease>>,
}

impl VideoFrame {
    /// Wrap an image with no native buffer behind it.
    pub fn new(image: RgbImage, timestamp: Duration) -> Self {
        Self {
            image: Some(image),
            timestamp,
            duration: None,
            release: None,
        }
    }

    /// Wrap an image whose backing buffer must be handed back through `release`.
    pub fn with_release(image: RgbImage, timestamp: Duration, release: Arc<dyn FrameRelease>) -> Self {
        Self {
            image: Some(image),
            timestamp,
            duration: None,
            release: Some(release),
        }
    }

    /// A frame whose buffer was closed before it reached the pipeline.
    pub fn closed(timestamp: Duration) -> Self {
        Self {
            image: None,
            timestamp,
            duration: None,
            release: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Build an output frame carrying this frame's timing and release hook.
    ///
    /// The new frame owns `image` outright; nothing of `self` is retained.
    /// Both frames release through the shared hook, each exactly once.
    pub fn derive(&self, image: RgbImage) -> Self {
        Self {
            image: Some(image),
            timestamp: self.timestamp,
            duration: self.duration,
            release: self.release.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.image.is_none()
    }

    /// Pixel access, failing for frames that were closed on receipt.
    pub fn image(&self) -> PipelineResult<&RgbImage> {
        self.image.as_ref().ok_or(PipelineError::FrameState {
            timestamp_us: self.timestamp.as_micros(),
        })
    }

    /// Width and height, (0, 0) for closed frames.
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.as_ref().map_or((0, 0), |image| image.dimensions())
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Release the frame now.
    pub fn close(mut self) {
        self.release_buffer();
    }

    fn release_buffer(&mut self) {
        if self.image.take().is_some() {
            if let Some(release) = self.release.take() {
                release.release(self.timestamp);
            }
        }
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        self.release_buffer();
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("dimensions", &self.dimensions())
            .field("timestamp", &self.timestamp)
            .field("duration", &self.duration)
            .field("closed", &self.is_closed())
            .finish()
    }
}
