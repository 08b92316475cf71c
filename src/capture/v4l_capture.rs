use super::CaptureSource;
use crate::frame::VideoFrame;
use anyhow::{Context, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::time::{Duration, Instant};

pub struct WebcamCapture {
    camera: Camera,
    width: u32,
    height: u32,
    started: Instant,
    frame_duration: Duration,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32, fps: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}@{}",
            device_index,
            width,
            height,
            fps
        );

        let index = CameraIndex::Index(device_index);
        let format = CameraFormat::new_from(width, height, FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

        camera
            .open_stream()
            .context("Failed to open camera stream")?;

        let resolution = camera.resolution();
        tracing::info!(
            "Webcam streaming at {}x{}",
            resolution.width(),
            resolution.height()
        );

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
            started: Instant::now(),
            frame_duration: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<VideoFrame> {
        let buffer = self
            .camera
            .frame()
            .context("Failed to capture frame")?;
        let timestamp = self.started.elapsed();

        // A buffer that will not decode is handed on as a closed frame
        let frame = match buffer.decode_image::<RgbFormat>() {
            Ok(image) => VideoFrame::new(image, timestamp),
            Err(e) => {
                tracing::warn!("Failed to decode frame at {:?}: {}", timestamp, e);
                VideoFrame::closed(timestamp)
            }
        };

        Ok(frame.with_duration(self.frame_duration))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
