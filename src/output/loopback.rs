use super::OutputSink;
use crate::frame::VideoFrame;
use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, FourCC, Format};

/// Writes frames to a v4l2loopback device as packed YUYV
pub struct V4L2Output {
    _device: Device,
    file: File,
    width: u32,
    height: u32,
    scratch: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let format = Output::set_format(&device, &requested)
            .context("Failed to set YUYV output format")?;
        if format.fourcc != requested.fourcc {
            bail!("v4l2loopback device refused YUYV (got {})", format.fourcc);
        }
        if (format.width, format.height) != (width, height) {
            tracing::warn!(
                "Device adjusted output to {}x{}",
                format.width,
                format.height
            );
        }

        // v4l2loopback accepts raw frames written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            _device: device,
            file,
            width: format.width,
            height: format.height,
            scratch: Vec::new(),
        })
    }
}

/// Pack an RGB image as YUYV 4:2:2, averaging chroma over each pixel pair.
fn rgb_to_yuyv(image: &RgbImage, out: &mut Vec<u8>) {
    let (width, height) = image.dimensions();
    out.clear();
    if width == 0 {
        return;
    }
    out.reserve((width * height * 2) as usize);

    for row in image.as_raw().chunks_exact(width as usize * 3) {
        for pair in row.chunks(6) {
            let first = &pair[0..3];
            let second = if pair.len() == 6 { &pair[3..6] } else { first };
            let (y0, u0, v0) = rgb_to_yuv(first);
            let (y1, u1, v1) = rgb_to_yuv(second);
            out.extend_from_slice(&[
                y0,
                ((u0 as u16 + u1 as u16) / 2) as u8,
                y1,
                ((v0 as u16 + v1 as u16) / 2) as u8,
            ]);
        }
    }
}

/// BT.601 full-range RGB to YUV in fixed point.
fn rgb_to_yuv(rgb: &[u8]) -> (u8, u8, u8) {
    let (r, g, b) = (rgb[0] as i32, rgb[1] as i32, rgb[2] as i32);
    let y = (77 * r + 150 * g + 29 * b + 128) >> 8;
    let u = ((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128;
    let v = ((128 * r - 107 * g - 21 * b + 128) >> 8) + 128;
    (
        y.clamp(0, 255) as u8,
        u.clamp(0, 255) as u8,
        v.clamp(0, 255) as u8,
    )
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        let image = frame.image()?;

        let resized;
        let image = if image.dimensions() != (self.width, self.height) {
            resized = imageops::resize(
                image,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            image
        };

        rgb_to_yuyv(image, &mut self.scratch);
        self.file
            .write_all(&self.scratch)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
