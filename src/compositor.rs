//! Background blur compositing.
//!
//! The background is a single approximately-Gaussian blur of the whole frame
//! (three successive box blurs), blended with the sharp frame per pixel:
//!
//! ```text
//! output = blurred * (1 - mask/255) + original * (mask/255)
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::mask::Mask;
use image::RgbImage;

/// Number of box passes used to approximate a Gaussian
const BOX_PASSES: usize = 3;

/// Blends a blurred copy of each frame behind the masked person
#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    blur_radius: u32,
}

impl Compositor {
    pub fn new(blur_radius: u32) -> Self {
        Self { blur_radius }
    }

    pub fn blur_radius(&self) -> u32 {
        self.blur_radius
    }

    pub fn set_blur_radius(&mut self, blur_radius: u32) {
        self.blur_radius = blur_radius;
    }

    /// Produce the output image for one frame.
    ///
    /// Returns a freshly allocated image; `original` is only read.
    pub fn composite(&self, original: &RgbImage, mask: &Mask) -> PipelineResult<RgbImage> {
        let _span = tracing::debug_span!("composite").entered();
        check_dimensions(original, mask)?;
        let blurred = blur(original, self.blur_radius);
        blend(original, &blurred, mask)
    }
}

fn check_dimensions(frame: &RgbImage, mask: &Mask) -> PipelineResult<()> {
    if frame.dimensions() != mask.dimensions() {
        let (frame_width, frame_height) = frame.dimensions();
        let (mask_width, mask_height) = mask.dimensions();
        return Err(PipelineError::DimensionMismatch {
            mask_width,
            mask_height,
            frame_width,
            frame_height,
        });
    }
    Ok(())
}

/// Per-pixel linear blend of `blurred` and `original` weighted by `mask`.
///
/// Exact at the extremes: mask 0 yields the blurred pixel and mask 255 the
/// original pixel.
pub fn blend(original: &RgbImage, blurred: &RgbImage, mask: &Mask) -> PipelineResult<RgbImage> {
    check_dimensions(original, mask)?;
    check_dimensions(blurred, mask)?;

    let (width, height) = original.dimensions();
    let mut out = RgbImage::new(width, height);
    for (((dst, src), bg), &m) in out
        .chunks_exact_mut(3)
        .zip(original.chunks_exact(3))
        .zip(blurred.chunks_exact(3))
        .zip(mask.as_raw())
    {
        let m = m as u32;
        let inv = 255 - m;
        for c in 0..3 {
            dst[c] = ((bg[c] as u32 * inv + src[c] as u32 * m + 127) / 255) as u8;
        }
    }
    Ok(out)
}

/// Approximate a Gaussian blur whose visible extent is `radius` pixels.
///
/// Sigma is taken as radius / 3 and realised as three box blurs of matching
/// variance, so cost per pixel does not depend on the radius.
pub fn blur(image: &RgbImage, radius: u32) -> RgbImage {
    if radius == 0 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    let _span = tracing::debug_span!("blur", radius).entered();

    let sigma = radius as f32 / 3.0;
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut current = image.as_raw().clone();
    let mut scratch = vec![0u8; current.len()];

    for box_radius in box_radii(sigma, BOX_PASSES) {
        box_blur_rows(&current, &mut scratch, w, h, box_radius);
        box_blur_columns(&scratch, &mut current, w, h, box_radius);
    }

    RgbImage::from_raw(width, height, current).unwrap_or_else(|| image.clone())
}

/// Box radii whose successive application matches a Gaussian of `sigma`.
fn box_radii(sigma: f32, passes: usize) -> Vec<usize> {
    let n = passes as f32;
    let ideal_width = (12.0 * sigma * sigma / n + 1.0).sqrt();
    let mut lower = ideal_width.floor() as i64;
    if lower % 2 == 0 {
        lower -= 1;
    }
    let lower = lower.max(1);
    let upper = lower + 2;
    let lower_f = lower as f32;
    let ideal_lower_count = (12.0 * sigma * sigma
        - n * lower_f * lower_f
        - 4.0 * n * lower_f
        - 3.0 * n)
        / (-4.0 * lower_f - 4.0);
    let lower_count = ideal_lower_count.round().max(0.0) as usize;

    (0..passes)
        .map(|i| {
            let width = if i < lower_count { lower } else { upper };
            ((width - 1) / 2) as usize
        })
        .collect()
}

/// Horizontal running-sum box blur with edge clamping, RGB interleaved.
fn box_blur_rows(src: &[u8], dst: &mut [u8], w: usize, h: usize, r: usize) {
    if r == 0 {
        dst.copy_from_slice(src);
        return;
    }
    let window = (2 * r + 1) as u32;
    let last = w - 1;
    for y in 0..h {
        let row = &src[y * w * 3..(y + 1) * w * 3];
        let out = &mut dst[y * w * 3..(y + 1) * w * 3];
        for c in 0..3 {
            let at = |x: usize| row[x.min(last) * 3 + c] as u32;
            let mut acc = at(0) * (r as u32 + 1);
            for x in 1..=r {
                acc += at(x);
            }
            for x in 0..w {
                out[x * 3 + c] = ((acc + window / 2) / window) as u8;
                acc += at(x + r + 1);
                acc -= at(x.saturating_sub(r));
            }
        }
    }
}

/// Vertical running-sum box blur with edge clamping, RGB interleaved.
fn box_blur_columns(src: &[u8], dst: &mut [u8], w: usize, h: usize, r: usize) {
    if r == 0 {
        dst.copy_from_slice(src);
        return;
    }
    let window = (2 * r + 1) as u32;
    let last = h - 1;
    let stride = w * 3;
    for x in 0..w {
        for c in 0..3 {
            let at = |y: usize| src[y.min(last) * stride + x * 3 + c] as u32;
            let mut acc = at(0) * (r as u32 + 1);
            for y in 1..=r {
                acc += at(y);
            }
            for y in 0..h {
                dst[y * stride + x * 3 + c] = ((acc + window / 2) / window) as u8;
                acc += at(y + r + 1);
                acc -= at(y.saturating_sub(r));
            }
        }
    }
}
