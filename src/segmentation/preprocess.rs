use crate::mask::Mask;
use anyhow::Result;
use image::{imageops, RgbImage};
use ndarray::Array4;

/// Memory layout of the model's input tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [1, height, width, 3]
    Nhwc,
    /// [1, 3, height, width]
    Nchw,
}

/// Preprocessor for converting RGB frames to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32, layout: TensorLayout) -> Self {
        Self {
            target_width,
            target_height,
            layout,
        }
    }

    /// Preprocess an RGB frame into a normalized tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions
    /// 2. Convert to float and normalize to [0, 1]
    /// 3. Lay out as NHWC or NCHW
    pub fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let source = if image.dimensions() != (self.target_width, self.target_height) {
            resized = imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            image
        };

        let (width, height) = (self.target_width as usize, self.target_height as usize);
        let mut tensor = match self.layout {
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, height, width, 3)),
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, height, width)),
        };

        for (x, y, pixel) in source.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                match self.layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                }
            }
        }

        Ok(tensor)
    }

    /// Resize a mask to frame dimensions; no-op when they already match
    pub fn resize_mask(mask: Mask, target_width: u32, target_height: u32) -> Mask {
        if mask.dimensions() == (target_width, target_height) {
            return mask;
        }
        let _span = tracing::debug_span!("resize_mask").entered();
        imageops::resize(
            &mask,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        )
    }

    /// Convert a mask to a grayscale RGB image for visualization
    pub fn mask_to_rgb(mask: &Mask) -> RgbImage {
        let (width, height) = mask.dimensions();
        RgbImage::from_fn(width, height, |x, y| {
            let value = mask.get_pixel(x, y)[0];
            image::Rgb([value, value, value])
        })
    }
}
