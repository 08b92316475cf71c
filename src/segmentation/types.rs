use crate::options::Delegate;
use anyhow::{ensure, Result};
use image::RgbImage;

/// Raw output of a person-segmentation model, at model resolution
///
/// Models either label each pixel with a category id or emit one confidence
/// plane per category. Row-major, `width * height` values per plane.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    /// Per-pixel category id; id 0 is background
    Categories {
        width: u32,
        height: u32,
        ids: Vec<u8>,
    },
    /// Per-category confidence planes with values in [0, 1]
    Confidences {
        width: u32,
        height: u32,
        channels: Vec<Vec<f32>>,
        /// Index of the background plane, if the model emits one
        background: Option<usize>,
    },
}

impl ModelOutput {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Categories { width, height, .. } | Self::Confidences { width, height, .. } => {
                (*width, *height)
            }
        }
    }

    /// Check that the output is non-empty and every plane holds exactly
    /// `width * height` values.
    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.dimensions();
        ensure!(
            width > 0 && height > 0,
            "model output is empty ({}x{})",
            width,
            height
        );
        let expected = width as usize * height as usize;
        match self {
            Self::Categories { ids, .. } => {
                ensure!(
                    ids.len() == expected,
                    "category plane has {} values, expected {}",
                    ids.len(),
                    expected
                );
            }
            Self::Confidences {
                channels,
                background,
                ..
            } => {
                ensure!(!channels.is_empty(), "model emitted no confidence planes");
                for (index, plane) in channels.iter().enumerate() {
                    ensure!(
                        plane.len() == expected,
                        "confidence plane {} has {} values, expected {}",
                        index,
                        plane.len(),
                        expected
                    );
                }
                if let Some(bg) = background {
                    ensure!(
                        *bg < channels.len(),
                        "background plane {} out of range for {} planes",
                        bg,
                        channels.len()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Trait for segmentation models
/// Allows swapping between backends (ONNX Runtime, scripted test models, ...)
pub trait SegmentationModel: Send {
    /// Run one inference call on a frame
    fn segment(&mut self, frame: &RgbImage) -> Result<ModelOutput>;

    /// Reset internal state (for models with temporal/recurrent components)
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Get the model's preferred input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);
}

/// Loads a model on the processor's init worker thread
pub trait ModelLoader: Send + Sync {
    fn load(&self, delegate: Delegate) -> Result<Box<dyn SegmentationModel>>;
}

impl<F> ModelLoader for F
where
    F: Fn(Delegate) -> Result<Box<dyn SegmentationModel>> + Send + Sync,
{
    fn load(&self, delegate: Delegate) -> Result<Box<dyn SegmentationModel>> {
        self(delegate)
    }
}
