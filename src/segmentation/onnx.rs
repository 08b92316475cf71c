use super::assets::{ModelCache, ModelSource};
use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{ModelLoader, ModelOutput, SegmentationModel};
use crate::options::Delegate;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use std::path::Path;

/// Shape conventions of an ONNX person-segmentation model
#[derive(Debug, Clone, PartialEq)]
pub struct OnnxModelConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// Layout of both the input frame tensor and the output planes
    pub layout: TensorLayout,
    /// Output plane holding background confidence, if any
    pub background_channel: Option<usize>,
}

impl Default for OnnxModelConfig {
    /// Multi-class selfie segmentation: 256x256 NHWC input, six output
    /// planes with background first.
    fn default() -> Self {
        Self {
            input_width: 256,
            input_height: 256,
            layout: TensorLayout::Nhwc,
            background_channel: Some(0),
        }
    }
}

/// Person segmentation through ONNX Runtime
pub struct OnnxSegmenter {
    session: Session,
    preprocessor: Preprocessor,
    config: OnnxModelConfig,
}

impl OnnxSegmenter {
    /// Create a segmenter from an ONNX file
    ///
    /// `PreferAccelerator` tries the CUDA execution provider first and falls
    /// back to CPU; `PreferCpu` goes straight to CPU.
    pub fn new<P: AsRef<Path>>(model_path: P, delegate: Delegate, config: OnnxModelConfig) -> Result<Self> {
        let path = model_path.as_ref();
        tracing::info!("Loading segmentation model from {}", path.display());

        let session = create_session(path, delegate)?;
        tracing::info!("Segmentation model loaded successfully");

        let preprocessor = Preprocessor::new(config.input_width, config.input_height, config.layout);
        Ok(Self {
            session,
            preprocessor,
            config,
        })
    }
}

/// Split a float output tensor into per-category planes.
fn decode_confidences(config: &OnnxModelConfig, dims: &[i64], data: &[f32]) -> Result<ModelOutput> {
    let (height, width, planes) = match (dims.len(), config.layout) {
        // [1, H, W]: a single person-confidence plane
        (3, _) => (dims[1], dims[2], 1),
        (4, TensorLayout::Nhwc) => (dims[1], dims[2], dims[3]),
        (4, TensorLayout::Nchw) => (dims[2], dims[3], dims[1]),
        _ => bail!("unexpected segmentation output shape {:?}", dims),
    };
    if height <= 0 || width <= 0 || planes <= 0 {
        bail!("unexpected segmentation output shape {:?}", dims);
    }
    let (width, height, planes) = (width as usize, height as usize, planes as usize);
    let area = width * height;
    if area * planes != data.len() {
        bail!("output shape {:?} does not match {} values", dims, data.len());
    }

    let channels: Vec<Vec<f32>> = match config.layout {
        TensorLayout::Nchw => data.chunks_exact(area).map(<[f32]>::to_vec).collect(),
        TensorLayout::Nhwc => (0..planes)
            .map(|c| data.iter().skip(c).step_by(planes).copied().collect())
            .collect(),
    };
    let background = if planes > 1 {
        config.background_channel
    } else {
        None
    };

    Ok(ModelOutput::Confidences {
        width: width as u32,
        height: height as u32,
        channels,
        background,
    })
}

/// Create an ONNX Runtime session for the requested delegate.
fn create_session(model_path: &Path, delegate: Delegate) -> Result<Session> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?;

    if delegate == Delegate::PreferAccelerator {
        match builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            Ok(accelerated) => match accelerated.commit_from_file(model_path) {
                Ok(session) => {
                    tracing::info!("Using CUDA execution provider for segmentation");
                    return Ok(session);
                }
                Err(e) => tracing::debug!("CUDA session failed ({}), using CPU", e),
            },
            Err(e) => tracing::debug!("CUDA execution provider unavailable ({}), using CPU", e),
        }
    }

    tracing::info!("Using CPU execution provider for segmentation");
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load model from {}", model_path.display()))
}

impl SegmentationModel for OnnxSegmenter {
    fn segment(&mut self, frame: &RgbImage) -> Result<ModelOutput> {
        let _span = tracing::debug_span!("onnx_segment").entered();

        let input = self.preprocessor.preprocess(frame)?;
        let shape = input.shape().to_vec();
        let input = Tensor::from_array((shape, input.into_raw_vec().into_boxed_slice()))
            .map(Value::from)
            .context("Failed to create input tensor")?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let output = &outputs[0];
        if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
            let dims: Vec<i64> = shape.iter().copied().collect();
            return decode_confidences(&self.config, &dims, data);
        }

        // Category-id outputs: [1, H, W]
        let (shape, ids) = if let Ok((shape, data)) = output.try_extract_tensor::<u8>() {
            (shape, data.to_vec())
        } else {
            let (shape, data) = output
                .try_extract_tensor::<i64>()
                .context("Segmentation output is neither float, u8 nor i64")?;
            (shape, data.iter().map(|&id| id.clamp(0, 255) as u8).collect())
        };
        let dims: Vec<i64> = shape.iter().copied().collect();
        if dims.len() != 3 || dims[1] <= 0 || dims[2] <= 0 {
            bail!("unexpected category output shape {:?}", dims);
        }
        Ok(ModelOutput::Categories {
            width: dims[2] as u32,
            height: dims[1] as u32,
            ids,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        (self.config.input_width, self.config.input_height)
    }
}

/// Resolves a model source through the asset cache and opens it with ONNX Runtime
pub struct OnnxLoader {
    source: ModelSource,
    cache: ModelCache,
    config: OnnxModelConfig,
}

impl OnnxLoader {
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            cache: ModelCache::default_location(),
            config: OnnxModelConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: ModelCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_config(mut self, config: OnnxModelConfig) -> Self {
        self.config = config;
        self
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, delegate: Delegate) -> Result<Box<dyn SegmentationModel>> {
        let path = self
            .cache
            .resolve(&self.source)
            .context("Failed to resolve segmentation model")?;
        let model = OnnxSegmenter::new(&path, delegate, self.config.clone())?;
        Ok(Box::new(model))
    }
}
