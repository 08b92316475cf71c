mod assets;
mod onnx;
mod preprocess;
pub mod types;

pub use assets::{ModelCache, ModelSource};
pub use onnx::{OnnxLoader, OnnxModelConfig, OnnxSegmenter};
pub use preprocess::{Preprocessor, TensorLayout};
pub use types::{ModelLoader, ModelOutput, SegmentationModel};
