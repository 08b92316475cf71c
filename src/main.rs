use anyhow::{bail, Context, Result};
use camola_blur::capture::{CaptureSource, WebcamCapture};
use camola_blur::output::{OutputSink, V4L2Output};
use camola_blur::segmentation::{
    ModelCache, ModelSource, OnnxLoader, OnnxModelConfig, Preprocessor, TensorLayout,
};
use camola_blur::{BlurProcessor, Delegate, FrameOutcome, OptionsUpdate, ProcessorOptions, VideoFrame};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    #[arg(long, conflicts_with = "model_url")]
    model: Option<PathBuf>,

    /// Remote segmentation model, fetched once and cached by version
    #[arg(long, requires = "model_version")]
    model_url: Option<String>,

    /// Version key for --model-url
    #[arg(long)]
    model_version: Option<String>,

    /// Directory for downloaded models (default: platform cache dir)
    #[arg(long)]
    model_cache: Option<PathBuf>,

    /// Square model input size in pixels
    #[arg(long, default_value_t = 256)]
    model_input_size: u32,

    /// Model expects NCHW tensors instead of NHWC
    #[arg(long)]
    nchw: bool,

    /// Processor options as JSON (blurRadius, enhancedPersonDetection, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the blur radius in pixels
    #[arg(long)]
    blur_radius: Option<u32>,

    /// Run segmentation on every Nth frame only
    #[arg(long)]
    every_n: Option<u32>,

    /// Run the model on the CPU even if an accelerator is available
    #[arg(long)]
    cpu: bool,

    /// Show matte visualization (grayscale silhouette) instead of the blurred video
    #[arg(long)]
    show_matte: bool,
}

impl Args {
    fn model_source(&self) -> Option<ModelSource> {
        if let Some(path) = &self.model {
            return Some(ModelSource::File(path.clone()));
        }
        match (&self.model_url, &self.model_version) {
            (Some(url), Some(version)) => Some(ModelSource::Remote {
                url: url.clone(),
                version: version.clone(),
            }),
            _ => None,
        }
    }

    fn loader(&self, source: ModelSource) -> OnnxLoader {
        let cache = match &self.model_cache {
            Some(dir) => ModelCache::new(dir),
            None => ModelCache::default_location(),
        };
        tracing::info!("Model cache: {}", cache.root().display());

        OnnxLoader::new(source)
            .with_cache(cache)
            .with_config(OnnxModelConfig {
                input_width: self.model_input_size,
                input_height: self.model_input_size,
                layout: if self.nchw {
                    TensorLayout::Nchw
                } else {
                    TensorLayout::Nhwc
                },
                ..Default::default()
            })
    }

    fn options(&self) -> Result<ProcessorOptions> {
        let mut options = match &self.config {
            Some(path) => ProcessorOptions::from_json_file(path)?,
            None => ProcessorOptions::default(),
        };
        options.apply(&OptionsUpdate {
            blur_radius: self.blur_radius,
            process_every_n_frames: self.every_n,
            delegate: self.cpu.then_some(Delegate::PreferCpu),
            ..Default::default()
        });
        Ok(options)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Camola blur starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}", args.fps);
    if args.fps == 0 {
        bail!("--fps must be at least 1");
    }

    let options = args.options()?;
    tracing::info!(
        "Blur radius {}px, segmenting every {} frame(s)",
        options.blur_radius,
        options.process_every_n_frames
    );

    let mut capture = WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
    )
    .context("Failed to initialize webcam capture")?;
    let (width, height) = capture.resolution();
    tracing::info!("Capturing at {}x{}", width, height);

    let mut output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;
    let (width, height) = output.resolution();
    tracing::info!("Writing at {}x{}", width, height);

    let mut processor = match args.model_source() {
        Some(source) => {
            let mut processor = BlurProcessor::new(options, Arc::new(args.loader(source)));
            processor.init();
            Some(processor)
        }
        None => {
            tracing::info!("No model given; frames are forwarded unblurred");
            None
        }
    };

    run_pipeline(
        &mut capture,
        &mut output,
        processor.as_mut(),
        args.fps,
        args.show_matte,
    )
}

fn run_pipeline<C, O>(
    capture: &mut C,
    output: &mut O,
    mut processor: Option<&mut BlurProcessor>,
    target_fps: u32,
    show_matte: bool,
) -> Result<()>
where
    C: CaptureSource,
    O: OutputSink,
{
    let frame_duration = Duration::from_secs_f32(1.0 / target_fps as f32);

    tracing::info!("Starting main pipeline loop, show_matte={}", show_matte);
    tracing::info!("Press Ctrl+C to stop");

    loop {
        let loop_start = Instant::now();

        let frame = capture
            .capture_frame()
            .context("Failed to capture frame")?;

        match processor.as_deref_mut() {
            Some(processor) => write_processed(output, processor, frame, show_matte)?,
            None if frame.is_closed() => {}
            None => output
                .write_frame(&frame)
                .context("Failed to write frame")?,
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }
}

fn write_processed<O: OutputSink>(
    output: &mut O,
    processor: &mut BlurProcessor,
    frame: VideoFrame,
    show_matte: bool,
) -> Result<()> {
    let outcome = processor.process_frame(frame);
    let matte = match (show_matte, &outcome, processor.last_mask()) {
        (true, FrameOutcome::Blurred(frame) | FrameOutcome::Reused(frame), Some(mask)) => {
            // Standalone frame: the blurred output keeps the release hook
            Some(VideoFrame::new(Preprocessor::mask_to_rgb(mask), frame.timestamp()))
        }
        _ => None,
    };

    let written = match &matte {
        Some(matte) => Some(matte),
        None => match &outcome {
            FrameOutcome::Blurred(frame)
            | FrameOutcome::Reused(frame)
            | FrameOutcome::PassedThrough(frame, _) => Some(frame),
            FrameOutcome::Dropped => None,
        },
    };
    if let Some(frame) = written {
        output
            .write_frame(frame)
            .context("Failed to write frame")?;
    }
    Ok(())
}
