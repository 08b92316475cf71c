use anyhow::{bail, Result};
use camola_blur::compositor::{self, Compositor};
use camola_blur::mask::{self, EdgeRefiner, SmoothingState, TemporalSmoother};
use camola_blur::segmentation::{ModelLoader, ModelOutput, Preprocessor, SegmentationModel};
use camola_blur::{
    BlurProcessor, Delegate, FrameOutcome, FrameRelease, FrameStats, LifecycleState,
    OptionsUpdate, PassThroughReason, PipelineError, PipelineObserver, ProcessorOptions,
    RefinementConfig, VideoFrame,
};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WIDTH: u32 = 48;
const HEIGHT: u32 = 32;
const SETTLE: Duration = Duration::from_secs(5);

/// Person-shaped block that drifts one pixel right per call
struct DriftingModel {
    calls: u64,
    fail_on: Vec<u64>,
}

impl DriftingModel {
    fn new() -> Self {
        Self {
            calls: 0,
            fail_on: Vec::new(),
        }
    }

    fn failing_on(fail_on: Vec<u64>) -> Self {
        Self { calls: 0, fail_on }
    }
}

impl SegmentationModel for DriftingModel {
    fn segment(&mut self, frame: &RgbImage) -> Result<ModelOutput> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on.contains(&call) {
            bail!("scripted failure on call {}", call);
        }
        let (width, height) = frame.dimensions();
        let offset = (call % 8) as u32;
        let person = |i: u32| {
            let (x, y) = (i % width, i / width);
            x >= 10 + offset && x < 30 + offset && y >= 4 && y < height
        };
        let channels = vec![
            (0..width * height)
                .map(|i| if person(i) { 0.05 } else { 0.9 })
                .collect(),
            (0..width * height)
                .map(|i| if person(i) { 0.95 } else { 0.1 })
                .collect(),
        ];
        Ok(ModelOutput::Confidences {
            width,
            height,
            channels,
            background: Some(0),
        })
    }

    fn input_size(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

/// Uniform single-plane confidence
struct FlatModel(f32);

impl SegmentationModel for FlatModel {
    fn segment(&mut self, frame: &RgbImage) -> Result<ModelOutput> {
        let (width, height) = frame.dimensions();
        Ok(ModelOutput::Confidences {
            width,
            height,
            channels: vec![vec![self.0; (width * height) as usize]],
            background: None,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

/// Returns an output with no pixels
struct EmptyModel;

impl SegmentationModel for EmptyModel {
    fn segment(&mut self, _frame: &RgbImage) -> Result<ModelOutput> {
        Ok(ModelOutput::Categories {
            width: 0,
            height: 0,
            ids: Vec::new(),
        })
    }

    fn input_size(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

/// Counts loads and can hold them until released
struct GatedLoader {
    loads: AtomicUsize,
    open: AtomicBool,
    fail: bool,
    make: fn() -> Box<dyn SegmentationModel>,
}

impl GatedLoader {
    fn new(make: fn() -> Box<dyn SegmentationModel>) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            fail: false,
            make,
        })
    }

    fn closed(make: fn() -> Box<dyn SegmentationModel>) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            fail: false,
            make,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            fail: true,
            make: drifting,
        })
    }

    fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

impl ModelLoader for GatedLoader {
    fn load(&self, _delegate: Delegate) -> Result<Box<dyn SegmentationModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        if self.fail {
            bail!("model asset unavailable");
        }
        Ok((self.make)())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    State(LifecycleState, LifecycleState),
    LoadFailed,
    InferenceFailed(u32),
    Dropped,
    Stats(FrameStats),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }
}

impl PipelineObserver for Recorder {
    fn state_changed(&mut self, from: LifecycleState, to: LifecycleState) {
        self.0.lock().unwrap().push(Event::State(from, to));
    }

    fn model_load_failed(&mut self, _error: &PipelineError) {
        self.0.lock().unwrap().push(Event::LoadFailed);
    }

    fn inference_failed(&mut self, _error: &PipelineError, consecutive: u32) {
        self.0.lock().unwrap().push(Event::InferenceFailed(consecutive));
    }

    fn frame_dropped(&mut self, _error: &PipelineError) {
        self.0.lock().unwrap().push(Event::Dropped);
    }

    fn frame_stats(&mut self, stats: &FrameStats) {
        self.0.lock().unwrap().push(Event::Stats(stats.clone()));
    }
}

/// Counts releases per frame timestamp
#[derive(Default)]
struct ReleaseLedger(Mutex<HashMap<Duration, u32>>);

impl FrameRelease for ReleaseLedger {
    fn release(&self, timestamp: Duration) {
        *self.0.lock().unwrap().entry(timestamp).or_insert(0) += 1;
    }
}

impl ReleaseLedger {
    fn total(&self) -> u32 {
        self.0.lock().unwrap().values().sum()
    }

    fn for_frame(&self, timestamp: Duration) -> u32 {
        self.0.lock().unwrap().get(&timestamp).copied().unwrap_or(0)
    }
}

fn image(n: u64) -> RgbImage {
    RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        Rgb([
            ((x * 5 + n as u32) % 256) as u8,
            ((y * 7) % 256) as u8,
            if (x / 4 + y / 4) % 2 == 0 { 220 } else { 30 },
        ])
    })
}

fn frame(n: u64) -> VideoFrame {
    VideoFrame::new(image(n), Duration::from_millis(33 * n))
}

fn processor(loader: Arc<dyn ModelLoader>, options: ProcessorOptions) -> (BlurProcessor, Recorder) {
    let recorder = Recorder::default();
    let processor = BlurProcessor::new(options, loader).with_observer(Box::new(recorder.clone()));
    (processor, recorder)
}

fn ready(loader: Arc<dyn ModelLoader>, options: ProcessorOptions) -> (BlurProcessor, Recorder) {
    let (mut processor, recorder) = processor(loader, options);
    processor.init();
    assert_eq!(processor.wait_until_settled(SETTLE), LifecycleState::Ready);
    (processor, recorder)
}

fn drifting() -> Box<dyn SegmentationModel> {
    Box::new(DriftingModel::new())
}

#[test]
fn init_twice_loads_once() {
    let loader = GatedLoader::new(drifting);
    let (mut processor, recorder) = processor(loader.clone(), ProcessorOptions::default());

    processor.init();
    processor.init();
    assert_eq!(processor.wait_until_settled(SETTLE), LifecycleState::Ready);
    processor.init();

    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.events(),
        vec![
            Event::State(LifecycleState::Uninitialized, LifecycleState::Initializing),
            Event::State(LifecycleState::Initializing, LifecycleState::Ready),
        ]
    );
}

#[test]
fn destroy_twice_is_safe() {
    let (mut processor, recorder) = ready(GatedLoader::new(drifting), ProcessorOptions::default());
    processor.process_frame(frame(0));

    processor.destroy();
    processor.destroy();
    assert_eq!(processor.state(), LifecycleState::Destroyed);
    assert!(processor.last_mask().is_none());
    assert_eq!(
        recorder.count(|e| *e == Event::State(LifecycleState::Ready, LifecycleState::Destroyed)),
        1
    );

    let outcome = processor.process_frame(frame(1));
    assert!(matches!(
        outcome,
        FrameOutcome::PassedThrough(_, PassThroughReason::Destroyed)
    ));
    processor.init();
    assert_eq!(processor.state(), LifecycleState::Destroyed);
}

#[test]
fn frames_during_initialization_pass_through() {
    let loader = GatedLoader::closed(drifting);
    let (mut processor, _) = processor(loader.clone(), ProcessorOptions::default());
    processor.init();

    for n in 0..3 {
        let input = image(n);
        match processor.process_frame(frame(n)) {
            FrameOutcome::PassedThrough(out, PassThroughReason::NotReady) => {
                assert_eq!(out.image().unwrap(), &input);
            }
            other => panic!("expected pass-through, got {:?}", other),
        }
    }

    loader.release();
    assert_eq!(processor.wait_until_settled(SETTLE), LifecycleState::Ready);
    assert!(matches!(processor.process_frame(frame(3)), FrameOutcome::Blurred(_)));
}

#[test]
fn destroy_during_load_discards_model() {
    let loader = GatedLoader::closed(drifting);
    let (mut processor, _) = processor(loader.clone(), ProcessorOptions::default());
    processor.init();
    processor.destroy();
    loader.release();

    assert_eq!(processor.wait_until_settled(SETTLE), LifecycleState::Destroyed);
    assert!(!processor.process_frame(frame(0)).is_blurred());
}

#[test]
fn model_load_failure_fails_open_and_logs_once() {
    let (mut processor, recorder) = processor(GatedLoader::failing(), ProcessorOptions::default());
    processor.init();
    assert_eq!(processor.wait_until_settled(SETTLE), LifecycleState::Failed);

    for n in 0..50 {
        let input = image(n);
        match processor.process_frame(frame(n)) {
            FrameOutcome::PassedThrough(out, PassThroughReason::ModelUnavailable) => {
                assert_eq!(out.image().unwrap(), &input);
            }
            other => panic!("expected pass-through, got {:?}", other),
        }
    }
    processor.init();
    processor.restart();

    assert_eq!(processor.state(), LifecycleState::Failed);
    assert_eq!(recorder.count(|e| *e == Event::LoadFailed), 1);
}

#[test]
fn inference_failure_affects_only_that_frame() {
    let loader: Arc<dyn ModelLoader> = Arc::new(|_: Delegate| -> Result<Box<dyn SegmentationModel>> {
        Ok(Box::new(DriftingModel::failing_on(vec![2, 3])))
    });
    let (mut processor, recorder) = ready(loader, ProcessorOptions::default());

    let outcomes: Vec<bool> = (0..6)
        .map(|n| processor.process_frame(frame(n)).is_blurred())
        .collect();
    assert_eq!(outcomes, vec![true, true, false, false, true, true]);
    assert_eq!(
        recorder.count(|e| matches!(e, Event::InferenceFailed(_))),
        2
    );
    assert!(recorder.events().contains(&Event::InferenceFailed(2)));
    assert_eq!(processor.state(), LifecycleState::Ready);
}

#[test]
fn empty_model_output_passes_frame_through() {
    let loader: Arc<dyn ModelLoader> = Arc::new(|_: Delegate| -> Result<Box<dyn SegmentationModel>> {
        Ok(Box::new(EmptyModel))
    });
    let (mut processor, recorder) = ready(loader, ProcessorOptions::default());

    match processor.process_frame(frame(0)) {
        FrameOutcome::PassedThrough(out, PassThroughReason::InferenceFailed) => {
            assert_eq!(out.image().unwrap(), &image(0));
        }
        other => panic!("expected inference pass-through, got {:?}", other),
    }
    assert!(processor.last_mask().is_none());
    assert_eq!(recorder.count(|e| *e == Event::InferenceFailed(1)), 1);
}

#[test]
fn closed_frames_are_dropped_silently() {
    let (mut processor, recorder) = ready(GatedLoader::new(drifting), ProcessorOptions::default());
    assert!(processor
        .process_frame(VideoFrame::closed(Duration::from_millis(5)))
        .into_frame()
        .is_none());
    assert_eq!(recorder.count(|e| *e == Event::Dropped), 1);
    assert!(processor.process_frame(frame(1)).is_blurred());
}

#[test]
fn every_frame_is_released_exactly_once() {
    let loader: Arc<dyn ModelLoader> = Arc::new(|_: Delegate| -> Result<Box<dyn SegmentationModel>> {
        Ok(Box::new(DriftingModel::failing_on((0..1000).filter(|n| n % 7 == 3).collect())))
    });
    let (mut processor, _) = ready(
        loader,
        ProcessorOptions {
            process_every_n_frames: 2,
            blur_radius: 4,
            ..Default::default()
        },
    );
    let ledger = Arc::new(ReleaseLedger::default());

    let mut held = Vec::new();
    let mut blurred = HashMap::new();
    let mut derived = 0u32;
    for n in 0..1000u64 {
        let timestamp = Duration::from_millis(n);
        let input = VideoFrame::with_release(image(n), timestamp, ledger.clone());
        let outcome = processor.process_frame(input);
        blurred.insert(timestamp, outcome.is_blurred());
        if outcome.is_blurred() {
            derived += 1;
        }
        let output = outcome.into_frame().unwrap();
        if n % 100 == 0 {
            held.push(output);
        }
    }

    // Every input released once; every derived output released unless held
    assert_eq!(ledger.total(), 1000 + derived - held.len() as u32);

    drop(held);
    assert_eq!(ledger.total(), 1000 + derived);
    for (timestamp, was_blurred) in blurred {
        assert_eq!(ledger.for_frame(timestamp), 1 + u32::from(was_blurred));
    }
}

#[test]
fn low_confidence_everywhere_yields_background_only() {
    let loader: Arc<dyn ModelLoader> = Arc::new(|_: Delegate| -> Result<Box<dyn SegmentationModel>> {
        Ok(Box::new(FlatModel(0.6)))
    });
    let options = ProcessorOptions {
        blur_radius: 9,
        enhanced_person_detection: RefinementConfig {
            confidence_threshold: 0.7,
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut processor, _) = ready(loader, options);

    let output = processor.process_frame(frame(0)).into_frame().unwrap();
    assert!(processor.last_mask().unwrap().pixels().all(|p| p[0] == 0));
    assert_eq!(output.image().unwrap(), &compositor::blur(&image(0), 9));
}

#[test]
fn single_step_schedule_matches_full_chain() {
    let options = ProcessorOptions {
        blur_radius: 6,
        process_every_n_frames: 1,
        ..Default::default()
    };
    let (mut processor, _) = ready(GatedLoader::new(drifting), options.clone());

    let mut model = DriftingModel::new();
    let mut state = SmoothingState::new();
    let smoother = TemporalSmoother::new(options.temporal_smoothing_alpha);
    let edge = EdgeRefiner::default();
    let compositor = Compositor::new(options.blur_radius);

    for n in 0..12 {
        let input = image(n);
        let raw = mask::convert(&model.segment(&input).unwrap(), options.mask_gamma).unwrap();
        let raw = Preprocessor::resize_mask(raw, WIDTH, HEIGHT);
        let refined = mask::refine(&raw, &options.enhanced_person_detection);
        let smoothed = smoother.smooth(&mut state, &refined);
        let expected_mask = edge.refine(smoothed);
        let expected = compositor.composite(&input, &expected_mask).unwrap();

        let output = processor.process_frame(frame(n)).into_frame().unwrap();
        assert_eq!(output.image().unwrap(), &expected, "frame {}", n);
        assert_eq!(processor.last_mask(), Some(&expected_mask));
    }
}

#[test]
fn restart_keeps_model_and_reseeds_smoothing() {
    let loader = GatedLoader::new(drifting);
    let (mut processor, recorder) = ready(loader.clone(), ProcessorOptions::default());
    for n in 0..5 {
        processor.process_frame(frame(n));
    }

    processor.restart();
    assert_eq!(processor.state(), LifecycleState::Ready);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.count(|e| *e == Event::State(LifecycleState::Ready, LifecycleState::Initializing)),
        1
    );

    // The first mask after a restart is the refined mask with no history
    processor.process_frame(frame(5));
    let options = ProcessorOptions::default();
    let mut model = DriftingModel::new();
    for _ in 0..5 {
        model.segment(&image(0)).unwrap();
    }
    let raw = mask::convert(&model.segment(&image(5)).unwrap(), options.mask_gamma).unwrap();
    let refined = mask::refine(&raw, &options.enhanced_person_detection);
    assert_eq!(processor.last_mask(), Some(&EdgeRefiner::default().refine(&refined)));
}

#[test]
fn update_applies_to_next_frame_without_reload() {
    let loader = GatedLoader::new(drifting);
    let (mut processor, _) = ready(
        loader.clone(),
        ProcessorOptions {
            blur_radius: 3,
            ..Default::default()
        },
    );
    processor.process_frame(frame(0));

    processor.update(&OptionsUpdate {
        blur_radius: Some(12),
        ..Default::default()
    });
    let output = processor.process_frame(frame(1)).into_frame().unwrap();
    let mask = processor.last_mask().unwrap().clone();
    let expected = Compositor::new(12).composite(&image(1), &mask).unwrap();

    assert_eq!(output.image().unwrap(), &expected);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn stats_are_reported_every_interval() {
    let (processor, recorder) = processor(GatedLoader::new(drifting), ProcessorOptions::default());
    let mut processor = processor.with_stats_interval(5);
    processor.init();
    processor.wait_until_settled(SETTLE);

    for n in 0..12 {
        processor.process_frame(frame(n));
    }
    let stats: Vec<FrameStats> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Stats(stats) => Some(stats),
            _ => None,
        })
        .collect();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].frame_index, 5);
    assert_eq!(stats[0].segmented_frames, 5);
    assert_eq!(stats[1].frame_index, 10);
}

#[test]
fn track_replacement_resets_history() {
    let (mut processor, _) = ready(
        GatedLoader::new(drifting),
        ProcessorOptions {
            process_every_n_frames: 4,
            ..Default::default()
        },
    );
    processor.process_frame(frame(0));
    assert!(processor.last_mask().is_some());

    processor.replace_track();
    assert!(processor.last_mask().is_none());
    // Frame-skip counter restarts too: the next frame segments
    assert!(matches!(processor.process_frame(frame(1)), FrameOutcome::Blurred(_)));
}
