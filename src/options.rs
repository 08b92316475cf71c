use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Largest blur radius accepted, in pixels.
pub const MAX_BLUR_RADIUS: u32 = 150;

/// Preferred execution target for the segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Delegate {
    #[default]
    PreferAccelerator,
    PreferCpu,
}

/// Mask refinement parameters ("enhanced person detection")
///
/// When `enabled` is false the refiner is bypassed and the continuous
/// confidence mask flows straight into temporal smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefinementConfig {
    pub enabled: bool,
    /// Binarization cutoff in [0, 1]; scaled by 255 against mask values
    pub confidence_threshold: f32,
    pub morphology_enabled: bool,
    /// Side length of the square opening kernel, in pixels
    pub morphology_kernel_size: u32,
    pub keep_largest_component_only: bool,
    /// Foreground area / total pixels below which the mask is cleared
    pub min_mask_area_ratio: f32,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.5,
            morphology_enabled: true,
            morphology_kernel_size: 3,
            keep_largest_component_only: true,
            min_mask_area_ratio: 0.01,
        }
    }
}

/// Full processor configuration, as supplied by the settings collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessorOptions {
    pub blur_radius: u32,
    pub delegate: Delegate,
    pub enhanced_person_detection: RefinementConfig,
    /// Base EMA weight given to the current mask, in [0, 1]
    pub temporal_smoothing_alpha: f32,
    /// Segmentation runs on every Nth frame; the mask is reused in between
    pub process_every_n_frames: u32,
    /// Gamma applied to confidence channels before scaling (1.0 disables)
    pub mask_gamma: f32,
    pub edge_refinement: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            blur_radius: 25,
            delegate: Delegate::PreferAccelerator,
            enhanced_person_detection: RefinementConfig::default(),
            temporal_smoothing_alpha: 0.7,
            process_every_n_frames: 1,
            mask_gamma: 1.2,
            edge_refinement: true,
        }
    }
}

impl ProcessorOptions {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read options from {}", path.display()))?;
        let options: ProcessorOptions = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse options in {}", path.display()))?;
        tracing::info!("Loaded processor options from {}", path.display());
        Ok(options.validated())
    }

    /// Clamp every field into its legal range, warning about each correction.
    pub fn validated(mut self) -> Self {
        if self.blur_radius > MAX_BLUR_RADIUS {
            tracing::warn!("blurRadius {} clamped to {}", self.blur_radius, MAX_BLUR_RADIUS);
            self.blur_radius = MAX_BLUR_RADIUS;
        }
        if self.process_every_n_frames == 0 {
            tracing::warn!("processEveryNFrames 0 raised to 1");
            self.process_every_n_frames = 1;
        }
        self.temporal_smoothing_alpha =
            clamp_unit("temporalSmoothingAlpha", self.temporal_smoothing_alpha);
        if !(self.mask_gamma.is_finite() && self.mask_gamma > 0.0) {
            tracing::warn!("maskGamma {} replaced with 1.0", self.mask_gamma);
            self.mask_gamma = 1.0;
        }

        let refine = &mut self.enhanced_person_detection;
        refine.confidence_threshold =
            clamp_unit("confidenceThreshold", refine.confidence_threshold);
        refine.min_mask_area_ratio = clamp_unit("minMaskAreaRatio", refine.min_mask_area_ratio);
        if refine.morphology_enabled && refine.morphology_kernel_size == 0 {
            tracing::warn!("morphologyKernelSize 0 disables morphology");
            refine.morphology_enabled = false;
        }
        self
    }

    /// Apply a partial update. Returns true if the model delegate changed,
    /// which only takes effect on the next model load.
    pub fn apply(&mut self, update: &OptionsUpdate) -> bool {
        if let Some(radius) = update.blur_radius {
            self.blur_radius = radius;
        }
        let delegate_changed = matches!(update.delegate, Some(d) if d != self.delegate);
        if let Some(delegate) = update.delegate {
            self.delegate = delegate;
        }
        if let Some(refine) = &update.enhanced_person_detection {
            refine.apply_to(&mut self.enhanced_person_detection);
        }
        if let Some(alpha) = update.temporal_smoothing_alpha {
            self.temporal_smoothing_alpha = alpha;
        }
        if let Some(n) = update.process_every_n_frames {
            self.process_every_n_frames = n;
        }
        if let Some(gamma) = update.mask_gamma {
            self.mask_gamma = gamma;
        }
        if let Some(edge) = update.edge_refinement {
            self.edge_refinement = edge;
        }
        *self = self.clone().validated();
        delegate_changed
    }
}

fn clamp_unit(name: &str, value: f32) -> f32 {
    if value.is_nan() {
        tracing::warn!("{} is NaN, using 0", name);
        return 0.0;
    }
    let clamped = value.clamp(0.0, 1.0);
    if clamped != value {
        tracing::warn!("{} {} clamped to {}", name, value, clamped);
    }
    clamped
}

/// Partial options for `update(partialOptions)`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptionsUpdate {
    pub blur_radius: Option<u32>,
    pub delegate: Option<Delegate>,
    pub enhanced_person_detection: Option<RefinementUpdate>,
    pub temporal_smoothing_alpha: Option<f32>,
    pub process_every_n_frames: Option<u32>,
    pub mask_gamma: Option<f32>,
    pub edge_refinement: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefinementUpdate {
    pub enabled: Option<bool>,
    pub confidence_threshold: Option<f32>,
    pub morphology_enabled: Option<bool>,
    pub morphology_kernel_size: Option<u32>,
    pub keep_largest_component_only: Option<bool>,
    pub min_mask_area_ratio: Option<f32>,
}

impl RefinementUpdate {
    fn apply_to(&self, config: &mut RefinementConfig) {
        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = self.confidence_threshold {
            config.confidence_threshold = v;
        }
        if let Some(v) = self.morphology_enabled {
            config.morphology_enabled = v;
        }
        if let Some(v) = self.morphology_kernel_size {
            config.morphology_kernel_size = v;
        }
        if let Some(v) = self.keep_largest_component_only {
            config.keep_largest_component_only = v;
        }
        if let Some(v) = self.min_mask_area_ratio {
            config.min_mask_area_ratio = v;
        }
    }
}
