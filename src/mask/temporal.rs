use super::Mask;

/// Pixel difference (0-255) above which a pixel counts as moving
const MOTION_THRESHOLD: u8 = 25;
/// Local difference above which the current mask is trusted more
const LARGE_LOCAL_DIFF: u8 = 40;
/// Local difference below which smoothing is strengthened
const SMALL_LOCAL_DIFF: u8 = 5;

const HIGH_MOTION_SCALE: f32 = 0.4;
const MEDIUM_MOTION_SCALE: f32 = 0.7;
const LOW_MOTION_SCALE: f32 = 1.3;
/// Ceiling for the low-motion boost
const MAX_BOOSTED_ALPHA: f32 = 0.95;

/// Temporal history for one video track
///
/// Holds the previous smoothed mask plus one scratch buffer that the next
/// blend is written into; the two swap every frame so steady-state smoothing
/// allocates nothing. Reset (not cleared) on resolution change or track
/// replacement.
#[derive(Debug, Default)]
pub struct SmoothingState {
    previous: Option<Mask>,
    scratch: Vec<u8>,
}

impl SmoothingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop both buffers; the next mask seeds fresh state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_seeded(&self) -> bool {
        self.previous.is_some()
    }

    /// Dimensions of the stored history, if any
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.previous.as_ref().map(|mask| mask.dimensions())
    }
}

/// Frame-level motion between two masks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionEstimate {
    /// Mean absolute pixel difference, 0-255
    pub mean_abs_diff: f32,
    /// Fraction of pixels differing by more than the motion threshold
    pub moving_fraction: f32,
}

impl MotionEstimate {
    pub fn between(current: &[u8], previous: &[u8]) -> Self {
        if current.is_empty() {
            return Self {
                mean_abs_diff: 0.0,
                moving_fraction: 0.0,
            };
        }
        let mut total = 0u64;
        let mut moving = 0usize;
        for (&c, &p) in current.iter().zip(previous) {
            let diff = c.abs_diff(p);
            total += diff as u64;
            if diff > MOTION_THRESHOLD {
                moving += 1;
            }
        }
        let n = current.len() as f32;
        Self {
            mean_abs_diff: total as f32 / n,
            moving_fraction: moving as f32 / n,
        }
    }

    /// Multiplier applied to the base alpha for this amount of motion.
    pub fn alpha_scale(&self) -> f32 {
        if self.moving_fraction > 0.10 || self.mean_abs_diff > 20.0 {
            HIGH_MOTION_SCALE
        } else if self.moving_fraction > 0.03 || self.mean_abs_diff > 8.0 {
            MEDIUM_MOTION_SCALE
        } else if self.moving_fraction < 0.005 && self.mean_abs_diff < 2.0 {
            LOW_MOTION_SCALE
        } else {
            1.0
        }
    }
}

/// Motion-adaptive exponential moving average over successive masks
///
/// `output = a * current + (1 - a) * previous`, where `a` starts from the
/// configured base alpha, is scaled by frame-level motion, then nudged per
/// pixel by the local difference.
#[derive(Debug, Clone, Copy)]
pub struct TemporalSmoother {
    base_alpha: f32,
}

impl TemporalSmoother {
    pub fn new(base_alpha: f32) -> Self {
        Self {
            base_alpha: base_alpha.clamp(0.0, 1.0),
        }
    }

    /// Frame-level alpha for a given motion estimate.
    pub fn frame_alpha(&self, motion: &MotionEstimate) -> f32 {
        let scale = motion.alpha_scale();
        let alpha = self.base_alpha * scale;
        if scale > 1.0 {
            alpha.min(MAX_BOOSTED_ALPHA).max(self.base_alpha)
        } else {
            alpha
        }
    }

    /// Blend `current` into the track's history and return the smoothed mask.
    ///
    /// The first mask after (re)initialization, or after a size change,
    /// passes through unchanged and seeds the state.
    pub fn smooth<'s>(&self, state: &'s mut SmoothingState, current: &Mask) -> &'s Mask {
        let _span = tracing::debug_span!("temporal_smooth").entered();

        if let Some(dimensions) = state.dimensions() {
            if dimensions != current.dimensions() {
                tracing::debug!(
                    "Mask size changed {:?} -> {:?}; resetting smoothing state",
                    dimensions,
                    current.dimensions()
                );
                state.reset();
            }
        }

        let previous = match state.previous.take() {
            Some(previous) => previous,
            None => return state.previous.insert(current.clone()),
        };

        let motion = MotionEstimate::between(current.as_raw(), previous.as_raw());
        let alpha = self.frame_alpha(&motion);
        let strong = alpha + (1.0 - alpha) * 0.5;
        let weak = alpha * 0.5;

        let mut out = std::mem::take(&mut state.scratch);
        out.clear();
        out.extend(
            current
                .as_raw()
                .iter()
                .zip(previous.as_raw())
                .map(|(&c, &p)| {
                    let diff = c.abs_diff(p);
                    let a = if diff > LARGE_LOCAL_DIFF {
                        strong
                    } else if diff < SMALL_LOCAL_DIFF {
                        weak
                    } else {
                        alpha
                    };
                    (a * c as f32 + (1.0 - a) * p as f32).round() as u8
                }),
        );

        let (width, height) = current.dimensions();
        state.scratch = previous.into_raw();
        match Mask::from_raw(width, height, out) {
            Some(smoothed) => state.previous.insert(smoothed),
            None => state.previous.insert(current.clone()),
        }
    }
}
