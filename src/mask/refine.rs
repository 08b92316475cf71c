use super::Mask;
use crate::options::RefinementConfig;

const FOREGROUND: u8 = 255;
const BACKGROUND: u8 = 0;

/// Refine a converted mask.
///
/// Stages, in order:
/// 1. Confidence threshold: binarize at `confidence_threshold * 255`
/// 2. Morphological opening (erosion then dilation), if enabled
/// 3. Keep only the largest 4-connected component, if enabled
/// 4. Clear everything when the foreground covers less than
///    `min_mask_area_ratio` of the frame
///
/// Pure: the same mask and config always give byte-identical output.
pub fn refine(mask: &Mask, config: &RefinementConfig) -> Mask {
    let _span = tracing::debug_span!("refine_mask").entered();
    let (width, height) = mask.dimensions();
    let (w, h) = (width as usize, height as usize);

    let mut data = threshold(mask.as_raw(), config.confidence_threshold);

    if config.morphology_enabled {
        let radius = (config.morphology_kernel_size / 2) as usize;
        if radius > 0 {
            data = open(&data, w, h, radius);
        }
    }

    if config.keep_largest_component_only {
        keep_largest_component(&mut data, w, h);
    }

    let total = data.len();
    if total > 0 {
        let ratio = count_foreground(&data) as f64 / total as f64;
        if ratio < config.min_mask_area_ratio as f64 {
            tracing::debug!(
                "Foreground covers {:.4} of frame, below {:.4}; clearing mask",
                ratio,
                config.min_mask_area_ratio
            );
            data.fill(BACKGROUND);
        }
    }

    Mask::from_raw(width, height, data).unwrap_or_else(|| Mask::new(width, height))
}

/// Number of non-zero pixels in a mask.
pub fn foreground_area(mask: &Mask) -> usize {
    count_foreground(mask.as_raw())
}

fn count_foreground(data: &[u8]) -> usize {
    data.iter().filter(|&&v| v != BACKGROUND).count()
}

fn threshold(data: &[u8], confidence_threshold: f32) -> Vec<u8> {
    let cutoff = confidence_threshold * 255.0;
    data.iter()
        .map(|&v| if v as f32 >= cutoff { FOREGROUND } else { BACKGROUND })
        .collect()
}

/// Opening with a square kernel of side `2 * radius + 1`.
fn open(data: &[u8], w: usize, h: usize, radius: usize) -> Vec<u8> {
    let eroded = square_pass(data, w, h, radius, |count, window| count == window);
    square_pass(&eroded, w, h, radius, |count, _| count > 0)
}

/// Separable square-window morphology.
///
/// `keep(count, window)` decides whether a pixel is foreground given the
/// number of foreground pixels inside its (clipped) line window and the full
/// window length. Out-of-bounds pixels count as background. Square erosion
/// and dilation both factor into a row pass followed by a column pass.
fn square_pass<F>(data: &[u8], w: usize, h: usize, radius: usize, keep: F) -> Vec<u8>
where
    F: Fn(usize, usize) -> bool,
{
    let window = 2 * radius + 1;
    let mut rows = vec![BACKGROUND; data.len()];
    let mut prefix = vec![0usize; w.max(h) + 1];

    for y in 0..h {
        let line = &data[y * w..(y + 1) * w];
        for x in 0..w {
            prefix[x + 1] = prefix[x] + usize::from(line[x] != BACKGROUND);
        }
        for x in 0..w {
            let lo = x.saturating_sub(radius);
            let hi = (x + radius).min(w - 1);
            if keep(prefix[hi + 1] - prefix[lo], window) {
                rows[y * w + x] = FOREGROUND;
            }
        }
    }

    let mut out = vec![BACKGROUND; data.len()];
    for x in 0..w {
        for y in 0..h {
            prefix[y + 1] = prefix[y] + usize::from(rows[y * w + x] != BACKGROUND);
        }
        for y in 0..h {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius).min(h - 1);
            if keep(prefix[hi + 1] - prefix[lo], window) {
                out[y * w + x] = FOREGROUND;
            }
        }
    }
    out
}

/// Clear every 4-connected foreground component except the largest.
///
/// Ties keep the component found first in row-major order.
fn keep_largest_component(data: &mut [u8], w: usize, h: usize) {
    let mut labels = vec![0u32; data.len()];
    let mut stack = Vec::new();
    let mut next_label = 0u32;
    let mut largest = (0u32, 0usize);

    for start in 0..data.len() {
        if data[start] == BACKGROUND || labels[start] != 0 {
            continue;
        }
        next_label += 1;
        labels[start] = next_label;
        stack.push(start);
        let mut size = 0usize;

        while let Some(index) = stack.pop() {
            size += 1;
            let (x, y) = (index % w, index / w);
            let mut visit = |neighbor: usize| {
                if data[neighbor] != BACKGROUND && labels[neighbor] == 0 {
                    labels[neighbor] = next_label;
                    stack.push(neighbor);
                }
            };
            if x > 0 {
                visit(index - 1);
            }
            if x + 1 < w {
                visit(index + 1);
            }
            if y > 0 {
                visit(index - w);
            }
            if y + 1 < h {
                visit(index + w);
            }
        }

        if size > largest.1 {
            largest = (next_label, size);
        }
    }

    if next_label > 1 {
        tracing::debug!(
            "Keeping component {} of {} ({} px)",
            largest.0,
            next_label,
            largest.1
        );
    }
    for (value, &label) in data.iter_mut().zip(labels.iter()) {
        if label != largest.0 {
            *value = BACKGROUND;
        }
    }
}
