use super::Mask;

/// Small-radius bilateral filter over a mask
///
/// Each output pixel is the weighted mean of its neighbourhood, weighted by
/// spatial proximity times value similarity. The wide value tolerance
/// (sigma 40/255) softens ragged edges without eating into the person.
/// Neighbours past the cutoff distance never get a weight computed: the
/// kernel only lists offsets inside the circle.
#[derive(Debug, Clone)]
pub struct EdgeRefiner {
    /// (dx, dy, spatial weight) for every offset within the cutoff
    kernel: Vec<(i32, i32, f32)>,
    /// Value-similarity weight indexed by absolute difference
    range_weights: [f32; 256],
}

impl EdgeRefiner {
    pub const DEFAULT_RADIUS: u32 = 2;
    pub const DEFAULT_SIGMA_SPACE: f32 = 1.5;
    pub const DEFAULT_SIGMA_RANGE: f32 = 40.0;

    pub fn new(radius: u32, sigma_space: f32, sigma_range: f32) -> Self {
        let r = radius as i32;
        let cutoff_sq = r * r;
        let two_space_sq = 2.0 * sigma_space * sigma_space;
        let two_range_sq = 2.0 * sigma_range * sigma_range;

        let mut kernel = Vec::new();
        for dy in -r..=r {
            for dx in -r..=r {
                let dist_sq = dx * dx + dy * dy;
                if dist_sq > cutoff_sq {
                    continue;
                }
                kernel.push((dx, dy, (-(dist_sq as f32) / two_space_sq).exp()));
            }
        }

        let mut range_weights = [0.0f32; 256];
        for (diff, weight) in range_weights.iter_mut().enumerate() {
            let d = diff as f32;
            *weight = (-(d * d) / two_range_sq).exp();
        }

        Self {
            kernel,
            range_weights,
        }
    }

    pub fn refine(&self, mask: &Mask) -> Mask {
        let _span = tracing::debug_span!("edge_refine").entered();
        let (width, height) = mask.dimensions();
        let (w, h) = (width as i32, height as i32);
        let src = mask.as_raw();

        Mask::from_fn(width, height, |x, y| {
            let (x, y) = (x as i32, y as i32);
            let center = src[(y * w + x) as usize];
            let mut weighted = 0.0f32;
            let mut total = 0.0f32;

            for &(dx, dy, spatial) in &self.kernel {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let value = src[(ny * w + nx) as usize];
                let weight = spatial * self.range_weights[center.abs_diff(value) as usize];
                weighted += weight * value as f32;
                total += weight;
            }

            // The centre always contributes weight 1
            image::Luma([(weighted / total).round().clamp(0.0, 255.0) as u8])
        })
    }
}

impl Default for EdgeRefiner {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_RADIUS,
            Self::DEFAULT_SIGMA_SPACE,
            Self::DEFAULT_SIGMA_RANGE,
        )
    }
}
