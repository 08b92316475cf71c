//! Mask stages between model output and compositing.
//!
//! ```text
//! ModelOutput -> convert -> refine -> TemporalSmoother -> EdgeRefiner -> Mask
//! ```
//!
//! Every stage works on a single-channel 8-bit mask: 255 is confidently
//! foreground, 0 confidently background.

mod convert;
mod edge;
mod refine;
mod temporal;

pub use convert::convert;
pub use edge::EdgeRefiner;
pub use refine::{foreground_area, refine};
pub use temporal::{MotionEstimate, SmoothingState, TemporalSmoother};

use image::GrayImage;

/// Single-channel person mask, same dimensions as its frame
pub type Mask = GrayImage;
