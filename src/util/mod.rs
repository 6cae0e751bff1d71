//! Utility types shared by every layer.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Stats`] - Device memory accounting
//! - [`Clock`] - Monotonic time source (real or manual)
//! - [`Rect`] - Integer pixel rectangles

mod error;
mod stats;
mod clock;
mod rect;

pub use error::*;
pub use stats::Stats;
pub use clock::{Clock, ManualClock, SystemClock, seconds_between};
pub use rect::{Rect, align_up};
