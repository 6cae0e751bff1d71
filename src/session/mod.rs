//! Render sessions.
//!
//! A [`Session`] owns the control thread that turns resets into rounds of
//! tiles, hands those tiles to a [`Device`](crate::device::Device) and
//! brings the results to the display or to a [`TileWriter`].
//!
//! - [`SessionParams`] - Serde-backed configuration
//! - [`Progress`] - Thread-safe counters, status text and cancellation
//! - [`ResetControl`] - Reset, cancel and redraw timeouts

mod control;
mod output;
mod params;
mod progress;
mod scene;
#[allow(clippy::module_inception)]
mod session;

pub use control::{ResetControl, Timeouts};
pub use output::FrameCollector;
pub use params::SessionParams;
pub use progress::Progress;
pub use scene::{NullScene, Scene, TileWriter};
pub use session::{Session, SessionState};
