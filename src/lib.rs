//! # render-session
//!
//! Tile scheduling, device abstraction and progressive render sessions for a
//! path tracer. The per-pixel kernel is supplied by the host through
//! [`device::Kernel`]; this crate decides where, when and in which order it
//! runs and how the results reach the screen or disk.
//!
//! ## Modules
//!
//! - [`util`] - Errors, clocks, memory statistics, rectangles
//! - [`buffers`] - Accumulation buffers, passes, film conversion, display
//! - [`tile`] - Tiles and the tile manager
//! - [`device`] - CPU, accelerator, multi and network devices
//! - [`session`] - The render session and its progress reporting
//!
//! ## Example
//!
//! ```ignore
//! use render_session::prelude::*;
//!
//! let device = CpuDevice::with_threads(0);
//! let session = Session::new(SessionParams::background(64), device)?;
//! session.reset(&BufferParams::new(1920, 1080), 64);
//! session.start()?;
//! session.wait();
//! session.write_output("frame.png")?;
//! ```

pub mod util;
pub mod buffers;
pub mod tile;
pub mod device;
pub mod session;

// Re-export commonly used types
pub use util::{Error, Result};
pub use buffers::{BufferParams, RenderBuffers};
pub use device::{Device, DeviceInfo, DeviceType};
pub use session::{Session, SessionParams, SessionState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Clock, Error, Result, SystemClock};
    pub use crate::buffers::{BufferParams, DisplayBuffer, FilmParams, PassType, RenderBuffers};
    pub use crate::tile::{RenderTile, TileManager, TileOrder};
    pub use crate::device::{
        CpuDevice, Device, DeviceInfo, DeviceRegistry, DeviceTask, DeviceTaskType, DeviceType, DrawTarget, Kernel,
        MultiDevice, RequestedFeatures,
    };
    pub use crate::session::{FrameCollector, Progress, Scene, Session, SessionParams, SessionState, TileWriter};
}
