//! Host hooks: the scene a session renders and where finished tiles go.

use crate::buffers::RenderBuffers;
use crate::device::{Device, RequestedFeatures};
use crate::tile::RenderTile;
use super::progress::Progress;

/// Scene state the session keeps in sync with the device.
///
/// Called from the session thread with the buffers lock held, so
/// implementations must not call back into the session.
pub trait Scene: Send + Sync {
    /// The output resolution changed.
    fn resize_camera(&self, _width: i32, _height: i32) {}

    /// Device data is out of date.
    fn need_update(&self) -> bool {
        false
    }

    /// Upload whatever changed. Errors go to the device's error slot or to
    /// `progress`.
    fn device_update(&self, _device: &dyn Device, _progress: &Progress) {}

    fn requested_features(&self) -> RequestedFeatures {
        RequestedFeatures::default()
    }
}

/// Scene with nothing to upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScene;

impl Scene for NullScene {}

/// Receives pixels as a background render produces them. `buffers` hold the
/// host copy of `tile`'s region, already read back from the device.
pub trait TileWriter: Send + Sync {
    /// The tile is final.
    fn write_render_tile(&self, tile: &RenderTile, buffers: &RenderBuffers);

    /// Intermediate result, e.g. after each progressive refine pass.
    fn update_render_tile(&self, tile: &RenderTile, buffers: &RenderBuffers) {
        let _ = (tile, buffers);
    }
}
