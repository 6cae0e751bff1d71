//! Tile descriptors.

use std::fmt;

use crate::buffers::SharedBuffers;
use crate::device::DevicePtr;
use crate::util::Rect;

/// Lifecycle of a tile inside the manager. Ordered: a tile only moves forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TileState {
    #[default]
    Pending,
    InFlight,
    /// Rendered, waiting for neighbours before it can be denoised.
    Rendered,
    /// Ready to denoise.
    Denoise,
    /// Denoised, buffers kept while neighbours still need them.
    Denoised,
    Done,
}

/// What a worker should do with an acquired tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderTileTask {
    #[default]
    PathTrace,
    Denoise,
}

/// Manager-side tile.
#[derive(Clone, Default)]
pub struct Tile {
    pub index: usize,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// Logical device the tile is queued on.
    pub device: usize,
    pub state: TileState,
    /// Per-tile buffers when rendering in background mode.
    pub buffers: Option<SharedBuffers>,
}

impl Tile {
    pub fn new(index: usize, x: i32, y: i32, w: i32, h: i32, device: usize) -> Self {
        Self { index, x, y, w, h, device, ..Default::default() }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("index", &self.index)
            .field("rect", &self.rect())
            .field("device", &self.device)
            .field("state", &self.state)
            .field("buffers", &self.buffers.is_some())
            .finish()
    }
}

/// Tile as seen by a device worker: region, sample range and buffer
/// addressing in the worker's memory space.
#[derive(Clone, Default)]
pub struct RenderTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub start_sample: u32,
    pub num_samples: u32,
    /// Next sample to render; `start_sample + num_samples` when finished.
    pub sample: u32,
    pub resolution: u32,
    pub offset: i32,
    pub stride: i32,
    /// Floats per pixel in `buffer`.
    pub pass_stride: usize,
    pub buffer: DevicePtr,
    pub rng_state: DevicePtr,
    pub buffers: Option<SharedBuffers>,
    pub tile_index: usize,
    pub task: RenderTileTask,
    /// Reset generation the tile was issued in.
    pub epoch: u64,
}

impl RenderTile {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    #[inline]
    pub fn num_pixels(&self) -> u64 {
        (self.w.max(0) as u64) * (self.h.max(0) as u64)
    }

    /// Every sample of the tile has been accumulated.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.sample >= self.start_sample + self.num_samples
    }

    /// Buffer index of pixel `(x, y)`.
    #[inline]
    pub fn index(&self, x: i32, y: i32) -> usize {
        (self.offset + x + y * self.stride) as usize
    }
}

impl fmt::Debug for RenderTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTile")
            .field("rect", &self.rect())
            .field("samples", &(self.start_sample..self.start_sample + self.num_samples))
            .field("sample", &self.sample)
            .field("task", &self.task)
            .field("tile_index", &self.tile_index)
            .field("buffer", &self.buffer)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A tile plus its eight neighbours, row-major, centre at [`CENTER`](Self::CENTER).
/// Missing neighbours have a zero `buffer`.
#[derive(Clone, Debug, Default)]
pub struct RenderTileNeighbors {
    pub tiles: [RenderTile; 9],
    /// Where the filtered result goes.
    pub target: RenderTile,
}

impl RenderTileNeighbors {
    pub const CENTER: usize = 4;
    pub const SIZE: usize = 9;

    pub fn new(center: RenderTile) -> Self {
        let mut neighbors = Self::default();
        neighbors.target = center.clone();
        neighbors.tiles[Self::CENTER] = center;
        neighbors
    }

    pub fn center(&self) -> &RenderTile {
        &self.tiles[Self::CENTER]
    }

    /// Bounding box of every present neighbour.
    pub fn bounds(&self) -> Rect {
        self.tiles
            .iter()
            .filter(|t| t.buffer != 0)
            .fold(self.center().rect(), |acc, t| acc.union(&t.rect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(TileState::Pending < TileState::InFlight);
        assert!(TileState::Rendered < TileState::Denoise);
        assert!(TileState::Denoised < TileState::Done);
    }

    #[test]
    fn test_render_tile_index() {
        let tile = RenderTile {
            x: 4,
            y: 2,
            w: 8,
            h: 8,
            offset: -(4 + 2 * 8),
            stride: 8,
            ..Default::default()
        };
        assert_eq!(tile.index(4, 2), 0);
        assert_eq!(tile.index(5, 3), 9);
        assert_eq!(tile.num_pixels(), 64);
    }

    #[test]
    fn test_neighbor_bounds() {
        let center = RenderTile { x: 8, y: 8, w: 8, h: 8, buffer: 1, ..Default::default() };
        let mut n = RenderTileNeighbors::new(center);
        assert_eq!(n.bounds(), Rect::new(8, 8, 8, 8));
        n.tiles[0] = RenderTile { x: 0, y: 0, w: 8, h: 8, buffer: 2, ..Default::default() };
        n.tiles[8] = RenderTile { x: 16, y: 16, w: 4, h: 8, buffer: 0, ..Default::default() };
        assert_eq!(n.bounds(), Rect::new(0, 0, 16, 16));
    }
}
