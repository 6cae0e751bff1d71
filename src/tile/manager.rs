//! Tile scheduling across progressive resolution levels and passes.
//!
//! State machine per reset epoch:
//!
//! ```text
//! reset -> {divider = R0, pass = -1}
//! next  -> {R0, pass 0} -> {R0/2, pass 0} -> ... -> {1, pass 0} -> {1, pass 1} -> ... done
//! ```
//!
//! Non-progressive managers render every sample in one round at full
//! resolution.

use std::cmp::Ordering;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::buffers::{BufferParams, SharedBuffers};
use super::tile::{RenderTileNeighbors, Tile, TileState};

/// Order tiles are handed out in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileOrder {
    #[default]
    Center,
    RightToLeft,
    LeftToRight,
    TopToBottom,
    BottomToTop,
}

/// Which tile kinds a worker accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileTypes(u8);

impl TileTypes {
    pub const NONE: TileTypes = TileTypes(0);
    pub const PATH_TRACE: TileTypes = TileTypes(1);
    pub const DENOISE: TileTypes = TileTypes(2);
    pub const ALL: TileTypes = TileTypes(3);

    #[inline]
    pub fn contains(self, other: TileTypes) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn union(self, other: TileTypes) -> TileTypes {
        TileTypes(self.0 | other.0)
    }

    #[inline]
    pub fn without(self, other: TileTypes) -> TileTypes {
        TileTypes(self.0 & !other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for TileTypes {
    fn default() -> Self {
        TileTypes::PATH_TRACE
    }
}

/// Static tiling configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileSettings {
    /// Render one sample per round, starting at a coarse resolution.
    pub progressive: bool,
    /// Target tile size in pixels.
    pub tile_size: (i32, i32),
    /// Coarsest level has at most `min_size^2` pixels. `None` disables
    /// coarsening.
    pub min_size: Option<i32>,
    /// Keep each logical device on the same image band across passes.
    pub preserve_tile_device: bool,
    pub background: bool,
    pub tile_order: TileOrder,
    /// Schedule a denoise round per tile once all its neighbours rendered.
    pub schedule_denoising: bool,
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            progressive: true,
            tile_size: (64, 64),
            min_size: Some(64),
            preserve_tile_device: false,
            background: false,
            tile_order: TileOrder::Center,
            schedule_denoising: false,
        }
    }
}

/// Mutable progress of the manager.
#[derive(Debug, Default)]
pub struct TileManagerState {
    /// Params of the current resolution level.
    pub buffer: BufferParams,
    /// First sample of the current round, -1 before the first `next()`.
    pub pass: i32,
    /// Samples rendered in the current round.
    pub num_samples: u32,
    pub resolution_divider: i32,
    /// All tiles of the current round, in grid order.
    pub tiles: Vec<Tile>,
    /// Grid dimensions of `tiles` when the image is a single band.
    pub tiles_x: i32,
    pub tiles_y: i32,
    /// Render queue per logical device, in `TileOrder`.
    pub render_tiles: Vec<VecDeque<usize>>,
    /// Tiles ready for denoising per logical device.
    pub denoising_tiles: Vec<VecDeque<usize>>,
    pub total_pixel_samples: u64,
}

/// Outcome of [`TileManager::finish_tile`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinishedTile {
    /// The tile's result is final and can be written out.
    pub write: bool,
    /// Its buffers are no longer needed once written.
    pub delete: bool,
}

/// Partitions the image into tiles and walks resolution levels and passes.
#[derive(Debug)]
pub struct TileManager {
    pub params: BufferParams,
    pub state: TileManagerState,
    pub num_samples: u32,
    settings: TileSettings,
    num_devices: usize,
}

impl TileManager {
    pub fn new(settings: TileSettings, num_samples: u32, num_devices: usize) -> Self {
        let mut manager = Self {
            params: BufferParams::default(),
            state: TileManagerState::default(),
            num_samples,
            settings,
            num_devices: num_devices.max(1),
        };
        manager.state.pass = -1;
        manager.state.resolution_divider = 1;
        manager
    }

    pub fn settings(&self) -> &TileSettings {
        &self.settings
    }

    /// Coarsest divider so the downscaled image has at most `min_size^2`
    /// pixels.
    pub fn get_divider(width: i32, height: i32, min_size: Option<i32>) -> i32 {
        let Some(min_size) = min_size else {
            return 1;
        };
        let limit = (min_size.max(1) as i64) * (min_size.max(1) as i64);
        let (mut w, mut h) = (width.max(1) as i64, height.max(1) as i64);
        let mut divider = 1;
        while w * h > limit {
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            divider <<= 1;
        }
        divider
    }

    /// Start a new epoch for `params` with `num_samples` passes.
    pub fn reset(&mut self, params: &BufferParams, num_samples: u32) {
        self.params = params.clone();
        self.state.buffer = BufferParams::default();
        self.state.pass = -1;
        self.state.num_samples = 0;
        self.state.resolution_divider = if self.settings.progressive {
            Self::get_divider(params.width, params.height, self.settings.min_size)
        } else {
            1
        };
        self.state.tiles.clear();
        self.state.render_tiles.clear();
        self.state.denoising_tiles.clear();
        self.state.tiles_x = 0;
        self.state.tiles_y = 0;
        self.set_samples(num_samples);
    }

    /// Change the target sample count, keeping the current position.
    pub fn set_samples(&mut self, num_samples: u32) {
        self.num_samples = num_samples;
        let (w, h) = (self.params.width.max(0) as u64, self.params.height.max(0) as u64);
        let mut pixel_samples = 0u64;
        if self.settings.progressive {
            let mut divider = Self::get_divider(self.params.width, self.params.height, self.settings.min_size);
            while divider > 1 {
                pixel_samples += (w / divider as u64).max(1) * (h / divider as u64).max(1);
                divider >>= 1;
            }
        }
        pixel_samples += num_samples as u64 * w * h;
        if self.settings.schedule_denoising {
            pixel_samples += w * h;
        }
        self.state.total_pixel_samples = if w * h == 0 { 0 } else { pixel_samples };
    }

    pub fn get_num_effective_samples(&self) -> u32 {
        self.num_samples
    }

    /// No more rounds to render.
    pub fn done(&self) -> bool {
        if self.params.width <= 0 || self.params.height <= 0 || self.num_samples == 0 {
            return true;
        }
        self.state.resolution_divider == 1
            && self.state.pass >= 0
            && self.state.pass as i64 + self.state.num_samples as i64 >= self.num_samples as i64
    }

    /// Advance to the next round and regenerate tiles. False when done.
    pub fn next(&mut self) -> bool {
        if self.done() {
            return false;
        }
        if self.state.pass < 0 {
            self.state.pass = 0;
        } else if self.settings.progressive && self.state.resolution_divider > 1 {
            self.state.pass = 0;
            self.state.resolution_divider = (self.state.resolution_divider / 2).max(1);
        } else {
            self.state.pass += 1;
            self.state.resolution_divider = 1;
        }
        self.state.num_samples = if self.settings.progressive { 1 } else { self.num_samples };
        self.set_tiles();
        true
    }

    fn set_tiles(&mut self) {
        let divider = self.state.resolution_divider;
        let image_w = (self.params.width / divider).max(1);
        let image_h = (self.params.height / divider).max(1);

        let mut buffer = self.params.downscaled(divider);
        buffer.width = image_w;
        buffer.height = image_h;
        self.state.buffer = buffer;
        // Whole-frame buffers (interactive or refine) are read back in bands.
        let banded = !self.settings.background || self.settings.progressive;
        self.gen_tiles(image_w, image_h, banded);
    }

    /// Number of tiles and tile extent covering `size` evenly.
    fn split_extent(size: i32, target: i32) -> (i32, i32) {
        if target <= 0 || target >= size {
            return (1, size);
        }
        let count = (size + target - 1) / target;
        let sub = (size + count - 1) / count;
        ((size + sub - 1) / sub, sub)
    }

    fn gen_tiles(&mut self, image_w: i32, image_h: i32, banded: bool) {
        let num_logical = if self.settings.preserve_tile_device { self.num_devices } else { 1 };
        let num = (image_h.max(1) as usize).min(num_logical);
        let sliced = banded && self.settings.preserve_tile_device;
        let slice_num = if sliced { num } else { 1 };

        self.state.tiles.clear();
        self.state.render_tiles = vec![VecDeque::new(); num];
        self.state.denoising_tiles = vec![VecDeque::new(); num];

        let (tiles_x, sub_w) = Self::split_extent(image_w, self.settings.tile_size.0);
        let mut grid_h = 0;
        for slice in 0..slice_num {
            let slice_y = (image_h / slice_num as i32) * slice as i32;
            let slice_h = if slice == slice_num - 1 {
                image_h - slice_y
            } else {
                image_h / slice_num as i32
            };
            let (tiles_y, sub_h) = Self::split_extent(slice_h, self.settings.tile_size.1);
            grid_h += tiles_y;
            let tiles_per_device = ((tiles_x * tiles_y) as usize).div_ceil(num);
            let (mut cur_device, mut cur_tiles) = (0usize, 0usize);

            for ty in 0..tiles_y {
                let y = ty * sub_h;
                let h = if ty == tiles_y - 1 { slice_h - y } else { sub_h };
                for tx in 0..tiles_x {
                    let x = tx * sub_w;
                    let w = if tx == tiles_x - 1 { image_w - x } else { sub_w };
                    let device = if sliced { slice } else { cur_device };
                    let index = self.state.tiles.len();
                    self.state.tiles.push(Tile::new(index, x, slice_y + y, w, h, device));
                    if !sliced {
                        cur_tiles += 1;
                        if cur_tiles == tiles_per_device {
                            cur_tiles = 0;
                            cur_device = (cur_device + 1).min(num - 1);
                        }
                    }
                }
            }
        }
        self.state.tiles_x = tiles_x;
        self.state.tiles_y = grid_h;

        let center = (image_w, image_h);
        let order = self.settings.tile_order;
        for device in 0..num {
            let mut queue: Vec<usize> = self
                .state
                .tiles
                .iter()
                .filter(|t| t.device == device)
                .map(|t| t.index)
                .collect();
            queue.sort_by(|&a, &b| compare_tiles(order, center, &self.state.tiles[a], &self.state.tiles[b]));
            self.state.render_tiles[device] = queue.into();
        }
        tracing::debug!(
            tiles = self.state.tiles.len(),
            divider = self.state.resolution_divider,
            pass = self.state.pass,
            "generated tiles"
        );
    }

    /// Pop the next tile for `device`. Denoise work takes precedence when the
    /// caller accepts it.
    pub fn next_tile(&mut self, device: usize, tile_types: TileTypes) -> Option<usize> {
        let logical = if self.settings.preserve_tile_device { device } else { 0 };
        if logical >= self.state.render_tiles.len() {
            return None;
        }
        if tile_types.contains(TileTypes::DENOISE) {
            if let Some(index) = self.state.denoising_tiles[logical].pop_front() {
                return Some(index);
            }
        }
        if !tile_types.contains(TileTypes::PATH_TRACE) {
            return None;
        }
        let index = self.state.render_tiles[logical].pop_front()?;
        self.state.tiles[index].state = TileState::InFlight;
        Some(index)
    }

    /// Whether rendering tiles remain queued for any device.
    pub fn has_render_tiles(&self) -> bool {
        self.state.render_tiles.iter().any(|q| !q.is_empty())
    }

    /// Any tile not yet done.
    pub fn has_tiles(&self) -> bool {
        self.state.tiles.iter().any(|t| t.state != TileState::Done)
    }

    /// Denoise work that may still appear for `device`.
    pub fn may_need_denoise(&self) -> bool {
        self.settings.schedule_denoising
            && self.state.tiles.iter().any(|t| t.state < TileState::Denoised)
    }

    /// Record that tile `index` finished its current task.
    pub fn finish_tile(&mut self, index: usize) -> FinishedTile {
        if index >= self.state.tiles.len() {
            return FinishedTile::default();
        }
        if self.settings.progressive {
            self.state.tiles[index].state = TileState::Done;
            return FinishedTile { write: true, delete: false };
        }

        match self.state.tiles[index].state {
            TileState::Pending | TileState::InFlight => {
                if !self.settings.schedule_denoising {
                    self.state.tiles[index].state = TileState::Done;
                    return FinishedTile { write: true, delete: true };
                }
                self.state.tiles[index].state = TileState::Rendered;
                for n in 0..RenderTileNeighbors::SIZE {
                    let Some(nindex) = self.get_neighbor_index(index, n) else { continue };
                    if self.state.tiles[nindex].state == TileState::Rendered
                        && self.check_neighbor_state(nindex, TileState::Rendered)
                    {
                        self.state.tiles[nindex].state = TileState::Denoise;
                        let device = self.state.tiles[nindex].device;
                        self.state.denoising_tiles[device].push_back(nindex);
                    }
                }
                FinishedTile { write: false, delete: false }
            }
            TileState::Denoise => {
                self.state.tiles[index].state = TileState::Denoised;
                let mut delete = false;
                for n in 0..RenderTileNeighbors::SIZE {
                    let Some(nindex) = self.get_neighbor_index(index, n) else { continue };
                    if self.state.tiles[nindex].state == TileState::Denoised
                        && self.check_neighbor_state(nindex, TileState::Denoised)
                    {
                        self.state.tiles[nindex].state = TileState::Done;
                        if nindex == index {
                            // Still has to be written before its buffers go.
                            delete = true;
                        } else {
                            self.state.tiles[nindex].buffers = None;
                        }
                    }
                }
                FinishedTile { write: true, delete }
            }
            _ => FinishedTile { write: false, delete: false },
        }
    }

    /// Grid index of neighbour `neighbor` (0..9, row-major, 4 = self).
    pub fn get_neighbor_index(&self, index: usize, neighbor: usize) -> Option<usize> {
        let tiles_x = self.state.tiles_x;
        if tiles_x <= 0 || neighbor >= RenderTileNeighbors::SIZE || index >= self.state.tiles.len() {
            return None;
        }
        let dx = (neighbor % 3) as i32 - 1;
        let dy = (neighbor / 3) as i32 - 1;
        let tx = index as i32 % tiles_x + dx;
        let ty = index as i32 / tiles_x + dy;
        if tx < 0 || ty < 0 || tx >= tiles_x || ty >= self.state.tiles_y {
            return None;
        }
        let nindex = (ty * tiles_x + tx) as usize;
        (nindex < self.state.tiles.len()).then_some(nindex)
    }

    /// Tile `index` and every in-bounds neighbour have reached `min_state`.
    pub fn check_neighbor_state(&self, index: usize, min_state: TileState) -> bool {
        if index >= self.state.tiles.len() || self.state.tiles[index].state < min_state {
            return false;
        }
        (0..RenderTileNeighbors::SIZE).all(|n| match self.get_neighbor_index(index, n) {
            Some(nindex) => self.state.tiles[nindex].state >= min_state,
            None => true,
        })
    }

    /// Buffers attached to tile `index`.
    pub fn tile_buffers(&self, index: usize) -> Option<SharedBuffers> {
        self.state.tiles.get(index).and_then(|t| t.buffers.clone())
    }
}

fn compare_tiles(order: TileOrder, image: (i32, i32), a: &Tile, b: &Tile) -> Ordering {
    match order {
        TileOrder::Center => {
            // Doubled coordinates keep the centre distance integral.
            let dist = |t: &Tile| {
                let dx = (image.0 - (2 * t.x + t.w)) as i64;
                let dy = (image.1 - (2 * t.y + t.h)) as i64;
                dx * dx + dy * dy
            };
            dist(a).cmp(&dist(b))
        }
        TileOrder::LeftToRight => a.x.cmp(&b.x).then(a.y.cmp(&b.y)),
        TileOrder::RightToLeft => b.x.cmp(&a.x).then(a.y.cmp(&b.y)),
        TileOrder::TopToBottom => a.y.cmp(&b.y).then(a.x.cmp(&b.x)),
        TileOrder::BottomToTop => b.y.cmp(&a.y).then(a.x.cmp(&b.x)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(progressive: bool, tile: i32, min_size: Option<i32>) -> TileSettings {
        TileSettings {
            progressive,
            tile_size: (tile, tile),
            min_size,
            background: !progressive,
            ..Default::default()
        }
    }

    fn coverage_ok(manager: &TileManager) -> bool {
        let (w, h) = (manager.state.buffer.width, manager.state.buffer.height);
        let mut hits = vec![0u8; (w * h) as usize];
        for t in &manager.state.tiles {
            if t.w <= 0 || t.h <= 0 {
                return false;
            }
            for y in t.y..t.y + t.h {
                for x in t.x..t.x + t.w {
                    if x >= w || y >= h {
                        return false;
                    }
                    hits[(y * w + x) as usize] += 1;
                }
            }
        }
        hits.iter().all(|&c| c == 1)
    }

    #[test]
    fn test_single_tile_four_passes() {
        let mut manager = TileManager::new(settings(true, 64, None), 4, 1);
        manager.reset(&BufferParams::new(64, 64), 4);
        assert!(!manager.done());
        let mut seen = Vec::new();
        for _ in 0..4 {
            assert!(manager.next());
            seen.push((manager.state.pass, manager.state.resolution_divider));
            assert_eq!(manager.state.tiles.len(), 1);
            let t = &manager.state.tiles[0];
            assert_eq!((t.x, t.y, t.w, t.h), (0, 0, 64, 64));
        }
        assert_eq!(seen, vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
        assert!(manager.done());
        assert!(!manager.next());
    }

    #[test]
    fn test_progressive_levels() {
        let mut manager = TileManager::new(settings(true, 32, Some(16)), 2, 1);
        manager.reset(&BufferParams::new(64, 64), 2);
        assert_eq!(manager.state.resolution_divider, 4);
        let mut states = Vec::new();
        while manager.next() {
            states.push((manager.state.resolution_divider, manager.state.pass));
        }
        assert_eq!(states, vec![(4, 0), (2, 0), (1, 0), (1, 1)]);
        assert_eq!(manager.state.buffer.width, 64);
    }

    #[test]
    fn test_monotonic() {
        for (w, h, passes) in [(100, 37, 3), (640, 480, 5), (1, 1, 2), (17, 300, 1)] {
            let mut manager = TileManager::new(settings(true, 16, Some(8)), passes, 1);
            manager.reset(&BufferParams::new(w, h), passes);
            let (mut divider, mut pass) = (i32::MAX, -1);
            let mut rounds = 0;
            while manager.next() {
                assert!(manager.state.resolution_divider <= divider);
                if manager.state.resolution_divider == divider {
                    assert!(manager.state.pass >= pass);
                }
                divider = manager.state.resolution_divider;
                pass = manager.state.pass;
                rounds += 1;
                assert!(rounds < 64);
            }
            assert_eq!(divider, 1);
            assert_eq!(pass + 1, passes as i32);
        }
    }

    #[test]
    fn test_non_progressive_single_round() {
        let mut manager = TileManager::new(settings(false, 16, Some(8)), 8, 1);
        manager.reset(&BufferParams::new(64, 48), 8);
        assert!(manager.next());
        assert_eq!(manager.state.pass, 0);
        assert_eq!(manager.state.num_samples, 8);
        assert_eq!(manager.state.resolution_divider, 1);
        assert_eq!(manager.state.tiles.len(), 12);
        assert!(manager.done());
        assert!(!manager.next());
    }

    #[test]
    fn test_coverage() {
        for (w, h) in [(64, 64), (100, 37), (9, 9), (1, 200), (257, 129), (6, 12)] {
            for tile in [1, 2, 3, 7, 16, 64, 500] {
                let mut manager = TileManager::new(settings(false, tile, None), 1, 1);
                manager.reset(&BufferParams::new(w, h), 1);
                assert!(manager.next());
                assert!(coverage_ok(&manager), "{w}x{h} tile {tile}");
            }
        }
    }

    #[test]
    fn test_even_split() {
        let mut manager = TileManager::new(settings(false, 32, None), 1, 1);
        manager.reset(&BufferParams::new(100, 32), 1);
        manager.next();
        let widths: Vec<i32> = manager.state.tiles.iter().map(|t| t.w).collect();
        assert_eq!(widths, vec![25, 25, 25, 25]);
    }

    #[test]
    fn test_zero_area() {
        let mut manager = TileManager::new(settings(true, 32, Some(16)), 4, 1);
        manager.reset(&BufferParams::new(0, 64), 4);
        assert!(manager.done());
        assert!(!manager.next());
        assert!(manager.state.tiles.is_empty());
        assert_eq!(manager.state.total_pixel_samples, 0);
    }

    #[test]
    fn test_preserve_tile_device_bands() {
        let mut s = settings(true, 16, None);
        s.preserve_tile_device = true;
        let mut manager = TileManager::new(s, 1, 2);
        manager.reset(&BufferParams::new(32, 32), 1);
        manager.next();
        assert_eq!(manager.state.render_tiles.len(), 2);
        for t in &manager.state.tiles {
            if t.device == 0 {
                assert!(t.y + t.h <= 16);
            } else {
                assert!(t.y >= 16);
            }
        }
        assert!(manager.next_tile(1, TileTypes::PATH_TRACE).is_some());
        assert!(manager.next_tile(5, TileTypes::PATH_TRACE).is_none());
    }

    #[test]
    fn test_tile_order() {
        let mut s = settings(false, 16, None);
        s.tile_order = TileOrder::LeftToRight;
        let mut manager = TileManager::new(s, 1, 1);
        manager.reset(&BufferParams::new(32, 32), 1);
        manager.next();
        let indices: Vec<usize> = std::iter::from_fn(|| manager.next_tile(0, TileTypes::PATH_TRACE)).collect();
        let order: Vec<(i32, i32)> = indices
            .iter()
            .map(|&i| (manager.state.tiles[i].x, manager.state.tiles[i].y))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 16), (16, 0), (16, 16)]);
    }

    #[test]
    fn test_center_first() {
        let mut manager = TileManager::new(settings(false, 10, None), 1, 1);
        manager.reset(&BufferParams::new(30, 30), 1);
        manager.next();
        let first = manager.next_tile(0, TileTypes::PATH_TRACE).unwrap();
        let t = &manager.state.tiles[first];
        assert_eq!((t.x, t.y), (10, 10));
        assert_eq!(t.state, TileState::InFlight);
    }

    #[test]
    fn test_denoise_scheduling() {
        let mut s = settings(false, 8, None);
        s.schedule_denoising = true;
        let mut manager = TileManager::new(s, 1, 1);
        manager.reset(&BufferParams::new(16, 8), 1);
        manager.next();
        assert_eq!(manager.state.tiles.len(), 2);

        let a = manager.next_tile(0, TileTypes::ALL).unwrap();
        assert_eq!(manager.finish_tile(a), FinishedTile { write: false, delete: false });
        assert!(manager.state.denoising_tiles[0].is_empty());
        assert!(manager.may_need_denoise());

        let b = manager.next_tile(0, TileTypes::ALL).unwrap();
        manager.finish_tile(b);
        // Both tiles rendered: both are ready to denoise.
        assert_eq!(manager.state.denoising_tiles[0].len(), 2);
        assert!(manager.next_tile(0, TileTypes::PATH_TRACE).is_none());

        let d0 = manager.next_tile(0, TileTypes::DENOISE).unwrap();
        assert_eq!(manager.finish_tile(d0), FinishedTile { write: true, delete: false });
        let d1 = manager.next_tile(0, TileTypes::DENOISE).unwrap();
        assert_eq!(manager.finish_tile(d1), FinishedTile { write: true, delete: true });
        assert!(!manager.has_tiles());
        assert!(!manager.may_need_denoise());
    }

    #[test]
    fn test_neighbor_index() {
        let mut manager = TileManager::new(settings(false, 10, None), 1, 1);
        manager.reset(&BufferParams::new(30, 20), 1);
        manager.next();
        assert_eq!((manager.state.tiles_x, manager.state.tiles_y), (3, 2));
        assert_eq!(manager.get_neighbor_index(0, 4), Some(0));
        assert_eq!(manager.get_neighbor_index(0, 0), None);
        assert_eq!(manager.get_neighbor_index(0, 8), Some(4));
        assert_eq!(manager.get_neighbor_index(5, 2), None);
        assert_eq!(manager.get_neighbor_index(4, 3), Some(3));
    }

    #[test]
    fn test_total_pixel_samples() {
        let mut manager = TileManager::new(settings(true, 64, Some(16)), 2, 1);
        manager.reset(&BufferParams::new(32, 32), 2);
        // Divider 2 preview level, then 2 full passes.
        assert_eq!(manager.state.total_pixel_samples, 16 * 16 + 2 * 32 * 32);
    }

    #[test]
    fn test_tile_types() {
        assert!(TileTypes::ALL.contains(TileTypes::DENOISE));
        assert!(!TileTypes::PATH_TRACE.contains(TileTypes::DENOISE));
        assert_eq!(TileTypes::ALL.without(TileTypes::DENOISE), TileTypes::PATH_TRACE);
        assert!(!TileTypes::ALL.contains(TileTypes::NONE));
    }
}
