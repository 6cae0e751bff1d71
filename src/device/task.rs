//! Device tasks and their splitting.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::buffers::FilmParams;
use crate::tile::{RenderTile, RenderTileNeighbors};
use super::denoise::DenoiseParams;
use super::kernel::ShaderEvalType;
use super::memory::DevicePtr;
use super::Device;

pub use crate::tile::TileTypes;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTaskType {
    #[default]
    PathTrace,
    Shader,
    FilmConvert,
    /// Tile-source task that only takes denoise tiles.
    Denoise,
}

/// How a direct-region task is cut up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMode {
    /// Horizontal bands of the region.
    #[default]
    Area,
    /// Contiguous ranges of the sample interval, same region.
    Samples,
}

/// Where tile-consuming tasks get their work from. Implemented by the
/// session; devices call it from their worker threads.
pub trait TileSource: Send + Sync {
    /// Fill `tile` with the next unit of work for `device`. False when there
    /// is none left (or the render was cancelled).
    fn acquire_tile(&self, device: &Arc<dyn Device>, tile: &mut RenderTile, tile_types: TileTypes) -> bool;

    /// `pixel_samples` more pixel samples were accumulated into `tile`.
    fn update_progress(&self, tile: Option<&RenderTile>, pixel_samples: u64);

    /// Hand a finished (or abandoned) tile back.
    fn release_tile(&self, device: &Arc<dyn Device>, tile: &mut RenderTile);

    fn get_cancel(&self) -> bool;

    /// Fill in the neighbours of `neighbors.center()` and make their buffers
    /// accessible to `device`.
    fn map_neighbor_tiles(&self, _neighbors: &mut RenderTileNeighbors, _device: &Arc<dyn Device>) {}

    fn unmap_neighbor_tiles(&self, _neighbors: &mut RenderTileNeighbors, _device: &Arc<dyn Device>) {}
}

/// One dispatch to a device.
///
/// Path-trace and denoise tasks with a [`TileSource`] pull tiles until the
/// source runs dry; without one they render the task region directly.
#[derive(Clone)]
pub struct DeviceTask {
    pub task_type: DeviceTaskType,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub offset: i32,
    pub stride: i32,
    /// First sample, or for film conversion the number of samples
    /// accumulated so far.
    pub sample: u32,
    pub num_samples: u32,
    pub pass_stride: usize,
    /// Float offset of the pass film conversion reads.
    pub pass_offset: usize,
    pub buffer: DevicePtr,
    pub rng_state: DevicePtr,
    pub rgba_byte: DevicePtr,
    pub rgba_half: DevicePtr,
    pub shader_input: DevicePtr,
    pub shader_output: DevicePtr,
    pub shader_eval_type: ShaderEvalType,
    pub shader_x: i32,
    pub shader_w: i32,
    pub film: FilmParams,
    pub denoise: DenoiseParams,
    pub tile_types: TileTypes,
    pub split_mode: SplitMode,
    /// Finish the current tile even when cancelled.
    pub must_finish: bool,
    /// The direct region was already cleared for `sample == 0`.
    pub region_cleared: bool,
    pub tile_source: Option<Arc<dyn TileSource>>,
}

impl DeviceTask {
    pub fn new(task_type: DeviceTaskType) -> Self {
        Self {
            task_type,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            offset: 0,
            stride: 0,
            sample: 0,
            num_samples: 1,
            pass_stride: 4,
            pass_offset: 0,
            buffer: 0,
            rng_state: 0,
            rgba_byte: 0,
            rgba_half: 0,
            shader_input: 0,
            shader_output: 0,
            shader_eval_type: ShaderEvalType::default(),
            shader_x: 0,
            shader_w: 0,
            film: FilmParams::default(),
            denoise: DenoiseParams::default(),
            tile_types: if task_type == DeviceTaskType::Denoise {
                TileTypes::DENOISE
            } else {
                TileTypes::PATH_TRACE
            },
            split_mode: SplitMode::Area,
            must_finish: false,
            region_cleared: false,
            tile_source: None,
        }
    }

    pub fn with_region(mut self, x: i32, y: i32, w: i32, h: i32) -> Self {
        self.x = x;
        self.y = y;
        self.w = w;
        self.h = h;
        self
    }

    /// Pulls tiles from a source rather than rendering its own region.
    #[inline]
    pub fn uses_tiles(&self) -> bool {
        self.tile_source.is_some()
            && matches!(self.task_type, DeviceTaskType::PathTrace | DeviceTaskType::Denoise)
    }

    /// Render directly into the task region.
    #[inline]
    pub fn is_direct_path_trace(&self) -> bool {
        self.task_type == DeviceTaskType::PathTrace && self.tile_source.is_none()
    }

    pub fn get_cancel(&self) -> bool {
        self.tile_source.as_ref().is_some_and(|s| s.get_cancel())
    }

    pub fn update_progress(&self, tile: Option<&RenderTile>, pixel_samples: u64) {
        if let Some(source) = &self.tile_source {
            source.update_progress(tile, pixel_samples);
        }
    }

    /// How many pieces [`split`](Self::split) will produce for `num`
    /// requested, with at most `max_size` pixels (or shader points) each
    /// when non-zero.
    pub fn get_subtask_count(&self, num: usize, max_size: usize) -> usize {
        let mut num = num.max(1);
        if max_size != 0 {
            let max_size_num = if self.task_type == DeviceTaskType::Shader {
                (self.shader_w.max(0) as usize).div_ceil(max_size)
            } else {
                let rows = (max_size / self.w.max(1) as usize).max(1);
                (self.h.max(0) as usize).div_ceil(rows)
            };
            num = num.max(max_size_num);
        }

        if self.task_type == DeviceTaskType::Shader {
            num.min(self.shader_w.max(0) as usize)
        } else if self.uses_tiles() {
            num
        } else if self.split_mode == SplitMode::Samples {
            num.min(self.num_samples as usize)
        } else {
            num.min(self.h.max(0) as usize)
        }
    }

    /// Partition into disjoint sub-tasks whose union is this task.
    pub fn split(&self, num: usize, max_size: usize) -> SmallVec<[DeviceTask; 8]> {
        let num = self.get_subtask_count(num, max_size);
        let mut tasks = SmallVec::new();
        if num == 0 {
            return tasks;
        }

        if self.task_type == DeviceTaskType::Shader {
            let step = self.shader_w / num as i32;
            for i in 0..num as i32 {
                let tx = self.shader_x + step * i;
                let tw = if i == num as i32 - 1 { self.shader_x + self.shader_w - tx } else { step };
                let mut task = self.clone();
                task.shader_x = tx;
                task.shader_w = tw;
                tasks.push(task);
            }
        } else if self.uses_tiles() {
            tasks.extend((0..num).map(|_| self.clone()));
        } else if self.split_mode == SplitMode::Samples {
            let step = self.num_samples / num as u32;
            for i in 0..num as u32 {
                let start = self.sample + step * i;
                let count = if i == num as u32 - 1 { self.sample + self.num_samples - start } else { step };
                let mut task = self.clone();
                task.sample = start;
                task.num_samples = count;
                tasks.push(task);
            }
        } else {
            let step = self.h / num as i32;
            for i in 0..num as i32 {
                let ty = self.y + step * i;
                let th = if i == num as i32 - 1 { self.y + self.h - ty } else { step };
                let mut task = self.clone();
                task.y = ty;
                task.h = th;
                tasks.push(task);
            }
        }
        tasks
    }
}

impl fmt::Debug for DeviceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTask")
            .field("type", &self.task_type)
            .field("region", &(self.x, self.y, self.w, self.h))
            .field("samples", &(self.sample..self.sample + self.num_samples))
            .field("shader", &(self.shader_x, self.shader_w))
            .field("buffer", &self.buffer)
            .field("tile_types", &self.tile_types)
            .field("split_mode", &self.split_mode)
            .field("must_finish", &self.must_finish)
            .field("tile_source", &self.tile_source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered_rows(tasks: &[DeviceTask]) -> Vec<i32> {
        let mut rows: Vec<i32> = tasks.iter().flat_map(|t| t.y..t.y + t.h).collect();
        rows.sort();
        rows
    }

    #[test]
    fn test_area_split_conservation() {
        for h in [1, 2, 7, 64, 101] {
            for n in [1, 2, 3, 8, 200] {
                let task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(3, 5, 16, h);
                let parts = task.split(n, 0);
                assert_eq!(parts.len(), n.min(h as usize));
                assert_eq!(covered_rows(&parts), (5..5 + h).collect::<Vec<_>>());
                assert!(parts.iter().all(|t| t.x == 3 && t.w == 16 && t.h > 0));
            }
        }
    }

    #[test]
    fn test_band_layout() {
        let task = DeviceTask::new(DeviceTaskType::FilmConvert).with_region(0, 10, 8, 10);
        let parts = task.split(3, 0);
        let bands: Vec<(i32, i32)> = parts.iter().map(|t| (t.y, t.h)).collect();
        assert_eq!(bands, vec![(10, 3), (13, 3), (16, 4)]);
    }

    #[test]
    fn test_sample_split_conservation() {
        for samples in [1u32, 5, 16, 33] {
            for n in [1, 2, 4, 7, 64] {
                let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 4, 4);
                task.split_mode = SplitMode::Samples;
                task.sample = 10;
                task.num_samples = samples;
                let parts = task.split(n, 0);
                let mut next = 10;
                for p in &parts {
                    assert_eq!(p.sample, next);
                    assert!(p.num_samples > 0);
                    assert_eq!((p.x, p.y, p.w, p.h), (0, 0, 4, 4));
                    next += p.num_samples;
                }
                assert_eq!(next, 10 + samples);
            }
        }
    }

    #[test]
    fn test_shader_split() {
        let mut task = DeviceTask::new(DeviceTaskType::Shader);
        task.shader_x = 100;
        task.shader_w = 10;
        let parts = task.split(4, 0);
        let ranges: Vec<(i32, i32)> = parts.iter().map(|t| (t.shader_x, t.shader_w)).collect();
        assert_eq!(ranges, vec![(100, 2), (102, 2), (104, 2), (106, 4)]);
    }

    #[test]
    fn test_max_size_raises_count() {
        let task = DeviceTask::new(DeviceTaskType::FilmConvert).with_region(0, 0, 10, 100);
        // 10 rows per piece.
        assert_eq!(task.get_subtask_count(2, 100), 10);
        assert_eq!(task.split(2, 100).len(), 10);
    }

    #[test]
    fn test_empty_region() {
        let task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 16, 0);
        assert!(task.split(4, 0).is_empty());
    }

    #[test]
    fn test_default_tile_types() {
        assert_eq!(DeviceTask::new(DeviceTaskType::PathTrace).tile_types, TileTypes::PATH_TRACE);
        assert_eq!(DeviceTask::new(DeviceTaskType::Denoise).tile_types, TileTypes::DENOISE);
    }
}
