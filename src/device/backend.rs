//! Memory and kernel execution shared by the CPU and accelerator devices.
//!
//! Both backends keep their allocations in a [`MemoryArena`]; they differ
//! in pointer space, memory limit, how unallocated reads degrade and how a
//! sample is launched.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec4;
use half::f16;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::buffers::{film_map_byte, film_map_half};
use crate::tile::{RenderTile, RenderTileNeighbors};
use crate::util::{Error, Stats};
use super::arena::{block_bytes, block_bytes_mut, block_floats_mut, MemoryArena};
use super::denoise::{filter_region, DenoiseParams, Window};
use super::kernel::{Kernel, KernelGlobals, RequestedFeatures, Texture};
use super::memory::{row_span, DeviceMemory, DevicePtr, Extension, Interpolation};
use super::task::DeviceTask;
use super::{DeviceId, DeviceInfo, ErrorState};

/// How one sample of a tile is launched.
#[derive(Clone, Copy)]
pub(crate) enum Launch<'a> {
    /// Pixel by pixel on the calling thread.
    Serial,
    /// One work item per tile row on a dedicated pool.
    Rows(&'a rayon::ThreadPool),
}

pub(crate) struct LocalBackend {
    pub id: DeviceId,
    pub info: DeviceInfo,
    pub stats: Stats,
    pub error: ErrorState,
    pub arena: MemoryArena,
    kernel: Arc<dyn Kernel>,
    globals: RwLock<Arc<KernelGlobals>>,
    textures: Mutex<HashMap<DevicePtr, String>>,
    /// Reads of unallocated memory zero the host copy instead of leaving it.
    zero_fill_unallocated: bool,
}

impl LocalBackend {
    pub fn new(info: DeviceInfo, kernel: Arc<dyn Kernel>, zero_fill_unallocated: bool) -> Self {
        let id = DeviceId::next();
        Self {
            id,
            info,
            stats: Stats::new(),
            error: ErrorState::default(),
            // Disjoint pointer ranges per device.
            arena: MemoryArena::new(id.get() << 40),
            kernel,
            globals: RwLock::new(Arc::new(KernelGlobals::new())),
            textures: Mutex::new(HashMap::new()),
            zero_fill_unallocated,
        }
    }

    /// Snapshot of constants and textures for one task.
    pub fn globals(&self) -> Arc<KernelGlobals> {
        self.globals.read().clone()
    }

    pub fn set_error(&self, msg: &str) {
        self.error.set(msg);
    }

    pub fn load_kernels(&self, features: &RequestedFeatures) -> bool {
        if self.error.is_set() {
            return false;
        }
        match self.kernel.load(features) {
            Ok(()) => {
                tracing::debug!(device = %self.info.description, kernel = self.kernel.name(), "kernels loaded");
                true
            }
            Err(e) => {
                self.set_error(&e.to_string());
                false
            }
        }
    }

    pub fn mem_alloc(&self, mem: &mut DeviceMemory) {
        if self.error.is_set() {
            return;
        }
        let size = mem.memory_size();
        let existing = self.arena.get(mem.device_pointer).map(|b| b.size);

        if let Some(limit) = self.info.memory_limit {
            let used = self.stats.mem_used().saturating_sub(existing.unwrap_or(0));
            if used + size > limit {
                let err = Error::OutOfMemory { requested: size, available: limit.saturating_sub(used) };
                self.set_error(&format!("{} ({}, \"{}\")", err, self.info.description, mem.name()));
                return;
            }
        }

        if existing.is_some() {
            if let Some(old) = self.arena.realloc(mem.device_pointer, size) {
                self.stats.mem_free(old);
                self.stats.mem_alloc(size);
                mem.device_size = size;
                return;
            }
        }

        mem.device_pointer = self.arena.alloc(size);
        mem.device_size = size;
        self.stats.mem_alloc(size);
        tracing::trace!(name = mem.name(), size, ptr = mem.device_pointer, "mem_alloc");
    }

    pub fn mem_copy_to(&self, mem: &mut DeviceMemory) {
        if self.error.is_set() {
            return;
        }
        if self.arena.get(mem.device_pointer).is_none() {
            self.mem_alloc(mem);
        }
        let Some(block) = self.arena.get(mem.device_pointer) else {
            return;
        };
        let size = block.size.min(mem.memory_size());
        let mut data = block.data.lock();
        block_bytes_mut(&mut data, block.size)[..size].copy_from_slice(&mem.host_bytes()[..size]);
    }

    pub fn mem_copy_from(&self, mem: &mut DeviceMemory, y: usize, w: usize, h: usize, elem: usize) {
        let Some(block) = self.arena.get(mem.device_pointer) else {
            if self.zero_fill_unallocated {
                let limit = mem.memory_size();
                let (offset, size) = row_span(y, w, h, elem, limit);
                mem.host_bytes_mut()[offset..offset + size].fill(0);
            }
            return;
        };
        if self.error.is_set() {
            return;
        }
        let limit = block.size.min(mem.memory_size());
        let (offset, size) = row_span(y, w, h, elem, limit);
        let data = block.data.lock();
        mem.host_bytes_mut()[offset..offset + size]
            .copy_from_slice(&block_bytes(&data, block.size)[offset..offset + size]);
    }

    pub fn mem_zero(&self, mem: &mut DeviceMemory) {
        if self.error.is_set() {
            return;
        }
        mem.zero_host();
        if let Some(block) = self.arena.get(mem.device_pointer) {
            block.data.lock().fill(0);
        }
    }

    pub fn mem_free(&self, mem: &mut DeviceMemory) {
        if mem.device_pointer == 0 {
            return;
        }
        if let Some(size) = self.arena.free(mem.device_pointer) {
            self.stats.mem_free(size);
        }
        if let Some(name) = self.textures.lock().remove(&mem.device_pointer) {
            Arc::make_mut(&mut *self.globals.write()).remove_texture(&name);
        }
        mem.device_pointer = 0;
        mem.device_size = 0;
    }

    pub fn const_copy_to(&self, name: &str, data: &[u8]) {
        if self.error.is_set() {
            return;
        }
        Arc::make_mut(&mut *self.globals.write()).set_constant(name, data);
    }

    pub fn tex_alloc(&self, name: &str, mem: &mut DeviceMemory, interpolation: Interpolation, extension: Extension) {
        self.mem_alloc(mem);
        self.mem_copy_to(mem);
        if self.error.is_set() || !mem.is_allocated() {
            return;
        }
        let bytes = mem.host_bytes();
        let mut words = vec![0u32; bytes.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        let texture = Texture::new(
            mem.data_type,
            mem.data_elements,
            mem.data_width,
            mem.data_height,
            interpolation,
            extension,
            Arc::new(words),
            bytes.len(),
        );
        Arc::make_mut(&mut *self.globals.write()).set_texture(name, texture);
        self.textures.lock().insert(mem.device_pointer, name.to_string());
    }

    /// Zero a direct path-trace region before its first sample.
    pub fn clear_region(&self, task: &DeviceTask) {
        let Some(block) = self.arena.get(task.buffer) else {
            return;
        };
        let ps = task.pass_stride.max(1);
        let mut data = block.data.lock();
        let floats = block_floats_mut(&mut data);
        for y in task.y..task.y + task.h {
            let start = (task.offset + task.x + y * task.stride) as usize * ps;
            let end = start + task.w.max(0) as usize * ps;
            if let Some(row) = floats.get_mut(start..end) {
                row.fill(0.0);
            }
        }
    }

    /// Accumulate `tile`'s remaining samples into its buffer.
    ///
    /// Each sample renders into a zeroed tile-local scratch which is then
    /// added to device memory under the allocation lock, so concurrent
    /// workers on disjoint tiles or disjoint sample ranges never race.
    #[allow(clippy::too_many_arguments)]
    pub fn path_trace_tile(
        &self,
        kg: &KernelGlobals,
        tile: &mut RenderTile,
        launch: Launch<'_>,
        clear: bool,
        must_finish: bool,
        stop: &dyn Fn() -> bool,
        on_sample: &mut dyn FnMut(&RenderTile),
    ) {
        let (w, h) = (tile.w.max(0) as usize, tile.h.max(0) as usize);
        if w == 0 || h == 0 {
            return;
        }
        let Some(buffer) = self.arena.get(tile.buffer) else {
            self.set_error(&format!(
                "Path trace: buffer {:#x} is not allocated on {}",
                tile.buffer, self.info.description
            ));
            return;
        };
        let ps = tile.pass_stride.max(1);
        let (tx, ty, offset, stride) = (tile.x, tile.y, tile.offset, tile.stride);
        let row_start = move |row: usize| (offset + tx + (ty + row as i32) * stride) as usize;
        if offset + tx + ty * stride < 0 || (row_start(h - 1) + w) * ps * 4 > buffer.size {
            self.set_error(&format!("Path trace: tile {:?} outside buffer {:#x}", tile.rect(), tile.buffer));
            return;
        }

        if clear {
            let mut data = buffer.data.lock();
            let floats = block_floats_mut(&mut data);
            for row in 0..h {
                let start = row_start(row) * ps;
                floats[start..start + w * ps].fill(0.0);
            }
        }

        let rng_block = self.arena.get(tile.rng_state);
        let mut rng = vec![0u32; w * h];
        match &rng_block {
            Some(block) => {
                let data = block.data.lock();
                for row in 0..h {
                    let start = row_start(row);
                    if let Some(src) = data.get(start..start + w) {
                        rng[row * w..(row + 1) * w].copy_from_slice(src);
                    }
                }
            }
            None => {
                for (i, seed) in rng.iter_mut().enumerate() {
                    let x = tx + (i % w) as i32;
                    let y = ty + (i / w) as i32;
                    *seed = lookup3::hash_uint2(x as u32, y as u32);
                }
            }
        }

        let kernel = self.kernel.as_ref();
        let mut scratch = vec![0.0f32; w * h * ps];
        let end_sample = tile.start_sample + tile.num_samples;
        let mut sample = tile.sample.max(tile.start_sample);

        while sample < end_sample {
            if !must_finish && stop() {
                break;
            }
            scratch.fill(0.0);
            match launch {
                Launch::Serial => {
                    let offset = -(tx + ty * w as i32);
                    for y in 0..h as i32 {
                        for x in 0..w as i32 {
                            kernel.path_trace(kg, &mut scratch, &mut rng, sample, tx + x, ty + y, offset, w as i32);
                        }
                    }
                }
                Launch::Rows(pool) => {
                    pool.install(|| {
                        scratch
                            .par_chunks_mut(w * ps)
                            .zip(rng.par_chunks_mut(w))
                            .enumerate()
                            .for_each(|(row, (buf, rng))| {
                                let y = ty + row as i32;
                                let offset = -(tx + y * w as i32);
                                for x in 0..w as i32 {
                                    kernel.path_trace(kg, buf, rng, sample, tx + x, y, offset, w as i32);
                                }
                            });
                    });
                }
            }

            {
                let mut data = buffer.data.lock();
                let floats = block_floats_mut(&mut data);
                for row in 0..h {
                    let start = row_start(row) * ps;
                    let src = &scratch[row * w * ps..(row + 1) * w * ps];
                    for (dst, s) in floats[start..start + w * ps].iter_mut().zip(src) {
                        *dst += *s;
                    }
                }
            }

            sample += 1;
            tile.sample = sample;
            on_sample(tile);
        }

        if let Some(block) = &rng_block {
            let mut data = block.data.lock();
            for row in 0..h {
                let start = row_start(row);
                if let Some(dst) = data.get_mut(start..start + w) {
                    dst.copy_from_slice(&rng[row * w..(row + 1) * w]);
                }
            }
        }
    }

    /// Convert the task region of the accumulation buffer into display pixels.
    pub fn film_convert(&self, task: &DeviceTask) {
        if self.error.is_set() {
            return;
        }
        let (Some(buffer), Some(rgba)) = (
            self.arena.get(task.buffer),
            self.arena.get(if task.rgba_half != 0 { task.rgba_half } else { task.rgba_byte }),
        ) else {
            self.set_error("Film convert: buffer or display memory not allocated");
            return;
        };
        let scale = 1.0 / task.sample.max(1) as f32;
        let ps = task.pass_stride.max(1);
        let src_words = buffer.data.lock();
        let src: &[f32] = bytemuck::cast_slice(&src_words);
        let mut dst_words = rgba.data.lock();

        for y in task.y..task.y + task.h {
            for x in task.x..task.x + task.w {
                let index = (task.offset + x + y * task.stride) as usize;
                let base = index * ps + task.pass_offset;
                let Some(px) = src.get(base..base + 4) else { continue };
                let px = Vec4::from_slice(px);
                if task.rgba_half != 0 {
                    let dst: &mut [f16] = bytemuck::cast_slice_mut(&mut dst_words);
                    if let Some(out) = dst.get_mut(index * 4..index * 4 + 4) {
                        out.copy_from_slice(&film_map_half(px, scale, &task.film));
                    }
                } else {
                    let dst = block_bytes_mut(&mut dst_words, rgba.size);
                    if let Some(out) = dst.get_mut(index * 4..index * 4 + 4) {
                        out.copy_from_slice(&film_map_byte(px, scale, &task.film));
                    }
                }
            }
        }
    }

    /// Evaluate shader points `[shader_x, shader_x + shader_w)`.
    pub fn shader(&self, kg: &KernelGlobals, task: &DeviceTask, stop: &dyn Fn() -> bool) {
        let (Some(input), Some(output)) = (self.arena.get(task.shader_input), self.arena.get(task.shader_output)) else {
            self.set_error("Shader: input or output memory not allocated");
            return;
        };
        let range = task.shader_x.max(0) as usize..(task.shader_x + task.shader_w).max(0) as usize;
        let inputs: Vec<[u32; 4]> = {
            let data = input.data.lock();
            let items: &[[u32; 4]] = bytemuck::cast_slice(&data[..data.len() / 4 * 4]);
            match items.get(range.clone()) {
                Some(items) => items.to_vec(),
                None => {
                    self.set_error("Shader: range outside input memory");
                    return;
                }
            }
        };
        let mut outputs: Vec<[f32; 4]> = {
            let data = output.data.lock();
            let items: &[[f32; 4]] = bytemuck::cast_slice(&data[..data.len() / 4 * 4]);
            match items.get(range.clone()) {
                Some(items) => items.to_vec(),
                None => {
                    self.set_error("Shader: range outside output memory");
                    return;
                }
            }
        };

        for sample in task.sample..task.sample + task.num_samples {
            if stop() {
                break;
            }
            for (inp, out) in inputs.iter().zip(outputs.iter_mut()) {
                self.kernel.shader(kg, *inp, out, task.shader_eval_type, sample);
            }
        }

        let mut data = output.data.lock();
        let len = data.len() / 4 * 4;
        let items: &mut [[f32; 4]] = bytemuck::cast_slice_mut(&mut data[..len]);
        items[range].copy_from_slice(&outputs);
    }

    /// Filter the centre tile of `neighbors` into `neighbors.target`.
    pub fn denoise(&self, neighbors: &RenderTileNeighbors, params: &DenoiseParams) {
        let center = neighbors.center().rect();
        let window_rect = center
            .expand(params.radius.max(0))
            .intersect(&neighbors.bounds())
            .unwrap_or(center);
        let mut window = Window::new(window_rect);
        let ps = params.pass_stride.max(1);

        for tile in neighbors.tiles.iter().filter(|t| t.buffer != 0) {
            let Some(overlap) = tile.rect().intersect(&window_rect) else { continue };
            let Some(block) = self.arena.get(tile.buffer) else {
                tracing::warn!(tile = tile.tile_index, "denoise neighbour not resident, skipped");
                continue;
            };
            let data = block.data.lock();
            let floats: &[f32] = bytemuck::cast_slice(&data);
            for y in overlap.y..overlap.bottom() {
                for x in overlap.x..overlap.right() {
                    let base = tile.index(x, y) * ps + params.combined_offset;
                    if let Some(px) = floats.get(base..base + 4) {
                        window.set(x, y, Vec4::from_slice(px));
                    }
                }
            }
        }

        let filtered = filter_region(&window, center, params);
        let target = &neighbors.target;
        let Some(block) = self.arena.get(target.buffer) else {
            self.set_error("Denoise: target buffer not allocated");
            return;
        };
        let mut data = block.data.lock();
        let floats = block_floats_mut(&mut data);
        let offset = params.output_offset();
        let mut i = 0;
        for y in center.y..center.bottom() {
            for x in center.x..center.right() {
                let base = target.index(x, y) * ps + offset;
                if let Some(dst) = floats.get_mut(base..base + 4) {
                    dst.copy_from_slice(&filtered[i].to_array());
                }
                i += 1;
            }
        }
    }

    /// Release every allocation, for device teardown.
    pub fn free_all(&self) {
        let freed = self.arena.clear();
        self.stats.mem_free(freed);
        self.textures.lock().clear();
    }
}

/// Tile equivalent of a direct path-trace task.
pub(crate) fn task_tile(task: &DeviceTask) -> RenderTile {
    RenderTile {
        x: task.x,
        y: task.y,
        w: task.w,
        h: task.h,
        start_sample: task.sample,
        num_samples: task.num_samples,
        sample: task.sample,
        resolution: 1,
        offset: task.offset,
        stride: task.stride,
        pass_stride: task.pass_stride,
        buffer: task.buffer,
        rng_state: task.rng_state,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::kernel::ConstantKernel;
    use crate::device::memory::{DataType, MemoryType};

    fn backend(limit: Option<usize>, zero_fill: bool) -> LocalBackend {
        let info = DeviceInfo { memory_limit: limit, ..DeviceInfo::cpu(1) };
        LocalBackend::new(info, Arc::new(ConstantKernel::new([1.0; 4])), zero_fill)
    }

    #[test]
    fn test_unallocated_copy_from() {
        let mut mem = DeviceMemory::floats("m", 1);
        mem.resize(4, 0);
        mem.host_mut::<f32>().fill(7.0);

        backend(None, false).mem_copy_from(&mut mem, 0, 4, 1, 4);
        assert_eq!(mem.host::<f32>(), &[7.0; 4]);

        backend(None, true).mem_copy_from(&mut mem, 0, 4, 1, 4);
        assert_eq!(mem.host::<f32>(), &[0.0; 4]);
    }

    #[test]
    fn test_memory_limit() {
        let b = backend(Some(64), false);
        let mut small = DeviceMemory::floats("small", 1);
        small.resize(8, 0);
        b.mem_alloc(&mut small);
        assert!(small.is_allocated());

        let mut big = DeviceMemory::floats("big", 1);
        big.resize(16, 0);
        b.mem_alloc(&mut big);
        assert!(!big.is_allocated());
        assert!(b.error.message().contains("Out of memory"));

        // Sticky: later allocations are ignored, frees still work.
        let mut tiny = DeviceMemory::floats("tiny", 1);
        tiny.resize(1, 0);
        b.mem_alloc(&mut tiny);
        assert!(!tiny.is_allocated());
        b.mem_free(&mut small);
        assert_eq!(b.stats.mem_used(), 0);
    }

    #[test]
    fn test_textures_follow_memory() {
        let b = backend(None, false);
        let mut mem = DeviceMemory::new("lut", MemoryType::Texture, DataType::Float, 1);
        mem.copy_from_slice(&[0.5f32, 1.5]);
        b.tex_alloc("lut", &mut mem, Interpolation::Closest, Extension::Clip);
        let kg = b.globals();
        let tex = kg.texture("lut").unwrap();
        assert_eq!(tex.data::<f32>(), &[0.5, 1.5]);
        assert_eq!(tex.interpolation, Interpolation::Closest);

        b.mem_free(&mut mem);
        assert!(b.globals().texture("lut").is_none());
        // The earlier snapshot is unaffected.
        assert!(kg.texture("lut").is_some());
    }

    fn tile_buffer(b: &LocalBackend, w: i32, h: i32) -> (DeviceMemory, RenderTile) {
        let mut mem = DeviceMemory::floats("buffer", 1);
        mem.resize((w * h * 4) as usize, 0);
        b.mem_alloc(&mut mem);
        let tile = RenderTile {
            w,
            h,
            num_samples: 3,
            stride: w,
            pass_stride: 4,
            buffer: mem.device_pointer,
            ..Default::default()
        };
        (mem, tile)
    }

    #[test]
    fn test_path_trace_serial_and_rows_agree() {
        let b = backend(None, false);
        let kg = b.globals();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        for launch in [Launch::Serial, Launch::Rows(&pool)] {
            let (mut mem, mut tile) = tile_buffer(&b, 5, 3);
            let mut samples = 0;
            b.path_trace_tile(&kg, &mut tile, launch, true, false, &|| false, &mut |_| samples += 1);
            assert_eq!(samples, 3);
            assert_eq!(tile.sample, 3);
            b.mem_copy_from(&mut mem, 0, 15, 1, 16);
            assert!(mem.host::<f32>().iter().all(|&v| v == 3.0));
        }
    }

    #[test]
    fn test_path_trace_stops_between_samples() {
        let b = backend(None, false);
        let kg = b.globals();
        let (mut mem, mut tile) = tile_buffer(&b, 2, 2);
        let count = std::cell::Cell::new(0);
        let stop = || count.get() >= 1;
        b.path_trace_tile(&kg, &mut tile, Launch::Serial, true, false, &stop, &mut |_| count.set(count.get() + 1));
        assert_eq!(tile.sample, 1);
        b.mem_copy_from(&mut mem, 0, 4, 1, 16);
        assert!(mem.host::<f32>().iter().all(|&v| v == 1.0));

        // must_finish ignores the stop request.
        let mut tile2 = tile.clone();
        tile2.sample = 0;
        b.path_trace_tile(&kg, &mut tile2, Launch::Serial, true, true, &|| true, &mut |_| {});
        assert_eq!(tile2.sample, 3);
    }

    #[test]
    fn test_film_convert_byte() {
        let b = backend(None, false);
        let (mut mem, _) = tile_buffer(&b, 2, 1);
        mem.host_mut::<f32>().copy_from_slice(&[2.0, 0.0, 0.0, 2.0, 0.0, 2.0, 0.0, 2.0]);
        b.mem_copy_to(&mut mem);

        let mut rgba = DeviceMemory::new("rgba", MemoryType::Pixels, DataType::Uchar, 4);
        rgba.resize(2, 1);
        b.mem_alloc(&mut rgba);

        let mut task = DeviceTask::new(super::super::task::DeviceTaskType::FilmConvert).with_region(0, 0, 2, 1);
        task.stride = 2;
        task.sample = 2;
        task.buffer = mem.device_pointer;
        task.rgba_byte = rgba.device_pointer;
        b.film_convert(&task);
        b.mem_copy_from(&mut rgba, 0, 2, 1, 4);
        assert_eq!(rgba.host::<u8>(), &[255, 0, 0, 255, 0, 255, 0, 255]);
    }
}
