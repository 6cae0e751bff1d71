//! Host CPU device.
//!
//! Memory lives in a host arena; tasks are split into one piece per worker
//! thread and pushed onto a rayon pool. Each piece either renders its slice
//! directly or keeps pulling tiles from the session until none are left.

use std::sync::{Arc, Weak};

use crate::tile::{RenderTile, RenderTileNeighbors, RenderTileTask};
use crate::util::Stats;
use super::backend::{task_tile, Launch, LocalBackend};
use super::kernel::{ConstantKernel, Kernel, KernelGlobals, RequestedFeatures};
use super::memory::{DeviceMemory, Extension, Interpolation};
use super::task::{DeviceTask, DeviceTaskType};
use super::task_pool::TaskPool;
use super::{Device, DeviceId, DeviceInfo};

pub struct CpuDevice {
    backend: LocalBackend,
    pool: Option<Arc<TaskPool>>,
    this: Weak<CpuDevice>,
}

impl CpuDevice {
    pub fn new(info: DeviceInfo, kernel: Arc<dyn Kernel>) -> Arc<Self> {
        let threads = match info.cpu_threads {
            0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        Arc::new_cyclic(|this: &Weak<CpuDevice>| {
            let backend = LocalBackend::new(info, kernel, false);
            let owner = this.clone();
            let on_panic = Box::new(move |msg: &str| {
                if let Some(device) = owner.upgrade() {
                    device.backend.set_error(msg);
                }
            });
            let pool = match TaskPool::new(threads, "cpu", on_panic) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    backend.set_error(&e.to_string());
                    None
                }
            };
            tracing::debug!(device = %backend.id, threads, "CPU device created");
            Self { backend, pool, this: this.clone() }
        })
    }

    /// CPU device with `threads` workers running the diagnostic
    /// [`ConstantKernel`] (adds white every sample).
    pub fn with_threads(threads: usize) -> Arc<Self> {
        Self::new(DeviceInfo::cpu(threads), Arc::new(ConstantKernel::new([1.0; 4])))
    }

    pub fn num_threads(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.num_threads())
    }

    fn thread_run(self: &Arc<Self>, task: &DeviceTask, pool: &TaskPool) {
        let kg = self.backend.globals();
        let stop = || pool.canceled() || task.get_cancel();
        match task.task_type {
            DeviceTaskType::PathTrace | DeviceTaskType::Denoise if task.uses_tiles() => {
                self.thread_tiles(&kg, task, pool);
            }
            DeviceTaskType::PathTrace => {
                let mut tile = task_tile(task);
                let clear = task.sample == 0 && !task.region_cleared;
                self.backend.path_trace_tile(&kg, &mut tile, Launch::Serial, clear, task.must_finish, &stop, &mut |t| {
                    task.update_progress(Some(t), t.num_pixels());
                });
            }
            DeviceTaskType::Denoise => {
                tracing::warn!("denoise task without a tile source ignored");
            }
            DeviceTaskType::FilmConvert => self.backend.film_convert(task),
            DeviceTaskType::Shader => self.backend.shader(&kg, task, &stop),
        }
    }

    fn thread_tiles(self: &Arc<Self>, kg: &KernelGlobals, task: &DeviceTask, pool: &TaskPool) {
        let Some(source) = &task.tile_source else { return };
        let device: Arc<dyn Device> = self.clone();
        let stop = || pool.canceled() || source.get_cancel();
        let mut tile = RenderTile::default();

        while source.acquire_tile(&device, &mut tile, task.tile_types) {
            match tile.task {
                RenderTileTask::PathTrace => {
                    let clear = tile.start_sample == 0;
                    self.backend.path_trace_tile(kg, &mut tile, Launch::Serial, clear, task.must_finish, &stop, &mut |t| {
                        source.update_progress(Some(t), t.num_pixels());
                    });
                }
                RenderTileTask::Denoise => {
                    let mut neighbors = RenderTileNeighbors::new(tile.clone());
                    source.map_neighbor_tiles(&mut neighbors, &device);
                    self.backend.denoise(&neighbors, &task.denoise);
                    source.unmap_neighbor_tiles(&mut neighbors, &device);
                    source.update_progress(Some(&tile), 0);
                }
            }
            source.release_tile(&device, &mut tile);

            if pool.canceled() || (source.get_cancel() && !task.must_finish) {
                break;
            }
        }
    }
}

impl Device for CpuDevice {
    fn id(&self) -> DeviceId {
        self.backend.id
    }

    fn info(&self) -> &DeviceInfo {
        &self.backend.info
    }

    fn stats(&self) -> &Stats {
        &self.backend.stats
    }

    fn error_message(&self) -> String {
        self.backend.error.message()
    }

    fn set_error(&self, msg: &str) {
        self.backend.set_error(msg);
    }

    fn load_kernels(&self, features: &RequestedFeatures) -> bool {
        self.backend.load_kernels(features)
    }

    fn mem_alloc(&self, mem: &mut DeviceMemory) {
        self.backend.mem_alloc(mem);
    }

    fn mem_copy_to(&self, mem: &mut DeviceMemory) {
        self.backend.mem_copy_to(mem);
    }

    fn mem_copy_from(&self, mem: &mut DeviceMemory, y: usize, w: usize, h: usize, elem: usize) {
        self.backend.mem_copy_from(mem, y, w, h, elem);
    }

    fn mem_zero(&self, mem: &mut DeviceMemory) {
        self.backend.mem_zero(mem);
    }

    fn mem_free(&self, mem: &mut DeviceMemory) {
        self.backend.mem_free(mem);
    }

    fn const_copy_to(&self, name: &str, data: &[u8]) {
        self.backend.const_copy_to(name, data);
    }

    fn tex_alloc(&self, name: &str, mem: &mut DeviceMemory, interpolation: Interpolation, extension: Extension) {
        self.backend.tex_alloc(name, mem, interpolation, extension);
    }

    fn task_add(&self, mut task: DeviceTask) {
        if self.backend.error.is_set() {
            return;
        }
        let (Some(pool), Some(this)) = (&self.pool, self.this.upgrade()) else {
            return;
        };
        if task.is_direct_path_trace() && task.sample == 0 && !task.region_cleared {
            self.backend.clear_region(&task);
            task.region_cleared = true;
        }
        let pieces = task.split(self.get_split_task_count(&task), 0);
        tracing::trace!(device = %self.backend.id, ?task, pieces = pieces.len(), "task_add");
        for piece in pieces {
            let device = Arc::clone(&this);
            let worker_pool = Arc::clone(pool);
            pool.push(move || device.thread_run(&piece, &worker_pool));
        }
    }

    fn task_wait(&self) {
        if let Some(pool) = &self.pool {
            pool.wait();
        }
    }

    fn task_cancel(&self) {
        if let Some(pool) = &self.pool {
            pool.cancel();
        }
    }

    fn get_split_task_count(&self, _task: &DeviceTask) -> usize {
        self.num_threads().max(1)
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            // The last handle can be released by one of our own jobs.
            if !pool.on_worker() {
                pool.cancel();
            }
        }
        self.backend.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_buffer(device: &CpuDevice, w: i32, h: i32) -> DeviceMemory {
        let mut mem = DeviceMemory::floats("buffer", 4);
        mem.resize((w * h) as usize, 0);
        device.mem_alloc(&mut mem);
        device.mem_zero(&mut mem);
        mem
    }

    #[test]
    fn test_direct_path_trace_split_over_threads() {
        let device = CpuDevice::with_threads(4);
        assert_eq!(device.num_threads(), 4);
        let mut mem = region_buffer(&device, 16, 9);

        let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 16, 9);
        task.stride = 16;
        task.num_samples = 2;
        task.buffer = mem.device_pointer;
        device.task_add(task);
        device.task_wait();

        device.mem_copy_from(&mut mem, 0, 16, 9, 16);
        assert!(mem.host::<f32>().iter().all(|&v| v == 2.0));
        assert!(!device.have_error());
    }

    #[test]
    fn test_sample_split_accumulates() {
        let device = CpuDevice::with_threads(3);
        let mut mem = region_buffer(&device, 4, 4);
        // Stale data is cleared for sample 0.
        mem.host_mut::<f32>().fill(9.0);
        device.mem_copy_to(&mut mem);

        let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 4, 4);
        task.stride = 4;
        task.num_samples = 7;
        task.split_mode = crate::device::SplitMode::Samples;
        task.buffer = mem.device_pointer;
        device.task_add(task);
        device.task_wait();

        device.mem_copy_from(&mut mem, 0, 4, 4, 16);
        assert!(mem.host::<f32>().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_errors_are_sticky() {
        let device = CpuDevice::with_threads(1);
        device.set_error("first");
        device.set_error("second");
        assert_eq!(device.error_message(), "first");

        let mut mem = DeviceMemory::floats("after", 1);
        mem.resize(4, 0);
        device.mem_alloc(&mut mem);
        assert!(!mem.is_allocated());
        assert!(!device.load_kernels(&RequestedFeatures::default()));
    }

    #[test]
    fn test_free_is_idempotent() {
        let device = CpuDevice::with_threads(1);
        let mut mem = DeviceMemory::floats("mem", 1);
        mem.resize(1024, 0);
        device.mem_alloc(&mut mem);
        assert_eq!(device.stats().mem_used(), 4096);
        device.mem_free(&mut mem);
        device.mem_free(&mut mem);
        assert_eq!(device.stats().mem_used(), 0);
        assert!(!mem.is_allocated());
    }

    #[test]
    fn test_realloc_keeps_pointer() {
        let device = CpuDevice::with_threads(1);
        let mut mem = DeviceMemory::floats("mem", 1);
        mem.resize(16, 0);
        device.mem_alloc(&mut mem);
        let ptr = mem.device_pointer;
        mem.resize(32, 0);
        device.mem_alloc(&mut mem);
        assert_eq!(mem.device_pointer, ptr);
        assert_eq!(device.stats().mem_used(), 128);
    }

    #[test]
    fn test_cancel_returns() {
        let device = CpuDevice::with_threads(2);
        let mut mem = region_buffer(&device, 64, 64);
        let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 64, 64);
        task.stride = 64;
        task.num_samples = 100_000;
        task.buffer = mem.device_pointer;
        device.task_add(task);
        device.task_cancel();
        device.task_wait();
        // Partial result, but whole samples only.
        device.mem_copy_from(&mut mem, 0, 64, 64, 16);
        let first = mem.host::<f32>()[0];
        assert!(first < 100_000.0);
        assert_eq!(first.fract(), 0.0);
    }
}
