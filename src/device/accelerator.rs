//! Discrete accelerator device.
//!
//! Models a GPU-like device: its own memory space with a fixed budget, and a
//! single in-order execution stream. Tasks are never split; each sample of a
//! tile is launched as one row-parallel grid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::tile::{RenderTile, RenderTileNeighbors, RenderTileTask};
use crate::util::{Error, Stats};
use super::backend::{task_tile, Launch, LocalBackend};
use super::kernel::{Kernel, KernelGlobals, RequestedFeatures};
use super::memory::{DeviceMemory, Extension, Interpolation};
use super::task::{DeviceTask, DeviceTaskType};
use super::{Device, DeviceId, DeviceInfo, DeviceType};

/// Commands for the stream thread.
enum StreamCommand {
    Run(DeviceTask),
    Stop,
}

pub struct AcceleratorDevice {
    backend: LocalBackend,
    grid: Option<rayon::ThreadPool>,
    tx: Mutex<Option<Sender<StreamCommand>>>,
    stream: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
}

impl AcceleratorDevice {
    /// Default memory budget when the description does not set one.
    pub const DEFAULT_MEMORY: usize = 1 << 30;

    pub fn device_info(num: usize) -> DeviceInfo {
        DeviceInfo {
            device_type: DeviceType::Accelerator,
            description: format!("Accelerator {num}"),
            id: format!("ACCEL_{num}"),
            num,
            display_device: true,
            memory_limit: Some(Self::DEFAULT_MEMORY),
            ..Default::default()
        }
    }

    pub fn new(mut info: DeviceInfo, kernel: Arc<dyn Kernel>) -> Arc<Self> {
        if info.memory_limit.is_none() {
            info.memory_limit = Some(Self::DEFAULT_MEMORY);
        }
        let (tx, rx) = channel::<StreamCommand>();

        let device = Arc::new_cyclic(|this: &Weak<AcceleratorDevice>| {
            let backend = LocalBackend::new(info, kernel, true);
            let grid = match rayon::ThreadPoolBuilder::new()
                .thread_name(|i| format!("accel-grid-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    backend.set_error(&Error::DeviceUnavailable(e.to_string()).to_string());
                    None
                }
            };
            let this = this.clone();
            let stream = thread::Builder::new()
                .name(format!("accel-stream-{}", backend.info.num))
                .spawn(move || stream_loop(this, rx));
            let stream = match stream {
                Ok(handle) => Some(handle),
                Err(e) => {
                    backend.set_error(&Error::DeviceUnavailable(e.to_string()).to_string());
                    None
                }
            };
            Self {
                backend,
                grid,
                tx: Mutex::new(Some(tx)),
                stream: Mutex::new(stream),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }
        });
        tracing::debug!(device = %device.backend.id, limit = ?device.backend.info.memory_limit, "accelerator created");
        device
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn canceled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn run(self: &Arc<Self>, task: &DeviceTask) {
        let Some(grid) = &self.grid else { return };
        let kg = self.backend.globals();
        let stop = || self.canceled() || task.get_cancel();
        match task.task_type {
            DeviceTaskType::PathTrace | DeviceTaskType::Denoise if task.uses_tiles() => {
                self.run_tiles(&kg, task, grid);
            }
            DeviceTaskType::PathTrace => {
                let mut tile = task_tile(task);
                let clear = task.sample == 0 && !task.region_cleared;
                self.backend.path_trace_tile(&kg, &mut tile, Launch::Rows(grid), clear, task.must_finish, &stop, &mut |t| {
                    task.update_progress(Some(t), t.num_pixels());
                });
            }
            DeviceTaskType::Denoise => {}
            DeviceTaskType::FilmConvert => self.backend.film_convert(task),
            DeviceTaskType::Shader => self.backend.shader(&kg, task, &stop),
        }
    }

    fn run_tiles(self: &Arc<Self>, kg: &KernelGlobals, task: &DeviceTask, grid: &rayon::ThreadPool) {
        let Some(source) = &task.tile_source else { return };
        let device: Arc<dyn Device> = self.clone();
        let stop = || self.canceled() || source.get_cancel();
        let mut tile = RenderTile::default();

        while source.acquire_tile(&device, &mut tile, task.tile_types) {
            match tile.task {
                RenderTileTask::PathTrace => {
                    let clear = tile.start_sample == 0;
                    self.backend.path_trace_tile(kg, &mut tile, Launch::Rows(grid), clear, task.must_finish, &stop, &mut |t| {
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

            if self.canceled() || (source.get_cancel() && !task.must_finish) || self.backend.error.is_set() {
                break;
            }
        }
    }
}

fn stream_loop(device: Weak<AcceleratorDevice>, rx: Receiver<StreamCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            StreamCommand::Run(task) => {
                let Some(device) = device.upgrade() else { break };
                if !device.canceled() && !device.backend.error.is_set() {
                    device.run(&task);
                }
                device.finish_one();
            }
            StreamCommand::Stop => break,
        }
    }
}

impl Device for AcceleratorDevice {
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
        if task.is_direct_path_trace() && task.sample == 0 && !task.region_cleared {
            self.backend.clear_region(&task);
            task.region_cleared = true;
        }
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else { return };
        *self.pending.lock() += 1;
        if tx.send(StreamCommand::Run(task)).is_err() {
            self.finish_one();
            self.backend.set_error("Accelerator stream thread has exited");
        }
    }

    fn task_wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    fn task_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task_wait();
        self.cancelled.store(false, Ordering::Release);
    }
}

impl Drop for AcceleratorDevice {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(StreamCommand::Stop);
        }
        if let Some(handle) = self.stream.lock().take() {
            // Dropped from the stream thread itself when it held the last handle.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.backend.free_all();
    }
}
