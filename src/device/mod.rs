//! Compute devices.
//!
//! A [`Device`] hides one memory space and one way of executing kernels.
//! Backends:
//! - [`CpuDevice`]: rayon worker pool over host memory
//! - [`AcceleratorDevice`]: separate memory arena, one execution stream
//! - [`MultiDevice`]: fans one logical device out over several others
//! - [`NetworkDevice`]: the same interface tunnelled over TCP
//!
//! Devices report runtime failures through a sticky error message rather
//! than `Err`: once set, allocation, copies and task submission become
//! no-ops so the first failure is the one reported.

mod arena;
mod backend;
pub mod cpu;
pub mod denoise;
pub mod kernel;
pub mod memory;
pub mod multi;
pub mod registry;
pub mod task;
mod task_pool;

#[cfg(feature = "accelerator")]
pub mod accelerator;
#[cfg(feature = "network")]
pub mod network;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use half::f16;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tile::{RenderTile, RenderTileNeighbors};
use crate::util::Stats;

pub use cpu::CpuDevice;
pub use denoise::DenoiseParams;
pub use kernel::{ConstantKernel, Kernel, KernelGlobals, RequestedFeatures, ShaderEvalType, Texture};
pub use memory::{DataType, DeviceMemory, DevicePtr, Extension, Interpolation, MemoryType};
pub use multi::MultiDevice;
pub use registry::{DeviceRegistry, RegistryConfig};
pub use task::{DeviceTask, DeviceTaskType, SplitMode, TileSource, TileTypes};

#[cfg(feature = "accelerator")]
pub use accelerator::AcceleratorDevice;
#[cfg(feature = "network")]
pub use network::{DeviceServer, NetworkDevice};

/// Process-unique device identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Cpu,
    Accelerator,
    Network,
    Multi,
}

impl DeviceType {
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Accelerator => "ACCELERATOR",
            DeviceType::Network => "NETWORK",
            DeviceType::Multi => "MULTI",
        }
    }
}

/// Static description used to create a device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub description: String,
    /// Stable identifier, e.g. `CPU` or `ACCEL_0`.
    pub id: String,
    pub num: usize,
    /// Drawn through pixel interop; sessions on such a device defer tonemapping
    /// to the draw thread.
    pub display_device: bool,
    /// Worker threads for CPU devices, 0 = all cores.
    pub cpu_threads: usize,
    /// Memory budget in bytes, `None` = unlimited.
    pub memory_limit: Option<usize>,
    /// `host:port` of a render server.
    pub address: Option<String>,
    pub multi_devices: Vec<DeviceInfo>,
    /// Devices used only to denoise.
    pub denoising_devices: Vec<DeviceInfo>,
}

impl DeviceInfo {
    pub fn cpu(threads: usize) -> Self {
        Self {
            device_type: DeviceType::Cpu,
            description: "CPU".into(),
            id: "CPU".into(),
            cpu_threads: threads,
            ..Default::default()
        }
    }

    /// Combine several devices into one multi device description. A single
    /// device without denoisers is returned unchanged.
    pub fn multi(subdevices: Vec<DeviceInfo>, denoising: Vec<DeviceInfo>) -> Self {
        if subdevices.len() == 1 && denoising.is_empty() {
            if let Some(only) = subdevices.into_iter().next() {
                return only;
            }
            return Self::default();
        }
        let description = subdevices
            .iter()
            .map(|d| d.description.as_str())
            .collect::<Vec<_>>()
            .join(" + ");
        let id = subdevices.iter().map(|d| d.id.as_str()).collect::<Vec<_>>().join("_");
        Self {
            device_type: DeviceType::Multi,
            description,
            id: format!("MULTI_{id}"),
            display_device: subdevices.iter().any(|d| d.display_device),
            multi_devices: subdevices,
            denoising_devices: denoising,
            ..Default::default()
        }
    }
}

/// Sticky first-error slot shared by all backends.
#[derive(Debug, Default)]
pub struct ErrorState {
    message: Mutex<Option<String>>,
}

impl ErrorState {
    /// Record `msg` unless an error is already set.
    pub fn set(&self, msg: &str) {
        let mut slot = self.message.lock();
        if slot.is_none() {
            tracing::error!("{msg}");
            *slot = Some(msg.to_string());
        }
    }

    pub fn is_set(&self) -> bool {
        self.message.lock().is_some()
    }

    pub fn message(&self) -> String {
        self.message.lock().clone().unwrap_or_default()
    }
}

/// Pixels handed to a [`DrawTarget`].
#[derive(Clone, Copy, Debug)]
pub enum DrawPixels<'a> {
    Byte(&'a [u8]),
    Half(&'a [f16]),
}

/// Placement of a draw: source size and destination rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DrawRegion {
    pub width: i32,
    pub height: i32,
    pub dx: i32,
    pub dy: i32,
    pub dw: i32,
    pub dh: i32,
    pub transparent: bool,
}

/// Host graphics context hooks. Only called from the thread owning it.
pub trait DrawTarget {
    fn bind(&mut self) {}
    fn draw(&mut self, pixels: DrawPixels<'_>, region: &DrawRegion);
    fn unbind(&mut self) {}
}

/// One memory space plus a way to run kernels in it.
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;
    fn info(&self) -> &DeviceInfo;
    fn stats(&self) -> &Stats;

    /// First recorded runtime error, empty if none.
    fn error_message(&self) -> String;
    fn have_error(&self) -> bool {
        !self.error_message().is_empty()
    }
    fn set_error(&self, msg: &str);

    /// Prepare kernels for `features`. False (and a sticky error) on failure.
    fn load_kernels(&self, features: &RequestedFeatures) -> bool;

    fn mem_alloc(&self, mem: &mut DeviceMemory);
    /// Upload the host copy, allocating first if needed.
    fn mem_copy_to(&self, mem: &mut DeviceMemory);
    /// Copy rows `[y, y + h)` of `w` items of `elem` bytes back to the host.
    fn mem_copy_from(&self, mem: &mut DeviceMemory, y: usize, w: usize, h: usize, elem: usize);
    fn mem_zero(&self, mem: &mut DeviceMemory);
    /// Release `mem`. Freeing an unallocated descriptor is a no-op.
    fn mem_free(&self, mem: &mut DeviceMemory);

    fn const_copy_to(&self, name: &str, data: &[u8]);

    /// Bind `mem` as a sampled texture named `name`.
    fn tex_alloc(&self, name: &str, mem: &mut DeviceMemory, interpolation: Interpolation, extension: Extension) {
        let _ = (name, interpolation, extension);
        self.mem_alloc(mem);
        self.mem_copy_to(mem);
    }

    fn tex_free(&self, mem: &mut DeviceMemory) {
        self.mem_free(mem);
    }

    fn task_add(&self, task: DeviceTask);
    fn task_wait(&self);
    fn task_cancel(&self);

    /// Sub-tasks a task is cut into on this device.
    fn get_split_task_count(&self, _task: &DeviceTask) -> usize {
        1
    }

    /// Independent tile consumers, used to keep tiles on one device across
    /// passes.
    fn num_logical_devices(&self) -> usize {
        1
    }

    /// Index of `sub` among this device's render devices. Denoising-only
    /// devices come after all render devices.
    fn device_number(&self, _sub: &dyn Device) -> usize {
        0
    }

    /// Translate tile buffer pointers into `sub`'s memory space.
    fn map_tile(&self, _sub: &dyn Device, _tile: &mut RenderTile) {}

    /// Make every neighbour buffer accessible to `sub`.
    fn map_neighbor_tiles(&self, sub: &dyn Device, neighbors: &mut RenderTileNeighbors) {
        for tile in neighbors.tiles.iter_mut() {
            self.map_tile(sub, tile);
        }
        self.map_tile(sub, &mut neighbors.target);
    }

    /// Undo [`map_neighbor_tiles`](Self::map_neighbor_tiles).
    fn unmap_neighbor_tiles(&self, _sub: &dyn Device, _neighbors: &mut RenderTileNeighbors) {}

    /// Copy the display rows back and hand them to `target`.
    #[allow(clippy::too_many_arguments)]
    fn draw_pixels(
        &self,
        rgba: &mut DeviceMemory,
        y: i32,
        w: i32,
        h: i32,
        region: &DrawRegion,
        target: &mut dyn DrawTarget,
    ) {
        let (y, w, h) = (y.max(0) as usize, w.max(0) as usize, h.max(0) as usize);
        self.mem_copy_from(rgba, y, w, h, rgba.item_size());
        let start = y * w * rgba.data_elements;
        let end = start + w * h * rgba.data_elements;
        target.bind();
        match rgba.data_type {
            DataType::Half => {
                let pixels = rgba.host::<f16>();
                target.draw(DrawPixels::Half(&pixels[start.min(pixels.len())..end.min(pixels.len())]), region);
            }
            _ => {
                let pixels = rgba.host::<u8>();
                target.draw(DrawPixels::Byte(&pixels[start.min(pixels.len())..end.min(pixels.len())]), region);
            }
        }
        target.unbind();
    }
}

/// Same device, compared by identity.
#[inline]
pub fn same_device(a: &dyn Device, b: &dyn Device) -> bool {
    a.id() == b.id()
}

pub type SharedDevice = Arc<dyn Device>;
