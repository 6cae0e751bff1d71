//! Composite device fanning one logical device out over several others.
//!
//! Memory is allocated on every render sub-device (and on denoising devices
//! when flagged) under one logical key; tasks are split across the render
//! devices with their pointers remapped per device.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tile::{RenderTile, RenderTileNeighbors};
use crate::util::Stats;
use super::kernel::RequestedFeatures;
use super::memory::{row_span, DeviceMemory, DevicePtr, Extension, Interpolation};
use super::task::{DeviceTask, DeviceTaskType, TileTypes};
use super::{Device, DeviceId, DeviceInfo, DeviceType, ErrorState};

/// Logical key to physical pointer, one map per sub-device.
type PtrMap = HashMap<DevicePtr, DevicePtr>;

struct KeyTable {
    next_key: DevicePtr,
    render: Vec<PtrMap>,
    denoise: Vec<PtrMap>,
    sizes: HashMap<DevicePtr, usize>,
}

pub struct MultiDevice {
    id: DeviceId,
    info: DeviceInfo,
    stats: Stats,
    error: ErrorState,
    devices: Vec<Arc<dyn Device>>,
    denoising: Vec<Arc<dyn Device>>,
    /// Also serialises allocation against task submission.
    keys: Mutex<KeyTable>,
}

/// Allocate `key` on `sub`, reusing its existing block. True on success.
fn alloc_on(sub: &dyn Device, mem: &mut DeviceMemory, map: &mut PtrMap, key: DevicePtr, texture: Option<(&str, Interpolation, Extension)>) -> bool {
    let current = map.get(&key).copied().unwrap_or(0);
    let saved = mem.swap_device(current, 0);
    match texture {
        Some((name, interpolation, extension)) => sub.tex_alloc(name, mem, interpolation, extension),
        None => sub.mem_alloc(mem),
    }
    let ptr = mem.device_pointer;
    mem.restore_device(saved);
    if ptr != 0 {
        map.insert(key, ptr);
        true
    } else {
        false
    }
}

/// Run `f` with `mem` pointing at `sub`'s copy of `key`, if it has one.
fn with_sub_pointer(mem: &mut DeviceMemory, map: &PtrMap, key: DevicePtr, f: impl FnOnce(&mut DeviceMemory)) -> bool {
    let Some(&ptr) = map.get(&key) else {
        return false;
    };
    let saved = mem.swap_device(ptr, mem.device_size);
    f(mem);
    mem.restore_device(saved);
    true
}

fn remap(map: &PtrMap, ptr: DevicePtr) -> DevicePtr {
    if ptr == 0 {
        0
    } else {
        map.get(&ptr).copied().unwrap_or(0)
    }
}

fn remap_task(task: &mut DeviceTask, map: &PtrMap) {
    task.buffer = remap(map, task.buffer);
    task.rng_state = remap(map, task.rng_state);
    task.rgba_byte = remap(map, task.rgba_byte);
    task.rgba_half = remap(map, task.rgba_half);
    task.shader_input = remap(map, task.shader_input);
    task.shader_output = remap(map, task.shader_output);
}

impl MultiDevice {
    /// Combine `devices` for rendering and `denoising` for denoise-only work.
    /// CPU devices are moved to the end of the render list.
    pub fn new(mut devices: Vec<Arc<dyn Device>>, denoising: Vec<Arc<dyn Device>>) -> Arc<Self> {
        // Stable: keeps the relative order of non-CPU devices.
        devices.sort_by_key(|d| d.info().device_type == DeviceType::Cpu);

        let mut info = DeviceInfo::multi(
            devices.iter().map(|d| d.info().clone()).collect(),
            denoising.iter().map(|d| d.info().clone()).collect(),
        );
        info.device_type = DeviceType::Multi;

        tracing::info!(
            devices = %info.description,
            denoisers = denoising.len(),
            "multi device created"
        );
        Arc::new(Self {
            id: DeviceId::next(),
            keys: Mutex::new(KeyTable {
                next_key: 0,
                render: vec![PtrMap::new(); devices.len()],
                denoise: vec![PtrMap::new(); denoising.len()],
                sizes: HashMap::new(),
            }),
            info,
            stats: Stats::new(),
            error: ErrorState::default(),
            devices,
            denoising,
        })
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn denoising_devices(&self) -> &[Arc<dyn Device>] {
        &self.denoising
    }

    fn render_index(&self, sub: &dyn Device) -> Option<usize> {
        self.devices.iter().position(|d| d.id() == sub.id())
    }

    fn denoise_index(&self, sub: &dyn Device) -> Option<usize> {
        self.denoising.iter().position(|d| d.id() == sub.id())
    }

    fn all_devices(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.devices.iter().chain(self.denoising.iter())
    }

    fn allocate(&self, mem: &mut DeviceMemory, texture: Option<(&str, Interpolation, Extension)>) {
        if self.have_error() {
            return;
        }
        let mut guard = self.keys.lock();
        let keys = &mut *guard;
        let existing = keys.sizes.contains_key(&mem.device_pointer);
        let key = if existing {
            mem.device_pointer
        } else {
            keys.next_key += 1;
            keys.next_key
        };

        let mut any = false;
        for (sub, map) in self.devices.iter().zip(keys.render.iter_mut()) {
            any |= alloc_on(sub.as_ref(), mem, map, key, texture);
        }
        if mem.shared_with_denoising {
            for (sub, map) in self.denoising.iter().zip(keys.denoise.iter_mut()) {
                any |= alloc_on(sub.as_ref(), mem, map, key, texture);
            }
        }
        if !any && !existing {
            return;
        }

        let size = mem.memory_size();
        if let Some(old) = keys.sizes.insert(key, size) {
            self.stats.mem_free(old);
        }
        self.stats.mem_alloc(size);
        mem.device_pointer = key;
        mem.device_size = size;
    }
}

impl Device for MultiDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Own error first, then the first failing sub-device's.
    fn error_message(&self) -> String {
        let own = self.error.message();
        if !own.is_empty() {
            return own;
        }
        self.all_devices()
            .map(|d| d.error_message())
            .find(|m| !m.is_empty())
            .unwrap_or_default()
    }

    fn set_error(&self, msg: &str) {
        self.error.set(msg);
    }

    fn load_kernels(&self, features: &RequestedFeatures) -> bool {
        if !self.devices.iter().all(|d| d.load_kernels(features)) {
            return false;
        }
        let denoise_features = RequestedFeatures { use_denoising: true, ..features.clone() };
        self.denoising.iter().all(|d| d.load_kernels(&denoise_features))
    }

    fn mem_alloc(&self, mem: &mut DeviceMemory) {
        self.allocate(mem, None);
    }

    fn mem_copy_to(&self, mem: &mut DeviceMemory) {
        if self.have_error() {
            return;
        }
        if !self.keys.lock().sizes.contains_key(&mem.device_pointer) {
            self.mem_alloc(mem);
        }
        let keys = self.keys.lock();
        let key = mem.device_pointer;
        for (sub, map) in self.devices.iter().zip(&keys.render) {
            with_sub_pointer(mem, map, key, |m| sub.mem_copy_to(m));
        }
        for (sub, map) in self.denoising.iter().zip(&keys.denoise) {
            with_sub_pointer(mem, map, key, |m| sub.mem_copy_to(m));
        }
    }

    /// Reads row bands from the render devices, band `i` from device `i`,
    /// matching how tasks and sliced tiles are distributed.
    fn mem_copy_from(&self, mem: &mut DeviceMemory, y: usize, w: usize, h: usize, elem: usize) {
        let keys = self.keys.lock();
        let key = mem.device_pointer;
        if !keys.sizes.contains_key(&key) || self.devices.is_empty() {
            let (offset, size) = row_span(y, w, h, elem, mem.memory_size());
            mem.host_bytes_mut()[offset..offset + size].fill(0);
            return;
        }
        // Same band count as DeviceTask::split: never more bands than rows.
        let n = self.devices.len().min(h).max(1);
        let band = h / n;
        for (i, (sub, map)) in self.devices.iter().zip(&keys.render).take(n).enumerate() {
            let sy = y + band * i;
            let sh = if i == n - 1 { h - band * i } else { band };
            if sh == 0 {
                continue;
            }
            let copied = with_sub_pointer(mem, map, key, |m| sub.mem_copy_from(m, sy, w, sh, elem));
            if !copied {
                let (offset, size) = row_span(sy, w, sh, elem, mem.memory_size());
                mem.host_bytes_mut()[offset..offset + size].fill(0);
            }
        }
    }

    fn mem_zero(&self, mem: &mut DeviceMemory) {
        if self.have_error() {
            return;
        }
        if !self.keys.lock().sizes.contains_key(&mem.device_pointer) {
            self.mem_alloc(mem);
        }
        mem.zero_host();
        let keys = self.keys.lock();
        let key = mem.device_pointer;
        for (sub, map) in self.devices.iter().zip(&keys.render) {
            with_sub_pointer(mem, map, key, |m| sub.mem_zero(m));
        }
        for (sub, map) in self.denoising.iter().zip(&keys.denoise) {
            with_sub_pointer(mem, map, key, |m| sub.mem_zero(m));
        }
    }

    fn mem_free(&self, mem: &mut DeviceMemory) {
        let key = mem.device_pointer;
        if key == 0 {
            return;
        }
        let mut guard = self.keys.lock();
        let keys = &mut *guard;
        for (sub, map) in self.devices.iter().zip(keys.render.iter_mut()) {
            with_sub_pointer(mem, map, key, |m| sub.mem_free(m));
            map.remove(&key);
        }
        for (sub, map) in self.denoising.iter().zip(keys.denoise.iter_mut()) {
            with_sub_pointer(mem, map, key, |m| sub.mem_free(m));
            map.remove(&key);
        }
        if let Some(size) = keys.sizes.remove(&key) {
            self.stats.mem_free(size);
        }
        mem.device_pointer = 0;
        mem.device_size = 0;
    }

    fn const_copy_to(&self, name: &str, data: &[u8]) {
        if self.have_error() {
            return;
        }
        for sub in self.all_devices() {
            sub.const_copy_to(name, data);
        }
    }

    fn tex_alloc(&self, name: &str, mem: &mut DeviceMemory, interpolation: Interpolation, extension: Extension) {
        self.allocate(mem, Some((name, interpolation, extension)));
    }

    fn tex_free(&self, mem: &mut DeviceMemory) {
        let key = mem.device_pointer;
        if key == 0 {
            return;
        }
        let mut guard = self.keys.lock();
        let keys = &mut *guard;
        for (sub, map) in self.all_devices().zip(keys.render.iter_mut().chain(keys.denoise.iter_mut())) {
            with_sub_pointer(mem, map, key, |m| sub.tex_free(m));
            map.remove(&key);
        }
        if let Some(size) = keys.sizes.remove(&key) {
            self.stats.mem_free(size);
        }
        mem.device_pointer = 0;
        mem.device_size = 0;
    }

    fn task_add(&self, task: DeviceTask) {
        if self.have_error() {
            return;
        }
        let keys = self.keys.lock();
        let has_pool = !self.denoising.is_empty();

        // Denoise tiles go to the denoising pool when there is one.
        let mut render_task = task;
        if has_pool && render_task.uses_tiles() && render_task.tile_types.contains(TileTypes::DENOISE) {
            let mut denoise_task = render_task.clone();
            denoise_task.tile_types = TileTypes::DENOISE;
            for ((sub, map), mut piece) in self
                .denoising
                .iter()
                .zip(&keys.denoise)
                .zip(denoise_task.split(self.denoising.len(), 0))
            {
                remap_task(&mut piece, map);
                sub.task_add(piece);
            }
            if render_task.task_type == DeviceTaskType::Denoise {
                return;
            }
            render_task.tile_types = render_task.tile_types.without(TileTypes::DENOISE);
            if render_task.tile_types.is_empty() {
                return;
            }
        }

        let pieces = render_task.split(self.devices.len(), 0);
        for ((sub, map), mut piece) in self.devices.iter().zip(&keys.render).zip(pieces) {
            remap_task(&mut piece, map);
            sub.task_add(piece);
        }
    }

    fn task_wait(&self) {
        for sub in self.all_devices() {
            sub.task_wait();
        }
    }

    fn task_cancel(&self) {
        for sub in self.all_devices() {
            sub.task_cancel();
        }
    }

    fn get_split_task_count(&self, task: &DeviceTask) -> usize {
        let pieces = task.split(self.devices.len(), 0);
        self.devices
            .iter()
            .zip(&pieces)
            .map(|(sub, piece)| sub.get_split_task_count(piece))
            .sum()
    }

    fn num_logical_devices(&self) -> usize {
        self.devices.len()
    }

    fn device_number(&self, sub: &dyn Device) -> usize {
        if let Some(i) = self.render_index(sub) {
            return i;
        }
        self.denoise_index(sub).map_or(0, |j| self.devices.len() + j)
    }

    fn map_tile(&self, sub: &dyn Device, tile: &mut RenderTile) {
        if tile.buffer == 0 {
            return;
        }
        let keys = self.keys.lock();
        let map = match self.render_index(sub) {
            Some(i) => &keys.render[i],
            None => match self.denoise_index(sub) {
                Some(j) => &keys.denoise[j],
                None => return,
            },
        };
        tile.buffer = remap(map, tile.buffer);
        tile.rng_state = remap(map, tile.rng_state);
    }

    /// Copy neighbours living on another device onto `sub` for the duration
    /// of a denoise. Each buffer goes device-to-host at most once.
    fn map_neighbor_tiles(&self, sub: &dyn Device, neighbors: &mut RenderTileNeighbors) {
        let matching = self.denoising.is_empty();

        for tile in neighbors.tiles.iter_mut() {
            let Some(shared) = tile.buffers.clone() else { continue };
            let mut buffers = shared.lock();
            tile.buffer = buffers.buffer.device_pointer;
            let owner = buffers.device().id();

            if owner == self.id && matching {
                // Whole-frame buffer present on every device.
                self.map_tile(sub, tile);
                continue;
            }
            if owner == sub.id() {
                continue;
            }

            if !buffers.map_neighbor_copied {
                buffers.map_neighbor_copied = true;
                buffers.copy_from_device();
            }
            let saved = if owner == self.id {
                // Reuse the block already allocated on the sub-device.
                self.map_tile(sub, tile);
                buffers.buffer.swap_device(tile.buffer, 0)
            } else {
                buffers.buffer.swap_device(0, 0)
            };
            sub.mem_copy_to(&mut buffers.buffer);
            tile.buffer = buffers.buffer.device_pointer;
            buffers.buffer.restore_device(saved);
        }

        let center = &neighbors.tiles[RenderTileNeighbors::CENTER];
        let same_as_center = match (&neighbors.target.buffers, &center.buffers) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if same_as_center {
            neighbors.target.buffer = center.buffer;
        } else {
            self.map_tile(sub, &mut neighbors.target);
        }
    }

    /// Bring the denoised target back to its owner and free the temporaries.
    fn unmap_neighbor_tiles(&self, sub: &dyn Device, neighbors: &mut RenderTileNeighbors) {
        let matching = self.denoising.is_empty();
        let Some(target_shared) = neighbors.target.buffers.clone() else {
            return;
        };
        {
            let mut buffers = target_shared.lock();
            let owner = buffers.device().id();
            if owner == self.id && matching {
                return;
            }
            if owner != sub.id() {
                let saved = buffers.buffer.swap_device(neighbors.target.buffer, 0);
                buffers.copy_from(sub);
                buffers.buffer.restore_device(saved);
                buffers.copy_to_device();
            }
        }

        for tile in neighbors.tiles.iter() {
            let Some(shared) = &tile.buffers else { continue };
            let mut buffers = shared.lock();
            let owner = buffers.device().id();
            if owner != sub.id() && owner != self.id {
                let saved = buffers.buffer.swap_device(tile.buffer, 0);
                sub.mem_free(&mut buffers.buffer);
                buffers.buffer.restore_device(saved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;

    fn multi(n: usize) -> (Arc<MultiDevice>, Vec<Arc<dyn Device>>) {
        let subs: Vec<Arc<dyn Device>> = (0..n).map(|_| CpuDevice::with_threads(1) as Arc<dyn Device>).collect();
        (MultiDevice::new(subs.clone(), vec![]), subs)
    }

    #[test]
    fn test_alloc_on_every_device() {
        let (device, subs) = multi(2);
        let mut mem = DeviceMemory::floats("data", 1);
        mem.resize(1024, 0);
        device.mem_alloc(&mut mem);
        assert!(mem.is_allocated());
        for sub in &subs {
            assert!(sub.stats().mem_used() >= 4096);
        }
        assert_eq!(device.stats().mem_used(), 4096);

        device.mem_free(&mut mem);
        device.mem_free(&mut mem);
        for sub in &subs {
            assert_eq!(sub.stats().mem_used(), 0);
        }
        assert_eq!(device.stats().mem_used(), 0);
    }

    #[test]
    fn test_round_trip() {
        let (device, _) = multi(3);
        let mut mem = DeviceMemory::floats("data", 1);
        let data: Vec<f32> = (0..70).map(|i| i as f32 * 0.25).collect();
        mem.copy_from_slice(&data);
        device.mem_alloc(&mut mem);
        device.mem_copy_to(&mut mem);
        mem.zero_host();
        device.mem_copy_from(&mut mem, 0, 10, 7, 4);
        assert_eq!(mem.host::<f32>(), data.as_slice());
    }

    #[test]
    fn test_unallocated_copy_from_zero_fills() {
        let (device, _) = multi(2);
        let mut mem = DeviceMemory::floats("data", 1);
        mem.resize(8, 0);
        mem.host_mut::<f32>().fill(1.0);
        device.mem_copy_from(&mut mem, 0, 8, 1, 4);
        assert!(mem.host::<f32>().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_cpu_sorted_last() {
        let cpu: Arc<dyn Device> = CpuDevice::with_threads(1);
        let mut accel_info = DeviceInfo::cpu(1);
        accel_info.device_type = DeviceType::Network;
        accel_info.id = "NET".into();
        let other: Arc<dyn Device> = CpuDevice::new(accel_info, Arc::new(crate::device::ConstantKernel::new([1.0; 4])));
        let device = MultiDevice::new(vec![cpu.clone(), other.clone()], vec![]);
        assert_eq!(device.devices()[0].id(), other.id());
        assert_eq!(device.devices()[1].id(), cpu.id());
        assert_eq!(device.device_number(cpu.as_ref()), 1);
        assert_eq!(device.num_logical_devices(), 2);
    }

    #[test]
    fn test_direct_task_fans_out() {
        let (device, _) = multi(2);
        let mut mem = DeviceMemory::floats("buffer", 4);
        mem.resize(8 * 6, 0);
        device.mem_alloc(&mut mem);
        device.mem_zero(&mut mem);

        let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 8, 6);
        task.stride = 8;
        task.num_samples = 3;
        task.buffer = mem.device_pointer;
        device.task_add(task);
        device.task_wait();

        device.mem_copy_from(&mut mem, 0, 8, 6, 16);
        assert!(mem.host::<f32>().iter().all(|&v| v == 3.0));
    }

    #[test]
    fn test_sub_error_surfaces() {
        let (device, subs) = multi(2);
        assert!(!device.have_error());
        subs[1].set_error("sub failed");
        assert_eq!(device.error_message(), "sub failed");
    }
}
