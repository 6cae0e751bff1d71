//! Accumulation buffers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{DataType, Device, DeviceMemory, MemoryType};
use super::params::BufferParams;
use super::passes::PassType;

/// Render buffers shared between the session, tiles and the device workers.
pub type SharedBuffers = Arc<Mutex<RenderBuffers>>;

/// Float accumulation storage for a tile or the whole frame, plus one RNG
/// state word per pixel.
///
/// The device copy is authoritative while rendering; the host copy is only
/// refreshed by [`copy_from_device`](Self::copy_from_device).
pub struct RenderBuffers {
    pub params: BufferParams,
    pub buffer: DeviceMemory,
    pub rng_state: DeviceMemory,
    /// Set once this buffer has been copied to the host for neighbour
    /// borrowing, so other borrowers skip the copy.
    pub map_neighbor_copied: bool,
    device: Arc<dyn Device>,
}

impl RenderBuffers {
    pub fn new(device: Arc<dyn Device>) -> Self {
        let mut buffer = DeviceMemory::new("RenderBuffers", MemoryType::ReadWrite, DataType::Float, 1);
        buffer.shared_with_denoising = true;
        let mut rng_state = DeviceMemory::new("rng_state", MemoryType::ReadWrite, DataType::Uint, 1);
        rng_state.shared_with_denoising = true;
        Self {
            params: BufferParams::default(),
            buffer,
            rng_state,
            map_neighbor_copied: false,
            device,
        }
    }

    /// Allocate for `params` and initialise RNG seeds.
    pub fn with_params(device: Arc<dyn Device>, params: &BufferParams) -> Self {
        let mut buffers = Self::new(device);
        buffers.reset(params);
        buffers
    }

    pub fn shared(self) -> SharedBuffers {
        Arc::new(Mutex::new(self))
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Reallocate for `params`, zeroing the accumulation and reseeding RNG.
    pub fn reset(&mut self, params: &BufferParams) {
        self.params = params.clone();
        self.device_free();

        self.buffer.resize(params.num_pixels() * params.get_passes_size(), 0);
        self.device.mem_alloc(&mut self.buffer);
        self.device.mem_zero(&mut self.buffer);

        self.rng_state.resize(params.num_pixels(), 0);
        let width = params.width.max(0) as usize;
        for (i, seed) in self.rng_state.host_mut::<u32>().iter_mut().enumerate() {
            let x = params.full_x + (i % width.max(1)) as i32;
            let y = params.full_y + (i / width.max(1)) as i32;
            *seed = lookup3::hash_uint2(x as u32, y as u32);
        }
        self.device.mem_alloc(&mut self.rng_state);
        self.device.mem_copy_to(&mut self.rng_state);
        self.map_neighbor_copied = false;
    }

    /// Clear the accumulation on the device.
    pub fn zero(&mut self) {
        if self.buffer.is_allocated() {
            self.device.mem_zero(&mut self.buffer);
        }
    }

    /// Pull the whole accumulation back to the host. False when nothing is
    /// allocated.
    pub fn copy_from_device(&mut self) -> bool {
        let device = Arc::clone(&self.device);
        self.copy_from(device.as_ref())
    }

    /// Pull the accumulation from `device`, which may be a device the
    /// buffer was temporarily copied to rather than its owner.
    pub fn copy_from(&mut self, device: &dyn Device) -> bool {
        if !self.buffer.is_allocated() {
            return false;
        }
        let stride = self.params.get_passes_size() * std::mem::size_of::<f32>();
        let (w, h) = (self.params.width.max(0) as usize, self.params.height.max(0) as usize);
        device.mem_copy_from(&mut self.buffer, 0, w, h, stride);
        true
    }

    /// Push the host accumulation to the device.
    pub fn copy_to_device(&mut self) {
        self.device.mem_copy_to(&mut self.buffer);
    }

    /// Read one pass from the host copy into `pixels` (`components` floats
    /// per pixel), normalised by `sample` and scaled by `exposure` where the
    /// pass calls for it. False if the pass is not stored or the component
    /// count does not match.
    pub fn get_pass_rect(
        &self,
        pass: PassType,
        exposure: f32,
        sample: u32,
        components: usize,
        pixels: &mut [f32],
    ) -> bool {
        let Some(offset) = self.params.pass_offset(pass) else {
            return false;
        };
        if components != pass.components() {
            return false;
        }
        let pass_stride = self.params.get_passes_size();
        let size = self.params.num_pixels();
        if pixels.len() < size * components {
            return false;
        }
        let data = self.buffer.host::<f32>();
        if data.len() < size * pass_stride {
            return false;
        }

        let scale = if pass.filter() && sample > 0 { 1.0 / sample as f32 } else { 1.0 };
        let scale_exposure = if pass.exposure() { scale * exposure } else { scale };
        let divide = pass.divide_by().and_then(|p| self.params.pass_offset(p));
        let motion_weight = self.params.pass_offset(PassType::MotionWeight);

        for i in 0..size {
            let src = &data[i * pass_stride + offset..i * pass_stride + offset + components];
            let out = &mut pixels[i * components..(i + 1) * components];
            if components == 1 {
                let f = src[0];
                out[0] = match pass {
                    PassType::Depth => {
                        if f == 0.0 {
                            1e10
                        } else {
                            f * scale_exposure
                        }
                    }
                    PassType::Mist => (f * scale_exposure).clamp(0.0, 1.0),
                    _ => f * scale_exposure,
                };
                continue;
            }

            match (pass, divide) {
                (_, Some(div)) => {
                    let color = &data[i * pass_stride + div..i * pass_stride + div + 3];
                    for c in 0..3 {
                        out[c] = if color[c] != 0.0 { src[c] / color[c] } else { 0.0 };
                    }
                    out[3] = 1.0;
                }
                (PassType::Shadow, _) => {
                    let invw = if src[3] > 0.0 { 1.0 / src[3] } else { 1.0 };
                    for c in 0..3 {
                        out[c] = src[c] * invw;
                    }
                    out[3] = 1.0;
                }
                (PassType::Motion, _) => {
                    let w = motion_weight.map(|o| data[i * pass_stride + o]).unwrap_or(0.0);
                    let invw = if w > 0.0 { 1.0 / w } else { 0.0 };
                    for c in 0..4 {
                        out[c] = src[c] * invw;
                    }
                }
                (PassType::Combined | PassType::Denoised, _) => {
                    for c in 0..3 {
                        out[c] = src[c] * scale_exposure;
                    }
                    out[3] = (src[3] * scale).clamp(0.0, 1.0);
                }
                _ => {
                    for c in 0..4 {
                        out[c] = src[c] * scale_exposure;
                    }
                }
            }
        }
        true
    }

    fn device_free(&mut self) {
        self.device.mem_free(&mut self.buffer);
        self.device.mem_free(&mut self.rng_state);
    }
}

impl Drop for RenderBuffers {
    fn drop(&mut self) {
        self.device_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;

    fn buffers(params: &BufferParams) -> RenderBuffers {
        RenderBuffers::with_params(CpuDevice::with_threads(1), params)
    }

    #[test]
    fn test_reset_allocates() {
        let params = BufferParams::new(8, 4);
        let rb = buffers(&params);
        assert!(rb.buffer.is_allocated());
        assert_eq!(rb.buffer.memory_size(), 8 * 4 * 4 * 4);
        assert_eq!(rb.device().stats().mem_used(), 8 * 4 * 4 * 4 + 8 * 4 * 4);
    }

    #[test]
    fn test_rng_seeds_follow_full_coordinates() {
        let mut params = BufferParams::new(2, 2);
        params.full_x = 10;
        params.full_y = 20;
        let rb = buffers(&params);
        let seeds = rb.rng_state.host::<u32>();
        assert_eq!(seeds[0], lookup3::hash_uint2(10, 20));
        assert_eq!(seeds[3], lookup3::hash_uint2(11, 21));
    }

    #[test]
    fn test_drop_frees_device_memory() {
        let device = CpuDevice::with_threads(1);
        {
            let _rb = RenderBuffers::with_params(device.clone(), &BufferParams::new(4, 4));
            assert!(device.stats().mem_used() > 0);
        }
        assert_eq!(device.stats().mem_used(), 0);
    }

    #[test]
    fn test_pass_rect_scaling() {
        let mut params = BufferParams::new(1, 1);
        params.passes.push(PassType::Depth);
        params.passes.push(PassType::Mist);
        let mut rb = buffers(&params);
        rb.buffer.host_mut::<f32>()[..6].copy_from_slice(&[8.0, 4.0, 2.0, 8.0, 3.0, 6.0]);

        let mut px = [0.0f32; 4];
        assert!(rb.get_pass_rect(PassType::Combined, 0.5, 4, 4, &mut px));
        assert_eq!(px, [1.0, 0.5, 0.25, 1.0]);

        let mut depth = [0.0f32];
        assert!(rb.get_pass_rect(PassType::Depth, 0.5, 4, 1, &mut depth));
        assert_eq!(depth[0], 3.0);

        let mut mist = [0.0f32];
        assert!(rb.get_pass_rect(PassType::Mist, 1.0, 4, 1, &mut mist));
        assert_eq!(mist[0], 1.0);

        assert!(!rb.get_pass_rect(PassType::Normal, 1.0, 4, 4, &mut px));
        assert!(!rb.get_pass_rect(PassType::Depth, 1.0, 4, 4, &mut px));
    }

    #[test]
    fn test_pass_rect_divides_by_color() {
        let mut params = BufferParams::new(1, 1);
        params.passes = vec![PassType::DiffuseDirect, PassType::DiffuseColor];
        let mut rb = buffers(&params);
        rb.buffer.host_mut::<f32>()[..8].copy_from_slice(&[1.0, 2.0, 3.0, 0.0, 2.0, 4.0, 0.0, 0.0]);
        let mut px = [0.0f32; 4];
        assert!(rb.get_pass_rect(PassType::DiffuseDirect, 1.0, 1, 4, &mut px));
        assert_eq!(px, [0.5, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn test_copy_round_trip() {
        let params = BufferParams::new(2, 2);
        let mut rb = buffers(&params);
        for (i, v) in rb.buffer.host_mut::<f32>().iter_mut().enumerate() {
            *v = i as f32;
        }
        rb.copy_to_device();
        rb.buffer.zero_host();
        assert!(rb.copy_from_device());
        assert_eq!(rb.buffer.host::<f32>()[15], 15.0);
    }
}
