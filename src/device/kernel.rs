//! Kernel invocation contract.
//!
//! The scheduler never looks inside a kernel: backends call
//! [`Kernel::path_trace`] once per pixel per sample with a tile-local view of
//! the accumulation buffer, and read nothing back except the buffer itself.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::buffers::FilmConstants;
use crate::util::Result;
use super::memory::{DataType, Extension, Interpolation};

/// Features the scene needs compiled into the kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedFeatures {
    pub max_closures: u32,
    pub use_hair: bool,
    pub use_volume: bool,
    pub use_baking: bool,
    pub use_denoising: bool,
    pub use_shadow_tricks: bool,
    pub experimental: bool,
}

/// What a shader task evaluates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShaderEvalType {
    #[default]
    Displace,
    Background,
    Bake,
}

/// A bound texture: host snapshot plus sampling state.
#[derive(Clone, Debug)]
pub struct Texture {
    pub data_type: DataType,
    pub elements: usize,
    pub width: usize,
    pub height: usize,
    pub interpolation: Interpolation,
    pub extension: Extension,
    words: Arc<Vec<u32>>,
    size: usize,
}

impl Texture {
    pub(crate) fn new(
        data_type: DataType,
        elements: usize,
        width: usize,
        height: usize,
        interpolation: Interpolation,
        extension: Extension,
        words: Arc<Vec<u32>>,
        size: usize,
    ) -> Self {
        Self { data_type, elements, width, height, interpolation, extension, words, size }
    }

    pub fn data<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(&bytemuck::cast_slice::<u32, u8>(&self.words)[..self.size])
    }
}

/// Constants and textures visible to a kernel while a task runs.
///
/// Tasks take a snapshot (`Arc<KernelGlobals>`) when they start, so uploads
/// made mid-render only affect later tasks.
#[derive(Clone, Debug, Default)]
pub struct KernelGlobals {
    constants: HashMap<String, Arc<Vec<u8>>>,
    textures: HashMap<String, Texture>,
}

impl KernelGlobals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_constant(&mut self, name: &str, data: &[u8]) {
        self.constants.insert(name.to_string(), Arc::new(data.to_vec()));
    }

    pub fn constant(&self, name: &str) -> Option<&[u8]> {
        self.constants.get(name).map(|d| d.as_slice())
    }

    /// Typed read of a constant. `None` if missing or too short.
    pub fn get<T: Pod>(&self, name: &str) -> Option<T> {
        let data = self.constant(name)?;
        let size = std::mem::size_of::<T>();
        if data.len() < size {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(&data[..size]))
    }

    pub fn set_texture(&mut self, name: &str, texture: Texture) {
        self.textures.insert(name.to_string(), texture);
    }

    pub fn remove_texture(&mut self, name: &str) -> Option<Texture> {
        self.textures.remove(name)
    }

    pub fn texture(&self, name: &str) -> Option<&Texture> {
        self.textures.get(name)
    }

    pub fn num_textures(&self) -> usize {
        self.textures.len()
    }

    /// Film layout uploaded by the session, or a bare combined pass.
    pub fn film(&self) -> FilmConstants {
        self.get::<FilmConstants>(FilmConstants::NAME).unwrap_or_default()
    }
}

/// Buffer index of pixel `(x, y)` under `offset`/`stride` addressing.
#[inline]
pub fn pixel_index(x: i32, y: i32, offset: i32, stride: i32) -> usize {
    (offset + x + y * stride) as usize
}

/// The opaque per-pixel compute function a device runs.
///
/// `path_trace` must *add* one sample's contribution to the pixel at
/// `pixel_index(x, y, offset, stride)`; clearing is the device's job.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str {
        "kernel"
    }

    /// Compile / specialise for the requested features.
    fn load(&self, _features: &RequestedFeatures) -> Result<()> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn path_trace(
        &self,
        kg: &KernelGlobals,
        buffer: &mut [f32],
        rng_state: &mut [u32],
        sample: u32,
        x: i32,
        y: i32,
        offset: i32,
        stride: i32,
    );

    /// Evaluate one shader point. Default leaves the output untouched.
    fn shader(
        &self,
        _kg: &KernelGlobals,
        _input: [u32; 4],
        _output: &mut [f32; 4],
        _eval: ShaderEvalType,
        _sample: u32,
    ) {
    }
}

/// Adds a constant colour to the combined pass every sample and advances the
/// pixel's RNG state. Used for bring-up and diagnostics.
#[derive(Clone, Debug)]
pub struct ConstantKernel {
    pub color: [f32; 4],
}

impl ConstantKernel {
    pub fn new(color: [f32; 4]) -> Self {
        Self { color }
    }
}

impl Kernel for ConstantKernel {
    fn name(&self) -> &str {
        "constant"
    }

    fn path_trace(
        &self,
        kg: &KernelGlobals,
        buffer: &mut [f32],
        rng_state: &mut [u32],
        _sample: u32,
        x: i32,
        y: i32,
        offset: i32,
        stride: i32,
    ) {
        let film = kg.film();
        let index = pixel_index(x, y, offset, stride);
        let base = index * film.pass_stride as usize + film.pass_combined as usize;
        for (dst, c) in buffer[base..base + 4].iter_mut().zip(self.color) {
            *dst += c;
        }
        if let Some(rng) = rng_state.get_mut(index) {
            *rng = lookup3::hash_uint(*rng);
        }
    }

    fn shader(
        &self,
        _kg: &KernelGlobals,
        _input: [u32; 4],
        output: &mut [f32; 4],
        _eval: ShaderEvalType,
        _sample: u32,
    ) {
        for (dst, c) in output.iter_mut().zip(self.color) {
            *dst += c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_constant() {
        let mut kg = KernelGlobals::new();
        kg.set_constant("scale", bytemuck::bytes_of(&2.5f32));
        assert_eq!(kg.get::<f32>("scale"), Some(2.5));
        assert_eq!(kg.get::<[f32; 4]>("scale"), None);
        assert_eq!(kg.get::<f32>("missing"), None);
    }

    #[test]
    fn test_default_film() {
        let kg = KernelGlobals::new();
        let film = kg.film();
        assert_eq!(film.pass_stride, 4);
        assert_eq!(film.pass_combined, 0);
    }

    #[test]
    fn test_pixel_index() {
        // Tile at (8, 4), width 16: local row-major addressing.
        let offset = -(8 + 4 * 16);
        assert_eq!(pixel_index(8, 4, offset, 16), 0);
        assert_eq!(pixel_index(9, 5, offset, 16), 17);
    }

    #[test]
    fn test_constant_kernel_accumulates() {
        let kg = KernelGlobals::new();
        let kernel = ConstantKernel::new([1.0, 0.5, 0.25, 1.0]);
        let mut buffer = vec![0.0f32; 8];
        let mut rng = vec![1u32, 2];
        kernel.path_trace(&kg, &mut buffer, &mut rng, 0, 1, 0, 0, 2);
        kernel.path_trace(&kg, &mut buffer, &mut rng, 1, 1, 0, 0, 2);
        assert_eq!(&buffer[4..8], &[2.0, 1.0, 0.5, 2.0]);
        assert_eq!(&buffer[0..4], &[0.0; 4]);
        assert_eq!(rng[0], 1);
        assert_ne!(rng[1], 2);
    }
}
