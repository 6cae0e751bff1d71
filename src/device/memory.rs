//! Host-side memory descriptors.
//!
//! A [`DeviceMemory`] owns the host copy of a block and remembers the opaque
//! pointer the device handed back when the block was allocated. Devices never
//! hand out real addresses: a [`DevicePtr`] is only meaningful to the device
//! that produced it (or, for a multi device, a logical key it maps).

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

/// Opaque device allocation handle. Zero means "not allocated".
pub type DevicePtr = u64;

/// Element type of a memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Uchar,
    Uint16,
    Uint,
    Int,
    Float,
    Half,
}

impl DataType {
    /// Size of one scalar in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Uchar => 1,
            DataType::Uint16 | DataType::Half => 2,
            DataType::Uint | DataType::Int | DataType::Float => 4,
        }
    }
}

/// How a block is used by kernels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    ReadOnly,
    #[default]
    ReadWrite,
    Texture,
    /// Display pixels, eligible for graphics interop.
    Pixels,
}

/// Texture filtering mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    #[default]
    Linear,
    Closest,
    Cubic,
}

/// Texture addressing outside `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extension {
    #[default]
    Repeat,
    Extend,
    Clip,
}

/// Host copy plus device handle of one memory block.
///
/// Host storage is kept in 32-bit words so typed views of every supported
/// element type are always correctly aligned.
#[derive(Debug)]
pub struct DeviceMemory {
    name: String,
    pub mem_type: MemoryType,
    pub data_type: DataType,
    /// Scalars per item (4 for an RGBA pixel).
    pub data_elements: usize,
    pub data_width: usize,
    pub data_height: usize,
    host: Vec<u32>,
    /// Handle returned by the owning device, 0 when not allocated.
    pub device_pointer: DevicePtr,
    /// Bytes the device reserved for this block.
    pub device_size: usize,
    /// Also place this block on denoising-only devices of a multi device.
    pub shared_with_denoising: bool,
}

impl DeviceMemory {
    pub fn new(name: impl Into<String>, mem_type: MemoryType, data_type: DataType, data_elements: usize) -> Self {
        Self {
            name: name.into(),
            mem_type,
            data_type,
            data_elements: data_elements.max(1),
            data_width: 0,
            data_height: 0,
            host: Vec::new(),
            device_pointer: 0,
            device_size: 0,
            shared_with_denoising: false,
        }
    }

    /// Shorthand for a read-write float vector.
    pub fn floats(name: impl Into<String>, elements: usize) -> Self {
        Self::new(name, MemoryType::ReadWrite, DataType::Float, elements)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resize the host copy, zero filled. Does not touch the device copy.
    pub fn resize(&mut self, width: usize, height: usize) {
        self.data_width = width;
        self.data_height = height;
        let words = self.memory_size().div_ceil(4);
        self.host.clear();
        self.host.resize(words, 0);
    }

    /// Bytes per item.
    #[inline]
    pub fn item_size(&self) -> usize {
        self.data_type.size() * self.data_elements
    }

    /// Number of items (`width * max(height, 1)`).
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_width * self.data_height.max(1)
    }

    /// Total bytes of the host copy.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.data_size() * self.item_size()
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.device_pointer != 0
    }

    pub fn host_bytes(&self) -> &[u8] {
        let size = self.memory_size();
        &bytemuck::cast_slice::<u32, u8>(&self.host)[..size]
    }

    pub fn host_bytes_mut(&mut self) -> &mut [u8] {
        let size = self.memory_size();
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.host)[..size]
    }

    /// Typed view of the host copy.
    pub fn host<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.host_bytes())
    }

    /// Mutable typed view of the host copy.
    pub fn host_mut<T: Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.host_bytes_mut())
    }

    /// Replace the host copy with `data`, resizing to `data.len()` items of
    /// `T`-sized scalars along the width.
    pub fn copy_from_slice<T: Pod>(&mut self, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let items = bytes.len() / self.item_size().max(1);
        let n = items * self.item_size();
        self.resize(items, 0);
        self.host_bytes_mut().copy_from_slice(&bytes[..n]);
    }

    /// Zero the host copy.
    pub fn zero_host(&mut self) {
        self.host.fill(0);
    }

    /// Temporarily point this descriptor at a different device block.
    /// Returns the previous binding for [`restore_device`](Self::restore_device).
    pub fn swap_device(&mut self, pointer: DevicePtr, size: usize) -> (DevicePtr, usize) {
        let saved = (self.device_pointer, self.device_size);
        self.device_pointer = pointer;
        self.device_size = size;
        saved
    }

    pub fn restore_device(&mut self, saved: (DevicePtr, usize)) {
        self.device_pointer = saved.0;
        self.device_size = saved.1;
    }
}

/// Byte range `[offset, offset + size)` covered by a row copy request,
/// clamped to `limit`.
pub(crate) fn row_span(y: usize, w: usize, h: usize, elem: usize, limit: usize) -> (usize, usize) {
    let offset = (y * w * elem).min(limit);
    let size = (w * h * elem).min(limit - offset);
    (offset, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let mut mem = DeviceMemory::new("rgba", MemoryType::Pixels, DataType::Uchar, 4);
        mem.resize(3, 2);
        assert_eq!(mem.item_size(), 4);
        assert_eq!(mem.data_size(), 6);
        assert_eq!(mem.memory_size(), 24);
        assert_eq!(mem.host_bytes().len(), 24);
    }

    #[test]
    fn test_typed_views() {
        let mut mem = DeviceMemory::floats("values", 1);
        mem.copy_from_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(mem.data_width, 3);
        assert_eq!(mem.host::<f32>(), &[1.0, 2.0, 3.0]);
        mem.host_mut::<f32>()[1] = 5.0;
        assert_eq!(mem.host::<f32>()[1], 5.0);
    }

    #[test]
    fn test_odd_byte_length_is_trimmed() {
        let mut mem = DeviceMemory::new("bytes", MemoryType::ReadOnly, DataType::Uchar, 1);
        mem.resize(5, 0);
        assert_eq!(mem.host_bytes().len(), 5);
        assert_eq!(mem.host::<u8>().len(), 5);
    }

    #[test]
    fn test_swap_restore() {
        let mut mem = DeviceMemory::floats("buffer", 1);
        mem.device_pointer = 7;
        mem.device_size = 16;
        let saved = mem.swap_device(9, 32);
        assert_eq!(mem.device_pointer, 9);
        mem.restore_device(saved);
        assert_eq!((mem.device_pointer, mem.device_size), (7, 16));
    }

    #[test]
    fn test_row_span_clamps() {
        assert_eq!(row_span(1, 4, 2, 4, 64), (16, 32));
        assert_eq!(row_span(3, 4, 2, 4, 64), (48, 16));
        assert_eq!(row_span(10, 4, 2, 4, 64), (64, 0));
    }
}
