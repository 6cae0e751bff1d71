//! Pointer-keyed block storage shared by the local backends.
//!
//! Each device owns one arena with its own pointer base, so pointers from
//! different devices never collide and a foreign pointer simply misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::memory::DevicePtr;

/// One allocation. The data mutex is the "allocation lock" kernels take when
/// merging their tile results back.
#[derive(Debug)]
pub(crate) struct Block {
    pub data: Mutex<Vec<u32>>,
    pub size: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u32; size.div_ceil(4)]),
            size,
        }
    }
}

#[derive(Debug)]
pub(crate) struct MemoryArena {
    next: AtomicU64,
    blocks: RwLock<HashMap<DevicePtr, Arc<Block>>>,
}

/// Pointer spacing between allocations, keeps pointer values readable in logs.
const POINTER_STEP: u64 = 0x10;

impl MemoryArena {
    pub fn new(base: DevicePtr) -> Self {
        Self {
            next: AtomicU64::new(base.max(POINTER_STEP)),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve a zeroed block of `size` bytes.
    pub fn alloc(&self, size: usize) -> DevicePtr {
        let ptr = self.next.fetch_add(POINTER_STEP, Ordering::Relaxed);
        self.blocks.write().insert(ptr, Arc::new(Block::new(size)));
        ptr
    }

    /// Replace the block behind `ptr` with a fresh one of `size` bytes.
    /// Returns the old size, or `None` if `ptr` is unknown.
    pub fn realloc(&self, ptr: DevicePtr, size: usize) -> Option<usize> {
        let mut blocks = self.blocks.write();
        let old = blocks.get(&ptr)?.size;
        blocks.insert(ptr, Arc::new(Block::new(size)));
        Some(old)
    }

    pub fn get(&self, ptr: DevicePtr) -> Option<Arc<Block>> {
        if ptr == 0 {
            return None;
        }
        self.blocks.read().get(&ptr).cloned()
    }

    /// Release `ptr`, returning the freed size. Unknown pointers are ignored.
    pub fn free(&self, ptr: DevicePtr) -> Option<usize> {
        self.blocks.write().remove(&ptr).map(|b| b.size)
    }

    /// Drop every block, returning total bytes released.
    pub fn clear(&self) -> usize {
        let mut blocks = self.blocks.write();
        let total = blocks.values().map(|b| b.size).sum();
        blocks.clear();
        total
    }
}

/// Byte view of a block's words.
#[inline]
pub(crate) fn block_bytes(words: &[u32], size: usize) -> &[u8] {
    &bytemuck::cast_slice::<u32, u8>(words)[..size]
}

#[inline]
pub(crate) fn block_bytes_mut(words: &mut [u32], size: usize) -> &mut [u8] {
    &mut bytemuck::cast_slice_mut::<u32, u8>(words)[..size]
}

/// Float view of a block's words.
#[inline]
pub(crate) fn block_floats_mut(words: &mut [u32]) -> &mut [f32] {
    bytemuck::cast_slice_mut(words)
}
