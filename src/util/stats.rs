//! Device memory accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-device memory statistics.
///
/// Lock-free: allocation tables are guarded elsewhere, these counters are
/// only read for reporting and tests.
#[derive(Debug, Default)]
pub struct Stats {
    mem_used: AtomicUsize,
    mem_peak: AtomicUsize,
    allocations: AtomicUsize,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation of `size` bytes.
    pub fn mem_alloc(&self, size: usize) {
        let used = self.mem_used.fetch_add(size, Ordering::Relaxed) + size;
        self.mem_peak.fetch_max(used, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release of `size` bytes. Never goes below zero.
    pub fn mem_free(&self, size: usize) {
        let _ = self.mem_used.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.saturating_sub(size))
        });
        let _ = self.allocations.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.saturating_sub(1))
        });
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// High water mark in bytes.
    #[inline]
    pub fn mem_peak(&self) -> usize {
        self.mem_peak.load(Ordering::Relaxed)
    }

    /// Number of live allocations.
    #[inline]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_peak() {
        let stats = Stats::new();
        stats.mem_alloc(100);
        stats.mem_alloc(50);
        assert_eq!(stats.mem_used(), 150);
        assert_eq!(stats.allocations(), 2);
        stats.mem_free(100);
        assert_eq!(stats.mem_used(), 50);
        assert_eq!(stats.mem_peak(), 150);
    }

    #[test]
    fn test_free_saturates() {
        let stats = Stats::new();
        stats.mem_alloc(10);
        stats.mem_free(10);
        stats.mem_free(10);
        assert_eq!(stats.mem_used(), 0);
        assert_eq!(stats.allocations(), 0);
    }
}
