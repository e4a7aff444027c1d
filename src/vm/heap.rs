//! Per-process heap allocator
//!
//! Hands out guest-virtual chunks inside the heap segment. The
//! allocator is pure bookkeeping: when it needs more room it reports
//! how many fresh pages to back, and the machine maps the frames and
//! commits the extension. First-fit over a free map keyed by guest
//! address, with coalescing on release.

use std::collections::BTreeMap;

use crate::compiler::HEAP_BASE;

use super::frame::PAGE_SIZE;

/// Chunk bookkeeping for one process heap
#[derive(Debug, Clone, Default)]
pub struct HeapAllocator {
    /// Bytes of heap segment currently backed by frames
    extent: u32,
    /// Free chunks: guest address → size
    free: BTreeMap<u32, u32>,
    /// Live chunks: guest address → size
    used: BTreeMap<u32, u32>,
}

impl HeapAllocator {
    /// Creates an empty heap
    pub fn new() -> Self {
        HeapAllocator::default()
    }

    /// Bytes of segment currently backed
    pub fn extent(&self) -> u32 {
        self.extent
    }

    /// Count of live chunks
    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Finds a first-fit free chunk; `None` means the caller must grow
    /// the heap first
    pub fn fit(&self, size: u32) -> Option<u32> {
        self.free
            .iter()
            .find(|(_, &sz)| sz >= size)
            .map(|(&addr, _)| addr)
    }

    /// Pages needed so a chunk of `size` fits at the segment end
    pub fn pages_for(&self, size: u32) -> u32 {
        // the tail free chunk (if any) already reaches the extent
        let tail = self
            .free
            .iter()
            .next_back()
            .filter(|(&addr, &sz)| addr + sz == HEAP_BASE + self.extent)
            .map(|(_, &sz)| sz)
            .unwrap_or(0);
        (size - size.min(tail)).div_ceil(PAGE_SIZE)
    }

    /// Commits `pages` freshly mapped pages at the segment end
    pub fn grow(&mut self, pages: u32) {
        let addr = HEAP_BASE + self.extent;
        self.extent += pages * PAGE_SIZE;
        self.release_range(addr, pages * PAGE_SIZE);
    }

    /// Claims the chunk at `addr`, splitting the free block it came from
    ///
    /// `addr` must come from [`Self::fit`].
    pub fn take(&mut self, addr: u32, size: u32) -> u32 {
        let block = self.free.remove(&addr).expect("fit returned a free block");
        debug_assert!(block >= size);
        if block > size {
            self.free.insert(addr + size, block - size);
        }
        self.used.insert(addr, size);
        addr
    }

    /// Releases a live chunk; returns its size, or `None` for a bad address
    pub fn release(&mut self, addr: u32) -> Option<u32> {
        let size = self.used.remove(&addr)?;
        self.release_range(addr, size);
        Some(size)
    }

    fn release_range(&mut self, addr: u32, size: u32) {
        let mut addr = addr;
        let mut size = size;
        // merge with the preceding free block
        if let Some((&prev, &prev_size)) = self.free.range(..addr).next_back() {
            if prev + prev_size == addr {
                self.free.remove(&prev);
                addr = prev;
                size += prev_size;
            }
        }
        // merge with the following free block
        if let Some(&next_size) = self.free.get(&(addr + size)) {
            self.free.remove(&(addr + size));
            size += next_size;
        }
        self.free.insert(addr, size);
    }

    /// Clones the other heap's layout; fork uses this after copying the
    /// backing frames
    pub fn copy_from(&mut self, other: &HeapAllocator) {
        self.extent = other.extent;
        self.free = other.free.clone();
        self.used = other.used.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_then_take() {
        let mut heap = HeapAllocator::new();
        assert_eq!(heap.fit(64), None);
        assert_eq!(heap.pages_for(64), 1);
        heap.grow(1);
        let addr = heap.fit(64).unwrap();
        assert_eq!(addr, HEAP_BASE);
        heap.take(addr, 64);
        // the remainder stays free
        assert_eq!(heap.fit(64), Some(HEAP_BASE + 64));
    }

    #[test]
    fn test_release_coalesces() {
        let mut heap = HeapAllocator::new();
        heap.grow(1);
        let a = heap.take(heap.fit(100).unwrap(), 100);
        let b = heap.take(heap.fit(100).unwrap(), 100);
        let c = heap.take(heap.fit(100).unwrap(), 100);
        heap.release(a);
        heap.release(c);
        heap.release(b);
        // everything merged back into one block
        assert_eq!(heap.free.len(), 1);
        assert_eq!(heap.fit(PAGE_SIZE), Some(HEAP_BASE));
    }

    #[test]
    fn test_release_unknown_address() {
        let mut heap = HeapAllocator::new();
        heap.grow(1);
        assert_eq!(heap.release(HEAP_BASE + 4), None);
    }

    #[test]
    fn test_pages_for_accounts_tail() {
        let mut heap = HeapAllocator::new();
        heap.grow(1);
        heap.take(heap.fit(PAGE_SIZE - 100).unwrap(), PAGE_SIZE - 100);
        // 100 bytes remain at the tail; a 150-byte chunk needs one page
        assert_eq!(heap.pages_for(150), 1);
        assert_eq!(heap.pages_for(100), 0);
    }

    #[test]
    fn test_copy_from_mirrors_layout() {
        let mut heap = HeapAllocator::new();
        heap.grow(2);
        let a = heap.take(heap.fit(32).unwrap(), 32);
        let mut twin = HeapAllocator::new();
        twin.copy_from(&heap);
        assert_eq!(twin.extent(), heap.extent());
        assert_eq!(twin.release(a), Some(32));
    }
}
