use crate::{util::*, Address};
use memmap2::MmapMut;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Contiguous reservation all heap spans are carved from.
///
/// Every word of the arena is accessed through `AtomicUsize`: mutators, mark workers and the
/// sweeper all touch object memory concurrently.
pub struct Arena {
    #[allow(dead_code)]
    map: MmapMut,
    start: Address,
    size: usize,
}

impl Arena {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = round_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let mut map = MmapMut::map_anon(size)?;
        let start = map.as_mut_ptr() as Address;
        Ok(Self { map, start, size })
    }

    #[inline]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.start + self.size
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.size >> PAGE_SHIFT
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[inline]
    pub fn page_index(&self, addr: Address) -> usize {
        (addr - self.start) >> PAGE_SHIFT
    }

    #[inline]
    pub fn page_address(&self, index: usize) -> Address {
        self.start + (index << PAGE_SHIFT)
    }

    #[inline]
    pub fn word(&self, addr: Address) -> &AtomicUsize {
        debug_assert!(self.contains(addr), "{:#x} is outside of the arena", addr);
        debug_assert_eq!(addr % PTR_SIZE, 0);
        unsafe { &*(addr as *const AtomicUsize) }
    }

    #[inline]
    pub fn words(&self, addr: Address, n: usize) -> &[AtomicUsize] {
        debug_assert!(n == 0 || self.contains(addr + (n - 1) * PTR_SIZE));
        unsafe { std::slice::from_raw_parts(addr as *const AtomicUsize, n) }
    }

    pub fn zero(&self, addr: Address, size: usize) {
        for word in self.words(addr, size / PTR_SIZE) {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_pages() {
        let arena = Arena::new(10 * PAGE_SIZE + 1).unwrap();
        assert_eq!(arena.npages(), 11);
        let p = arena.page_address(3);
        assert_eq!(arena.page_index(p + 100), 3);
        arena.word(p).store(42, Ordering::Relaxed);
        assert_eq!(arena.words(p, 2)[0].load(Ordering::Relaxed), 42);
        arena.zero(p, PAGE_SIZE);
        assert_eq!(arena.word(p).load(Ordering::Relaxed), 0);
        assert!(!arena.contains(arena.end()));
    }
}
