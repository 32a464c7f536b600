//! Heap bitmap.
//!
//! Every heap word owns one nibble: bit 0 says the word holds a pointer, bit 1 is the mark bit of
//! an object starting at that word and bit 2 is the checkmark bit used by the verification pass.
//! Two words share a byte, so every update is an atomic read-modify-write on that byte.
use crate::{util::PTR_SIZE, Address};
use atomic::{Atomic, Ordering};
use bit_vec::BitVec;
use memmap2::MmapMut;

pub const BIT_POINTER: u8 = 1;
pub const BIT_MARKED: u8 = 2;
pub const BIT_CHECKMARK: u8 = 4;

const BITS_PER_WORD: usize = 4;

pub struct HeapBitmap {
    #[allow(dead_code)]
    mem_map: MmapMut,
    bitmap_begin: *const Atomic<u8>,
    bitmap_size: usize,
    heap_begin: Address,
    heap_limit: Address,
}

unsafe impl Send for HeapBitmap {}
unsafe impl Sync for HeapBitmap {}

impl HeapBitmap {
    pub fn new(heap_begin: Address, heap_size: usize) -> std::io::Result<Self> {
        let nwords = heap_size / PTR_SIZE;
        let bitmap_size = (nwords * BITS_PER_WORD + 7) / 8;
        let mut mem_map = MmapMut::map_anon(bitmap_size.max(1))?;
        let bitmap_begin = mem_map.as_mut_ptr() as *const Atomic<u8>;
        Ok(Self {
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin,
            heap_limit: heap_begin + heap_size,
        })
    }

    #[inline]
    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> Address {
        self.heap_limit
    }

    #[inline]
    pub fn has_address(&self, addr: Address) -> bool {
        addr >= self.heap_begin && addr < self.heap_limit
    }

    #[inline]
    fn locate(&self, addr: Address) -> (&Atomic<u8>, u32) {
        debug_assert!(self.has_address(addr), "{:#x} not covered by heap bitmap", addr);
        let word = (addr - self.heap_begin) / PTR_SIZE;
        let index = word / 2;
        debug_assert!(index < self.bitmap_size);
        let shift = ((word & 1) * BITS_PER_WORD) as u32;
        unsafe { (&*self.bitmap_begin.add(index), shift) }
    }

    #[inline]
    fn bits(&self, addr: Address) -> u8 {
        let (byte, shift) = self.locate(addr);
        (byte.load(Ordering::Acquire) >> shift) & 0xf
    }

    #[inline]
    pub fn is_pointer(&self, addr: Address) -> bool {
        self.bits(addr) & BIT_POINTER != 0
    }

    #[inline]
    pub fn set_pointer(&self, addr: Address, is_pointer: bool) {
        let (byte, shift) = self.locate(addr);
        if is_pointer {
            byte.fetch_or(BIT_POINTER << shift, Ordering::AcqRel);
        } else {
            byte.fetch_and(!(BIT_POINTER << shift), Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.bits(addr) & BIT_MARKED != 0
    }

    /// Sets the mark bit. Returns true for the single caller that flipped it from 0 to 1.
    #[inline]
    pub fn try_mark(&self, addr: Address) -> bool {
        self.test_and_set(addr, BIT_MARKED)
    }

    #[inline]
    pub fn set_marked(&self, addr: Address) {
        let (byte, shift) = self.locate(addr);
        byte.fetch_or(BIT_MARKED << shift, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_marked(&self, addr: Address) {
        let (byte, shift) = self.locate(addr);
        byte.fetch_and(!(BIT_MARKED << shift), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_checkmarked(&self, addr: Address) -> bool {
        self.bits(addr) & BIT_CHECKMARK != 0
    }

    #[inline]
    pub fn try_checkmark(&self, addr: Address) -> bool {
        self.test_and_set(addr, BIT_CHECKMARK)
    }

    #[inline]
    fn test_and_set(&self, addr: Address, bit: u8) -> bool {
        let (byte, shift) = self.locate(addr);
        let mask = bit << shift;
        // Racy fast path, the fetch_or below decides the winner.
        if byte.load(Ordering::Relaxed) & mask != 0 {
            return false;
        }
        byte.fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    pub fn clear_checkmarks(&self, begin: Address, size: usize) {
        let mut addr = begin;
        while addr < begin + size {
            let (byte, shift) = self.locate(addr);
            byte.fetch_and(!(BIT_CHECKMARK << shift), Ordering::AcqRel);
            addr += PTR_SIZE;
        }
    }

    /// Initializes pointer bits for a freshly allocated object of `nwords` words holding `count`
    /// repetitions of a type described by `ptrmask`. Words past the last element are scalar.
    pub fn init_object(&self, addr: Address, nwords: usize, ptrmask: &BitVec, count: usize) {
        let elem_words = ptrmask.len();
        for i in 0..nwords {
            let is_ptr = elem_words != 0 && i < elem_words * count && ptrmask[i % elem_words];
            self.set_pointer(addr + i * PTR_SIZE, is_ptr);
        }
    }
}
