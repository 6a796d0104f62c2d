//! Cycle-accurate primitive operations.
//!
//! This module is the only place where raw memory is touched. Everything
//! above it names memory through a [`Target`], which is a pointer and a
//! length borrowed from a live region (normally a
//! [`ProbeBuffer`](crate::buffer::ProbeBuffer)).
//!
//! Safety
//! ======
//!
//! A `Target` is constructed either from a `ProbeBuffer` (safe; the borrow
//! keeps the mapping alive) or with [`Target::from_raw`], which is `unsafe`
//! because the caller must guarantee the region is mapped, readable and
//! writable for the target's lifetime. Given that, every operation here is
//! sound: accesses are volatile, stay inside `[ptr, ptr + len)`, and the
//! word-sized operations (`load`, `store`, `atomic_bump`) act on the first
//! aligned 8-byte word of the region.
//!
//! The memory is shared between threads without locking. Attacker and
//! victim race on it; the only ordering we rely on is the fences issued
//! here.
//!
//! A null target is a contract violation. Debug builds assert; release
//! builds turn every operation on it into a no-op returning zero cycles.

use std::marker::PhantomData;
use std::sync::atomic::{ AtomicU64, Ordering };

/// Cache line size assumed by all eviction and stride arithmetic.
pub const CACHE_LINE: usize = 64;

/// Number of L3 set-index bits used by [`Target::set_index`].
const SET_INDEX_MASK: usize = 0xfff;

/// An address to be flushed, probed, or evicted.
#[derive(Clone, Copy)]
pub struct Target<'a> {
    ptr: *mut u8,
    len: usize,
    _region: PhantomData<&'a [u8]>,
}

impl<'a> Target<'a> {
    /// Create a handle for `len` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must either be null or point to a region valid for reads and
    /// writes of `len` bytes for all of `'a`.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len, _region: PhantomData }
    }

    /// A null handle. Operations on it are contract violations.
    pub fn null() -> Self {
        Self { ptr: core::ptr::null_mut(), len: 0, _region: PhantomData }
    }

    pub fn is_null(&self) -> bool { self.ptr.is_null() }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// The virtual address, for reporting.
    pub fn addr(&self) -> usize { self.ptr as usize }

    /// Cache set index of this address (bits 6..18).
    pub fn set_index(&self) -> usize {
        (self.addr() / CACHE_LINE) & SET_INDEX_MASK
    }

    /// Sub-handle starting `off` bytes into this region.
    ///
    /// Panics if `off` is outside the region.
    pub fn offset(&self, off: usize) -> Target<'a> {
        assert!(off < self.len, "offset {:#x} outside region of {:#x} bytes",
            off, self.len);
        Self {
            ptr: unsafe { self.ptr.add(off) },
            len: self.len - off,
            _region: PhantomData,
        }
    }

    /// Sub-handle for the `idx`-th cache line of this region.
    pub fn line(&self, idx: usize) -> Target<'a> {
        let mut t = self.offset(idx * CACHE_LINE);
        t.len = t.len.min(CACHE_LINE);
        t
    }

    /// Returns false (and fails fast in debug builds) on a null handle.
    #[inline(always)]
    fn valid(&self) -> bool {
        debug_assert!(!self.ptr.is_null(), "operation on a null target");
        !self.ptr.is_null()
    }

    /// First 8-byte aligned word inside the region.
    #[inline(always)]
    fn word(&self) -> Option<*mut u64> {
        let pad = self.ptr.align_offset(8);
        if pad.checked_add(8).map_or(true, |end| end > self.len) {
            debug_assert!(false, "target too small for a word access");
            return None;
        }
        Some(unsafe { self.ptr.add(pad) } as *mut u64)
    }
}

impl std::fmt::Debug for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({:p}, {:#x})", self.ptr, self.len)
    }
}

/// Cache levels that [`evict_level`] can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}
impl CacheLevel {
    /// Number of cache lines touched to push a line out of this level.
    pub fn lines(&self) -> usize {
        match self {
            Self::L1 => 64,
            Self::L2 => 256,
            Self::L3 => 4096,
        }
    }

    /// Bytes an eviction region must cover for this level.
    pub fn region_size(&self) -> usize { self.lines() * CACHE_LINE }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use core::arch::x86_64::*;

    #[inline(always)]
    pub fn counter() -> (u64, u32) {
        let mut aux = 0u32;
        let tsc = unsafe { __rdtscp(&mut aux) };
        // Linux puts (node << 12 | cpu) in TSC_AUX
        (tsc, aux & 0xfff)
    }
    #[inline(always)]
    pub fn lfence() { unsafe { _mm_lfence() } }
    #[inline(always)]
    pub fn mfence() { unsafe { _mm_mfence() } }
    #[inline(always)]
    pub unsafe fn clflush(p: *const u8) { unsafe { _mm_clflush(p) } }
    #[inline(always)]
    pub unsafe fn prefetch(p: *const u8) {
        unsafe { _mm_prefetch::<_MM_HINT_T0>(p as *const i8) }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod arch {
    use std::sync::OnceLock;
    use std::sync::atomic::{ compiler_fence, fence, Ordering };
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();

    /// Nanoseconds since first use. There is no portable cycle counter.
    #[inline(always)]
    pub fn counter() -> (u64, u32) {
        compiler_fence(Ordering::SeqCst);
        let t = EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64;
        compiler_fence(Ordering::SeqCst);
        (t, 0)
    }
    #[inline(always)]
    pub fn lfence() { compiler_fence(Ordering::SeqCst) }
    #[inline(always)]
    pub fn mfence() { fence(Ordering::SeqCst) }
    #[inline(always)]
    pub unsafe fn clflush(_p: *const u8) { fence(Ordering::SeqCst) }
    #[inline(always)]
    pub unsafe fn prefetch(_p: *const u8) {}
}

/// Read the cycle counter. Returns the counter value and the id of the cpu
/// it was read on.
#[inline(always)]
pub fn read_counter() -> (u64, u32) { arch::counter() }

/// Full memory barrier followed by a load fence.
#[inline(always)]
pub fn fence() {
    arch::mfence();
    arch::lfence();
}

/// Spin for `iterations` without touching memory or yielding to the
/// scheduler.
#[inline(never)]
pub fn busy_wait(iterations: u64) {
    for i in 0..iterations {
        std::hint::black_box(i);
    }
}

/// Evict the line containing `t` from every cache level.
#[inline(always)]
pub fn flush(t: Target<'_>) {
    if !t.valid() { return; }
    unsafe { arch::clflush(t.ptr) };
    arch::mfence();
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}

/// Evict every cache line overlapping `t`. A single fence follows the
/// whole range.
pub fn flush_range(t: Target<'_>) {
    if !t.valid() || t.len == 0 { return; }
    unsafe { arch::clflush(t.ptr) };
    // Offset of the first line boundary after the start
    let head = CACHE_LINE - t.addr() % CACHE_LINE;
    for i in 1..lines_spanned(t) {
        unsafe { arch::clflush(t.ptr.add(head + (i - 1) * CACHE_LINE)) };
    }
    arch::mfence();
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}

/// Number of cache lines overlapping `t`.
pub fn lines_spanned(t: Target<'_>) -> usize {
    if t.len == 0 { return 0; }
    let first = t.addr() / CACHE_LINE;
    let last = (t.addr() + t.len - 1) / CACHE_LINE;
    last - first + 1
}

/// Time a single load from `t`.
#[inline(always)]
pub fn probe(t: Target<'_>) -> u64 {
    if !t.valid() { return 0; }
    arch::lfence();
    let (start, _) = arch::counter();
    unsafe { core::ptr::read_volatile(t.ptr) };
    let (end, _) = arch::counter();
    arch::lfence();
    end.saturating_sub(start)
}

/// Time a load from each target in order. The batch is bracketed by a
/// single pair of fences.
pub fn probe_many(targets: &[Target<'_>]) -> Vec<u64> {
    let mut res = vec![0u64; targets.len()];
    arch::lfence();
    for (t, out) in targets.iter().zip(res.iter_mut()) {
        if !t.valid() { continue; }
        let (start, _) = arch::counter();
        unsafe { core::ptr::read_volatile(t.ptr) };
        let (end, _) = arch::counter();
        *out = end.saturating_sub(start);
    }
    arch::lfence();
    res
}

/// Untimed load from `t`.
#[inline(always)]
pub fn reload(t: Target<'_>) {
    if !t.valid() { return; }
    unsafe { core::ptr::read_volatile(t.ptr) };
}

/// Software prefetch of `t` into all cache levels.
#[inline(always)]
pub fn prefetch(t: Target<'_>) {
    if !t.valid() { return; }
    unsafe { arch::prefetch(t.ptr) };
}

/// Push lines out of `level` by touching `level.lines()` consecutive cache
/// lines starting at `t`.
///
/// `t` must cover [`CacheLevel::region_size`] bytes. Debug builds assert
/// this; release builds touch only the lines that fit.
pub fn evict_level(level: CacheLevel, t: Target<'_>) {
    if !t.valid() { return; }
    debug_assert!(t.len >= level.region_size(),
        "{:?} eviction needs {:#x} bytes, region has {:#x}",
        level, level.region_size(), t.len);
    let lines = level.lines().min(t.len.div_ceil(CACHE_LINE));
    for i in 0..lines {
        unsafe { core::ptr::read_volatile(t.ptr.add(i * CACHE_LINE)) };
    }
}

/// Volatile load of the first byte of `t`.
#[inline(always)]
pub fn load_byte(t: Target<'_>) -> u8 {
    if !t.valid() { return 0; }
    unsafe { core::ptr::read_volatile(t.ptr) }
}

/// Volatile store to the first byte of `t`.
#[inline(always)]
pub fn store_byte(t: Target<'_>, value: u8) {
    if !t.valid() { return; }
    unsafe { core::ptr::write_volatile(t.ptr, value) };
}

/// Volatile load of the first word of `t`.
#[inline(always)]
pub fn load(t: Target<'_>) -> u64 {
    if !t.valid() { return 0; }
    match t.word() {
        Some(p) => unsafe { core::ptr::read_volatile(p) },
        None => 0,
    }
}

/// Volatile store to the first word of `t`.
#[inline(always)]
pub fn store(t: Target<'_>, value: u64) {
    if !t.valid() { return; }
    if let Some(p) = t.word() {
        unsafe { core::ptr::write_volatile(p, value) };
    }
}

/// Time a store to the first word of `t`.
pub fn timed_store(t: Target<'_>, value: u64) -> u64 {
    if !t.valid() { return 0; }
    arch::lfence();
    let (start, _) = arch::counter();
    store(t, value);
    arch::mfence();
    let (end, _) = arch::counter();
    arch::lfence();
    end.saturating_sub(start)
}

/// Atomically add one to the first word of `t`.
#[inline(always)]
pub fn atomic_bump(t: Target<'_>) {
    if !t.valid() { return; }
    if let Some(p) = t.word() {
        let a = unsafe { &*(p as *const AtomicU64) };
        a.fetch_add(1, Ordering::SeqCst);
    }
}
