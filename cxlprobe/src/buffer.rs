//! Memory regions used as attack targets.

use memmap2::{ MmapOptions, MmapRaw };
use crate::error::*;
use crate::timing::{ Target, CACHE_LINE };

/// An anonymous, page-aligned memory mapping.
///
/// All probe/flush/evict targets are derived from one of these (see
/// [`Target`]). The mapping is shared between attacker, victim and observer
/// threads, so it is handed around behind an `Arc` and accessed only through
/// the volatile operations in [`crate::timing`].
pub struct ProbeBuffer {
    map: MmapRaw,
    len: usize,
    /// The NUMA node this buffer was placed on (if any)
    node: Option<usize>,
}
impl ProbeBuffer {
    /// Map an anonymous region of `len` bytes, rounded up to a cache line.
    pub fn anonymous(len: usize) -> Result<Self> {
        let len = len.max(CACHE_LINE).next_multiple_of(CACHE_LINE);
        let map = MmapOptions::new().len(len).map_anon()?;
        Ok(Self { map: MmapRaw::from(map), len, node: None })
    }

    /// Write every page once so the backing frames are allocated now
    /// (under whatever memory policy applies to the calling thread).
    pub fn prefault(&self) {
        let base = self.map.as_mut_ptr();
        for off in (0..self.len).step_by(4096) {
            unsafe { core::ptr::write_volatile(base.add(off), 0) };
        }
    }

    pub(crate) fn set_node(&mut self, node: usize) { self.node = Some(node); }

    pub fn node(&self) -> Option<usize> { self.node }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Number of whole cache lines in the buffer.
    pub fn lines(&self) -> usize { self.len / CACHE_LINE }

    /// A handle covering the entire buffer.
    pub fn target(&self) -> Target<'_> {
        // SAFETY: the mapping is valid for `len` bytes for as long as `self`
        // is borrowed, which the returned lifetime enforces.
        unsafe { Target::from_raw(self.map.as_mut_ptr(), self.len) }
    }

    /// A handle starting at byte offset `off`.
    pub fn at(&self, off: usize) -> Target<'_> {
        self.target().offset(off)
    }

    /// Like [`ProbeBuffer::at`], but reports an out-of-range offset as an
    /// error instead of panicking.
    pub fn checked_at(&self, off: usize) -> Result<Target<'_>> {
        if off >= self.len {
            return Err(Error::Config(format!(
                "offset {:#x} outside buffer of {:#x} bytes", off, self.len)));
        }
        Ok(self.at(off))
    }

    /// A handle for the `idx`-th cache line.
    pub fn line(&self, idx: usize) -> Target<'_> {
        self.target().line(idx)
    }

    /// Handles for the cache lines `first..first + n`.
    pub fn lines_from(&self, first: usize, n: usize) -> Vec<Target<'_>> {
        (first..first + n).map(|i| self.line(i)).collect()
    }

    /// Handles for `n` cache lines spaced `stride` bytes apart. Used to build
    /// eviction and prime sets that land in the same cache set.
    pub fn strided(&self, n: usize, stride: usize) -> Vec<Target<'_>> {
        (0..n).map(|i| self.at(i * stride)).collect()
    }
}

impl std::fmt::Debug for ProbeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeBuffer")
            .field("base", &self.map.as_ptr())
            .field("len", &self.len)
            .field("node", &self.node)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounded_to_lines() {
        let buf = ProbeBuffer::anonymous(100).unwrap();
        assert_eq!(buf.len(), 128);
        assert_eq!(buf.lines(), 2);
        assert_eq!(buf.line(1).addr() - buf.line(0).addr(), 64);
        assert_eq!(buf.line(1).len(), 64);
    }

    #[test]
    fn strided_sets() {
        let buf = ProbeBuffer::anonymous(0x100000).unwrap();
        let set = buf.strided(4, 0x40000);
        assert_eq!(set.len(), 4);
        for t in &set {
            assert_eq!(t.set_index(), set[0].set_index());
        }
    }
}
