//! Attack-step compositions and the hit/miss threshold.

use std::sync::Arc;
use std::sync::atomic::{ AtomicU64, Ordering };

use crate::error::*;
use crate::timing::{ self, CacheLevel, Target };

/// The cycle count separating a cache hit from a miss.
///
/// One `Threshold` is created per measurement context and cloned into every
/// component that classifies samples. Clones share the same value.
///
/// There is one writer (whoever owns the context) and many readers. Reads
/// and writes are relaxed: a classification racing with [`Threshold::set`]
/// may see either the old or the new value.
#[derive(Clone, Debug)]
pub struct Threshold(Arc<AtomicU64>);
impl Threshold {
    /// Default threshold in cycles.
    pub const DEFAULT: u64 = 200;

    pub fn new(cycles: u64) -> Result<Self> {
        if cycles == 0 {
            return Err(Error::InvalidThreshold);
        }
        Ok(Self(Arc::new(AtomicU64::new(cycles))))
    }

    pub fn get(&self) -> u64 { self.0.load(Ordering::Relaxed) }

    pub fn set(&self, cycles: u64) -> Result<()> {
        if cycles == 0 {
            return Err(Error::InvalidThreshold);
        }
        self.0.store(cycles, Ordering::Relaxed);
        Ok(())
    }

    /// Returns true if `cycles` classifies as a hit. Ties are misses.
    pub fn is_hit(&self, cycles: u64) -> bool { cycles < self.get() }
}
impl Default for Threshold {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(Self::DEFAULT)))
    }
}

/// Canonical attack steps built from [`crate::timing`] operations.
#[derive(Clone, Debug, Default)]
pub struct AttackPrimitives {
    threshold: Threshold,
}
impl AttackPrimitives {
    /// Delay between flush and reload, in [`timing::busy_wait`] iterations.
    pub const FLUSH_RELOAD_DELAY: u64 = 100;

    /// Delay between the prime and probe passes.
    pub const PRIME_PROBE_DELAY: u64 = 10_000;

    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }

    /// Shared handle to the threshold used by this library.
    pub fn threshold_handle(&self) -> &Threshold { &self.threshold }

    pub fn threshold(&self) -> u64 { self.threshold.get() }

    pub fn set_threshold(&self, cycles: u64) -> Result<()> {
        log::debug!("threshold {} -> {}", self.threshold.get(), cycles);
        self.threshold.set(cycles)
    }

    pub fn is_hit(&self, cycles: u64) -> bool { self.threshold.is_hit(cycles) }

    /// FLUSH+RELOAD: flush the line, wait, then time a reload.
    pub fn flush_reload(&self, t: Target<'_>) -> u64 {
        self.flush_reload_window(t, Self::FLUSH_RELOAD_DELAY)
    }

    /// FLUSH+RELOAD with a caller-chosen wait between flush and reload.
    pub fn flush_reload_window(&self, t: Target<'_>, delay: u64) -> u64 {
        timing::flush(t);
        timing::fence();
        timing::busy_wait(delay);
        timing::probe(t)
    }

    /// FLUSH+FLUSH: flush the line twice. Used as a quieter variant where
    /// only the flush latency is observable.
    pub fn flush_flush(&self, t: Target<'_>) {
        timing::flush(t);
        timing::fence();
        timing::flush(t);
        timing::fence();
    }

    /// EVICT+TIME: sweep an L3-sized region, then time `probe_t`.
    pub fn evict_time(&self, evict: Target<'_>, probe_t: Target<'_>) -> u64 {
        timing::evict_level(CacheLevel::L3, evict);
        timing::fence();
        timing::probe(probe_t)
    }

    /// EVICT+TIME with an explicit eviction set instead of a linear sweep.
    pub fn evict_set_time(&self, set: &[Target<'_>], probe_t: Target<'_>)
        -> u64
    {
        for t in set {
            timing::reload(*t);
        }
        timing::fence();
        timing::probe(probe_t)
    }

    /// PRIME+PROBE over `set`. Returns the average probe latency and the
    /// number of lines that were still cached.
    pub fn prime_probe(&self, set: &[Target<'_>]) -> Result<(u64, u32)> {
        if set.is_empty() {
            return Err(Error::degenerate(1, 0));
        }

        // Prime
        for t in set {
            timing::probe(*t);
        }
        timing::fence();
        timing::busy_wait(Self::PRIME_PROBE_DELAY);

        // Probe
        let results = timing::probe_many(set);
        let hits = results.iter().filter(|c| self.is_hit(**c)).count() as u32;
        let avg = results.iter().sum::<u64>() / results.len() as u64;
        Ok((avg, hits))
    }

    /// Branch-dependent access followed by a probe.
    ///
    /// Reads the word at `cond`. If it is nonzero, `true_t` is touched
    /// before `probe_t` is timed. When `probe_t` aliases `true_t` this
    /// models a secret-dependent load leaving a trace in the cache.
    pub fn spectre_probe(&self, cond: Target<'_>, true_t: Target<'_>,
        probe_t: Target<'_>) -> u64
    {
        if timing::load(cond) != 0 {
            timing::reload(true_t);
        }
        timing::fence();
        timing::probe(probe_t)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::ProbeBuffer;

    #[test]
    fn threshold_boundary() {
        let t = Threshold::new(300).unwrap();
        assert!(t.is_hit(299));
        assert!(!t.is_hit(300));
        assert!(!t.is_hit(301));
    }

    #[test]
    fn threshold_rejects_zero() {
        assert!(Threshold::new(0).is_err());
        let t = Threshold::default();
        assert!(matches!(t.set(0), Err(Error::InvalidThreshold)));
        assert_eq!(t.get(), Threshold::DEFAULT);
    }

    #[test]
    fn threshold_is_shared() {
        let lib = AttackPrimitives::default();
        let handle = lib.threshold_handle().clone();
        handle.set(512).unwrap();
        assert_eq!(lib.threshold(), 512);
        lib.set_threshold(64).unwrap();
        assert_eq!(handle.get(), 64);
    }

    #[test]
    fn prime_probe_empty_set() {
        let lib = AttackPrimitives::default();
        assert!(matches!(lib.prime_probe(&[]),
            Err(Error::Degenerate { needed: 1, got: 0 })));
    }

    #[test]
    fn compositions_run() {
        let lib = AttackPrimitives::default();
        let evict = ProbeBuffer::anonymous(CacheLevel::L3.region_size()).unwrap();
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let (cond, gadget) = (buf.line(0), buf.line(1));

        timing::reload(gadget);
        lib.evict_time(evict.target(), gadget);
        lib.evict_set_time(&evict.strided(8, 0x1000), gadget);
        lib.flush_flush(gadget);

        timing::store(cond, 1);
        lib.spectre_probe(cond, gadget, gadget);
        timing::store(cond, 0);
        lib.spectre_probe(cond, gadget, gadget);
        assert_eq!(timing::load(cond), 0);
    }

    #[test]
    fn prime_probe_counts() {
        let lib = AttackPrimitives::new(Threshold::new(u64::MAX).unwrap());
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let set = buf.lines_from(0, 16);
        let (_, hits) = lib.prime_probe(&set).unwrap();
        assert_eq!(hits, 16);
    }
}
