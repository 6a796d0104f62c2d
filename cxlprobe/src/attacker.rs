//! The attacker role.

use bitvec::prelude::*;

use crate::buffer::ProbeBuffer;
use crate::error::*;
use crate::placement::PlacementProvider;
use crate::primitives::{ AttackPrimitives, Threshold };
use crate::stats::{ self, HitMissCount };
use crate::timing::{ self, Target };
use crate::types::*;

/// Results from [`Attacker::repeat_attack`].
#[derive(Debug, Default)]
pub struct AttackBatch {
    /// Completed trials, with consecutive attack ids starting at zero
    pub results: Vec<AttackResult>,
    /// Index of each failed trial and the reason it failed
    pub skipped: Vec<(usize, Error)>,
}
impl AttackBatch {
    /// Number of trials that produced a result.
    pub fn completed(&self) -> usize { self.results.len() }

    /// Hits and misses over completed trials only.
    pub fn hit_miss(&self) -> HitMissCount {
        stats::success_rate(&self.results)
    }

    /// Probe latencies of all completed trials, in order.
    pub fn probe_times(&self) -> Vec<u64> {
        self.results.iter().map(|r| r.attacker_probe_time).collect()
    }
}

/// Runs attack protocols against victim-owned memory and produces
/// [`AttackResult`] records.
///
/// An attacker must be bound to a cpu with [`Attacker::init`] before any
/// attack; until then every attack returns
/// [`Error::NotInitialized`].
#[derive(Debug)]
pub struct Attacker {
    cpu: Option<usize>,
    lib: AttackPrimitives,
    data_location: DataPlacement,
    thread_config: ThreadPlacement,

    /// Holds the branch condition word for [`Attacker::spectre_attack`]
    scratch: Option<ProbeBuffer>,
}

impl Attacker {
    /// Busy-wait window between flush and reload, giving a concurrently
    /// running victim time to touch the line.
    pub const VICTIM_WINDOW: u64 = 1000;

    pub fn new(threshold: Threshold) -> Self {
        Self {
            cpu: None,
            lib: AttackPrimitives::new(threshold),
            data_location: DataPlacement::NormalNode,
            thread_config: ThreadPlacement::CrossCore,
            scratch: None,
        }
    }

    /// Set the placement tags attached to every result.
    pub fn with_placement(mut self, data: DataPlacement,
        thread: ThreadPlacement) -> Self
    {
        self.data_location = data;
        self.thread_config = thread;
        self
    }

    /// Pin the calling thread to `cpu` and mark the attacker ready.
    pub fn init(&mut self, cpu: usize, placement: &dyn PlacementProvider)
        -> Result<()>
    {
        placement.bind_thread_to_cpu(cpu)?;
        self.scratch = Some(ProbeBuffer::anonymous(timing::CACHE_LINE)?);
        self.cpu = Some(cpu);
        log::info!("attacker initialized on cpu {}", cpu);
        Ok(())
    }

    /// Forget the cpu binding. Attacks fail until the next `init`.
    pub fn cleanup(&mut self) {
        self.cpu = None;
        self.scratch = None;
        log::debug!("attacker cleanup");
    }

    pub fn cpu(&self) -> Option<usize> { self.cpu }
    pub fn primitives(&self) -> &AttackPrimitives { &self.lib }

    fn ready(&self) -> Result<usize> {
        self.cpu.ok_or(Error::NotInitialized(Role::Attacker))
    }

    /// Build a result for a single classified probe.
    fn single(&self, victim_access_time: u64, probe_time: u64) -> AttackResult {
        let is_hit = self.lib.is_hit(probe_time);
        AttackResult {
            attack_id: 0,
            victim_access_time,
            attacker_probe_time: probe_time,
            latency_diff: probe_time.abs_diff(self.lib.threshold()),
            hit_count: is_hit as u32,
            miss_count: !is_hit as u32,
            is_hit,
            data_location: self.data_location,
            thread_config: self.thread_config,
        }
    }

    /// FLUSH+RELOAD against `victim`.
    ///
    /// A hit means something (the victim) brought the line back into the
    /// cache during the window between flush and reload.
    pub fn flush_reload_attack(&mut self, victim: Target<'_>)
        -> Result<AttackResult>
    {
        self.ready()?;
        let t = self.lib.flush_reload_window(victim, Self::VICTIM_WINDOW);
        Ok(self.single(t, t))
    }

    /// FLUSH+RELOAD with the victim interleaved on the same hardware thread.
    /// `victim_step` runs between the flush and the reload.
    pub fn interleaved_flush_reload_attack<F>(&mut self, victim: Target<'_>,
        victim_step: F) -> Result<AttackResult>
        where F: FnOnce() -> u64
    {
        self.ready()?;
        timing::flush(victim);
        timing::fence();
        let victim_time = victim_step();
        timing::busy_wait(AttackPrimitives::FLUSH_RELOAD_DELAY);
        let t = timing::probe(victim);
        Ok(self.single(victim_time, t))
    }

    /// EVICT+TIME against `victim` using an explicit eviction set.
    ///
    /// The victim line is timed once while warm (reported as
    /// `victim_access_time`), then again after the eviction set has been
    /// walked.
    pub fn evict_time_attack(&mut self, victim: Target<'_>,
        evict_set: &[Target<'_>]) -> Result<AttackResult>
    {
        self.ready()?;
        if evict_set.is_empty() {
            return Err(Error::degenerate(1, 0));
        }
        timing::reload(victim);
        let warm = timing::probe(victim);
        let t = self.lib.evict_set_time(evict_set, victim);
        Ok(self.single(warm, t))
    }

    /// PRIME+PROBE over `set`. The result counts a hit if any line in the
    /// set survived the wait.
    pub fn prime_probe_attack(&mut self, set: &[Target<'_>])
        -> Result<AttackResult>
    {
        self.ready()?;
        let (avg, hits) = self.lib.prime_probe(set)?;
        let mut res = self.single(0, avg);
        res.hit_count = hits;
        res.miss_count = set.len() as u32 - hits;
        res.is_hit = hits > 0;
        Ok(res)
    }

    /// Branch-dependent access to `gadget`.
    ///
    /// The gadget line is flushed, then touched only if `condition` is set,
    /// then probed. A hit reveals the branch outcome.
    pub fn spectre_attack(&mut self, gadget: Target<'_>, condition: bool)
        -> Result<AttackResult>
    {
        self.ready()?;
        let scratch = self.scratch.as_ref()
            .ok_or(Error::NotInitialized(Role::Attacker))?;
        let cond = scratch.target();
        timing::store(cond, condition as u64);
        timing::flush(gadget);
        timing::fence();
        let t = self.lib.spectre_probe(cond, gadget, gadget);
        Ok(self.single(0, t))
    }

    /// Run `trial` `n` times.
    ///
    /// Failed trials are logged and skipped; the batch carries on. Completed
    /// trials are numbered consecutively from zero, so `attack_id` indexes
    /// into [`AttackBatch::results`].
    pub fn repeat_attack<F>(&mut self, mut trial: F, n: usize)
        -> Result<AttackBatch>
        where F: FnMut(&mut Self) -> Result<AttackResult>
    {
        self.ready()?;
        let mut batch = AttackBatch::default();
        for idx in 0..n {
            match trial(self) {
                Ok(mut res) => {
                    res.attack_id = batch.results.len() as u64;
                    batch.results.push(res);
                },
                Err(e) => {
                    log::warn!("trial {}/{} failed: {}", idx + 1, n, e);
                    batch.skipped.push((idx, e));
                },
            }
        }
        if !batch.skipped.is_empty() {
            log::info!("{} of {} trials skipped", batch.skipped.len(), n);
        }
        Ok(batch)
    }

    /// Time one load from each address.
    pub fn probe_addresses(&self, set: &[Target<'_>]) -> Result<Vec<u64>> {
        self.ready()?;
        Ok(timing::probe_many(set))
    }

    /// Spin on a small local buffer to bring the core out of low-power
    /// states before measuring.
    pub fn warmup(&self, iterations: usize) {
        let mut scratch = [0u64; 1024];
        for i in 0..iterations as u64 {
            for (j, x) in scratch.iter_mut().enumerate() {
                *x = i.wrapping_mul(j as u64);
            }
            std::hint::black_box(&mut scratch);
        }
    }

    /// Collect `n` flush/wait/reload latencies for `victim`.
    pub fn timing_sidechannel(&self, victim: Target<'_>, n: usize)
        -> Result<Vec<u64>>
    {
        self.ready()?;
        Ok((0..n).map(|_| self.lib.flush_reload(victim)).collect())
    }

    /// Record `n` FLUSH+RELOAD outcomes for `victim` as a bit pattern
    /// (1 = hit).
    pub fn collect_pattern(&self, victim: Target<'_>, n: usize)
        -> Result<BitVec<usize, Msb0>>
    {
        Ok(self.timing_sidechannel(victim, n)?
            .into_iter()
            .map(|t| self.lib.is_hit(t))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::placement::UnpinnedPlacement;

    fn ready_attacker() -> Attacker {
        let mut a = Attacker::new(Threshold::default());
        a.init(0, &UnpinnedPlacement::new(2, 1)).unwrap();
        a
    }

    #[test]
    fn attacks_require_init() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut a = Attacker::new(Threshold::default());
        assert!(matches!(a.flush_reload_attack(buf.line(0)),
            Err(Error::NotInitialized(Role::Attacker))));
        assert!(matches!(a.prime_probe_attack(&buf.lines_from(0, 4)),
            Err(Error::NotInitialized(_))));
        assert!(a.repeat_attack(|a| a.spectre_attack(buf.line(1), true), 3)
            .is_err());
    }

    #[test]
    fn timed_addresses_need_init() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let set = buf.lines_from(0, 6);
        let a = Attacker::new(Threshold::default());
        assert!(matches!(a.probe_addresses(&set),
            Err(Error::NotInitialized(Role::Attacker))));
        let a = ready_attacker();
        assert_eq!(a.probe_addresses(&set).unwrap().len(), 6);
        assert!(a.probe_addresses(&[]).unwrap().is_empty());
    }

    #[test]
    fn init_rejects_bad_cpu() {
        let mut a = Attacker::new(Threshold::default());
        assert!(matches!(a.init(5, &UnpinnedPlacement::new(2, 1)),
            Err(Error::InvalidCpu { cpu: 5, available: 2 })));
        assert_eq!(a.cpu(), None);
    }

    #[test]
    fn repeat_skips_failures() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut a = ready_attacker();
        let mut calls = 0;
        let batch = a.repeat_attack(|a| {
            calls += 1;
            if calls % 3 == 0 {
                return Err(Error::degenerate(1, 0));
            }
            a.flush_reload_attack(buf.line(0))
        }, 9).unwrap();

        assert_eq!(batch.completed(), 6);
        assert_eq!(batch.skipped.len(), 3);
        let ids: Vec<u64> = batch.results.iter().map(|r| r.attack_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        let skipped: Vec<usize> = batch.skipped.iter().map(|(i, _)| *i).collect();
        assert_eq!(skipped, vec![2, 5, 8]);
        assert_eq!(batch.hit_miss().total(), 6);
    }

    #[test]
    fn result_fields() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut a = ready_attacker()
            .with_placement(DataPlacement::CxlMemory, ThreadPlacement::SameThread);
        let r = a.flush_reload_attack(buf.line(2)).unwrap();
        assert_eq!(r.hit_count + r.miss_count, 1);
        assert_eq!(r.is_hit, r.hit_count == 1);
        assert_eq!(r.latency_diff,
            r.attacker_probe_time.abs_diff(Threshold::DEFAULT));
        assert_eq!(r.data_location, DataPlacement::CxlMemory);
        assert_eq!(r.thread_config, ThreadPlacement::SameThread);

        let set = buf.lines_from(8, 8);
        let r = a.prime_probe_attack(&set).unwrap();
        assert_eq!(r.hit_count + r.miss_count, 8);
    }

    #[test]
    fn evict_time_needs_set() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut a = ready_attacker();
        assert!(a.evict_time_attack(buf.line(0), &[]).is_err());
        let set = buf.lines_from(1, 16);
        assert!(a.evict_time_attack(buf.line(0), &set).is_ok());
    }

    #[test]
    fn interleaved_step_runs() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut a = ready_attacker();
        let mut ran = false;
        let r = a.interleaved_flush_reload_attack(buf.line(0), || {
            ran = true;
            42
        }).unwrap();
        assert!(ran);
        assert_eq!(r.victim_access_time, 42);
    }

    #[test]
    fn pattern_length() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let a = ready_attacker();
        assert_eq!(a.collect_pattern(buf.line(0), 32).unwrap().len(), 32);
        a.warmup(4);
    }
}
