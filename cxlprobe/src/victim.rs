//! The victim role.
//!
//! A [`Victim`] performs memory-access workloads that create (or suppress)
//! observable cache state. It can run inline on the caller's thread, or on a
//! dedicated pinned thread driven by [`VictimCommand`] messages (see
//! [`VictimThread`]).

use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{ self, Receiver, Sender };
use std::thread::JoinHandle;
use std::time::Duration;

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::buffer::ProbeBuffer;
use crate::error::*;
use crate::placement::PlacementProvider;
use crate::primitives::Threshold;
use crate::timing::{ self, Target };

/// Running aggregate over every access a victim performed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct VictimStats {
    pub total_accesses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_latency: f64,
    pub max_latency: u64,
    /// Zero until the first access is recorded
    pub min_latency: u64,
}
impl VictimStats {
    fn record(&mut self, cycles: u64, hit: bool) {
        if self.total_accesses == 0 {
            self.min_latency = cycles;
        }
        self.total_accesses += 1;
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
        self.max_latency = self.max_latency.max(cycles);
        self.min_latency = self.min_latency.min(cycles);
        self.avg_latency += (cycles as f64 - self.avg_latency)
            / self.total_accesses as f64;
    }
}

/// Order in which [`Victim::memory_sequence`] walks its addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum AccessPattern {
    /// Each address once, in order.
    Sequential,
    /// As many uniformly random picks as there are addresses.
    Random,
    /// Passes with stride 1, 2, 4, ... while the stride is below the number
    /// of addresses.
    Stride,
}
impl FromStr for AccessPattern {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "random" => Ok(Self::Random),
            "stride" => Ok(Self::Stride),
            _ => Err(Error::UnknownVariant {
                kind: "access pattern", name: s.into()
            }),
        }
    }
}

/// Background work a victim can perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkloadKind {
    /// Integer busy loop with a fixed iteration budget.
    CpuIntensive,
    /// Repeated line-by-line scans of a 1MiB buffer until the deadline.
    MemoryIntensive,
}
impl FromStr for WorkloadKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu-intensive" => Ok(Self::CpuIntensive),
            "memory-intensive" => Ok(Self::MemoryIntensive),
            _ => Err(Error::UnknownVariant { kind: "workload", name: s.into() }),
        }
    }
}

/// Kind of a single access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Performs victim-side memory accesses and keeps [`VictimStats`].
#[derive(Debug)]
pub struct Victim {
    cpu: Option<usize>,
    threshold: Threshold,
    stats: VictimStats,
    rng: StdRng,
}

impl Victim {
    /// Assumed core clock used to turn durations into cycle budgets.
    pub const CYCLES_PER_US: u64 = 2400;

    /// Size of the buffer scanned by [`WorkloadKind::MemoryIntensive`].
    pub const SCAN_SIZE: usize = 1 << 20;

    /// Bytes processed by one [`Victim::encrypt_operation`].
    pub const BLOCK_SIZE: usize = 256;

    pub fn new(threshold: Threshold) -> Self {
        Self {
            cpu: None,
            threshold,
            stats: VictimStats::default(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Pin the calling thread to `cpu`. Resets the statistics.
    pub fn init(&mut self, cpu: usize, placement: &dyn PlacementProvider)
        -> Result<()>
    {
        placement.bind_thread_to_cpu(cpu)?;
        self.cpu = Some(cpu);
        self.stats = VictimStats::default();
        log::info!("victim initialized on cpu {}", cpu);
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.cpu = None;
        log::debug!("victim cleanup");
    }

    pub fn cpu(&self) -> Option<usize> { self.cpu }

    /// Snapshot of the running statistics.
    pub fn stats(&self) -> VictimStats { self.stats }

    fn ready(&self) -> Result<()> {
        self.cpu.map(|_| ()).ok_or(Error::NotInitialized(Role::Victim))
    }

    /// Timed read of `t`, recorded in the statistics.
    fn timed_read(&mut self, t: Target<'_>) -> u64 {
        let cycles = timing::probe(t);
        self.stats.record(cycles, self.threshold.is_hit(cycles));
        cycles
    }

    /// A single read or write to `t`. Returns the elapsed cycles.
    pub fn single_access(&mut self, t: Target<'_>, access: Access)
        -> Result<u64>
    {
        self.ready()?;
        Ok(match access {
            Access::Read => self.timed_read(t),
            Access::Write => {
                let cycles = timing::timed_store(t, self.stats.total_accesses);
                self.stats.record(cycles, self.threshold.is_hit(cycles));
                cycles
            },
        })
    }

    /// Touch `addrs` in the given order.
    pub fn memory_sequence(&mut self, addrs: &[Target<'_>],
        pattern: AccessPattern) -> Result<()>
    {
        self.ready()?;
        if addrs.is_empty() {
            return Err(Error::degenerate(1, 0));
        }
        let n = addrs.len();
        match pattern {
            AccessPattern::Sequential => {
                for t in addrs {
                    self.timed_read(*t);
                }
            },
            AccessPattern::Random => {
                for _ in 0..n {
                    let idx = self.rng.gen_range(0..n);
                    self.timed_read(addrs[idx]);
                }
            },
            AccessPattern::Stride => {
                let mut stride = 1;
                while stride < n {
                    for t in addrs.iter().step_by(stride) {
                        self.timed_read(*t);
                    }
                    stride *= 2;
                }
            },
        }
        Ok(())
    }

    /// Cycles in `duration` at [`Victim::CYCLES_PER_US`], saturating.
    fn cycle_budget(duration: Duration) -> u64 {
        u64::try_from(duration.as_micros())
            .unwrap_or(u64::MAX)
            .saturating_mul(Self::CYCLES_PER_US)
    }

    /// Run a workload for roughly `duration`.
    pub fn workload(&mut self, duration: Duration, kind: WorkloadKind)
        -> Result<()>
    {
        self.ready()?;
        if duration.is_zero() {
            return Err(Error::Config("workload duration must be non-zero".into()));
        }
        let budget = Self::cycle_budget(duration);
        match kind {
            WorkloadKind::CpuIntensive => {
                let mut x: u64 = 0;
                for i in 0..budget {
                    x = x.wrapping_mul(1664525).wrapping_add(1013904223) ^ i;
                    std::hint::black_box(x);
                }
            },
            WorkloadKind::MemoryIntensive => {
                let buf = ProbeBuffer::anonymous(Self::SCAN_SIZE)?;
                let (start, _) = timing::read_counter();
                let deadline = start.saturating_add(budget);
                while timing::read_counter().0 < deadline {
                    for line in 0..buf.lines() {
                        timing::reload(buf.line(line));
                    }
                }
            },
        }
        Ok(())
    }

    /// Data-dependent branch selecting which line to read. Returns the
    /// latency of the read.
    pub fn branch_operation(&mut self, condition: bool, true_t: Target<'_>,
        false_t: Target<'_>) -> Result<u64>
    {
        self.ready()?;
        let t = if std::hint::black_box(condition) { true_t } else { false_t };
        Ok(self.timed_read(t))
    }

    /// Table lookups at `indices` (wrapped to the table size), in the
    /// manner of an S-box. Returns the xor of all bytes read.
    pub fn lookup_operation(&mut self, table: Target<'_>, indices: &[usize])
        -> Result<u8>
    {
        self.ready()?;
        if table.is_empty() {
            return Err(Error::degenerate(1, 0));
        }
        let mut acc = 0u8;
        for idx in indices {
            let t = table.offset(idx % table.len());
            self.timed_read(t);
            acc ^= timing::load_byte(t);
        }
        Ok(acc)
    }

    /// Toy block cipher over [`Victim::BLOCK_SIZE`] bytes.
    ///
    /// Each byte of `plaintext` is xored with the repeating `key` and written
    /// to `ciphertext`. The result then indexes the 256-byte `sbox`, so the
    /// line touched in the table depends on secret data. Every table read is
    /// timed and recorded.
    pub fn encrypt_operation(&mut self, key: &[u8], plaintext: Target<'_>,
        ciphertext: Target<'_>, sbox: Target<'_>) -> Result<()>
    {
        self.ready()?;
        if key.is_empty() {
            return Err(Error::degenerate(1, 0));
        }
        for t in [plaintext, ciphertext, sbox] {
            if t.len() < Self::BLOCK_SIZE {
                return Err(Error::degenerate(Self::BLOCK_SIZE, t.len()));
            }
        }
        for i in 0..Self::BLOCK_SIZE {
            let c = timing::load_byte(plaintext.offset(i)) ^ key[i % key.len()];
            timing::store_byte(ciphertext.offset(i), c);
            self.timed_read(sbox.offset(c as usize));
        }
        Ok(())
    }

    /// Pointer-chasing walk over `chain`: the word loaded at each step picks
    /// the next link. Returns the final word.
    pub fn chain_access(&mut self, chain: &[Target<'_>]) -> Result<u64> {
        self.ready()?;
        if chain.is_empty() {
            return Err(Error::degenerate(1, 0));
        }
        let mut idx = 0;
        let mut value = 0;
        for step in 0..chain.len() {
            self.timed_read(chain[idx]);
            value = timing::load(chain[idx]);
            idx = (value as usize).wrapping_add(step + 1) % chain.len();
        }
        Ok(value)
    }

    /// Sleep without touching memory.
    pub fn idle(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Read `t` `iterations` times, sleeping `interval` in between.
    pub fn timed_loop(&mut self, t: Target<'_>, iterations: usize,
        interval: Duration) -> Result<()>
    {
        self.ready()?;
        for _ in 0..iterations {
            self.timed_read(t);
            std::thread::sleep(interval);
        }
        Ok(())
    }
}

/// Requests delivered to a [`VictimThread`]. Offsets are byte offsets into
/// the thread's shared buffer.
#[derive(Debug)]
pub enum VictimCommand {
    Access { offset: usize, access: Access },
    Sequence { offsets: Vec<usize>, pattern: AccessPattern },
    Lookup { indices: Vec<usize> },
    Branch { condition: bool, true_offset: usize, false_offset: usize },
    Workload { duration: Duration, kind: WorkloadKind },
    /// Encrypt one block. The S-box is the first 256 bytes of the buffer.
    Encrypt { key: Vec<u8>, plaintext: usize, ciphertext: usize },
    Idle(Duration),
    /// Read `offset` repeatedly, sleeping `interval` between reads.
    Repeat { offset: usize, iterations: usize, interval: Duration },
    /// Reply once every earlier command has completed.
    Barrier(Sender<()>),
    Shutdown,
}

/// A [`Victim`] running on its own pinned thread.
///
/// The thread blocks on a channel and executes commands in the order they
/// were sent. Failed commands are logged and skipped.
pub struct VictimThread {
    tx: Sender<VictimCommand>,
    handle: Option<JoinHandle<VictimStats>>,
}

impl VictimThread {
    /// Spawn a victim pinned to `cpu`, operating on `buf`.
    ///
    /// Returns once the victim has been pinned, or with the error that
    /// prevented it.
    pub fn spawn(cpu: usize, placement: Arc<dyn PlacementProvider>,
        threshold: Threshold, buf: Arc<ProbeBuffer>) -> Result<Self>
    {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(format!("victim-{}", cpu))
            .spawn(move || {
                let mut victim = Victim::new(threshold);
                match victim.init(cpu, placement.as_ref()) {
                    Ok(()) => { let _ = ready_tx.send(Ok(())); },
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return VictimStats::default();
                    },
                }
                Self::run(&mut victim, &buf, rx);
                victim.cleanup();
                victim.stats()
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { tx, handle: Some(handle) }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            },
            Err(_) => Err(Error::Thread("victim exited during init".into())),
        }
    }

    fn run(victim: &mut Victim, buf: &ProbeBuffer, rx: Receiver<VictimCommand>) {
        while let Ok(cmd) = rx.recv() {
            let res = match cmd {
                VictimCommand::Shutdown => break,
                VictimCommand::Barrier(reply) => {
                    let _ = reply.send(());
                    Ok(())
                },
                VictimCommand::Access { offset, access } => {
                    buf.checked_at(offset)
                        .and_then(|t| victim.single_access(t, access))
                        .map(|_| ())
                },
                VictimCommand::Sequence { offsets, pattern } => {
                    offsets.iter().map(|o| buf.checked_at(*o))
                        .collect::<Result<Vec<_>>>()
                        .and_then(|addrs| victim.memory_sequence(&addrs, pattern))
                },
                VictimCommand::Lookup { indices } => {
                    victim.lookup_operation(buf.target(), &indices).map(|_| ())
                },
                VictimCommand::Branch { condition, true_offset, false_offset } => {
                    buf.checked_at(true_offset)
                        .and_then(|t| Ok((t, buf.checked_at(false_offset)?)))
                        .and_then(|(t, f)| victim.branch_operation(condition, t, f))
                        .map(|_| ())
                },
                VictimCommand::Workload { duration, kind } => {
                    victim.workload(duration, kind)
                },
                VictimCommand::Encrypt { key, plaintext, ciphertext } => {
                    buf.checked_at(plaintext)
                        .and_then(|p| Ok((p, buf.checked_at(ciphertext)?)))
                        .and_then(|(p, c)| {
                            victim.encrypt_operation(&key, p, c, buf.target())
                        })
                },
                VictimCommand::Repeat { offset, iterations, interval } => {
                    buf.checked_at(offset)
                        .and_then(|t| victim.timed_loop(t, iterations, interval))
                },
                VictimCommand::Idle(d) => {
                    victim.idle(d);
                    Ok(())
                },
            };
            if let Err(e) = res {
                log::warn!("victim command failed: {}", e);
            }
        }
    }

    /// Queue a command.
    pub fn send(&self, cmd: VictimCommand) -> Result<()> {
        self.tx.send(cmd)
            .map_err(|_| Error::Thread("victim thread has exited".into()))
    }

    /// Block until every previously sent command has run.
    pub fn sync(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(VictimCommand::Barrier(reply_tx))?;
        reply_rx.recv()
            .map_err(|_| Error::Thread("victim thread has exited".into()))
    }

    /// Stop the thread and return its final statistics.
    pub fn shutdown(mut self) -> Result<VictimStats> {
        let _ = self.tx.send(VictimCommand::Shutdown);
        let handle = self.handle.take()
            .ok_or(Error::Thread("victim already joined".into()))?;
        handle.join().map_err(|_| Error::Thread("victim thread panicked".into()))
    }
}

impl Drop for VictimThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(VictimCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::placement::UnpinnedPlacement;

    fn ready_victim() -> Victim {
        let mut v = Victim::new(Threshold::default());
        v.init(0, &UnpinnedPlacement::new(2, 1)).unwrap();
        v
    }

    #[test]
    fn requires_init() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut v = Victim::new(Threshold::default());
        assert!(matches!(v.single_access(buf.line(0), Access::Read),
            Err(Error::NotInitialized(Role::Victim))));
        assert_eq!(v.stats().total_accesses, 0);
    }

    #[test]
    fn stats_accumulate() {
        let mut s = VictimStats::default();
        s.record(100, true);
        s.record(300, false);
        s.record(50, true);
        assert_eq!(s.total_accesses, 3);
        assert_eq!(s.cache_hits, 2);
        assert_eq!(s.cache_misses, 1);
        assert_eq!(s.min_latency, 50);
        assert_eq!(s.max_latency, 300);
        assert!((s.avg_latency - 150.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_access_counts() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let addrs = buf.lines_from(0, 8);

        let mut v = ready_victim();
        v.memory_sequence(&addrs, AccessPattern::Sequential).unwrap();
        assert_eq!(v.stats().total_accesses, 8);

        let mut v = ready_victim();
        v.memory_sequence(&addrs, AccessPattern::Random).unwrap();
        assert_eq!(v.stats().total_accesses, 8);

        // strides 1, 2, 4 over 8 addresses: 8 + 4 + 2
        let mut v = ready_victim();
        v.memory_sequence(&addrs, AccessPattern::Stride).unwrap();
        assert_eq!(v.stats().total_accesses, 14);
        let s = v.stats();
        assert_eq!(s.cache_hits + s.cache_misses, s.total_accesses);
    }

    #[test]
    fn empty_sequence_is_degenerate() {
        let mut v = ready_victim();
        for p in [AccessPattern::Sequential, AccessPattern::Random,
            AccessPattern::Stride]
        {
            assert!(matches!(v.memory_sequence(&[], p),
                Err(Error::Degenerate { needed: 1, got: 0 })));
        }
        assert_eq!(v.stats().total_accesses, 0);
    }

    #[test]
    fn encrypt_block() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let (sbox, pt, ct) = (buf.target(), buf.target().offset(1024),
            buf.target().offset(2048));
        for i in 0..Victim::BLOCK_SIZE {
            timing::store_byte(pt.offset(i), i as u8);
        }
        let key: Vec<u8> = (0..32).map(|i| 0xa0 | i).collect();

        let mut v = ready_victim();
        v.encrypt_operation(&key, pt, ct, sbox).unwrap();
        for i in 0..Victim::BLOCK_SIZE {
            assert_eq!(timing::load_byte(ct.offset(i)), i as u8 ^ key[i % 32]);
        }
        assert_eq!(v.stats().total_accesses, Victim::BLOCK_SIZE as u64);

        assert!(matches!(v.encrypt_operation(&[], pt, ct, sbox),
            Err(Error::Degenerate { needed: 1, got: 0 })));
        let short = buf.target().offset(4096 - 100);
        assert!(matches!(v.encrypt_operation(&key, pt, short, sbox),
            Err(Error::Degenerate { needed: 256, got: 100 })));
    }

    #[test]
    fn pattern_names() {
        assert_eq!("stride".parse::<AccessPattern>().unwrap(), AccessPattern::Stride);
        assert!(matches!("zigzag".parse::<AccessPattern>(),
            Err(Error::UnknownVariant { kind: "access pattern", .. })));
        assert_eq!("memory-intensive".parse::<WorkloadKind>().unwrap(),
            WorkloadKind::MemoryIntensive);
        assert!("idle".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn lookup_xors_table() {
        let buf = ProbeBuffer::anonymous(256).unwrap();
        for i in 0..4 {
            timing::store(buf.line(i), 1u64 << i);
        }
        let mut v = ready_victim();
        // 0 and 256 both land on byte 0
        let res = v.lookup_operation(buf.target(), &[0, 64, 256, 128]).unwrap();
        assert_eq!(res, 1 ^ 2 ^ 1 ^ 4);
        assert_eq!(v.stats().total_accesses, 4);
    }

    #[test]
    fn branch_and_chain() {
        let buf = ProbeBuffer::anonymous(4096).unwrap();
        let mut v = ready_victim();
        v.branch_operation(true, buf.line(0), buf.line(1)).unwrap();
        let chain = buf.lines_from(0, 4);
        assert_eq!(v.chain_access(&chain).unwrap(), 0);
        assert!(v.chain_access(&[]).is_err());
        assert_eq!(v.stats().total_accesses, 5);
    }

    #[test]
    fn short_workloads() {
        let mut v = ready_victim();
        v.workload(Duration::from_micros(10), WorkloadKind::CpuIntensive).unwrap();
        v.workload(Duration::from_micros(10), WorkloadKind::MemoryIntensive).unwrap();
        assert!(v.workload(Duration::ZERO, WorkloadKind::CpuIntensive).is_err());
    }

    #[test]
    fn workload_budget_saturates() {
        assert_eq!(Victim::cycle_budget(Duration::from_micros(10)), 24_000);
        let d = Duration::from_secs(u64::MAX / 1_000_000);
        assert_eq!(Victim::cycle_budget(d), u64::MAX);
        assert_eq!(Victim::cycle_budget(Duration::MAX), u64::MAX);
    }

    #[test]
    fn threaded_victim() {
        let buf = Arc::new(ProbeBuffer::anonymous(4096).unwrap());
        let placement = Arc::new(UnpinnedPlacement::new(2, 1));
        let vt = VictimThread::spawn(1, placement, Threshold::default(),
            buf.clone()).unwrap();
        vt.send(VictimCommand::Access { offset: 0, access: Access::Read }).unwrap();
        vt.send(VictimCommand::Access { offset: 64, access: Access::Write }).unwrap();
        vt.send(VictimCommand::Sequence {
            offsets: vec![0, 128, 256],
            pattern: AccessPattern::Sequential,
        }).unwrap();
        vt.send(VictimCommand::Repeat {
            offset: 192, iterations: 3, interval: Duration::ZERO,
        }).unwrap();
        vt.sync().unwrap();
        assert_eq!(timing::load(buf.line(1)), 1);
        vt.send(VictimCommand::Encrypt {
            key: vec![0xff], plaintext: 1024, ciphertext: 2048,
        }).unwrap();
        vt.sync().unwrap();
        assert_eq!(timing::load_byte(buf.at(2048)), 0xff);
        let stats = vt.shutdown().unwrap();
        assert_eq!(stats.total_accesses, 8 + Victim::BLOCK_SIZE as u64);
    }

    #[test]
    fn threaded_victim_bad_cpu() {
        let buf = Arc::new(ProbeBuffer::anonymous(4096).unwrap());
        let placement = Arc::new(UnpinnedPlacement::new(2, 1));
        assert!(matches!(
            VictimThread::spawn(7, placement, Threshold::default(), buf),
            Err(Error::InvalidCpu { cpu: 7, .. })));
    }
}
