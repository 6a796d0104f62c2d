//! Batch and realtime sampling.
//!
//! An [`Observer`] moves through three states:
//!
//! ```text
//! Idle --init--> Ready --start--> Sampling --stop--> Ready --cleanup--> Idle
//! ```
//!
//! Batch sampling is allowed in `Ready` and `Sampling`. Realtime sampling
//! runs on a background thread which delivers each [`Observation`] to a
//! callback until [`Observer::stop`] returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::JoinHandle;
use std::time::Duration;

use bitvec::prelude::*;
use serde::Serialize;

use crate::buffer::ProbeBuffer;
use crate::error::*;
use crate::placement::PlacementProvider;
use crate::primitives::Threshold;
use crate::stats::{ self, HitMissCount, Statistics };
use crate::timing::{ self, Target };
use crate::types::TimingSample;

/// Bounded, pre-allocated storage for [`TimingSample`]s.
///
/// Samples past capacity are dropped and counted. Clearing rewinds the
/// write position without releasing the storage.
#[derive(Debug)]
pub struct ObservationBuffer {
    samples: Vec<TimingSample>,
    pos: usize,
    dropped: usize,
}
impl ObservationBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![TimingSample::default(); capacity],
            pos: 0,
            dropped: 0,
        }
    }

    /// Append a sample. Returns false if the buffer is full.
    pub fn push(&mut self, sample: TimingSample) -> bool {
        match self.samples.get_mut(self.pos) {
            Some(slot) => {
                *slot = sample;
                self.pos += 1;
                true
            },
            None => {
                self.dropped += 1;
                false
            },
        }
    }

    pub fn clear(&mut self) {
        self.pos = 0;
        self.dropped = 0;
    }

    pub fn capacity(&self) -> usize { self.samples.len() }
    pub fn len(&self) -> usize { self.pos }
    pub fn is_empty(&self) -> bool { self.pos == 0 }
    pub fn is_full(&self) -> bool { self.pos == self.samples.len() }

    /// Number of samples rejected since the last clear.
    pub fn dropped(&self) -> usize { self.dropped }

    /// The samples recorded so far.
    pub fn as_slice(&self) -> &[TimingSample] { &self.samples[..self.pos] }

    /// Cycle counts of the samples recorded so far.
    pub fn cycles(&self) -> Vec<u64> {
        self.as_slice().iter().map(|s| s.cycle_count).collect()
    }
}

/// A realtime sample delivered to an [`Observer`] callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub sample_id: u64,
    pub timestamp: u64,
    pub access_time: u64,
    pub cpu_id: u32,
    pub is_hit: bool,
    pub address: usize,
}

/// The most recent realtime observations, with hit/miss totals over every
/// observation ever pushed.
#[derive(Debug)]
pub struct ObservationHistory {
    recent: VecDeque<Observation>,
    keep: usize,
    total: HitMissCount,
}
impl ObservationHistory {
    /// Keep at most `keep` observations (at least one).
    pub fn new(keep: usize) -> Self {
        let keep = keep.max(1);
        Self {
            recent: VecDeque::with_capacity(keep.min(1 << 16)),
            keep,
            total: HitMissCount::default(),
        }
    }

    /// Record `obs`, evicting the oldest kept observation when full.
    pub fn push(&mut self, obs: Observation) {
        if obs.is_hit {
            self.total.hits = self.total.hits.saturating_add(1);
        } else {
            self.total.misses = self.total.misses.saturating_add(1);
        }
        if self.recent.len() == self.keep {
            self.recent.pop_front();
        }
        self.recent.push_back(obs);
    }

    pub fn len(&self) -> usize { self.recent.len() }
    pub fn is_empty(&self) -> bool { self.recent.is_empty() }

    /// Hits and misses over every pushed observation.
    pub fn total(&self) -> HitMissCount { self.total }

    /// Kept observations, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.recent.iter()
    }

    pub fn access_times(&self) -> Vec<u64> {
        self.recent.iter().map(|o| o.access_time).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverState {
    Idle,
    Ready,
    Sampling,
}
impl ObserverState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Sampling => "sampling",
        }
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

/// Batch and realtime sampling controller.
pub struct Observer {
    state: ObserverState,
    buffer: ObservationBuffer,
    threshold: Threshold,
    monitor: Option<(usize, Arc<dyn PlacementProvider>)>,
    worker: Option<Worker>,
    last_run: u64,
}

impl Observer {
    /// Delay between batch samples, in [`timing::busy_wait`] iterations.
    pub const SAMPLE_DELAY: u64 = 100;

    /// Delay between flush and reload in [`Observer::l3_timing`].
    pub const L3_DELAY: u64 = 100_000;

    /// Delay before each access in [`Observer::access_intervals`].
    pub const INTERVAL_DELAY: u64 = 1000;

    /// Default realtime cadence (1kHz).
    pub const DEFAULT_CADENCE: Duration = Duration::from_millis(1);

    /// Two events closer than this many cycles overlap.
    pub const OVERLAP_WINDOW: u64 = 10_000;

    pub fn new(threshold: Threshold) -> Self {
        Self {
            state: ObserverState::Idle,
            buffer: ObservationBuffer::with_capacity(0),
            threshold,
            monitor: None,
            worker: None,
            last_run: 0,
        }
    }

    /// Pin the realtime sampling thread to `cpu`.
    pub fn with_monitor_cpu(mut self, cpu: usize,
        placement: Arc<dyn PlacementProvider>) -> Self
    {
        self.monitor = Some((cpu, placement));
        self
    }

    pub fn state(&self) -> ObserverState { self.state }
    pub fn buffer(&self) -> &ObservationBuffer { &self.buffer }

    /// Number of callbacks delivered by the last completed realtime run.
    pub fn last_run_samples(&self) -> u64 { self.last_run }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidState { op, state: self.state.name() }
    }

    fn require_sampling_allowed(&self, op: &'static str) -> Result<()> {
        match self.state {
            ObserverState::Ready | ObserverState::Sampling => Ok(()),
            ObserverState::Idle => Err(self.invalid(op)),
        }
    }

    /// Allocate a buffer for `capacity` samples.
    pub fn init(&mut self, capacity: usize) -> Result<()> {
        if self.state != ObserverState::Idle {
            return Err(self.invalid("init"));
        }
        self.buffer = ObservationBuffer::with_capacity(capacity);
        self.state = ObserverState::Ready;
        log::debug!("observer ready ({} samples)", capacity);
        Ok(())
    }

    /// Stop any realtime sampling and release the buffer.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state == ObserverState::Sampling {
            self.stop()?;
        }
        self.buffer = ObservationBuffer::with_capacity(0);
        self.state = ObserverState::Idle;
        Ok(())
    }

    pub fn clear_buffer(&mut self) { self.buffer.clear(); }

    /// Statistics over the cycle counts currently in the buffer.
    pub fn buffer_statistics(&self) -> Result<Statistics> {
        stats::statistics(&self.buffer.cycles())
    }

    /// Flag outliers among the buffered samples.
    pub fn buffer_anomalies(&self, z_threshold: f64)
        -> Result<BitVec<usize, Msb0>>
    {
        stats::detect_anomalies(&self.buffer.cycles(), z_threshold)
    }

    /// `n` probes of `t` separated by a short busy-wait. Samples are also
    /// appended to the buffer (until it fills).
    pub fn sample_timing(&mut self, t: Target<'_>, n: usize) -> Result<Vec<u64>> {
        self.require_sampling_allowed("sample_timing")?;
        let mut res = Vec::with_capacity(n);
        for _ in 0..n {
            let cycles = timing::probe(t);
            let (timestamp, cpu_id) = timing::read_counter();
            self.buffer.push(TimingSample { cycle_count: cycles, cpu_id, timestamp });
            res.push(cycles);
            timing::busy_wait(Self::SAMPLE_DELAY);
        }
        Ok(res)
    }

    /// Probe each address `probes_per_addr` times, flushing after every
    /// probe. Bit `i * probes_per_addr + j` is set if the `j`-th probe of
    /// address `i` hit.
    pub fn sample_pattern(&mut self, addrs: &[Target<'_>], probes_per_addr: usize)
        -> Result<BitVec<usize, Msb0>>
    {
        self.require_sampling_allowed("sample_pattern")?;
        let mut res = BitVec::with_capacity(addrs.len() * probes_per_addr);
        for t in addrs {
            for _ in 0..probes_per_addr {
                let cycles = timing::probe(*t);
                res.push(self.threshold.is_hit(cycles));
                timing::flush(*t);
                timing::fence();
            }
        }
        Ok(res)
    }

    /// `n` raw counter readings. `cycle_count` is the distance from the
    /// previous reading.
    pub fn counter_samples(&self, n: usize) -> Vec<TimingSample> {
        let (mut prev, _) = timing::read_counter();
        (0..n).map(|_| {
            let (now, cpu_id) = timing::read_counter();
            let s = TimingSample {
                cycle_count: now.saturating_sub(prev),
                cpu_id,
                timestamp: now,
            };
            prev = now;
            s
        }).collect()
    }

    /// Latency of single accesses to `t`, each preceded by a fixed delay.
    pub fn access_intervals(&self, t: Target<'_>, n: usize) -> Vec<u64> {
        (0..n).map(|_| {
            timing::busy_wait(Self::INTERVAL_DELAY);
            timing::probe(t)
        }).collect()
    }

    /// Reload latency of `t` after a flush and a long wait. Approximates the
    /// latency of the memory backing `t`.
    pub fn l3_timing(&self, t: Target<'_>, n: usize) -> Vec<u64> {
        (0..n).map(|_| {
            timing::flush(t);
            timing::busy_wait(Self::L3_DELAY);
            timing::probe(t)
        }).collect()
    }

    /// Paired probes of `tier` and `baseline`, flushing both after each
    /// pair. Returns `(tier, baseline)` latencies.
    pub fn tier_latency(&self, tier: Target<'_>, baseline: Target<'_>, n: usize)
        -> (Vec<u64>, Vec<u64>)
    {
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        for _ in 0..n {
            a.push(timing::probe(tier));
            b.push(timing::probe(baseline));
            timing::flush(tier);
            timing::flush(baseline);
            timing::fence();
        }
        (a, b)
    }

    /// For each address, the set of other addresses mapping to the same
    /// cache set.
    pub fn cache_conflicts(&self, addrs: &[Target<'_>])
        -> Vec<BitVec<usize, Msb0>>
    {
        addrs.iter().enumerate().map(|(i, a)| {
            addrs.iter().enumerate()
                .map(|(j, b)| i != j && a.set_index() == b.set_index())
                .collect()
        }).collect()
    }

    /// If two events (in cycles) fall within [`Observer::OVERLAP_WINDOW`],
    /// return how much of the window they share.
    pub fn timing_overlap(a: u64, b: u64) -> Option<u64> {
        let diff = a.abs_diff(b);
        (diff < Self::OVERLAP_WINDOW).then(|| Self::OVERLAP_WINDOW - diff)
    }

    /// Start realtime sampling of `buf` at `offset` with the default cadence.
    pub fn start<F>(&mut self, buf: Arc<ProbeBuffer>, offset: usize, callback: F)
        -> Result<()>
        where F: FnMut(&Observation) + Send + 'static
    {
        self.start_with_cadence(buf, offset, Self::DEFAULT_CADENCE, callback)
    }

    /// Start realtime sampling, taking one sample every `cadence`.
    pub fn start_with_cadence<F>(&mut self, buf: Arc<ProbeBuffer>,
        offset: usize, cadence: Duration, mut callback: F) -> Result<()>
        where F: FnMut(&Observation) + Send + 'static
    {
        match self.state {
            ObserverState::Sampling => return Err(Error::AlreadyRunning),
            ObserverState::Idle => return Err(self.invalid("start")),
            ObserverState::Ready => {},
        }
        buf.checked_at(offset)?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let threshold = self.threshold.clone();
        let monitor = self.monitor.clone();

        let handle = std::thread::Builder::new()
            .name("observer".to_string())
            .spawn(move || {
                if let Some((cpu, placement)) = monitor {
                    if let Err(e) = placement.bind_thread_to_cpu(cpu) {
                        log::warn!("observer couldn't pin to cpu {}: {}", cpu, e);
                    }
                }
                let t = buf.at(offset);
                let mut sample_id = 0;
                while flag.load(Ordering::Acquire) {
                    let access_time = timing::probe(t);
                    let (timestamp, cpu_id) = timing::read_counter();
                    callback(&Observation {
                        sample_id,
                        timestamp,
                        access_time,
                        cpu_id,
                        is_hit: threshold.is_hit(access_time),
                        address: t.addr(),
                    });
                    sample_id += 1;
                    std::thread::sleep(cadence);
                }
                sample_id
            })?;

        self.worker = Some(Worker { running, handle });
        self.state = ObserverState::Sampling;
        log::info!("realtime sampling started ({:?} cadence)", cadence);
        Ok(())
    }

    /// Stop realtime sampling. Blocks until the sampling thread has exited,
    /// so no callback runs after this returns.
    pub fn stop(&mut self) -> Result<()> {
        let worker = match (self.state, self.worker.take()) {
            (ObserverState::Sampling, Some(w)) => w,
            _ => return Err(Error::NotRunning),
        };
        worker.running.store(false, Ordering::Release);
        let res = worker.handle.join();
        self.state = ObserverState::Ready;
        self.last_run = res.map_err(|_| {
            Error::Thread("observer thread panicked".into())
        })?;
        log::info!("realtime sampling stopped after {} samples", self.last_run);
        Ok(())
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if self.state == ObserverState::Sampling {
            let _ = self.stop();
        }
    }
}
