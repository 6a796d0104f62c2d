//! Multi-round measurement drivers.
//!
//! An [`Orchestrator`] owns a validated [`Configuration`], the placement
//! provider, and the shared [`Threshold`]. Each `run_*` method sets up the
//! attacker and victim roles it needs, runs a number of rounds, and returns
//! a report value; nothing is written to disk except by
//! [`Orchestrator::run_demo`].
//!
//! Every run pins the calling thread to the attacker cpu.

use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::Serialize;

use crate::attacker::Attacker;
use crate::buffer::ProbeBuffer;
use crate::config::Configuration;
use crate::error::*;
use crate::observe::Observer;
use crate::placement::PlacementProvider;
use crate::primitives::Threshold;
use crate::report::{ self, CsvSink, JsonSink, ReportSink, TextSink };
use crate::stats::{ self, HitMissCount, LatencyDifference, Statistics };
use crate::timing;
use crate::types::*;
use crate::victim::{ Access, Victim, VictimCommand, VictimThread };

/// Result of [`Orchestrator::calibrate`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Calibration {
    pub hits: Statistics,
    pub misses: Statistics,
    /// Hit/miss separation in `[0, 1)`
    pub separation: f64,
    /// The threshold now in effect
    pub threshold: u64,
}
impl Calibration {
    pub fn print(&self) {
        println!("[*] calibration:");
        println!("  {:<24}: {:.2} cycles (min {}, max {})", "cached mean",
            self.hits.mean, self.hits.min, self.hits.max);
        println!("  {:<24}: {:.2} cycles (min {}, max {})", "flushed mean",
            self.misses.mean, self.misses.min, self.misses.max);
        println!("  {:<24}: {:.4}", "separation", self.separation);
        println!("  {:<24}: {}", "threshold", self.threshold);
    }
}

/// Result of [`Orchestrator::run_flush_reload`].
#[derive(Clone, Debug, Serialize)]
pub struct FlushReloadReport {
    /// Hit/miss counts for each round
    pub rounds: Vec<HitMissCount>,
    /// Completed trials from every round
    pub results: Vec<AttackResult>,
    /// Trials that failed and were skipped
    pub skipped: usize,
}
impl FlushReloadReport {
    pub fn overall(&self) -> HitMissCount {
        stats::success_rate(&self.results)
    }

    /// Success rate of each round.
    pub fn success_curve(&self) -> Vec<f64> {
        self.rounds.iter().map(|r| r.success_rate()).collect()
    }

    /// (min, average, max) hits per round.
    pub fn hit_range(&self) -> (u32, f64, u32) {
        let (min, max) = self.rounds.iter().map(|r| r.hits).minmax()
            .into_option().unwrap_or((0, 0));
        let avg = match self.rounds.len() {
            0 => 0.0,
            n => self.rounds.iter().map(|r| r.hits as f64).sum::<f64>() / n as f64,
        };
        (min, avg, max)
    }

    pub fn print(&self) {
        for (idx, r) in self.rounds.iter().enumerate() {
            println!("  round {:>3}: {:>6.2}% ({}/{})", idx,
                r.success_rate() * 100.0, r.hits, r.total());
        }
        let (min, avg, max) = self.hit_range();
        let overall = self.overall();
        println!("[*] flush+reload summary:");
        println!("  {:<24}: {:.2}%", "success rate", overall.success_rate() * 100.0);
        println!("  {:<24}: {}/{}", "hits", overall.hits, overall.total());
        println!("  {:<24}: {:.2} (min {}, max {})", "hits per round", avg, min, max);
        println!("  {:<24}: {}", "skipped trials", self.skipped);
    }
}

/// Result of [`Orchestrator::run_latency`].
#[derive(Clone, Debug, Serialize)]
pub struct LatencyReport {
    pub rounds: Vec<LatencyDifference>,
    /// Latencies on the CXL node, all rounds
    pub tier: Vec<u64>,
    /// Latencies on the normal node, all rounds
    pub baseline: Vec<u64>,
}
impl LatencyReport {
    pub fn tier_statistics(&self) -> Result<Statistics> {
        stats::statistics(&self.tier)
    }
    pub fn baseline_statistics(&self) -> Result<Statistics> {
        stats::statistics(&self.baseline)
    }

    /// Average difference and signal strength over all rounds.
    pub fn average(&self) -> LatencyDifference {
        let n = self.rounds.len().max(1) as f64;
        LatencyDifference {
            difference: self.rounds.iter().map(|r| r.difference).sum::<f64>() / n,
            signal_strength: self.rounds.iter()
                .map(|r| r.signal_strength).sum::<f64>() / n,
        }
    }

    pub fn print(&self) {
        for (idx, r) in self.rounds.iter().enumerate() {
            println!("  round {:>3}: {:>10.2} cycles (signal {:.2})", idx,
                r.difference, r.signal_strength);
        }
        for (name, s) in [("cxl node", self.tier_statistics()),
            ("normal node", self.baseline_statistics())]
        {
            if let Ok(s) = s {
                println!("[*] {} latency:", name);
                println!("  {:<24}: {}/{}", "min/max", s.min, s.max);
                println!("  {:<24}: {:.2}", "mean", s.mean);
                println!("  {:<24}: {:.2}", "median", s.median);
                println!("  {:<24}: {:.2}", "stddev", s.stddev);
            }
        }
        let avg = self.average();
        println!("[*] latency difference:");
        println!("  {:<24}: {:.2} cycles", "average difference", avg.difference);
        println!("  {:<24}: {:.2}", "average signal", avg.signal_strength);
    }
}

/// Per-thread outcome of [`Orchestrator::run_multithreading`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ThreadOutcome {
    pub cpu: usize,
    pub hit_miss: HitMissCount,
    pub mean_probe: f64,
}

/// Result of [`Orchestrator::run_isolation`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct IsolationReport {
    /// Trials where the victim touched the line between flush and reload
    pub with_access: HitMissCount,
    /// Trials with no victim access
    pub without_access: HitMissCount,
    /// Separation between the two sets of probe latencies
    pub separation: f64,
}
impl IsolationReport {
    pub fn print(&self) {
        println!("[*] single-thread isolation:");
        println!("  {:<24}: {:.2}% ({}/{})", "victim accessed",
            self.with_access.success_rate() * 100.0, self.with_access.hits,
            self.with_access.total());
        println!("  {:<24}: {:.2}% ({}/{})", "victim idle",
            self.without_access.success_rate() * 100.0,
            self.without_access.hits, self.without_access.total());
        println!("  {:<24}: {:.4}", "separation", self.separation);
    }
}

/// Everything produced by [`Orchestrator::run_demo`].
#[derive(Debug)]
pub struct DemoReport {
    pub flush_reload: FlushReloadReport,
    pub latency: LatencyReport,
    pub threads: Vec<ThreadOutcome>,
    pub isolation: IsolationReport,
    /// Files written, in order
    pub files: Vec<PathBuf>,
}

/// Sequences attacker and victim roles across rounds.
pub struct Orchestrator {
    config: Configuration,
    placement: Arc<dyn PlacementProvider>,
    threshold: Threshold,
    rounds: usize,
    threads: usize,
}

impl Orchestrator {
    pub const DEFAULT_ROUNDS: usize = 5;
    pub const DEFAULT_THREADS: usize = 4;

    /// Size of the victim buffer. Only the first line is attacked.
    pub const VICTIM_BUFFER: usize = 0x10000;

    /// Size of each per-round latency buffer.
    pub const LATENCY_BUFFER: usize = 4096;

    /// Victim reads per attacker trial in cross-thread runs.
    pub const VICTIM_REPEAT: usize = 16;

    /// Histogram buckets in the latency heatmap.
    pub const HEATMAP_BUCKETS: usize = 16;

    /// Fails if `config` doesn't validate against `placement`.
    pub fn new(config: Configuration, placement: Arc<dyn PlacementProvider>)
        -> Result<Self>
    {
        config.validate(placement.as_ref())?;
        Ok(Self {
            threshold: Threshold::new(config.threshold)?,
            config,
            placement,
            rounds: Self::DEFAULT_ROUNDS,
            threads: Self::DEFAULT_THREADS,
        })
    }

    pub fn rounds(mut self, x: usize) -> Self {
        self.rounds = x;
        self
    }
    pub fn threads(mut self, x: usize) -> Self {
        self.threads = x;
        self
    }

    pub fn config(&self) -> &Configuration { &self.config }
    pub fn threshold(&self) -> &Threshold { &self.threshold }

    fn attacker(&self) -> Result<Attacker> {
        let mut a = Attacker::new(self.threshold.clone())
            .with_placement(self.config.data_placement,
                self.config.thread_placement);
        a.init(self.config.attacker_cpu, self.placement.as_ref())?;
        a.warmup(self.config.warmup_iterations);
        Ok(a)
    }

    fn victim_buffer(&self) -> Result<Arc<ProbeBuffer>> {
        let buf = self.placement.alloc_on_node(Self::VICTIM_BUFFER,
            self.config.data_node())?;
        Ok(Arc::new(buf))
    }

    /// Measure cached and flushed probe latencies on the configured data
    /// node and move the threshold to the midpoint.
    pub fn calibrate(&self) -> Result<Calibration> {
        self.placement.bind_thread_to_cpu(self.config.attacker_cpu)?;
        let buf = self.placement.alloc_on_node(Self::LATENCY_BUFFER,
            self.config.data_node())?;
        let t = buf.target();
        let n = self.config.sample_size;

        let hits: Vec<u64> = (0..n).map(|_| {
            timing::reload(t);
            timing::fence();
            timing::probe(t)
        }).collect();
        let misses: Vec<u64> = (0..n).map(|_| {
            timing::flush(t);
            timing::fence();
            timing::probe(t)
        }).collect();

        let threshold = stats::recommend_threshold(&hits, &misses);
        self.threshold.set(threshold)?;
        let res = Calibration {
            hits: stats::statistics(&hits)?,
            misses: stats::statistics(&misses)?,
            separation: stats::hit_miss_separation(&hits, &misses)?,
            threshold,
        };
        log::info!("calibrated threshold: {} cycles (separation {:.3})",
            threshold, res.separation);
        Ok(res)
    }

    /// Flush+Reload against a victim reading the first line of its buffer.
    ///
    /// With [`ThreadPlacement::SameThread`] the victim runs on the calling
    /// thread between each flush and reload. Otherwise it runs on its own
    /// thread pinned to the victim cpu, reading the line while the attacker
    /// runs its trials.
    pub fn run_flush_reload(&self) -> Result<FlushReloadReport> {
        let buf = self.victim_buffer()?;
        let mut attacker = self.attacker()?;
        let n = self.config.iterations;
        let mut report = FlushReloadReport {
            rounds: Vec::with_capacity(self.rounds),
            results: Vec::with_capacity(self.rounds * n),
            skipped: 0,
        };

        log::info!("flush+reload: {} rounds of {} trials ({}, {})",
            self.rounds, n, self.config.data_placement.name(),
            self.config.thread_placement.name());

        if self.config.thread_placement == ThreadPlacement::SameThread {
            let mut victim = Victim::new(self.threshold.clone());
            victim.init(self.config.attacker_cpu, self.placement.as_ref())?;
            let t = buf.target();
            for _ in 0..self.rounds {
                let batch = attacker.repeat_attack(|a| {
                    a.interleaved_flush_reload_attack(t, || {
                        victim.single_access(t, Access::Read).unwrap_or(0)
                    })
                }, n)?;
                report.rounds.push(batch.hit_miss());
                report.skipped += batch.skipped.len();
                report.results.extend(batch.results);
            }
            victim.cleanup();
        } else {
            let victim = VictimThread::spawn(self.config.victim_cpu,
                self.placement.clone(), self.threshold.clone(), buf.clone())?;
            let t = buf.target();
            for _ in 0..self.rounds {
                victim.send(VictimCommand::Repeat {
                    offset: 0,
                    iterations: n * Self::VICTIM_REPEAT,
                    interval: Duration::ZERO,
                })?;
                let batch = attacker.repeat_attack(|a| {
                    a.flush_reload_attack(t)
                }, n)?;
                victim.sync()?;
                report.rounds.push(batch.hit_miss());
                report.skipped += batch.skipped.len();
                report.results.extend(batch.results);
            }
            let vstats = victim.shutdown()?;
            log::debug!("victim made {} accesses", vstats.total_accesses);
        }

        attacker.cleanup();
        Ok(report)
    }

    /// Compare flushed-access latency on the CXL node against the normal
    /// node. Each round uses freshly allocated buffers.
    pub fn run_latency(&self) -> Result<LatencyReport> {
        self.placement.bind_thread_to_cpu(self.config.attacker_cpu)?;
        let observer = Observer::new(self.threshold.clone());
        let n = self.config.sample_size;
        let mut report = LatencyReport {
            rounds: Vec::with_capacity(self.rounds),
            tier: Vec::with_capacity(self.rounds * n),
            baseline: Vec::with_capacity(self.rounds * n),
        };

        log::info!("latency: node {} vs node {}, {} rounds of {} samples",
            self.config.numa_node_cxl, self.config.numa_node_normal,
            self.rounds, n);

        for _ in 0..self.rounds {
            let normal = self.placement.alloc_on_node(Self::LATENCY_BUFFER,
                self.config.numa_node_normal)?;
            let cxl = self.placement.alloc_on_node(Self::LATENCY_BUFFER,
                self.config.numa_node_cxl)?;
            // Prefaulting left both pages cached
            timing::flush_range(cxl.target());
            timing::flush_range(normal.target());
            let (tier, baseline) = observer.tier_latency(cxl.target(),
                normal.target(), n);
            report.rounds.push(stats::latency_difference(&tier, &baseline)?);
            report.tier.extend(tier);
            report.baseline.extend(baseline);
            self.placement.free(cxl);
            self.placement.free(normal);
        }
        Ok(report)
    }

    /// Run Flush+Reload from several attacker threads at once, all against
    /// the same line. Thread `i` is pinned to `attacker_cpu + i` (mod the
    /// number of cpus).
    pub fn run_multithreading(&self) -> Result<Vec<ThreadOutcome>> {
        if self.threads == 0 {
            return Err(Error::Config("thread count must be non-zero".into()));
        }
        let config = self.config.for_multithreading(self.threads,
            self.placement.as_ref());
        let buf = self.victim_buffer()?;
        let ncpu = self.placement.num_cpus();

        log::info!("multithreading: {} threads, {} trials each",
            self.threads, config.iterations);

        let outcomes: Vec<Result<ThreadOutcome>> = std::thread::scope(|s| {
            let handles = (0..self.threads).map(|i| {
                let cpu = (config.attacker_cpu + i) % ncpu;
                let buf = &buf;
                let placement = self.placement.as_ref();
                let threshold = self.threshold.clone();
                s.spawn(move || -> Result<ThreadOutcome> {
                    let mut a = Attacker::new(threshold)
                        .with_placement(config.data_placement,
                            ThreadPlacement::CrossCore);
                    a.init(cpu, placement)?;
                    let t = buf.target();
                    let batch = a.repeat_attack(|a| a.flush_reload_attack(t),
                        config.iterations)?;
                    a.cleanup();
                    let probes = batch.probe_times();
                    let mean_probe = match probes.len() {
                        0 => 0.0,
                        n => probes.iter().sum::<u64>() as f64 / n as f64,
                    };
                    Ok(ThreadOutcome { cpu, hit_miss: batch.hit_miss(), mean_probe })
                })
            }).collect_vec();
            handles.into_iter().map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(Error::Thread("attacker thread panicked".into()))
                })
            }).collect()
        });
        outcomes.into_iter().collect()
    }

    /// Attacker and victim interleaved on one isolated cpu. Compares trials
    /// where the victim touches the line against trials where it doesn't.
    pub fn run_isolation(&self) -> Result<IsolationReport> {
        let config = self.config.for_isolation();
        let buf = self.placement.alloc_on_node(Self::LATENCY_BUFFER,
            config.data_node())?;
        let t = buf.target();

        let mut attacker = Attacker::new(self.threshold.clone())
            .with_placement(config.data_placement, config.thread_placement);
        attacker.init(config.attacker_cpu, self.placement.as_ref())?;
        attacker.warmup(config.warmup_iterations);
        let mut victim = Victim::new(self.threshold.clone());
        victim.init(config.victim_cpu, self.placement.as_ref())?;

        log::info!("isolation: cpu {}, {} trials", config.attacker_cpu,
            config.iterations);

        let active = attacker.repeat_attack(|a| {
            a.interleaved_flush_reload_attack(t, || {
                victim.single_access(t, Access::Read).unwrap_or(0)
            })
        }, config.iterations)?;
        let idle = attacker.repeat_attack(|a| {
            a.interleaved_flush_reload_attack(t, || 0)
        }, config.iterations)?;

        victim.cleanup();
        attacker.cleanup();
        Ok(IsolationReport {
            with_access: active.hit_miss(),
            without_access: idle.hit_miss(),
            separation: stats::hit_miss_separation(&active.probe_times(),
                &idle.probe_times())?,
        })
    }

    /// Run every experiment and write reports into `dir`.
    ///
    /// Writes `attack_report.txt`, `results.json`, `results.csv`,
    /// `success_curve.csv`, `latency_cxl.csv`, `latency_normal.csv` and
    /// `latency_heatmap.csv` (one row per node, one column per histogram
    /// bucket, as fractions of the samples).
    pub fn run_demo(&self, dir: &Path) -> Result<DemoReport> {
        log::info!("running all experiments, output in {}", dir.display());
        let flush_reload = self.run_flush_reload()?;
        let latency = self.run_latency()?;
        let threads = self.run_multithreading()?;
        let isolation = self.run_isolation()?;

        let mut files = vec![
            TextSink::new(dir).write_results("attack_report", &flush_reload.results)?,
            JsonSink::new(dir).write_results("results", &flush_reload.results)?,
            CsvSink::new(dir).write_results("results", &flush_reload.results)?,
        ];

        let curve = dir.join("success_curve.csv");
        report::write_success_curve(&curve, &flush_reload.success_curve())?;
        files.push(curve);

        for (name, cycles) in [("cxl", &latency.tier), ("normal", &latency.baseline)] {
            let path = dir.join(format!("latency_{}.csv", name));
            report::write_timings(&path, &format!("{}_cycles", name), cycles)?;
            files.push(path);
        }

        let mut cells = Vec::with_capacity(2 * Self::HEATMAP_BUCKETS);
        for cycles in [&latency.tier, &latency.baseline] {
            let h = stats::histogram(cycles, Self::HEATMAP_BUCKETS)?;
            let total = cycles.len() as f64;
            cells.extend(h.into_iter().map(|c| c as f64 / total));
        }
        let heatmap = dir.join("latency_heatmap.csv");
        report::write_heatmap(&heatmap, &cells, Self::HEATMAP_BUCKETS)?;
        files.push(heatmap);

        Ok(DemoReport { flush_reload, latency, threads, isolation, files })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::placement::UnpinnedPlacement;

    fn orchestrator(placement: ThreadPlacement) -> Orchestrator {
        let p: Arc<dyn PlacementProvider> = Arc::new(UnpinnedPlacement::new(4, 2));
        let cfg = Configuration::detect(p.as_ref())
            .thread_placement(placement)
            .iterations(50)
            .warmup_iterations(2)
            .sample_size(32);
        Orchestrator::new(cfg, p).unwrap().rounds(3).threads(2)
    }

    #[test]
    fn rejects_invalid_config() {
        let p: Arc<dyn PlacementProvider> = Arc::new(UnpinnedPlacement::new(2, 1));
        let cfg = Configuration::detect(p.as_ref()).victim_cpu(9);
        assert!(matches!(Orchestrator::new(cfg, p),
            Err(Error::InvalidCpu { cpu: 9, .. })));
    }

    #[test]
    fn flush_reload_rounds() {
        for placement in [ThreadPlacement::SameThread, ThreadPlacement::CrossCore] {
            let o = orchestrator(placement);
            let r = o.run_flush_reload().unwrap();
            assert_eq!(r.rounds.len(), 3);
            assert_eq!(r.results.len() + r.skipped, 150);
            assert_eq!(r.success_curve().len(), 3);
            assert!(r.results.iter().all(|x| x.thread_config == placement));
            let (min, avg, max) = r.hit_range();
            assert!(min as f64 <= avg && avg <= max as f64);
        }
    }

    #[test]
    fn latency_rounds() {
        let o = orchestrator(ThreadPlacement::CrossCore);
        let r = o.run_latency().unwrap();
        assert_eq!(r.rounds.len(), 3);
        assert_eq!(r.tier.len(), 96);
        assert_eq!(r.baseline.len(), 96);
        assert!(r.average().signal_strength >= 0.0);
    }

    #[test]
    fn multithreading_outcomes() {
        let o = orchestrator(ThreadPlacement::CrossCore);
        let out = o.run_multithreading().unwrap();
        assert_eq!(out.iter().map(|t| t.cpu).collect_vec(), vec![0, 1]);
        assert!(out.iter().all(|t| t.hit_miss.total() == 50));
        assert!(o.threads(0).run_multithreading().is_err());
    }

    #[test]
    fn isolation_counts() {
        let o = orchestrator(ThreadPlacement::CrossCore);
        let r = o.run_isolation().unwrap();
        assert_eq!(r.with_access.total(), 50);
        assert_eq!(r.without_access.total(), 50);
        assert!((0.0..1.0).contains(&r.separation));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn calibrate_sets_threshold() {
        let o = orchestrator(ThreadPlacement::CrossCore);
        let c = o.calibrate().unwrap();
        assert_eq!(o.threshold().get(), c.threshold);
        assert!(c.threshold > 0);
    }
}
