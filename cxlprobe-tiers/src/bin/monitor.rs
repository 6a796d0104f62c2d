use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::mpsc;
use std::time::{ Duration, Instant };

use bitvec::prelude::*;
use clap::Parser;

use cxlprobe::*;

fn main() {
    let env = env_logger::Env::default().filter_or("CXLPROBE_LOG", "info");
    env_logger::init_from_env(env);
    let args = Args::parse();
    if let Err(e) = Monitor::run(&args) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

/// Watch a single line on some memory tier in real time.
///
/// Context
/// =======
///
/// Batch measurements hide how the state of a line changes over time. The
/// realtime observer probes one line at a fixed cadence from a dedicated
/// cpu and reports every sample as it happens.
///
/// Test
/// ====
///
/// 1. Allocate a buffer on the node for `--tier`.
///
/// 2. Optionally start a victim which reads the watched line every
///    `--victim-period-us` microseconds.
///
/// 3. Start the observer on the monitor cpu and print a summary once per
///    second until `--seconds` have passed or SIGINT is received.
///
/// Results
/// =======
///
/// Without a victim the line stays cached after the first probe and the
/// hit rate sits near 100%. A victim on another socket or a flush-heavy
/// neighbor shows up as bursts of misses and as flagged outliers in the
/// final summary.
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Tier holding the watched line
    #[arg(long, value_enum, default_value = "cxl-memory")]
    tier: DataPlacement,

    /// Sampling period in microseconds
    #[arg(long, default_value_t = 1000)]
    period_us: u64,

    /// Stop after this many seconds (runs until SIGINT if omitted)
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Run a victim reading the line at this period
    #[arg(long)]
    victim_period_us: Option<u64>,

    /// Outliers are samples more than this many stddevs from the mean
    #[arg(long, default_value_t = 3.0)]
    z_threshold: f64,

    /// Keep only the most recent samples (at least one) for the summary
    /// and CSV output
    #[arg(long, default_value_t = 100_000)]
    keep: usize,

    /// Write the kept samples as CSV into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Keeps a victim reading the watched line in bounded chunks, so that it
/// can be shut down promptly.
struct VictimPacer {
    thread: VictimThread,
    interval: Duration,
    chunk: usize,
    done: Option<mpsc::Receiver<()>>,
}
impl VictimPacer {
    /// Wall-clock length of one chunk of victim reads.
    const CHUNK: Duration = Duration::from_millis(250);

    fn new(thread: VictimThread, interval: Duration) -> Self {
        let chunk = (Self::CHUNK.as_micros() / interval.as_micros().max(1))
            .max(1) as usize;
        Self { thread, interval, chunk, done: None }
    }

    /// Queue another chunk once the previous one has finished.
    fn feed(&mut self) -> Result<()> {
        if let Some(done) = &self.done {
            if done.try_recv().is_err() {
                return Ok(());
            }
        }
        self.thread.send(VictimCommand::Repeat {
            offset: 0,
            iterations: self.chunk,
            interval: self.interval,
        })?;
        let (tx, rx) = mpsc::channel();
        self.thread.send(VictimCommand::Barrier(tx))?;
        log::debug!("victim: queued {} reads", self.chunk);
        self.done = Some(rx);
        Ok(())
    }
}

struct Monitor;
impl Monitor {
    const REPORT_PERIOD: Duration = Duration::from_secs(1);

    fn run(args: &Args) -> Result<()> {
        let term = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone())?;

        let placement: Arc<dyn PlacementProvider> = Arc::new(SystemPlacement);
        let cfg = Configuration::detect(placement.as_ref())
            .data_placement(args.tier);
        cfg.validate(placement.as_ref())?;
        cfg.print();

        let buf = Arc::new(placement.alloc_on_node(4096, cfg.data_node())?);
        let mut victim = match args.victim_period_us {
            Some(us) => {
                let thread = VictimThread::spawn(cfg.victim_cpu,
                    placement.clone(), Threshold::new(cfg.threshold)?,
                    buf.clone())?;
                Some(VictimPacer::new(thread, Duration::from_micros(us)))
            },
            None => None,
        };

        let (tx, rx) = mpsc::channel();
        let mut observer = Observer::new(Threshold::new(cfg.threshold)?)
            .with_monitor_cpu(cfg.monitor_cpu, placement.clone());
        observer.init(0)?;
        observer.start_with_cadence(buf.clone(), 0,
            Duration::from_micros(args.period_us), move |obs| {
                let _ = tx.send(*obs);
            })?;
        println!("[*] watching {:#x} on node {} from cpu {} (ctrl-c to stop)",
            buf.target().addr(), cfg.data_node(), cfg.monitor_cpu);

        let start = Instant::now();
        let deadline = args.seconds.map(Duration::from_secs);
        let mut history = ObservationHistory::new(args.keep);
        let mut last_report = Instant::now();
        let mut window = stats::HitMissCount::default();

        while !term.load(Ordering::Relaxed) {
            if let Some(v) = victim.as_mut() {
                v.feed()?;
            }
            if deadline.is_some_and(|d| start.elapsed() >= d) {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(obs) => {
                    if obs.is_hit { window.hits += 1; } else { window.misses += 1; }
                    history.push(obs);
                },
                Err(mpsc::RecvTimeoutError::Timeout) => {},
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if last_report.elapsed() >= Self::REPORT_PERIOD {
                println!("  {:>8.1}s: {:>6} samples, {:>6.2}% hits",
                    start.elapsed().as_secs_f64(), window.total(),
                    window.success_rate() * 100.0);
                window = stats::HitMissCount::default();
                last_report = Instant::now();
            }
        }

        observer.stop()?;
        for obs in rx.try_iter() {
            history.push(obs);
        }
        observer.cleanup()?;
        if let Some(v) = victim {
            let vstats = v.thread.shutdown()?;
            println!("[*] victim made {} accesses", vstats.total_accesses);
        }

        Self::summarize(args, &history)
    }

    fn summarize(args: &Args, history: &ObservationHistory) -> Result<()> {
        println!("[*] monitor summary:");
        println!("  {:<24}: {}", "samples", history.total().total());
        if history.is_empty() {
            println!("  no samples");
            return Ok(());
        }
        println!("  {:<24}: {:.2}%", "hit rate",
            history.total().success_rate() * 100.0);

        let cycles = history.access_times();
        let s = stats::statistics(&cycles)?;
        let outliers: BitVec<usize, Msb0> =
            stats::detect_anomalies(&cycles, args.z_threshold)?;
        println!("  {:<24}: last {}", "window", cycles.len());
        println!("  {:<24}: {:.2} cycles", "mean", s.mean);
        println!("  {:<24}: {:.2} cycles", "median", s.median);
        println!("  {:<24}: {}/{}", "min/max", s.min, s.max);
        println!("  {:<24}: {}", "outliers", outliers.count_ones());

        if let Some(dir) = &args.output {
            let timing: Vec<TimingSample> = history.iter().map(|o| TimingSample {
                cycle_count: o.access_time,
                cpu_id: o.cpu_id,
                timestamp: o.timestamp,
            }).collect();
            let path = CsvSink::new(dir).write_samples("monitor", &timing)?;
            println!("[*] wrote {}", path.display());
        }
        Ok(())
    }
}
