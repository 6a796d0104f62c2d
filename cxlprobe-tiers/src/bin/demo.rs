use std::path::PathBuf;
use std::sync::Arc;

use clap::{ Parser, ValueEnum };

use cxlprobe::*;

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().filter_or("CXLPROBE_LOG", level);
    env_logger::init_from_env(env);
    if let Err(e) = Demo::run(&args) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Flush+Reload rounds against a victim
    FlushReload,
    /// CXL vs. normal node latency
    Latency,
    /// Concurrent Flush+Reload attackers
    Multithreading,
    /// Attacker and victim interleaved on one isolated cpu
    SingleThread,
    /// Everything above, with reports written to `--output`
    FullDemo,
}

/// Run one of the predefined experiments, or all of them.
///
/// Context
/// =======
///
/// Each mode exercises one part of the harness on the local machine using
/// defaults detected from the topology (attacker on cpu 0, victim halfway
/// across the machine, CXL memory on node 1 if it exists).
///
/// Test
/// ====
///
/// - `flush-reload`: `--rounds` rounds of `--iterations` trials. With
///   `--compare`, run once with the victim line on the normal node and once
///   on the CXL node.
///
/// - `latency`: paired miss latencies on both nodes.
///
/// - `multithreading`: `--threads` attackers flushing and reloading the
///   same line.
///
/// - `single-thread`: victim and attacker interleaved on one cpu, with and
///   without the victim access.
///
/// - `full-demo`: all of the above. Writes `attack_report.txt`,
///   `results.json`, `results.csv`, `success_curve.csv` and the latency
///   files into `--output`.
///
/// Results
/// =======
///
/// With `--stats`, the threshold is calibrated first and summary
/// statistics are printed for every experiment.
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Experiment to run
    #[arg(short, long, value_enum, default_value = "flush-reload")]
    mode: Mode,

    /// Trials per round
    #[arg(short, long, default_value_t = Configuration::DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Number of rounds
    #[arg(short, long, default_value_t = Orchestrator::DEFAULT_ROUNDS)]
    rounds: usize,

    /// Number of attacker threads
    #[arg(short, long, default_value_t = Orchestrator::DEFAULT_THREADS)]
    threads: usize,

    /// Output directory
    #[arg(short, long, default_value = "./results")]
    output: PathBuf,

    /// Compare CXL vs. normal memory
    #[arg(short, long)]
    compare: bool,

    /// Calibrate first and print detailed statistics
    #[arg(short, long)]
    stats: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

struct Demo;
impl Demo {
    fn orchestrator(args: &Args, placement: &Arc<dyn PlacementProvider>,
        cfg: Configuration) -> Result<Orchestrator>
    {
        let orch = Orchestrator::new(cfg, placement.clone())?
            .rounds(args.rounds)
            .threads(args.threads);
        if args.stats {
            orch.calibrate()?.print();
        }
        Ok(orch)
    }

    fn flush_reload(args: &Args, placement: &Arc<dyn PlacementProvider>,
        cfg: Configuration) -> Result<()>
    {
        let tiers = if args.compare {
            vec![DataPlacement::NormalNode, DataPlacement::CxlMemory]
        } else {
            vec![cfg.data_placement]
        };
        for tier in tiers {
            println!("\n[*] flush+reload on {}", tier.name());
            let orch = Self::orchestrator(args, placement, cfg.data_placement(tier))?;
            let res = orch.run_flush_reload()?;
            res.print();
            if args.stats {
                if let Ok(s) = stats::statistics(&res.results.iter()
                    .map(|r| r.attacker_probe_time).collect::<Vec<_>>())
                {
                    println!("  {:<24}: {:.2} (median {:.2}, stddev {:.2})",
                        "probe latency", s.mean, s.median, s.stddev);
                }
            }
        }
        Ok(())
    }

    fn run(args: &Args) -> Result<()> {
        println!("[*] cxlprobe demo: {:?}", args.mode);
        let placement: Arc<dyn PlacementProvider> = Arc::new(SystemPlacement);
        let cfg = Configuration::detect(placement.as_ref())
            .iterations(args.iterations);
        cfg.print();

        match args.mode {
            Mode::FlushReload => Self::flush_reload(args, &placement, cfg)?,
            Mode::Latency => {
                println!("\n[*] latency: node {} vs node {}",
                    cfg.numa_node_cxl, cfg.numa_node_normal);
                Self::orchestrator(args, &placement, cfg)?.run_latency()?.print();
            },
            Mode::Multithreading => {
                println!("\n[*] multithreading: {} threads", args.threads);
                let out = Self::orchestrator(args, &placement, cfg)?
                    .run_multithreading()?;
                Self::print_threads(&out);
            },
            Mode::SingleThread => {
                println!("\n[*] single-thread isolation");
                Self::orchestrator(args, &placement, cfg)?.run_isolation()?.print();
            },
            Mode::FullDemo => {
                println!("\n[*] running all experiments");
                let res = Self::orchestrator(args, &placement, cfg)?
                    .run_demo(&args.output)?;
                res.flush_reload.print();
                res.latency.print();
                Self::print_threads(&res.threads);
                res.isolation.print();
                println!("[*] results saved to {}:", args.output.display());
                for f in &res.files {
                    println!("  {}", f.display());
                }
            },
        }
        Ok(())
    }

    fn print_threads(out: &[ThreadOutcome]) {
        for t in out {
            println!("  cpu {:>3}: {:>6.2}% hits ({}/{}), mean probe {:.1} cycles",
                t.cpu, t.hit_miss.success_rate() * 100.0, t.hit_miss.hits,
                t.hit_miss.total(), t.mean_probe);
        }
    }
}
