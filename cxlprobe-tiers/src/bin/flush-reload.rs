use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use itertools::*;
use rand::prelude::*;

use cxlprobe::*;

fn main() {
    let env = env_logger::Env::default().filter_or("CXLPROBE_LOG", "info");
    env_logger::init_from_env(env);
    let args = Args::parse();
    if let Err(e) = FlushReloadTiers::run(&args) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

/// FLUSH+RELOAD against victim data placed on different memory tiers.
///
/// Context
/// =======
///
/// A FLUSH+RELOAD attacker can only tell a hit from a miss if the reload
/// latency of a flushed line is clearly above the latency of a cached one.
/// Lines backed by a CXL expander take the long path through the expander
/// on every miss, which moves the miss distribution (and the best
/// threshold) compared to lines on a local DRAM node.
///
/// Test
/// ====
///
/// 1. For each requested tier, allocate the victim buffer on the matching
///    NUMA node.
///
/// 2. Optionally calibrate the hit/miss threshold on that node.
///
/// 3. Start a victim which repeatedly reads the first line of the buffer,
///    either on its own cpu or interleaved on the attacker's cpu.
///
/// 4. Run `--rounds` rounds of `--iterations` FLUSH+RELOAD trials against
///    the line and count hits.
///
/// Results
/// =======
///
/// With a calibrated threshold, the success rate reflects how often the
/// victim touched the line inside the attack window. Without calibration,
/// a threshold tuned for local DRAM tends to misclassify CXL-backed misses.
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// A comma-separated list of tiers holding the victim line
    #[arg(long, value_enum, value_delimiter = ',',
        default_value = "normal-node,cxl-memory")]
    tiers: Vec<DataPlacement>,

    /// Arrangement of the attacker and victim
    #[arg(long, value_enum, default_value = "cross-core")]
    threads: ThreadPlacement,

    /// Trials per round
    #[arg(short, long, default_value_t = Configuration::DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Number of rounds
    #[arg(short, long, default_value_t = Orchestrator::DEFAULT_ROUNDS)]
    rounds: usize,

    /// Calibrate the threshold on each tier before measuring
    #[arg(short, long)]
    calibrate: bool,

    /// Fixed hit/miss threshold in cycles
    #[arg(long)]
    threshold: Option<u64>,

    /// Write results (CSV and text report) into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

struct FlushReloadTiers;
impl FlushReloadTiers {
    fn run(args: &Args) -> Result<()> {
        let placement: Arc<dyn PlacementProvider> = Arc::new(SystemPlacement);
        let mut base = Configuration::detect(placement.as_ref())
            .thread_placement(args.threads)
            .iterations(args.iterations);
        if let Some(t) = args.threshold {
            base = base.threshold(t);
        }
        base.print();

        // Randomize the tier order so that drift over the run doesn't
        // always favor the same tier.
        let mut tiers = args.tiers.clone();
        tiers.shuffle(&mut thread_rng());
        println!("[*] tier order: {}", tiers.iter().map(|t| t.name()).join(", "));

        let mut results = Vec::new();
        for tier in tiers {
            let cfg = base.data_placement(tier);
            let orch = Orchestrator::new(cfg, placement.clone())?
                .rounds(args.rounds);
            println!("[*] {} (node {})", tier.name(), cfg.data_node());
            if args.calibrate {
                orch.calibrate()?.print();
            }
            let report = orch.run_flush_reload()?;
            report.print();
            log::debug!("{}: {} skipped trials", tier.name(), report.skipped);
            results.extend(report.results);
        }

        if let Some(dir) = &args.output {
            let csv = CsvSink::new(dir).write_results("flush_reload", &results)?;
            let txt = TextSink::new(dir).write_results("flush_reload", &results)?;
            println!("[*] wrote {} and {}", csv.display(), txt.display());
        }
        Ok(())
    }
}
