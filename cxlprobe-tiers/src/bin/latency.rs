use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use itertools::*;

use cxlprobe::*;

fn main() {
    let env = env_logger::Env::default().filter_or("CXLPROBE_LOG", "info");
    env_logger::init_from_env(env);
    let args = Args::parse();
    if let Err(e) = TierLatency::run(&args) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

/// Miss latency of CXL-backed memory compared to a local DRAM node.
///
/// Context
/// =======
///
/// A CXL memory expander usually shows up as a NUMA node without any cpus.
/// Loads which miss in the cache hierarchy are served by the expander,
/// which adds latency on top of a normal DRAM access.
///
/// Test
/// ====
///
/// 1. Pin to the attacker cpu.
///
/// 2. Each round, allocate one page on the normal node and one on the CXL
///    node.
///
/// 3. Take `--samples` paired measurements: probe both lines, then flush
///    both so the next pair misses.
///
/// 4. Report the per-round latency difference and signal strength
///    (difference over the pooled standard deviation).
///
/// Results
/// =======
///
/// On systems with an expander the CXL node is consistently slower. On a
/// single-node machine both buffers land on node 0 and the difference is
/// close to zero.
///
#[derive(Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Node backing normal memory
    #[arg(long)]
    normal_node: Option<usize>,

    /// Node backing CXL memory
    #[arg(long)]
    cxl_node: Option<usize>,

    /// Paired samples per round
    #[arg(short, long, default_value_t = Configuration::DEFAULT_SAMPLE_SIZE)]
    samples: usize,

    /// Number of rounds
    #[arg(short, long, default_value_t = Orchestrator::DEFAULT_ROUNDS)]
    rounds: usize,

    /// Denoising filter applied before computing statistics
    #[arg(long, default_value = "identity")]
    filter: stats::FilterKind,

    /// Write raw latencies and a histogram heatmap into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

struct TierLatency;
impl TierLatency {
    fn run(args: &Args) -> Result<()> {
        let placement: Arc<dyn PlacementProvider> = Arc::new(SystemPlacement);
        let mut cfg = Configuration::detect(placement.as_ref())
            .sample_size(args.samples);
        if let Some(n) = args.normal_node {
            cfg = cfg.numa_node_normal(n);
        }
        if let Some(n) = args.cxl_node {
            cfg = cfg.numa_node_cxl(n);
        }
        if cfg.numa_node_cxl == cfg.numa_node_normal {
            println!("[!] normal and CXL memory are both on node {}",
                cfg.numa_node_cxl);
        }
        cfg.print();

        let orch = Orchestrator::new(cfg, placement)?.rounds(args.rounds);
        let res = orch.run_latency()?;
        res.print();

        let tier = stats::denoise(&res.tier, args.filter)?;
        let baseline = stats::denoise(&res.baseline, args.filter)?;
        let cmp = stats::compare_distributions(&tier, &baseline)?;
        println!("[*] comparison ({:?} filter):", args.filter);
        println!("  {:<24}: {:.2} cycles", "difference", cmp.difference);
        println!("  {:<24}: {:.2}", "t statistic", cmp.t_statistic);
        println!("  {:<24}: {:.4}", "significance score", cmp.significance);

        if let Some(dir) = &args.output {
            std::fs::create_dir_all(dir)?;
            report::write_timings(&dir.join("latency_cxl.csv"), "cxl_cycles",
                &res.tier)?;
            report::write_timings(&dir.join("latency_normal.csv"),
                "normal_cycles", &res.baseline)?;
            let buckets = Orchestrator::HEATMAP_BUCKETS;
            let cells = [&tier, &baseline].iter()
                .map(|x| stats::histogram(x, buckets))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .zip([tier.len(), baseline.len()])
                .flat_map(|(h, n)| h.into_iter().map(move |c| c as f64 / n as f64))
                .collect_vec();
            report::write_heatmap(&dir.join("latency_heatmap.csv"), &cells,
                buckets)?;
            println!("[*] wrote latencies to {}", dir.display());
        }
        Ok(())
    }
}
