
use cxlprobe::*;

fn or_unreadable<T: std::fmt::Display>(r: Result<T>) -> String {
    match r {
        Ok(v) => v.to_string(),
        Err(e) => format!("<read error: {}>", e),
    }
}

fn main() {
    let env = env_logger::Env::default().filter_or("CXLPROBE_LOG", "warn");
    env_logger::init_from_env(env);

    let placement = SystemPlacement;
    let num_cpus = placement.num_cpus();
    let num_nodes = placement.num_numa_nodes();

    let isol = or_unreadable(SystemPlacement::sysfs_isolated());
    let nohz = or_unreadable(SystemPlacement::sysfs_nohz());
    let smt = match SystemPlacement::sysfs_smt_enabled() {
        Ok(true) => "enabled [!!]".to_string(),
        Ok(false) => "disabled".to_string(),
        Err(e) => format!("<read error: {}>", e),
    };
    let boost = match SystemPlacement::sysfs_cpufreq_boost_enabled() {
        Ok(true) => "enabled [!!]".to_string(),
        Ok(false) => "disabled".to_string(),
        Err(e) => format!("<read error: {}>", e),
    };

    println!("[*] 'cxlprobe' environment summary:");
    println!("  {:<40}: {}", "online cpus", num_cpus);
    println!("  {:<40}: {}", "isolated cpus", isol);
    println!("  {:<40}: {}", "nohz_full cpus", nohz);
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)", smt);
    println!("  {:<40}: {}", "cpufreq boost", boost);
    println!("  {:<40}: {}", "cache line size", CACHE_LINE);
    println!("  {:<40}: {}", "numa nodes", num_nodes);
    for node in 0..num_nodes {
        let cpus = match SystemPlacement::sysfs_node_cpulist(node) {
            Ok(s) if s.is_empty() => "<none> (memory-only, CXL?)".to_string(),
            Ok(s) => s,
            Err(e) => format!("<read error: {}>", e),
        };
        println!("  {:<40}: {}", format!("node{} cpus", node), cpus);
    }
    println!();
    Configuration::detect(&placement).print();
}
