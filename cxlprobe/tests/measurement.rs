use std::sync::{ Arc, Mutex };
use std::time::Duration;

use cxlprobe::*;

fn single_cpu() -> Arc<dyn PlacementProvider> {
    Arc::new(UnpinnedPlacement::new(1, 1))
}

fn orchestrator(iterations: usize) -> Orchestrator {
    let p = single_cpu();
    let cfg = Configuration::detect(p.as_ref())
        .iterations(iterations)
        .warmup_iterations(10)
        .sample_size(256);
    Orchestrator::new(cfg, p).unwrap().rounds(2).threads(1)
}

#[test]
#[cfg(target_arch = "x86_64")]
fn calibrated_threshold_classifies() {
    let orch = orchestrator(100);
    let cal = orch.calibrate().unwrap();
    assert!(cal.hits.mean < cal.misses.mean);

    let lib = AttackPrimitives::new(orch.threshold().clone());
    let buf = ProbeBuffer::anonymous(4096).unwrap();
    let t = buf.line(3);

    let cached: Vec<u64> = (0..200).map(|_| {
        timing::reload(t);
        timing::fence();
        timing::probe(t)
    }).collect();
    let flushed: Vec<u64> = (0..200).map(|_| lib.flush_reload(t)).collect();

    let cached = stats::classify(&cached, lib.threshold());
    let flushed = stats::classify(&flushed, lib.threshold());
    assert!(cached.hits > cached.misses, "{:?}", cached);
    assert!(flushed.misses > flushed.hits, "{:?}", flushed);
}

#[test]
#[cfg(target_arch = "x86_64")]
fn victim_access_is_visible() {
    let orch = orchestrator(200);
    orch.calibrate().unwrap();
    let r = orch.run_isolation().unwrap();
    assert!(r.with_access.hits > r.without_access.hits, "{:?}", r);
}

#[test]
fn attack_batches_report_only_completed_trials() {
    let buf = ProbeBuffer::anonymous(0x10000).unwrap();
    let mut a = Attacker::new(Threshold::default())
        .with_placement(DataPlacement::Local, ThreadPlacement::SameThread);
    a.init(0, single_cpu().as_ref()).unwrap();

    let set = buf.strided(4, 0x1000);
    let mut n = 0;
    let batch = a.repeat_attack(|a| {
        n += 1;
        match n % 4 {
            0 => a.prime_probe_attack(&[]),
            1 => a.flush_reload_attack(buf.line(0)),
            2 => a.evict_time_attack(buf.line(0), &set),
            _ => a.spectre_attack(buf.line(1), n % 2 == 1),
        }
    }, 20).unwrap();

    assert_eq!(batch.completed(), 15);
    assert_eq!(batch.skipped.len(), 5);
    assert!(batch.results.iter().enumerate().all(|(i, r)| r.attack_id == i as u64));
    assert_eq!(stats::success_rate(&batch.results).total(), 15);
    let by_placement = stats::success_by_placement(&batch.results);
    assert_eq!(by_placement.len(), 1);
    assert_eq!(by_placement[&DataPlacement::Local].total(), 15);
}

#[test]
fn observer_lifecycle() {
    let buf = Arc::new(ProbeBuffer::anonymous(4096).unwrap());
    let mut o = Observer::new(Threshold::default())
        .with_monitor_cpu(0, single_cpu());
    assert_eq!(o.state(), ObserverState::Idle);

    o.init(64).unwrap();
    let seen = Arc::new(Mutex::new(0u64));
    let counter = seen.clone();
    o.start_with_cadence(buf.clone(), 0, Duration::from_micros(200), move |_| {
        *counter.lock().unwrap() += 1;
    }).unwrap();
    assert_eq!(o.state(), ObserverState::Sampling);
    std::thread::sleep(Duration::from_millis(10));

    o.cleanup().unwrap();
    assert_eq!(o.state(), ObserverState::Idle);
    let n = *seen.lock().unwrap();
    assert_eq!(n, o.last_run_samples());
    assert!(matches!(o.stop(), Err(Error::NotRunning)));
}

#[test]
fn demo_writes_reports() {
    let dir = std::env::temp_dir()
        .join(format!("cxlprobe-demo-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let res = orchestrator(20).run_demo(&dir).unwrap();
    assert_eq!(res.flush_reload.rounds.len(), 2);
    assert_eq!(res.threads.len(), 1);
    for f in &res.files {
        assert!(f.exists(), "{} missing", f.display());
    }
    let report = std::fs::read_to_string(dir.join("attack_report.txt")).unwrap();
    assert!(report.starts_with("Attack Success Rate Report"));
    let curve = std::fs::read_to_string(dir.join("success_curve.csv")).unwrap();
    assert_eq!(curve.lines().count(), 3);

    let _ = std::fs::remove_dir_all(&dir);
}
