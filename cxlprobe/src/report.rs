//! Report writers.
//!
//! Measurements hand their records to a [`ReportSink`]. Each sink owns an
//! output directory and writes one file per call, named after the `name`
//! argument plus the sink's extension.

use std::fs::{ self, File };
use std::io::{ BufWriter, Write };
use std::path::{ Path, PathBuf };

use serde::Serialize;

use crate::error::*;
use crate::stats::{ self, Statistics };
use crate::types::{ AttackResult, TimingSample };

/// A destination for measurement records.
pub trait ReportSink {
    fn write_results(&mut self, name: &str, results: &[AttackResult])
        -> Result<PathBuf>;
    fn write_samples(&mut self, name: &str, samples: &[TimingSample])
        -> Result<PathBuf>;
    fn write_statistics(&mut self, name: &str, stats: &Statistics)
        -> Result<PathBuf>;
}

fn create(dir: &Path, name: &str, ext: &str) -> Result<(PathBuf, BufWriter<File>)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.{}", name, ext));
    let file = File::create(&path)?;
    Ok((path, BufWriter::new(file)))
}

/// Comma-separated values, one row per record.
#[derive(Clone, Debug)]
pub struct CsvSink {
    dir: PathBuf,
}
impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}
impl ReportSink for CsvSink {
    fn write_results(&mut self, name: &str, results: &[AttackResult])
        -> Result<PathBuf>
    {
        let (path, mut w) = create(&self.dir, name, "csv")?;
        writeln!(w, "attack_id,victim_access_time,attacker_probe_time,\
            latency_diff,hit_count,miss_count,is_hit,data_location,thread_config")?;
        for r in results {
            writeln!(w, "{},{},{},{},{},{},{},{},{}",
                r.attack_id,
                r.victim_access_time,
                r.attacker_probe_time,
                r.latency_diff,
                r.hit_count,
                r.miss_count,
                r.is_hit as u8,
                r.data_location.name(),
                r.thread_config.name(),
            )?;
        }
        w.flush()?;
        Ok(path)
    }

    fn write_samples(&mut self, name: &str, samples: &[TimingSample])
        -> Result<PathBuf>
    {
        let (path, mut w) = create(&self.dir, name, "csv")?;
        writeln!(w, "sample_id,cycle_count,cpu_id,timestamp")?;
        for (i, s) in samples.iter().enumerate() {
            writeln!(w, "{},{},{},{}", i, s.cycle_count, s.cpu_id, s.timestamp)?;
        }
        w.flush()?;
        Ok(path)
    }

    fn write_statistics(&mut self, name: &str, s: &Statistics)
        -> Result<PathBuf>
    {
        let (path, mut w) = create(&self.dir, name, "csv")?;
        writeln!(w, "min,max,mean,median,stddev")?;
        writeln!(w, "{},{},{:.2},{:.2},{:.2}", s.min, s.max, s.mean, s.median,
            s.stddev)?;
        w.flush()?;
        Ok(path)
    }
}

#[derive(Serialize)]
struct ResultsDoc<'a> {
    results: &'a [AttackResult],
}

#[derive(Serialize)]
struct SamplesDoc<'a> {
    samples: &'a [TimingSample],
}

/// Pretty-printed JSON documents.
#[derive(Clone, Debug)]
pub struct JsonSink {
    dir: PathBuf,
}
impl JsonSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let (path, mut w) = create(&self.dir, name, "json")?;
        serde_json::to_writer_pretty(&mut w, value)?;
        writeln!(w)?;
        w.flush()?;
        Ok(path)
    }
}
impl ReportSink for JsonSink {
    fn write_results(&mut self, name: &str, results: &[AttackResult])
        -> Result<PathBuf>
    {
        self.write(name, &ResultsDoc { results })
    }
    fn write_samples(&mut self, name: &str, samples: &[TimingSample])
        -> Result<PathBuf>
    {
        self.write(name, &SamplesDoc { samples })
    }
    fn write_statistics(&mut self, name: &str, stats: &Statistics)
        -> Result<PathBuf>
    {
        self.write(name, stats)
    }
}

/// Human-readable summaries.
#[derive(Clone, Debug)]
pub struct TextSink {
    dir: PathBuf,
}
impl TextSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_str(&self, name: &str, s: &str) -> Result<PathBuf> {
        let (path, mut w) = create(&self.dir, name, "txt")?;
        w.write_all(s.as_bytes())?;
        w.flush()?;
        Ok(path)
    }
}
impl ReportSink for TextSink {
    fn write_results(&mut self, name: &str, results: &[AttackResult])
        -> Result<PathBuf>
    {
        self.write_str(name, &success_report(results))
    }

    fn write_samples(&mut self, name: &str, samples: &[TimingSample])
        -> Result<PathBuf>
    {
        let cycles: Vec<u64> = samples.iter().map(|s| s.cycle_count).collect();
        let mut out = format!("Timing Samples\n==============\n\n\
            Samples: {}\n", samples.len());
        if let Ok(s) = stats::statistics(&cycles) {
            out.push_str(&statistics_block(&s));
        }
        self.write_str(name, &out)
    }

    fn write_statistics(&mut self, name: &str, stats: &Statistics)
        -> Result<PathBuf>
    {
        self.write_str(name, &statistics_block(stats))
    }
}

fn statistics_block(s: &Statistics) -> String {
    let mut out = String::new();
    out.push_str(&format!("  {:<8}: {} cycles\n", "min", s.min));
    out.push_str(&format!("  {:<8}: {} cycles\n", "max", s.max));
    out.push_str(&format!("  {:<8}: {:.2} cycles\n", "mean", s.mean));
    out.push_str(&format!("  {:<8}: {:.2} cycles\n", "median", s.median));
    out.push_str(&format!("  {:<8}: {:.2} cycles\n", "stddev", s.stddev));
    out
}

/// Overall and per-placement success rates for a set of results.
pub fn success_report(results: &[AttackResult]) -> String {
    let overall = stats::success_rate(results);
    let mut out = String::new();
    out.push_str("Attack Success Rate Report\n");
    out.push_str("==========================\n\n");
    out.push_str(&format!("Overall Success Rate: {:.2}%\n\n",
        overall.success_rate() * 100.0));
    out.push_str("Success Rate by Data Placement:\n");
    for (placement, count) in stats::success_by_placement(results) {
        out.push_str(&format!("  {}: {:.2}% ({}/{})\n", placement.name(),
            count.success_rate() * 100.0, count.hits, count.total()));
    }
    out.push_str("\nDetailed Statistics:\n");
    out.push_str(&format!("Total Attacks: {}\n", overall.total()));
    out.push_str(&format!("Successful: {}\n", overall.hits));
    out.push_str(&format!("Failed: {}\n", overall.misses));
    out
}

/// Write `rates` as an `iteration,success_rate` curve.
pub fn write_success_curve(path: &Path, rates: &[f64]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "iteration,success_rate")?;
    for (i, r) in rates.iter().enumerate() {
        writeln!(w, "{},{:.4}", i, r)?;
    }
    w.flush()?;
    Ok(())
}

/// Write a row-major matrix with `cols` columns as CSV.
pub fn write_heatmap(path: &Path, data: &[f64], cols: usize) -> Result<()> {
    if cols == 0 || data.len() % cols != 0 {
        return Err(Error::Config(format!(
            "{} cells don't form rows of {}", data.len(), cols)));
    }
    let mut w = BufWriter::new(File::create(path)?);
    for row in data.chunks(cols) {
        let line: Vec<String> = row.iter().map(|v| format!("{:.2}", v)).collect();
        writeln!(w, "{}", line.join(","))?;
    }
    w.flush()?;
    Ok(())
}

/// Write raw cycle counts as `sample_id,<label>`.
pub fn write_timings(path: &Path, label: &str, cycles: &[u64]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "sample_id,{}", label)?;
    for (i, c) in cycles.iter().enumerate() {
        writeln!(w, "{},{}", i, c)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{ DataPlacement, ThreadPlacement };

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("cxlprobe-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn results() -> Vec<AttackResult> {
        [(true, DataPlacement::NormalNode), (false, DataPlacement::NormalNode),
         (true, DataPlacement::CxlMemory)]
            .iter().enumerate()
            .map(|(i, (is_hit, loc))| AttackResult {
                attack_id: i as u64,
                victim_access_time: 100,
                attacker_probe_time: if *is_hit { 80 } else { 300 },
                latency_diff: if *is_hit { 120 } else { 100 },
                hit_count: *is_hit as u32,
                miss_count: !*is_hit as u32,
                is_hit: *is_hit,
                data_location: *loc,
                thread_config: ThreadPlacement::CrossCore,
            }).collect()
    }

    #[test]
    fn text_report() {
        let s = success_report(&results());
        assert!(s.contains("Overall Success Rate: 66.67%"));
        assert!(s.contains("  normal_node: 50.00% (1/2)"));
        assert!(s.contains("  cxl_memory: 100.00% (1/1)"));
        assert!(s.contains("Total Attacks: 3\nSuccessful: 2\nFailed: 1\n"));
    }

    #[test]
    fn csv_and_json_files() {
        let dir = scratch_dir("sinks");
        let res = results();

        let path = CsvSink::new(&dir).write_results("results", &res).unwrap();
        let csv = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("attack_id,"));
        assert_eq!(lines[3], "2,100,80,120,1,0,1,cxl_memory,cross_core");

        let path = JsonSink::new(&dir).write_results("results", &res).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["results"].as_array().unwrap().len(), 3);
        assert_eq!(v["results"][2]["data_location"], "cxl_memory");

        let samples = [TimingSample { cycle_count: 7, cpu_id: 1, timestamp: 9 }];
        let path = TextSink::new(&dir).write_samples("samples", &samples).unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("Samples: 1"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn curves_and_heatmaps() {
        let dir = scratch_dir("curves");
        fs::create_dir_all(&dir).unwrap();

        let curve = dir.join("curve.csv");
        write_success_curve(&curve, &[0.5, 0.25]).unwrap();
        assert_eq!(fs::read_to_string(&curve).unwrap(),
            "iteration,success_rate\n0,0.5000\n1,0.2500\n");

        let heat = dir.join("heat.csv");
        write_heatmap(&heat, &[1.0, 2.0, 3.0, 4.0], 2).unwrap();
        assert_eq!(fs::read_to_string(&heat).unwrap(), "1.00,2.00\n3.00,4.00\n");
        assert!(write_heatmap(&heat, &[1.0, 2.0, 3.0], 2).is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
