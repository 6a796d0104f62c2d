//! Classification and summary statistics over cycle counts.
//!
//! Every function here is pure: inputs are borrowed and never modified, and
//! undersized inputs are reported as [`Error::Degenerate`] rather than
//! producing NaNs.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitvec::prelude::*;
use itertools::Itertools;
use serde::Serialize;

use crate::error::*;
use crate::types::{ AttackResult, DataPlacement };

/// Guards divisions by a standard deviation.
pub const EPSILON: f64 = 1e-9;

/// Summary of a list of cycle counts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Statistics {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation
    pub stddev: f64,
}

/// Result of [`compare_distributions`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Comparison {
    /// `mean(a) - mean(b)`
    pub difference: f64,
    /// Welch's t statistic
    pub t_statistic: f64,
    /// `1 / (1 + |t|)`.
    ///
    /// This is a monotone score where smaller means "more different". It is
    /// *not* a p-value and shouldn't be read as one.
    pub significance: f64,
}

/// Result of [`latency_difference`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LatencyDifference {
    /// `mean(tier) - mean(baseline)` in cycles
    pub difference: f64,
    /// `|difference|` over the pooled standard deviation
    pub signal_strength: f64,
}

/// Hit and miss counts for a set of samples or results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HitMissCount {
    pub hits: u32,
    pub misses: u32,
}
impl HitMissCount {
    pub fn total(&self) -> u32 { self.hits + self.misses }

    /// Fraction of hits, or zero when there is nothing to count.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }
}

fn mean(x: &[u64]) -> f64 {
    x.iter().map(|v| *v as f64).sum::<f64>() / x.len() as f64
}

/// Population variance (divide by n).
fn pop_variance(x: &[u64], mean: f64) -> f64 {
    x.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / x.len() as f64
}

/// Sample variance (divide by n - 1).
fn sample_variance(x: &[u64], mean: f64) -> f64 {
    x.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>()
        / (x.len() - 1) as f64
}

fn require(x: &[u64], needed: usize) -> Result<()> {
    if x.len() < needed {
        return Err(Error::degenerate(needed, x.len()));
    }
    Ok(())
}

/// Compute min/max/mean/median/stddev.
pub fn statistics(x: &[u64]) -> Result<Statistics> {
    let (min, max) = x.iter().minmax().into_option()
        .map(|(lo, hi)| (*lo, *hi))
        .ok_or(Error::degenerate(1, 0))?;
    let mean = mean(x);

    let sorted = x.iter().copied().sorted_unstable().collect_vec();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    };

    Ok(Statistics {
        min, max, mean, median,
        stddev: pop_variance(x, mean).sqrt(),
    })
}

/// Compare two distributions with a Welch-style two-sample t statistic.
pub fn compare_distributions(a: &[u64], b: &[u64]) -> Result<Comparison> {
    require(a, 2)?;
    require(b, 2)?;
    let (ma, mb) = (mean(a), mean(b));
    let (va, vb) = (sample_variance(a, ma), sample_variance(b, mb));
    let difference = ma - mb;

    let se = (va / a.len() as f64 + vb / b.len() as f64).sqrt();
    let t_statistic = if se > 0.0 {
        difference / se
    } else if difference == 0.0 {
        0.0
    } else {
        f64::INFINITY.copysign(difference)
    };
    Ok(Comparison {
        difference,
        t_statistic,
        significance: 1.0 / (1.0 + t_statistic.abs()),
    })
}

/// How cleanly the hit and miss distributions are separated, in `[0, 1)`.
///
/// Zero means the means coincide; values approach one as the distance
/// between the means grows relative to their spread.
pub fn hit_miss_separation(hits: &[u64], misses: &[u64]) -> Result<f64> {
    require(hits, 1)?;
    require(misses, 1)?;
    let (mh, mm) = (mean(hits), mean(misses));
    let spread = (pop_variance(hits, mh) + pop_variance(misses, mm) + EPSILON)
        .sqrt();
    let r = (mh - mm).abs() / spread;
    Ok(r / (1.0 + r))
}

/// Midpoint of the two means, rounded down. Returns zero ("no
/// recommendation") if either list is empty.
pub fn recommend_threshold(hits: &[u64], misses: &[u64]) -> u64 {
    if hits.is_empty() || misses.is_empty() {
        return 0;
    }
    ((mean(hits) + mean(misses)) / 2.0) as u64
}

/// Filters accepted by [`denoise`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    /// Window of 5; the first and last two samples pass through.
    MovingAverage,
    /// Window of 3; the first and last sample pass through.
    Median,
    /// Pass everything through unchanged.
    Identity,
}
impl FilterKind {
    /// Resolve a filter by name. Unrecognized names resolve to
    /// [`FilterKind::Identity`].
    pub fn from_name(name: &str) -> Self {
        match name.parse() {
            Ok(kind) => kind,
            Err(e) => {
                log::debug!("{}; using identity filter", e);
                Self::Identity
            },
        }
    }
}
impl FromStr for FilterKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "moving_average" => Ok(Self::MovingAverage),
            "median" => Ok(Self::Median),
            "identity" | "none" => Ok(Self::Identity),
            _ => Err(Error::UnknownVariant { kind: "filter", name: s.into() }),
        }
    }
}

/// Smooth a list of samples. Fails on empty input.
pub fn denoise(x: &[u64], kind: FilterKind) -> Result<Vec<u64>> {
    require(x, 1)?;
    Ok(match kind {
        FilterKind::Identity => x.to_vec(),
        FilterKind::MovingAverage => window_filter(x, 5, |w| {
            (w.iter().map(|v| *v as u128).sum::<u128>() / w.len() as u128) as u64
        }),
        FilterKind::Median => window_filter(x, 3, |w| {
            let mut w = [w[0], w[1], w[2]];
            w.sort_unstable();
            w[1]
        }),
    })
}

/// Apply `f` to each full window centered on a sample. Samples without a
/// full window pass through.
fn window_filter(x: &[u64], width: usize, f: impl Fn(&[u64]) -> u64)
    -> Vec<u64>
{
    let half = width / 2;
    let mut res = x.to_vec();
    if x.len() < width {
        return res;
    }
    for (i, w) in x.windows(width).enumerate() {
        res[i + half] = f(w);
    }
    res
}

/// Flag samples whose z-score exceeds `z_threshold` in magnitude.
pub fn detect_anomalies(x: &[u64], z_threshold: f64)
    -> Result<BitVec<usize, Msb0>>
{
    require(x, 1)?;
    let m = mean(x);
    let sd = pop_variance(x, m).sqrt();
    Ok(x.iter()
        .map(|v| ((*v as f64 - m) / (sd + EPSILON)).abs() > z_threshold)
        .collect())
}

/// Count samples below (hits) and at or above (misses) `threshold`.
pub fn classify(x: &[u64], threshold: u64) -> HitMissCount {
    let hits = x.iter().filter(|c| **c < threshold).count() as u32;
    HitMissCount { hits, misses: x.len() as u32 - hits }
}

/// Count hits and misses over a set of attack results.
pub fn success_rate(results: &[AttackResult]) -> HitMissCount {
    let hits = results.iter().filter(|r| r.is_hit).count() as u32;
    HitMissCount { hits, misses: results.len() as u32 - hits }
}

/// [`success_rate`], stratified by data placement. Placements with no
/// results are omitted.
pub fn success_by_placement(results: &[AttackResult])
    -> BTreeMap<DataPlacement, HitMissCount>
{
    let mut res: BTreeMap<DataPlacement, HitMissCount> = BTreeMap::new();
    for r in results {
        let entry = res.entry(r.data_location).or_default();
        if r.is_hit {
            entry.hits += 1;
        } else {
            entry.misses += 1;
        }
    }
    res
}

/// Bucket samples into `buckets` equal-width bins spanning `[min, max]`.
pub fn histogram(x: &[u64], buckets: usize) -> Result<Vec<u32>> {
    if buckets == 0 {
        return Err(Error::Config("histogram needs at least one bucket".into()));
    }
    let (min, max) = x.iter().minmax().into_option()
        .map(|(lo, hi)| (*lo, *hi))
        .ok_or(Error::degenerate(1, 0))?;
    let width = ((max - min) as f64 + 1.0) / buckets as f64;
    let mut res = vec![0u32; buckets];
    for v in x {
        let idx = (((v - min) as f64 / width) as usize).min(buckets - 1);
        res[idx] += 1;
    }
    Ok(res)
}

/// Compare latencies measured on some memory tier against a baseline.
/// Both lists must be the same length (paired samples).
pub fn latency_difference(tier: &[u64], baseline: &[u64])
    -> Result<LatencyDifference>
{
    require(tier, 1)?;
    if tier.len() != baseline.len() {
        return Err(Error::LengthMismatch {
            left: tier.len(), right: baseline.len()
        });
    }
    let (mt, mb) = (mean(tier), mean(baseline));
    let pooled = ((pop_variance(tier, mt) + pop_variance(baseline, mb)) / 2.0)
        .sqrt();
    let difference = mt - mb;
    Ok(LatencyDifference {
        difference,
        signal_strength: difference.abs() / (pooled + EPSILON),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::ThreadPlacement;

    fn result(is_hit: bool, loc: DataPlacement) -> AttackResult {
        AttackResult {
            attack_id: 0,
            victim_access_time: 0,
            attacker_probe_time: 0,
            latency_diff: 0,
            hit_count: is_hit as u32,
            miss_count: !is_hit as u32,
            is_hit,
            data_location: loc,
            thread_config: ThreadPlacement::CrossCore,
        }
    }

    #[test]
    fn ordering_invariant() {
        let sets: [&[u64]; 4] = [
            &[7],
            &[3, 1, 2],
            &[100, 100, 100, 500, 500],
            &[u64::MAX / 4, 0, 12, 90000],
        ];
        for x in sets {
            let s = statistics(x).unwrap();
            assert!(s.min as f64 <= s.mean && s.mean <= s.max as f64);
            assert!(s.stddev >= 0.0);
        }
    }

    #[test]
    fn median_odd_and_even() {
        let odd = [9, 1, 5, 3, 7];
        assert_eq!(statistics(&odd).unwrap().median, 5.0);
        let even = [4, 1, 3, 2];
        assert_eq!(statistics(&even).unwrap().median, 2.5);
        // input untouched
        assert_eq!(odd, [9, 1, 5, 3, 7]);
    }

    #[test]
    fn population_stddev() {
        let s = statistics(&[2, 4, 4, 4, 5, 5, 7, 9]).unwrap();
        assert_eq!(s.mean, 5.0);
        assert!((s.stddev - 2.0).abs() < 1e-12);
    }

    #[test]
    fn empty_is_degenerate() {
        assert!(matches!(statistics(&[]),
            Err(Error::Degenerate { needed: 1, got: 0 })));
        assert!(matches!(compare_distributions(&[1], &[1, 2]),
            Err(Error::Degenerate { needed: 2, got: 1 })));
        assert!(hit_miss_separation(&[], &[1]).is_err());
        assert!(detect_anomalies(&[], 2.0).is_err());
    }

    #[test]
    fn comparison() {
        let c = compare_distributions(&[10, 12, 11, 13], &[20, 22, 21, 23])
            .unwrap();
        assert_eq!(c.difference, -10.0);
        assert!(c.t_statistic < 0.0);
        assert!(c.significance > 0.0 && c.significance < 0.1);

        let same = compare_distributions(&[5, 5], &[5, 5]).unwrap();
        assert_eq!(same.t_statistic, 0.0);
        assert_eq!(same.significance, 1.0);

        let apart = compare_distributions(&[5, 5], &[9, 9]).unwrap();
        assert_eq!(apart.significance, 0.0);
    }

    #[test]
    fn separation_symmetric() {
        let hits = [50, 55, 52, 61, 48];
        let misses = [300, 280, 410, 390];
        let a = hit_miss_separation(&hits, &misses).unwrap();
        let b = hit_miss_separation(&misses, &hits).unwrap();
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
    }

    #[test]
    fn separation_degenerate() {
        assert_eq!(hit_miss_separation(&[7, 7], &[7, 7]).unwrap(), 0.0);
        assert!(hit_miss_separation(&[7, 7], &[9, 9]).unwrap() > 0.99);
    }

    #[test]
    fn well_separated_scenario() {
        let hits = [50, 55, 52];
        let misses = [400, 410, 405];
        let t = recommend_threshold(&hits, &misses);
        assert!((226..=229).contains(&t), "{}", t);
        assert!(hit_miss_separation(&hits, &misses).unwrap() > 0.95);
    }

    #[test]
    fn threshold_between_means() {
        let cases: [(&[u64], &[u64]); 3] = [
            (&[1], &[1]),
            (&[10, 20], &[1000]),
            (&[900, 901], &[3, 4, 5]),
        ];
        for (h, m) in cases {
            let t = recommend_threshold(h, m) as f64;
            let (mh, mm) = (mean(h), mean(m));
            assert!(t >= mh.min(mm).floor() && t <= mh.max(mm));
        }
        assert_eq!(recommend_threshold(&[], &[100]), 0);
        assert_eq!(recommend_threshold(&[100], &[]), 0);
    }

    #[test]
    fn classify_scenario() {
        let c = classify(&[100, 100, 100, 500, 500], 300);
        assert_eq!(c, HitMissCount { hits: 3, misses: 2 });
        assert_eq!(c.success_rate(), 0.6);
        assert_eq!(classify(&[300], 300).misses, 1);
        assert_eq!(HitMissCount::default().success_rate(), 0.0);
    }

    #[test]
    fn unknown_filter_is_identity() {
        let x = [5, 900, 3, 3, 77, 1, 2];
        assert_eq!(denoise(&x, FilterKind::from_name("bogus")).unwrap(),
            x.to_vec());
        assert!("bogus".parse::<FilterKind>().is_err());
    }

    #[test]
    fn denoise_rejects_empty() {
        for kind in [FilterKind::MovingAverage, FilterKind::Median,
            FilterKind::Identity, FilterKind::from_name("bogus")]
        {
            assert!(matches!(denoise(&[], kind),
                Err(Error::Degenerate { needed: 1, got: 0 })));
        }
        assert_eq!(denoise(&[7], FilterKind::Median).unwrap(), vec![7]);
    }

    #[test]
    fn moving_average_edges() {
        let x = [10, 20, 30, 40, 50, 60, 70];
        let y = denoise(&x, FilterKind::MovingAverage).unwrap();
        assert_eq!(y, vec![10, 20, 30, 40, 50, 60, 70]);
        let x = [0, 0, 100, 0, 0, 0];
        let y = denoise(&x, FilterKind::MovingAverage).unwrap();
        assert_eq!(y, vec![0, 0, 20, 20, 0, 0]);
        // too short for a window
        assert_eq!(denoise(&[1, 2, 3], FilterKind::MovingAverage).unwrap(),
            vec![1, 2, 3]);
    }

    #[test]
    fn median_filter_removes_spikes() {
        let x = [10, 10, 999, 10, 10, 1];
        let y = denoise(&x, FilterKind::Median).unwrap();
        assert_eq!(y, vec![10, 10, 10, 10, 10, 1]);
    }

    #[test]
    fn anomalies() {
        let mut x = vec![100u64; 20];
        x[7] = 5000;
        let mask = detect_anomalies(&x, 3.0).unwrap();
        assert_eq!(mask.len(), 20);
        assert_eq!(mask.count_ones(), 1);
        assert!(mask[7]);
        // flat input has nothing to flag
        assert!(detect_anomalies(&[4, 4, 4], 0.5).unwrap().not_any());
    }

    #[test]
    fn histogram_buckets() {
        let h = histogram(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], 5).unwrap();
        assert_eq!(h, vec![2, 2, 2, 2, 2]);
        let h = histogram(&[42, 42, 42], 4).unwrap();
        assert_eq!(h.iter().sum::<u32>(), 3);
        assert!(histogram(&[1], 0).is_err());
    }

    #[test]
    fn latency_difference_signal() {
        let tier = [300, 310, 305, 295];
        let base = [100, 110, 105, 95];
        let d = latency_difference(&tier, &base).unwrap();
        assert_eq!(d.difference, 200.0);
        assert!(d.signal_strength > 10.0);
        assert!(matches!(latency_difference(&tier, &base[..2]),
            Err(Error::LengthMismatch { left: 4, right: 2 })));
    }

    #[test]
    fn placement_breakdown() {
        let results = vec![
            result(true, DataPlacement::CxlMemory),
            result(false, DataPlacement::CxlMemory),
            result(true, DataPlacement::NormalNode),
            result(true, DataPlacement::NormalNode),
        ];
        assert_eq!(success_rate(&results).success_rate(), 0.75);
        let by = success_by_placement(&results);
        assert_eq!(by.len(), 2);
        assert_eq!(by[&DataPlacement::CxlMemory].success_rate(), 0.5);
        assert_eq!(by[&DataPlacement::NormalNode].hits, 2);
        assert!(!by.contains_key(&DataPlacement::Local));
    }
}
