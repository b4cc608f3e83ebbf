//! Offline analysis of a measurement log.

use std::collections::*;
use itertools::*;

use crate::measure::{ MeasurementLog, MeasurementRecord, MAX_AUX_COUNTERS };
use crate::scenario::Scenario;
use crate::secret::SecretInput;

/// A single line of the measurement report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportRow {
    /// A retained step.
    Sample {
        cycles: u64,
        secret: u8,
        counters: [u64; MAX_AUX_COUNTERS],
    },
    /// The end of a run.
    Boundary,
}

/// The samples collected for a single run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSamples {
    pub secret: u8,
    /// Cycle counts for each retained step, in program order. The step that
    /// cleared the counting flag is not included.
    pub cycles: Vec<u64>,
    /// The number of real steps matched the expected count for the secret.
    pub consistent: bool,
}
impl RunSamples {
    /// The sample `offset` steps before the end of the run.
    pub fn from_end(&self, offset: usize) -> Option<u64> {
        self.cycles.len().checked_sub(offset + 1).map(|idx| self.cycles[idx])
    }
}

/// Result of [`analyze`].
#[derive(Clone, Debug, Default)]
pub struct Analysis {
    pub rows: Vec<ReportRow>,
    /// Completed runs, in order.
    pub runs: Vec<RunSamples>,
    /// Number of runs with an unexpected number of steps, including runs
    /// which never completed.
    pub anomalies: usize,
    pub zero_steps: usize,
    /// Number of runs without a boundary in the log.
    pub missing_runs: usize,
}
impl Analysis {
    pub fn boundaries(&self) -> usize {
        self.rows.iter().filter(|r| matches!(r, ReportRow::Boundary)).count()
    }
}

/// Split a measurement log into runs and check each run against the number
/// of steps expected for its secret.
///
/// Zero-steps are skipped. Records taken while the counting flag was set are
/// samples of the current run. A real step recorded after the flag was
/// cleared ends the run.
pub fn analyze(log: &MeasurementLog, secrets: &SecretInput, scenario: &impl Scenario)
    -> Analysis
{
    analyze_records(log.records(), secrets.values(), scenario)
}

pub fn analyze_records(records: &[MeasurementRecord], secrets: &[u8],
    scenario: &impl Scenario) -> Analysis
{
    let mut res = Analysis::default();
    let mut run = 0;
    let mut steps = 0;
    let mut cycles = Vec::new();

    for rec in records.iter() {
        if rec.is_zero_step() {
            res.zero_steps += 1;
            continue;
        }
        let secret = match secrets.get(run) {
            Some(s) => *s,
            None => {
                log::warn!("log has more runs than secrets ({})", secrets.len());
                res.anomalies += 1;
                break;
            },
        };
        steps += 1;

        if rec.counting_flag != 0 {
            res.rows.push(ReportRow::Sample {
                cycles: rec.cycles,
                secret,
                counters: rec.counters,
            });
            cycles.push(rec.cycles);
            continue;
        }

        let expected = scenario.expected_steps(secret);
        let consistent = steps == expected;
        if !consistent {
            log::debug!("run {}: {} steps, expected {} for secret {}",
                run, steps, expected, secret);
            res.anomalies += 1;
        }
        res.rows.push(ReportRow::Boundary);
        res.runs.push(RunSamples {
            secret,
            cycles: std::mem::take(&mut cycles),
            consistent,
        });
        steps = 0;
        run += 1;
    }

    res.missing_runs = secrets.len().saturating_sub(res.runs.len());
    res.anomalies += res.missing_runs;
    res
}

/// Statistics for samples taken at the same distance from the end of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexStats {
    /// Distance from the end of the run (0 is the last sample).
    pub offset: usize,
    /// Number of samples at this offset.
    pub samples: usize,
    /// Mean cycles for each secret value.
    pub means: BTreeMap<u8, f64>,
    /// Pearson correlation between cycles and secret.
    pub correlation: f64,
    /// Largest difference between two class means.
    pub separation: f64,
    /// Best fraction of samples correctly classified by a single cycle
    /// threshold between the two most separated classes.
    pub hit_rate: f64,
}

/// Result of [`verdict`].
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    /// Number of consistent runs used.
    pub runs_used: usize,
    /// Statistics for every offset with samples from at least two secrets.
    pub indices: Vec<IndexStats>,
    /// Offset with the largest separation.
    pub best: Option<usize>,
    pub threshold: f64,
    pub exploitable: bool,
}
impl Verdict {
    pub const DEFAULT_THRESHOLD: f64 = 20.0;

    pub fn best_stats(&self) -> Option<&IndexStats> {
        self.best.and_then(|b| self.indices.iter().find(|s| s.offset == b))
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  {:<24}: {}", "runs used", self.runs_used)?;
        match self.best_stats() {
            Some(best) => {
                writeln!(f, "  {:<24}: {} from the end", "best offset", best.offset)?;
                for (secret, mean) in best.means.iter() {
                    writeln!(f, "  {:<24}: {:.2}", format!("mean (secret {})", secret), mean)?;
                }
                writeln!(f, "  {:<24}: {:.2} cycles", "separation", best.separation)?;
                writeln!(f, "  {:<24}: {:.4}", "pearson r", best.correlation)?;
                writeln!(f, "  {:<24}: {:.2}%", "hit rate", best.hit_rate * 100.0)?;
            },
            None => writeln!(f, "  no offset has samples for two different secrets")?,
        }
        write!(f, "  {:<24}: {}", format!("exploitable (>{})", self.threshold),
            if self.exploitable { "yes" } else { "no" })
    }
}

/// Pearson correlation coefficient. Returns 0 if either side is constant.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n == 0 {
        return 0.0;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0f64, 0.0f64, 0.0f64);
    for (a, b) in x[..n].iter().zip(y[..n].iter()) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx == 0.0 || syy == 0.0 {
        return 0.0;
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}

/// Best accuracy of classifying `lo`/`hi` samples with `cycles > t`.
fn threshold_hit_rate(lo: &[u64], hi: &[u64]) -> f64 {
    let total = lo.len() + hi.len();
    if total == 0 {
        return 0.0;
    }
    let candidates = lo.iter().chain(hi.iter()).copied().sorted().dedup();
    let mut best = 0usize;
    for t in candidates {
        let correct = lo.iter().filter(|c| **c <= t).count()
            + hi.iter().filter(|c| **c > t).count();
        best = best.max(correct);
    }
    // Everything on one side is also a candidate.
    best = best.max(lo.len()).max(hi.len());
    best as f64 / total as f64
}

fn index_stats(offset: usize, samples: &[(u8, u64)]) -> Option<IndexStats> {
    let groups = samples.iter().copied().into_group_map();
    if groups.len() < 2 {
        return None;
    }
    let means: BTreeMap<u8, f64> = groups.iter().map(|(s, c)| {
        (*s, c.iter().sum::<u64>() as f64 / c.len() as f64)
    }).collect();

    let (lo, hi) = means.iter()
        .minmax_by(|a, b| a.1.total_cmp(b.1))
        .into_option()?;
    let separation = hi.1 - lo.1;
    let hit_rate = threshold_hit_rate(&groups[lo.0], &groups[hi.0]);

    let xs: Vec<f64> = samples.iter().map(|(_, c)| *c as f64).collect();
    let ys: Vec<f64> = samples.iter().map(|(s, _)| *s as f64).collect();

    Some(IndexStats {
        offset,
        samples: samples.len(),
        correlation: pearson(&xs, &ys),
        separation,
        hit_rate,
        means,
    })
}

/// Decide whether the measured code leaks its secret through timing.
///
/// Only consistent runs are used. Runs for different secrets may take a
/// different number of steps, so samples are aligned by their distance from
/// the end of the run.
pub fn verdict(runs: &[RunSamples], threshold: f64) -> Verdict {
    let used: Vec<&RunSamples> = runs.iter().filter(|r| r.consistent).collect();
    let depth = used.iter().map(|r| r.cycles.len()).max().unwrap_or(0);

    let mut indices = Vec::new();
    let mut samples = Vec::with_capacity(used.len());
    for offset in 0..depth {
        samples.clear();
        samples.extend(used.iter().filter_map(|r| {
            r.from_end(offset).map(|c| (r.secret, c))
        }));
        if let Some(stats) = index_stats(offset, &samples) {
            indices.push(stats);
        }
    }

    let best = indices.iter()
        .max_by(|a, b| a.separation.total_cmp(&b.separation))
        .map(|s| s.offset);
    let exploitable = indices.iter().any(|s| s.separation > threshold);

    Verdict { runs_used: used.len(), indices, best, threshold, exploitable }
}
