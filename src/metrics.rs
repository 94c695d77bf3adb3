//! Sample aggregation and threshold evaluation.
//!
//! Every HTTP call emits one [`Sample`] tagged with the step name that made
//! it. Samples are appended to a single shared log; nothing mutates a sample
//! after it is recorded, which is what makes concurrent VU writes safe.
//!
//! Thresholds (`p(95)<500`, `rate<0.01`) are evaluated exactly once, after
//! the executor reports the run finished. Percentiles use nearest-rank
//! selection on the sorted matching samples, with no interpolation. A
//! threshold whose tag matched no samples passes vacuously: absence of
//! traffic must not fail the run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;

/// One timing/outcome observation for a single HTTP call. Append-only.
#[derive(Debug, Clone)]
pub struct Sample {
    pub tag: String,
    pub duration_ms: f64,
    pub failed: bool,
    pub timestamp: SystemTime,
}

/// Errors from parsing a threshold expression.
#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("unrecognized threshold expression: '{0}' (expected p(N)<X or rate<X)")]
    UnrecognizedExpression(String),

    #[error("invalid number in threshold expression '{0}'")]
    InvalidNumber(String),

    #[error("percentile must be in (0, 100], got {0}")]
    PercentileOutOfRange(f64),
}

/// Parsed threshold predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdExpr {
    /// `p(95)<500`: nearest-rank percentile of duration_ms must be below the
    /// bound.
    Percentile { quantile: f64, max_ms: f64 },
    /// `rate<0.01`: failed/total over the matching samples must be below the
    /// bound.
    Rate { max: f64 },
}

impl ThresholdExpr {
    pub fn parse(expression: &str) -> Result<Self, ThresholdError> {
        let expression = expression.trim();

        let percentile_re =
            Regex::new(r"^p\((\d+(?:\.\d+)?)\)\s*<\s*(\d+(?:\.\d+)?)$").expect("valid regex");
        let rate_re = Regex::new(r"^rate\s*<\s*(\d+(?:\.\d+)?)$").expect("valid regex");

        if let Some(captures) = percentile_re.captures(expression) {
            let quantile: f64 = captures[1]
                .parse()
                .map_err(|_| ThresholdError::InvalidNumber(expression.to_string()))?;
            let max_ms: f64 = captures[2]
                .parse()
                .map_err(|_| ThresholdError::InvalidNumber(expression.to_string()))?;
            if quantile <= 0.0 || quantile > 100.0 {
                return Err(ThresholdError::PercentileOutOfRange(quantile));
            }
            Ok(ThresholdExpr::Percentile { quantile, max_ms })
        } else if let Some(captures) = rate_re.captures(expression) {
            let max: f64 = captures[1]
                .parse()
                .map_err(|_| ThresholdError::InvalidNumber(expression.to_string()))?;
            Ok(ThresholdExpr::Rate { max })
        } else {
            Err(ThresholdError::UnrecognizedExpression(
                expression.to_string(),
            ))
        }
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdExpr::Percentile { quantile, max_ms } => {
                write!(f, "p({})<{}", quantile, max_ms)
            }
            ThresholdExpr::Rate { max } => write!(f, "rate<{}", max),
        }
    }
}

/// A pass/fail criterion over the samples matching `tag`.
///
/// `tag: None` is the global threshold: it matches every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub tag: Option<String>,
    pub expr: ThresholdExpr,
}

impl Threshold {
    /// Threshold over all samples, e.g. `Threshold::global("p(95)<500")`.
    pub fn global(expression: &str) -> Result<Self, ThresholdError> {
        Ok(Self {
            tag: None,
            expr: ThresholdExpr::parse(expression)?,
        })
    }

    /// Threshold over samples with an exactly matching tag.
    pub fn tagged(tag: &str, expression: &str) -> Result<Self, ThresholdError> {
        Ok(Self {
            tag: Some(tag.to_string()),
            expr: ThresholdExpr::parse(expression)?,
        })
    }

    fn matches(&self, sample: &Sample) -> bool {
        match &self.tag {
            None => true,
            Some(tag) => sample.tag == *tag,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            None => write!(f, "{}", self.expr),
            Some(tag) => write!(f, "{{{}}} {}", tag, self.expr),
        }
    }
}

/// Outcome of evaluating one threshold at run end.
#[derive(Debug, Clone)]
pub struct ThresholdResult {
    pub threshold: Threshold,
    pub passed: bool,
    /// Observed percentile (ms) or failure rate; `None` when no samples
    /// matched and the threshold passed vacuously.
    pub observed: Option<f64>,
}

/// Nearest-rank summary for one tag, used in the end-of-run report.
#[derive(Debug, Clone)]
pub struct TagStats {
    pub tag: String,
    pub count: usize,
    pub failed: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl TagStats {
    pub fn format_table_row(&self) -> String {
        format!(
            "{:<32} {:>6} {:>6} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
            self.tag,
            self.count,
            self.failed,
            self.min_ms,
            self.mean_ms,
            self.p50_ms,
            self.p90_ms,
            self.p95_ms,
            self.max_ms,
        )
    }
}

/// Shared sample log with end-of-run threshold evaluation.
///
/// This is deliberately the single owner of all metric state: VUs only ever
/// append through [`Aggregator::record`], never read or mutate.
#[derive(Debug, Default)]
pub struct Aggregator {
    samples: Mutex<Vec<Sample>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample. `failed` covers both transport failures and
    /// 4xx/5xx statuses.
    pub fn record(&self, tag: &str, duration_ms: f64, failed: bool) {
        self.samples.lock().expect("sample log poisoned").push(Sample {
            tag: tag.to_string(),
            duration_ms,
            failed,
            timestamp: SystemTime::now(),
        });
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().expect("sample log poisoned").len()
    }

    /// Samples recorded for an exact tag (test/report helper).
    pub fn samples_for(&self, tag: &str) -> Vec<Sample> {
        self.samples
            .lock()
            .expect("sample log poisoned")
            .iter()
            .filter(|sample| sample.tag == tag)
            .cloned()
            .collect()
    }

    /// Evaluate every threshold over the current sample set. Called once,
    /// after all VUs have finished.
    pub fn evaluate(&self, thresholds: &[Threshold]) -> Vec<ThresholdResult> {
        let samples = self.samples.lock().expect("sample log poisoned");

        thresholds
            .iter()
            .map(|threshold| {
                let matching: Vec<&Sample> = samples
                    .iter()
                    .filter(|sample| threshold.matches(sample))
                    .collect();

                if matching.is_empty() {
                    // Vacuous pass: no traffic in a tag must not fail the run.
                    return ThresholdResult {
                        threshold: threshold.clone(),
                        passed: true,
                        observed: None,
                    };
                }

                let (passed, observed) = match &threshold.expr {
                    ThresholdExpr::Percentile { quantile, max_ms } => {
                        let mut durations: Vec<f64> =
                            matching.iter().map(|sample| sample.duration_ms).collect();
                        durations.sort_by(|a, b| a.total_cmp(b));
                        let value = nearest_rank(&durations, *quantile);
                        (value < *max_ms, value)
                    }
                    ThresholdExpr::Rate { max } => {
                        let failures =
                            matching.iter().filter(|sample| sample.failed).count();
                        let rate = failures as f64 / matching.len() as f64;
                        (rate < *max, rate)
                    }
                };

                ThresholdResult {
                    threshold: threshold.clone(),
                    passed,
                    observed: Some(observed),
                }
            })
            .collect()
    }

    /// Per-tag summary statistics, sorted by tag name.
    pub fn tag_stats(&self) -> Vec<TagStats> {
        let samples = self.samples.lock().expect("sample log poisoned");

        let mut by_tag: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
        for sample in samples.iter() {
            by_tag.entry(&sample.tag).or_default().push(sample);
        }

        by_tag
            .into_iter()
            .map(|(tag, group)| {
                let mut durations: Vec<f64> =
                    group.iter().map(|sample| sample.duration_ms).collect();
                durations.sort_by(|a, b| a.total_cmp(b));
                let count = durations.len();
                let sum: f64 = durations.iter().sum();

                TagStats {
                    tag: tag.to_string(),
                    count,
                    failed: group.iter().filter(|sample| sample.failed).count(),
                    min_ms: durations[0],
                    max_ms: durations[count - 1],
                    mean_ms: sum / count as f64,
                    p50_ms: nearest_rank(&durations, 50.0),
                    p90_ms: nearest_rank(&durations, 90.0),
                    p95_ms: nearest_rank(&durations, 95.0),
                    p99_ms: nearest_rank(&durations, 99.0),
                }
            })
            .collect()
    }
}

/// Nearest-rank percentile over an already-sorted slice: the value at rank
/// ceil(q/100 * n), 1-based. No interpolation.
fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    let rank = ((quantile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// Render per-tag statistics as a table for the final report.
pub fn format_stats_table(stats: &[TagStats]) -> String {
    if stats.is_empty() {
        return "No samples recorded.\n".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!(
        "{:<32} {:>6} {:>6} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "Tag", "Count", "Fail", "Min(ms)", "Mean(ms)", "P50(ms)", "P90(ms)", "P95(ms)", "Max(ms)"
    ));
    output.push_str(&"-".repeat(110));
    output.push('\n');
    for row in stats {
        output.push_str(&row.format_table_row());
        output.push('\n');
    }
    output
}
