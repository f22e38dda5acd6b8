//! Test and suite result types.

use crate::failure::FailureRecord;
use crate::measure::MetricStatistics;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Outcome of one test case invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Full name: "Class/test" or the registered test name
    pub name: String,
    /// `true` when no failure was recorded
    pub passed: bool,
    /// Every failure, in the order it was recorded
    pub failures: Vec<FailureRecord>,
    /// Statistics from measure calls made by the test
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<MetricStatistics>,
    /// Time spent in the whole lifecycle
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// A result for a test that never ran, failed by `failure`.
    pub fn not_run(name: impl Into<String>, failure: FailureRecord) -> Self {
        Self {
            name: name.into(),
            passed: false,
            failures: vec![failure],
            measurements: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn measurement(&self, metric: &str) -> Option<&MetricStatistics> {
        self.measurements.iter().find(|m| m.metric == metric)
    }
}

/// A measured metric that got slower than its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct Regression {
    pub case: String,
    pub metric: String,
    pub baseline_average: f64,
    pub current_average: f64,
    /// `current / baseline`; above `1.0` means slower
    pub ratio: f64,
}

/// Results for an entire suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    /// Suite name
    pub suite: String,
    /// Individual test results
    pub results: Vec<ExecutionResult>,
    /// Total suite duration
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Timestamp when suite started
    pub started_at: String,
    /// Git commit hash (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    /// Custom metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SuiteResult {
    /// Load a suite result from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading suite results from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing suite results from {}", path.display()))
    }

    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }

    /// Total number of failure records across all tests.
    pub fn failure_count(&self) -> usize {
        self.results.iter().map(|r| r.failures.len()).sum()
    }

    /// Find metrics whose average is more than `threshold` above the
    /// baseline's (e.g. `0.05` for 5%).
    pub fn find_regressions(&self, baseline: &SuiteResult, threshold: f64) -> Vec<Regression> {
        let baseline_map: HashMap<_, _> = baseline.results.iter().map(|r| (&r.name, r)).collect();

        let mut regressions = Vec::new();
        for result in &self.results {
            let Some(base) = baseline_map.get(&result.name) else {
                continue;
            };
            for current in &result.measurements {
                let (Some(current_average), Some(baseline_average)) = (
                    current.average(),
                    base.measurement(&current.metric).and_then(|m| m.average()),
                ) else {
                    continue;
                };
                if baseline_average <= 0.0 {
                    continue;
                }
                let ratio = current_average / baseline_average;
                if ratio > 1.0 + threshold {
                    regressions.push(Regression {
                        case: result.name.clone(),
                        metric: current.metric.clone(),
                        baseline_average,
                        current_average,
                        ratio,
                    });
                }
            }
        }
        regressions
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_nanos().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u128::deserialize(d)?;
        Ok(Duration::from_nanos(nanos as u64))
    }
}
