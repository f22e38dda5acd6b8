//! Pluggable reporters for test output.
//!
//! Reporters never panic and never fail the run: write errors are logged
//! through `tracing` and otherwise ignored. Console output is emitted in
//! complete lines so concurrent writers cannot interleave.

use crate::config::RunnerConfig;
use crate::measure::MetricStatistics;
use crate::result::{ExecutionResult, SuiteResult};
use anyhow::Context;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Trait for test result reporters.
pub trait Reporter: Send + Sync {
    /// Called when a suite starts.
    fn suite_start(&self, _suite: &str, _config: &RunnerConfig) {}

    /// Called when a test case starts.
    fn case_start(&self, _name: &str) {}

    /// Called when a test case has finished its whole lifecycle.
    fn case_end(&self, _result: &ExecutionResult) {}

    /// Called when a suite completes.
    fn suite_end(&self, _result: &SuiteResult) {}
}

const RULE: &str = "---------------------------------------------------------------";

/// Console reporter that prints results to stdout.
pub struct ConsoleReporter {
    show_samples: bool,
    output_lock: Mutex<()>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            show_samples: false,
            output_lock: Mutex::new(()),
        }
    }

    /// Print every retained sample after each metric summary.
    pub fn show_samples(mut self, show: bool) -> Self {
        self.show_samples = show;
        self
    }

    fn write_stdout(&self, message: &str) {
        let _guard = self.output_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", message) {
            tracing::warn!(error = %e, "failed to write to stdout");
        }
    }

    fn format_case(&self, result: &ExecutionResult) -> String {
        let mut out = String::new();
        for failure in &result.failures {
            let note = if failure.kind().is_measurement_violation() {
                ", iteration discarded"
            } else {
                ""
            };
            out.push_str(&format!(
                "{}:{}: error: {} : {} ({}{})\n",
                failure.file_path(),
                failure.line_number(),
                result.name,
                failure.description(),
                failure.kind(),
                note
            ));
        }
        for stats in &result.measurements {
            out.push_str(&format_metric(&result.name, stats));
            out.push('\n');
            if self.show_samples && !stats.samples.is_empty() {
                let samples: Vec<_> = stats
                    .samples
                    .iter()
                    .map(|s| format!("{:.6}", s))
                    .collect();
                out.push_str(&format!("      values: [{}]\n", samples.join(", ")));
            }
        }
        let verdict = if result.passed { "passed" } else { "failed" };
        out.push_str(&format!(
            "Test Case '{}' {} ({}).",
            result.name,
            verdict,
            format_duration(result.duration)
        ));
        out
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn suite_start(&self, suite: &str, config: &RunnerConfig) {
        let header = format!(
            "{RULE}\n\
             Test Suite '{}' started\n\
             Iterations: {}, Continue after failure: {}\n\
             {RULE}",
            suite, config.iterations, config.continue_after_failure
        );
        self.write_stdout(&header);
    }

    fn case_end(&self, result: &ExecutionResult) {
        self.write_stdout(&self.format_case(result));
    }

    fn suite_end(&self, result: &SuiteResult) {
        let footer = format!(
            "{RULE}\n\
             Executed {} tests, with {} failures ({} failed) in {}\n\
             {RULE}",
            result.results.len(),
            result.failure_count(),
            result.failed_count(),
            format_duration(result.total_duration)
        );
        self.write_stdout(&footer);
    }
}

fn format_metric(case: &str, stats: &MetricStatistics) -> String {
    if !stats.passed {
        return format!(
            "{}: measured [{}, {}] no valid samples ({} discarded)",
            case, stats.metric, stats.unit, stats.discarded
        );
    }
    let average = stats.average().unwrap_or_default();
    let relative = stats.relative_std_dev().unwrap_or_default();
    let mut line = format!(
        "{}: measured [{}, {}] average: {:.6}, relative standard deviation: {:.3}%",
        case, stats.metric, stats.unit, average, relative
    );
    if stats.discarded > 0 {
        line.push_str(&format!(", discarded: {}", stats.discarded));
    }
    line
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} seconds", secs)
    } else if secs >= 0.001 {
        format!("{:.2}ms", secs * 1_000.0)
    } else {
        format!("{:.2}us", secs * 1_000_000.0)
    }
}

/// JSON reporter that writes results to files.
///
/// Layout per suite:
/// - `{suite}/{timestamp}.json`: machine-readable results
/// - `{suite}/{timestamp}.txt`: human-readable summary
/// - `{suite}/latest.json` and `latest.txt`: most recent results
pub struct JsonReporter {
    output_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Write the suite files and return the path of `latest.json`.
    pub fn write(&self, result: &SuiteResult) -> anyhow::Result<PathBuf> {
        let suite_dir = self.output_dir.join(result.suite.replace(['/', '\\'], "_"));
        std::fs::create_dir_all(&suite_dir)
            .with_context(|| format!("creating {}", suite_dir.display()))?;

        let json = serde_json::to_string_pretty(result).context("serializing suite results")?;
        let summary = format_summary(result);

        let stamped = suite_dir.join(format!("{}.json", result.started_at));
        std::fs::write(&stamped, &json)
            .with_context(|| format!("writing {}", stamped.display()))?;
        std::fs::write(suite_dir.join(format!("{}.txt", result.started_at)), &summary)
            .context("writing text summary")?;

        let latest = suite_dir.join("latest.json");
        std::fs::write(&latest, &json)
            .with_context(|| format!("writing {}", latest.display()))?;
        std::fs::write(suite_dir.join("latest.txt"), &summary)
            .context("writing latest summary")?;

        tracing::info!(path = %stamped.display(), "results written");
        Ok(latest)
    }
}

fn format_summary(result: &SuiteResult) -> String {
    let mut output = String::new();
    output.push_str(&format!("Test Suite: {}\n", result.suite));
    output.push_str(&format!("Started:    {}\n", result.started_at));
    if let Some(sha) = &result.git_sha {
        output.push_str(&format!("Git SHA:    {}\n", sha));
    }
    output.push_str(RULE);
    output.push('\n');

    for case in &result.results {
        let verdict = if case.passed { "passed" } else { "FAILED" };
        output.push_str(&format!("  {:<48} {}\n", case.name, verdict));
        for failure in &case.failures {
            output.push_str(&format!("      {}\n", failure));
        }
        for stats in &case.measurements {
            output.push_str(&format!("      {}\n", format_metric(&case.name, stats)));
        }
    }

    output.push_str(RULE);
    output.push('\n');
    output.push_str(&format!(
        "Tests: {}, failed: {}, total time: {}\n",
        result.results.len(),
        result.failed_count(),
        format_duration(result.total_duration)
    ));
    output
}

impl Reporter for JsonReporter {
    fn suite_end(&self, result: &SuiteResult) {
        if let Err(e) = self.write(result) {
            tracing::warn!(error = %format!("{:#}", e), "failed to write results");
        }
    }
}

/// GitHub Actions reporter that emits workflow annotations.
///
/// Only produces output when `GITHUB_ACTIONS` is set: an `::error` per
/// recorded failure and a `::warning` per metric regression against the
/// optional baseline.
pub struct GitHubActionsReporter {
    threshold: f64,
    baseline: Option<SuiteResult>,
}

impl GitHubActionsReporter {
    /// `threshold` is the regression threshold (e.g., 0.05 for 5%).
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            baseline: None,
        }
    }

    /// Load baseline from a file for comparison. A missing or unreadable
    /// baseline is logged and ignored.
    pub fn with_baseline(mut self, path: impl AsRef<std::path::Path>) -> Self {
        match SuiteResult::load(path.as_ref()) {
            Ok(baseline) => self.baseline = Some(baseline),
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "baseline not loaded"),
        }
        self
    }

    fn is_github_actions() -> bool {
        std::env::var("GITHUB_ACTIONS").is_ok()
    }

    fn annotations(&self, result: &SuiteResult) -> Vec<String> {
        let mut lines = Vec::new();
        for case in &result.results {
            for failure in &case.failures {
                lines.push(format!(
                    "::error file={},line={},title={}::{}",
                    failure.file_path(),
                    failure.line_number(),
                    case.name,
                    failure.description().replace('\n', "%0A")
                ));
            }
        }
        if let Some(baseline) = &self.baseline {
            for r in result.find_regressions(baseline, self.threshold) {
                lines.push(format!(
                    "::warning title=Performance Regression::{} `{}` is {:.1}% slower than baseline",
                    r.case,
                    r.metric,
                    (r.ratio - 1.0) * 100.0
                ));
            }
        }
        lines
    }
}

impl Reporter for GitHubActionsReporter {
    fn suite_end(&self, result: &SuiteResult) {
        if !Self::is_github_actions() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        for line in self.annotations(result) {
            if writeln!(stdout, "{}", line).is_err() {
                break;
            }
        }
    }
}

/// Combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter {
    fn suite_start(&self, suite: &str, config: &RunnerConfig) {
        for r in &self.reporters {
            r.suite_start(suite, config);
        }
    }

    fn case_start(&self, name: &str) {
        for r in &self.reporters {
            r.case_start(name);
        }
    }

    fn case_end(&self, result: &ExecutionResult) {
        for r in &self.reporters {
            r.case_end(result);
        }
    }

    fn suite_end(&self, result: &SuiteResult) {
        for r in &self.reporters {
            r.suite_end(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{FailureKind, FailureRecord};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn failed_case() -> ExecutionResult {
        ExecutionResult {
            name: "Math/test_add".to_string(),
            passed: false,
            failures: vec![FailureRecord::new(
                FailureKind::AssertionFailure,
                "1 + 1 != 3",
                "tests/math.rs",
                12,
            )],
            measurements: vec![MetricStatistics {
                metric: "wall_clock_time".to_string(),
                unit: "s".to_string(),
                samples: vec![0.5, 0.5],
                discarded: 1,
                passed: true,
            }],
            duration: Duration::from_millis(3),
        }
    }

    fn suite_of(results: Vec<ExecutionResult>) -> SuiteResult {
        SuiteResult {
            suite: "demo/suite".to_string(),
            results,
            total_duration: Duration::from_secs(2),
            started_at: "1700000000000".to_string(),
            git_sha: Some("abc123".to_string()),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn should_format_failure_with_location() {
        let text = ConsoleReporter::new().format_case(&failed_case());
        assert!(text.contains("tests/math.rs:12: error: Math/test_add : 1 + 1 != 3"));
        assert!(text.contains("average: 0.500000"));
        assert!(text.contains("discarded: 1"));
        assert!(text.ends_with("failed (3.00ms)."));
    }

    #[test]
    fn should_mark_measurement_violations_as_discarding_the_iteration() {
        let mut result = failed_case();
        result.failures.push(FailureRecord::new(
            FailureKind::DoubleStop,
            "stop_measuring called more than once in one iteration",
            "tests/math.rs",
            20,
        ));
        let text = ConsoleReporter::new().format_case(&result);

        assert!(text.contains("1 + 1 != 3 (assertion failure)\n"));
        assert!(text.contains("(double stop, iteration discarded)"));
    }

    #[test]
    fn should_report_metric_without_samples_as_failed() {
        let stats = MetricStatistics {
            metric: "wall_clock_time".to_string(),
            unit: "s".to_string(),
            samples: vec![],
            discarded: 5,
            passed: false,
        };
        assert!(format_metric("c", &stats).contains("no valid samples (5 discarded)"));
    }

    #[test]
    fn should_format_duration_in_appropriate_units() {
        assert!(format_duration(Duration::from_secs(2)).contains("seconds"));
        assert!(format_duration(Duration::from_millis(500)).contains("ms"));
        assert!(format_duration(Duration::from_micros(100)).contains("us"));
    }

    #[test]
    fn should_write_json_and_summary_files() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = JsonReporter::new(dir.path());
        let latest = reporter.write(&suite_of(vec![failed_case()])).unwrap();

        let suite_dir = dir.path().join("demo_suite");
        assert_eq!(latest, suite_dir.join("latest.json"));
        assert!(suite_dir.join("1700000000000.json").exists());
        assert!(suite_dir.join("latest.txt").exists());

        let loaded = SuiteResult::load(&latest).unwrap();
        assert_eq!(loaded.results[0].failures.len(), 1);
        assert_eq!(loaded.git_sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn should_annotate_failures_and_regressions() {
        let mut baseline_case = failed_case();
        baseline_case.measurements[0].samples = vec![0.1, 0.1];
        let mut reporter = GitHubActionsReporter::new(0.05);
        reporter.baseline = Some(suite_of(vec![baseline_case]));

        let lines = reporter.annotations(&suite_of(vec![failed_case()]));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("::error file=tests/math.rs,line=12"));
        assert!(lines[1].contains("Performance Regression"));
    }

    #[derive(Default)]
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Reporter for Recording {
        fn suite_start(&self, suite: &str, _config: &RunnerConfig) {
            self.events.lock().unwrap().push(format!("start:{}", suite));
        }

        fn case_end(&self, result: &ExecutionResult) {
            self.events.lock().unwrap().push(format!("case:{}", result.name));
        }

        fn suite_end(&self, result: &SuiteResult) {
            self.events.lock().unwrap().push(format!("end:{}", result.results.len()));
        }
    }

    #[test]
    fn should_forward_events_to_every_reporter() {
        let first = Recording::default();
        let second = Recording::default();
        let (a, b) = (first.events.clone(), second.events.clone());
        let multi = MultiReporter::new(vec![Box::new(first), Box::new(second)]);

        multi.suite_start("demo", &RunnerConfig::new());
        multi.case_start("Math/test_add");
        multi.case_end(&failed_case());
        multi.suite_end(&suite_of(vec![failed_case()]));

        let expected = vec!["start:demo", "case:Math/test_add", "end:1"];
        assert_eq!(*a.lock().unwrap(), expected);
        assert_eq!(*b.lock().unwrap(), expected);
    }
}
