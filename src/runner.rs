//! The suite runner.

use crate::case::{TestCase, TestHooks};
use crate::class::{BoundMethod, TestCaseClass};
use crate::config::RunnerConfig;
use crate::failure::{install_panic_hook, FailureRecord};
use crate::report::{ConsoleReporter, JsonReporter, Reporter};
use crate::result::{ExecutionResult, Regression, SuiteResult};
use std::collections::HashMap;
use std::panic;
use std::time::Instant;

/// Runs test cases one after another and collects their results.
///
/// # Example
///
/// ```rust,no_run
/// use cntryl_testcase::{tc_assert, TestRunner};
///
/// let mut runner = TestRunner::new("my_suite");
///
/// runner.run("vector_is_empty", |tc| {
///     let data: Vec<u8> = Vec::new();
///     tc_assert!(tc, data.is_empty());
/// });
///
/// let suite = runner.finish();
/// assert!(suite.passed());
/// ```
pub struct TestRunner {
    suite: String,
    config: RunnerConfig,
    results: Vec<ExecutionResult>,
    suite_start: Instant,
    reporters: Vec<Box<dyn Reporter>>,
    metadata: HashMap<String, String>,
}

impl TestRunner {
    /// Create a new runner with default config from environment.
    pub fn new(suite: &str) -> Self {
        Self::with_config(suite, RunnerConfig::from_env())
    }

    /// Create a new runner with explicit config.
    pub fn with_config(suite: &str, config: RunnerConfig) -> Self {
        install_panic_hook();

        let mut reporters: Vec<Box<dyn Reporter>> =
            vec![Box::new(JsonReporter::new(config.output_dir.clone()))];
        if config.verbose {
            reporters.insert(0, Box::new(ConsoleReporter::new()));
        }

        let runner = Self {
            suite: suite.to_string(),
            config,
            results: Vec::new(),
            suite_start: Instant::now(),
            reporters,
            metadata: HashMap::new(),
        };

        for r in &runner.reporters {
            r.suite_start(&runner.suite, &runner.config);
        }

        runner
    }

    /// Add custom metadata to the suite results.
    pub fn metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace reporters with a custom set.
    pub fn reporters(&mut self, reporters: Vec<Box<dyn Reporter>>) -> &mut Self {
        self.reporters = reporters;
        self
    }

    /// Add an additional reporter.
    pub fn add_reporter(&mut self, reporter: Box<dyn Reporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Results collected so far.
    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    fn should_run(&self, name: &str) -> bool {
        match &self.config.filter {
            Some(f) => name.contains(f.as_str()),
            None => true,
        }
    }

    /// Create a test case carrying this runner's settings.
    pub fn new_case(&self, name: &str) -> TestCase {
        TestCase::with_config(name, &self.config)
    }

    /// Run a test that only has a body.
    pub fn run<F>(&mut self, name: &str, body: F) -> Option<&ExecutionResult>
    where
        F: FnOnce(&mut TestCase),
    {
        if !self.should_run(name) {
            return None;
        }
        self.notify_start(name);
        let result = self.new_case(name).invoke_fn(body);
        Some(self.push(result))
    }

    /// Run a test with its own set-up and tear-down.
    pub fn run_hooks(&mut self, name: &str, hooks: &mut dyn TestHooks) -> Option<&ExecutionResult> {
        if !self.should_run(name) {
            return None;
        }
        self.notify_start(name);
        let result = self.new_case(name).invoke(hooks);
        Some(self.push(result))
    }

    /// Run every method of a test class.
    ///
    /// `set_up_class` runs before the first method and `tear_down_class`
    /// after the last. If `set_up_class` panics the methods are reported
    /// failed without running; `tear_down_class` still runs.
    pub fn run_class<C: TestCaseClass>(&mut self) {
        let methods: Vec<_> = C::tests()
            .into_iter()
            .map(|m| (format!("{}/{}", C::NAME, m.name), m))
            .filter(|(name, _)| self.should_run(name))
            .collect();
        if methods.is_empty() {
            return;
        }

        tracing::debug!(class = C::NAME, methods = methods.len(), "running test class");
        match panic::catch_unwind(C::set_up_class) {
            Ok(()) => {
                for (name, method) in methods {
                    self.notify_start(&name);
                    let mut tc = self.new_case(&name);
                    tc.set_default_performance_metrics(C::default_performance_metrics());
                    let result = tc.invoke(&mut BoundMethod::<C>::new(method));
                    self.push(result);
                }
            }
            Err(payload) => {
                let failure = FailureRecord::from_panic("set_up_class", &*payload);
                tracing::error!(class = C::NAME, %failure, "class set-up failed");
                for (name, _) in methods {
                    self.notify_start(&name);
                    self.push(ExecutionResult::not_run(name, failure.clone()));
                }
            }
        }

        if let Err(payload) = panic::catch_unwind(C::tear_down_class) {
            let failure = FailureRecord::from_panic("tear_down_class", &*payload);
            tracing::error!(class = C::NAME, %failure, "class tear-down failed");
            let name = format!("{}/tear_down_class", C::NAME);
            self.push(ExecutionResult::not_run(name, failure));
        }
    }

    fn notify_start(&self, name: &str) {
        for r in &self.reporters {
            r.case_start(name);
        }
    }

    fn push(&mut self, result: ExecutionResult) -> &ExecutionResult {
        for r in &self.reporters {
            r.case_end(&result);
        }
        self.results.push(result);
        &self.results[self.results.len() - 1]
    }

    fn suite_result(&self) -> SuiteResult {
        SuiteResult {
            suite: self.suite.clone(),
            results: self.results.clone(),
            total_duration: self.suite_start.elapsed(),
            started_at: unix_millis_timestamp(),
            git_sha: self.config.git_sha.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Finish the suite and return its results.
    ///
    /// This writes JSON output and prints the summary.
    pub fn finish(self) -> SuiteResult {
        let suite_result = self.suite_result();
        for r in &self.reporters {
            r.suite_end(&suite_result);
        }
        suite_result
    }

    /// Finish and compare measurements against a baseline file.
    pub fn finish_with_baseline(
        self,
        baseline_path: impl AsRef<std::path::Path>,
        threshold: f64,
    ) -> anyhow::Result<(SuiteResult, Vec<Regression>)> {
        let suite = self.finish();
        let baseline = SuiteResult::load(baseline_path)?;
        let regressions = suite.find_regressions(&baseline, threshold);
        Ok((suite, regressions))
    }
}

fn unix_millis_timestamp() -> String {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_millis())
}
