//! Harness for test cases registered with `#[testcase]`.
//!
//! ## Architecture
//!
//! 1. `#[testcase]` registers each function in a distributed slice via linkme
//! 2. `testcase_main!()` generates a `main()` that calls [`harness_main`]
//! 3. [`harness_main`] parses CLI flags, sets up logging and calls
//!    [`run_with_options`]
//! 4. [`run_with_options`] runs every matching entry through a [`TestRunner`]
//!
//! Each test binary is self-contained: build it as a `harness = false`
//! test target and `cargo test` runs it like any other.

use crate::{RunnerConfig, TestCase, TestRunner};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A registered test entry.
#[doc(hidden)]
pub struct TestEntry {
    /// Test name (function name or custom)
    pub name: &'static str,
    /// The test body
    pub func: fn(&mut TestCase),
    /// Whether this test is ignored by default
    pub ignored: bool,
    /// Module path where the test is defined
    pub module_path: &'static str,
}

/// Distributed slice collecting all registered tests.
#[doc(hidden)]
#[linkme::distributed_slice]
pub static TEST_CASES: [TestEntry];

/// Command-line flags of a test binary.
#[derive(Debug, Clone, Parser)]
#[command(about = "Run registered test cases", ignore_errors = true)]
struct HarnessArgs {
    /// Filter tests by glob pattern (e.g. "math*", "*insert*")
    #[arg(long)]
    filter: Option<String>,

    /// Include tests marked with #[testcase(ignore)]
    #[arg(long)]
    include_ignored: bool,

    /// List registered tests without running them
    #[arg(long)]
    list: bool,

    /// Block iterations per metric group in measure calls
    #[arg(long)]
    iterations: Option<usize>,

    /// Verbose output (debug logging)
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Quiet mode (no per-test console output)
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Output directory for JSON results
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Baseline JSON for measurement regression comparison
    #[arg(long)]
    baseline: Option<PathBuf>,

    /// Regression threshold (0.05 = 5%)
    #[arg(long, default_value_t = 0.05)]
    threshold: f64,
}

/// Options for running registered tests.
#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    /// Filter tests by glob pattern
    pub filter: Option<String>,
    /// Include ignored tests
    pub include_ignored: bool,
    /// Measure iterations override
    pub iterations: Option<usize>,
    /// Console output
    pub verbose: bool,
    /// Output directory override
    pub output_dir: Option<PathBuf>,
    /// Baseline file for comparison
    pub baseline: Option<PathBuf>,
    /// Regression threshold (e.g., 0.05 for 5%)
    pub threshold: f64,
}

impl HarnessOptions {
    pub fn new() -> Self {
        Self {
            threshold: 0.05,
            verbose: true,
            ..Default::default()
        }
    }

    pub fn filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    pub fn include_ignored(mut self, v: bool) -> Self {
        self.include_ignored = v;
        self
    }

    pub fn iterations(mut self, n: usize) -> Self {
        self.iterations = Some(n);
        self
    }

    pub fn verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    pub fn baseline(mut self, path: impl Into<PathBuf>) -> Self {
        self.baseline = Some(path.into());
        self
    }

    pub fn threshold(mut self, t: f64) -> Self {
        self.threshold = t;
        self
    }
}

/// What a harness run produced.
#[derive(Debug)]
pub struct HarnessOutcome {
    pub suite: crate::SuiteResult,
    pub regressions: Vec<crate::Regression>,
}

impl HarnessOutcome {
    pub fn success(&self) -> bool {
        self.suite.passed() && self.regressions.is_empty()
    }
}

/// Entry point generated by `testcase_main!()`.
///
/// Exits with success only when every test passed and no measurement
/// regressed against the baseline.
pub fn harness_main() -> ExitCode {
    let args = HarnessArgs::parse();
    init_tracing(args.verbose);

    if args.list {
        let tests = list_tests();
        if tests.is_empty() {
            println!("No tests registered. Add #[testcase] to your test functions.");
        } else {
            println!("Registered tests ({}):", tests.len());
            for name in tests {
                println!("  {}", name);
            }
        }
        return ExitCode::SUCCESS;
    }

    let mut opts = HarnessOptions::new()
        .verbose(!args.quiet)
        .include_ignored(args.include_ignored)
        .threshold(args.threshold);
    if let Some(pattern) = args.filter {
        opts = opts.filter(pattern);
    }
    if let Some(n) = args.iterations {
        opts = opts.iterations(n);
    }
    if let Some(dir) = args.output_dir {
        opts = opts.output_dir(dir);
    }
    if let Some(baseline) = args.baseline {
        opts = opts.baseline(baseline);
    }

    match run_with_options(opts) {
        Ok(outcome) => {
            for r in &outcome.regressions {
                eprintln!(
                    "{} `{}` is {:.1}% slower than baseline",
                    r.case,
                    r.metric,
                    (r.ratio - 1.0) * 100.0
                );
            }
            if outcome.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`. Does nothing if one
/// is already installed.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Suite name derived from the executable name.
fn suite_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .map(|name| strip_cargo_hash(&name).replace('_', "-"))
        .unwrap_or_else(|| "testcase".to_string())
}

/// Remove the `-<16 hex chars>` suffix cargo appends to test executables.
fn strip_cargo_hash(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((stem, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            stem
        }
        _ => name,
    }
}

/// Run the registered tests selected by `opts`.
pub fn run_with_options(opts: HarnessOptions) -> anyhow::Result<HarnessOutcome> {
    let entries = select(&TEST_CASES, &opts);
    if entries.is_empty() {
        if opts.filter.is_some() {
            tracing::warn!("no tests matched the filter");
        } else {
            tracing::warn!("no tests registered; add #[testcase] to your test functions");
        }
    }

    let mut config = RunnerConfig::from_env().verbose(opts.verbose);
    if let Some(n) = opts.iterations {
        config = config.iterations(n);
    }
    if let Some(dir) = &opts.output_dir {
        config = config.output_dir(dir);
    }

    let mut runner = TestRunner::with_config(&suite_name(), config);
    for entry in entries {
        let name = format!("{}::{}", entry.module_path, entry.name);
        runner.run(&name, entry.func);
    }

    match opts.baseline {
        Some(path) => {
            let (suite, regressions) = runner.finish_with_baseline(path, opts.threshold)?;
            Ok(HarnessOutcome { suite, regressions })
        }
        None => Ok(HarnessOutcome {
            suite: runner.finish(),
            regressions: Vec::new(),
        }),
    }
}

fn select<'a>(entries: &'a [TestEntry], opts: &HarnessOptions) -> Vec<&'a TestEntry> {
    entries
        .iter()
        .filter(|e| {
            if e.ignored && !opts.include_ignored {
                return false;
            }
            match &opts.filter {
                Some(pattern) => {
                    matches_glob(e.name, pattern) || matches_glob(e.module_path, pattern)
                }
                None => true,
            }
        })
        .collect()
}

/// Case-insensitive glob matching supporting `*`; a pattern without `*`
/// matches as a substring.
fn matches_glob(text: &str, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let text = text.to_lowercase();

    if !pattern.contains('*') {
        return text.contains(&pattern);
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let last = parts.len() - 1;
    let mut remaining = text.as_str();

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match remaining.strip_prefix(part) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if i == last {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Names of all registered tests.
pub fn list_tests() -> Vec<&'static str> {
    TEST_CASES.iter().map(|t| t.name).collect()
}

/// Number of registered tests.
pub fn test_count() -> usize {
    TEST_CASES.len()
}
