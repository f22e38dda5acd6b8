//! Configuration for the test runner.

use crate::measure::{DEFAULT_ITERATIONS, MIN_ITERATIONS};
use std::path::PathBuf;

/// Configuration for the test runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Block iterations per metric group in measure calls.
    pub iterations: usize,
    /// Initial `continue_after_failure` of every test case.
    pub continue_after_failure: bool,
    /// Output directory for JSON results.
    pub output_dir: PathBuf,
    /// Print results to stdout.
    pub verbose: bool,
    /// Filter tests by name substring.
    pub filter: Option<String>,
    /// Git SHA to include in results (for regression tracking).
    pub git_sha: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            continue_after_failure: true,
            output_dir: PathBuf::from("target/testcase"),
            verbose: true,
            filter: None,
            git_sha: None,
        }
    }
}

impl RunnerConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse config from environment variables.
    ///
    /// Supported variables:
    /// - `TESTCASE_ITERATIONS`: measure iterations (default: 10, minimum 5)
    /// - `TESTCASE_CONTINUE_AFTER_FAILURE`: default for new test cases (default: true)
    /// - `TESTCASE_VERBOSE`: verbose output (default: true)
    /// - `TESTCASE_OUTPUT_DIR`: output directory
    /// - `TESTCASE_FILTER`: filter tests by name
    /// - `TESTCASE_GIT_SHA`: git commit hash
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("TESTCASE_ITERATIONS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.iterations = n.max(MIN_ITERATIONS);
            }
        }
        if let Ok(v) = std::env::var("TESTCASE_CONTINUE_AFTER_FAILURE") {
            cfg.continue_after_failure = parse_flag(&v);
        }
        if let Ok(v) = std::env::var("TESTCASE_VERBOSE") {
            cfg.verbose = parse_flag(&v);
        }
        if let Ok(v) = std::env::var("TESTCASE_OUTPUT_DIR") {
            cfg.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TESTCASE_FILTER") {
            cfg.filter = Some(v);
        }
        if let Ok(v) = std::env::var("TESTCASE_GIT_SHA") {
            cfg.git_sha = Some(v);
        }

        if cfg.git_sha.is_none() {
            cfg.git_sha = detect_git_sha();
        }

        cfg
    }

    /// Set the number of measure iterations (clamped to the minimum).
    pub fn iterations(mut self, n: usize) -> Self {
        self.iterations = n.max(MIN_ITERATIONS);
        self
    }

    /// Set the default `continue_after_failure`.
    pub fn continue_after_failure(mut self, v: bool) -> Self {
        self.continue_after_failure = v;
        self
    }

    /// Set the output directory.
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Set verbose output.
    pub fn verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    /// Set filter pattern.
    pub fn filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    /// Clear filter pattern.
    pub fn no_filter(mut self) -> Self {
        self.filter = None;
        self
    }

    /// Set git SHA.
    pub fn git_sha(mut self, sha: impl Into<String>) -> Self {
        self.git_sha = Some(sha.into());
        self
    }
}

fn parse_flag(v: &str) -> bool {
    v != "0" && !v.eq_ignore_ascii_case("false")
}

fn detect_git_sha() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                String::from_utf8(o.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}
