//! # cntryl-testcase
//!
//! An in-process test-case runtime: set-up / body / tear-down lifecycle,
//! LIFO teardown actions, failure recording with `continue_after_failure`,
//! and repeated-block performance measurement with validated
//! start/stop windows.
//!
//! ## Quick Start
//!
//! ```rust
//! use cntryl_testcase::{tc_assert, TestCase};
//!
//! let result = TestCase::new("parse_header").invoke_fn(|tc| {
//!     let path = std::env::temp_dir().join("parse_header.tmp");
//!     std::fs::write(&path, b"header").unwrap();
//!     tc.add_teardown_block(move |_| {
//!         std::fs::remove_file(&path).ok();
//!     })
//!     .unwrap();
//!
//!     tc_assert!(tc, "header".len() == 6);
//!
//!     tc.measure(|_scope| {
//!         std::hint::black_box("header".to_uppercase());
//!     })
//!     .unwrap();
//! });
//!
//! assert!(result.passed);
//! assert_eq!(result.measurements.len(), 1);
//! ```
//!
//! Tests can also be registered with `#[testcase]` and run by a binary
//! ending in `testcase_main!()`, or grouped into a [`TestCaseClass`] and run
//! with [`TestRunner::run_class`].

mod assert;
mod case;
mod class;
mod config;
mod failure;
mod harness;
mod measure;
mod metric;
mod report;
mod result;
mod runner;
mod teardown;

pub use case::{Phase, TestCase, TestHooks};
pub use class::{TestCaseClass, TestMethod};
pub use config::RunnerConfig;
pub use failure::{FailureKind, FailureRecord, FailureRecorder};
pub use harness::{
    harness_main, init_tracing, list_tests, run_with_options, test_count, HarnessOptions,
    HarnessOutcome,
};
pub use measure::{
    MeasureError, MeasureScope, MeasurementSession, MetricStatistics, SessionState, WindowState,
    DEFAULT_ITERATIONS, MIN_ITERATIONS,
};
pub use metric::{
    group_metrics, MetricDescriptor, MetricProbe, MetricRegistry, WallClockProbe, WALL_CLOCK_TIME,
};
pub use report::{ConsoleReporter, GitHubActionsReporter, JsonReporter, MultiReporter, Reporter};
pub use result::{ExecutionResult, Regression, SuiteResult};
pub use runner::TestRunner;
pub use teardown::{
    RegistrationState, RegistrationWindowViolation, TeardownAction, TeardownRegistrar,
    TeardownStack,
};

pub use cntryl_testcase_macros::{testcase, testcase_main};

#[doc(hidden)]
pub mod __private {
    pub use crate::harness::{TestEntry, TEST_CASES};
    pub use linkme;
}
