//! The test-case lifecycle: set-up, body, teardown actions, tear-down and
//! failure aggregation.

use crate::config::RunnerConfig;
use crate::failure::{
    clear_panic_location, install_panic_hook, FailureKind, FailureRecord, FailureRecorder,
    PhaseAbort,
};
use crate::measure::{
    MeasureError, MeasureScope, MeasurementSession, MetricStatistics, DEFAULT_ITERATIONS,
};
use crate::metric::{MetricRegistry, WALL_CLOCK_TIME};
use crate::result::ExecutionResult;
use crate::teardown::{RegistrationWindowViolation, TeardownRegistrar, TeardownStack};
use std::panic::{self, AssertUnwindSafe, Location};
use std::time::Instant;

/// Lifecycle phase a test case is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SetUp,
    Body,
    TeardownAction,
    TearDown,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::SetUp => "set_up",
            Phase::Body => "test body",
            Phase::TeardownAction => "teardown action",
            Phase::TearDown => "tear_down",
        }
    }
}

/// The user-provided parts of a test: per-instance set-up, the body and
/// per-instance tear-down.
pub trait TestHooks {
    fn set_up(&mut self, _tc: &mut TestCase) {}

    fn run(&mut self, tc: &mut TestCase);

    fn tear_down(&mut self, _tc: &mut TestCase) {}
}

/// Adapts a single closure into [`TestHooks`].
struct BodyOnly<F>(Option<F>);

impl<F: FnOnce(&mut TestCase)> TestHooks for BodyOnly<F> {
    fn run(&mut self, tc: &mut TestCase) {
        if let Some(body) = self.0.take() {
            body(tc);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseOutcome {
    failed: bool,
    aborted: bool,
}

/// One test invocation.
///
/// All recording, teardown registration and measurement go through the
/// `TestCase` passed into each phase; there is no ambient "current test".
pub struct TestCase {
    name: String,
    recorder: FailureRecorder,
    teardown: TeardownStack,
    registry: MetricRegistry,
    default_metrics: Vec<String>,
    iterations: usize,
    measurements: Vec<MetricStatistics>,
    phase: Option<Phase>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            teardown: TeardownStack::new(name.clone()),
            name,
            recorder: FailureRecorder::new(true),
            registry: MetricRegistry::new(),
            default_metrics: vec![WALL_CLOCK_TIME.to_string()],
            iterations: DEFAULT_ITERATIONS,
            measurements: Vec::new(),
            phase: None,
        }
    }

    /// New test case with runner-wide settings applied.
    pub fn with_config(name: impl Into<String>, config: &RunnerConfig) -> Self {
        let mut tc = Self::new(name);
        tc.set_continue_after_failure(config.continue_after_failure);
        tc.iterations = config.iterations;
        tc
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defaults to `true`.
    pub fn continue_after_failure(&self) -> bool {
        self.recorder.continue_after_failure()
    }

    pub fn set_continue_after_failure(&mut self, value: bool) {
        self.recorder.set_continue_after_failure(value);
    }

    /// Phase currently executing, if any.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn failures(&self) -> &[FailureRecord] {
        self.recorder.records()
    }

    pub fn has_failed(&self) -> bool {
        self.recorder.has_failed()
    }

    /// Record a failure. `expected` is `true` for failed checks and `false`
    /// for unexpected faults.
    ///
    /// With `continue_after_failure` off this unwinds the rest of the current
    /// phase; later phases still run.
    pub fn record_failure(
        &mut self,
        description: impl Into<String>,
        file_path: impl Into<String>,
        line_number: u32,
        expected: bool,
    ) {
        self.recorder.record(FailureRecord::from_expected(
            description,
            file_path,
            line_number,
            expected,
        ));
    }

    /// Register a cleanup action that runs after the body, before
    /// `tear_down`, in LIFO order.
    ///
    /// Registration is open from [`TestCase::new`] until the body returns.
    /// Registering once teardown has started fails and is recorded as a
    /// failure of this test.
    #[track_caller]
    pub fn add_teardown_block<F>(&mut self, action: F) -> Result<(), RegistrationWindowViolation>
    where
        F: FnOnce(&mut TestCase) + Send + 'static,
    {
        let location = Location::caller();
        match self.teardown.push(Box::new(action)) {
            Ok(()) => Ok(()),
            Err(violation) => {
                tracing::warn!(case = %self.name, %violation, "rejected teardown registration");
                self.recorder.record(FailureRecord::new(
                    FailureKind::RegistrationWindowViolation,
                    violation.to_string(),
                    location.file(),
                    location.line(),
                ));
                Err(violation)
            }
        }
    }

    /// Handle for registering teardown actions from other threads.
    pub fn teardown_registrar(&self) -> TeardownRegistrar {
        self.teardown.registrar()
    }

    pub fn metric_registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn metric_registry_mut(&mut self) -> &mut MetricRegistry {
        &mut self.registry
    }

    /// Metrics used by [`TestCase::measure`].
    pub fn default_performance_metrics(&self) -> &[String] {
        &self.default_metrics
    }

    pub fn set_default_performance_metrics<I, S>(&mut self, metrics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_metrics = metrics.into_iter().map(Into::into).collect();
    }

    /// Iterations per metric group for measure calls.
    pub fn set_measure_iterations(&mut self, iterations: usize) {
        self.iterations = iterations;
    }

    /// Statistics from every measure call made so far.
    pub fn measurements(&self) -> &[MetricStatistics] {
        &self.measurements
    }

    /// Measure the default metrics, starting the window automatically.
    #[track_caller]
    pub fn measure<F>(&mut self, block: F) -> Result<Vec<MetricStatistics>, MeasureError>
    where
        F: FnMut(&mut MeasureScope<'_>),
    {
        let defaults = self.default_metrics.clone();
        let ids: Vec<&str> = defaults.iter().map(String::as_str).collect();
        self.measure_metrics(&ids, true, block)
    }

    /// Measure `metrics` across repeated calls to `block`.
    ///
    /// An unknown metric fails the test and runs no iterations. Protocol
    /// violations inside the block are recorded and discard the affected
    /// iteration.
    ///
    /// The test case stays borrowed while the block runs. Take a
    /// [`TestCase::teardown_registrar`] beforehand to register cleanup from
    /// inside the block.
    #[track_caller]
    pub fn measure_metrics<F>(
        &mut self,
        metrics: &[&str],
        automatically_start_measuring: bool,
        block: F,
    ) -> Result<Vec<MetricStatistics>, MeasureError>
    where
        F: FnMut(&mut MeasureScope<'_>),
    {
        let location = Location::caller();
        let mut session = match MeasurementSession::configure(
            &self.registry,
            metrics,
            automatically_start_measuring,
        ) {
            Ok(session) => session.iterations(self.iterations),
            Err(err) => {
                tracing::warn!(case = %self.name, %err, "measure call rejected");
                self.recorder.record(FailureRecord::new(
                    FailureKind::UnknownMetric,
                    err.to_string(),
                    location.file(),
                    location.line(),
                ));
                return Err(err);
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            session.run_block(&mut self.recorder, block)
        }));
        if let Some(stats) = session.statistics() {
            self.measurements.extend_from_slice(stats);
        }
        match outcome {
            Ok(stats) => Ok(stats),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Run the full lifecycle and report the outcome.
    ///
    /// Teardown actions and `tear_down` always run, whatever happened in
    /// `set_up` or the body.
    pub fn invoke(mut self, hooks: &mut dyn TestHooks) -> ExecutionResult {
        install_panic_hook();
        let started = Instant::now();
        tracing::debug!(case = %self.name, "test case started");

        let set_up = self.run_phase(Phase::SetUp, |tc| hooks.set_up(tc));
        if set_up.failed && !self.continue_after_failure() {
            tracing::debug!(
                case = %self.name,
                aborted = set_up.aborted,
                "set_up failed; skipping test body"
            );
        } else {
            self.run_phase(Phase::Body, |tc| hooks.run(tc));
        }

        self.drain_teardown();
        self.run_phase(Phase::TearDown, |tc| hooks.tear_down(tc));

        let duration = started.elapsed();
        let mut failures = self.recorder.into_records();
        failures.extend(self.teardown.take_rejected());
        tracing::debug!(case = %self.name, failures = failures.len(), "test case finished");

        ExecutionResult {
            passed: failures.is_empty(),
            name: self.name,
            failures,
            measurements: self.measurements,
            duration,
        }
    }

    /// [`TestCase::invoke`] for a test that only has a body.
    pub fn invoke_fn<F>(self, body: F) -> ExecutionResult
    where
        F: FnOnce(&mut TestCase),
    {
        self.invoke(&mut BodyOnly(Some(body)))
    }

    fn drain_teardown(&mut self) -> usize {
        let stack = self.teardown.clone();
        stack.drain(|action| {
            self.run_phase(Phase::TeardownAction, action);
        })
    }

    fn run_phase<F>(&mut self, phase: Phase, f: F) -> PhaseOutcome
    where
        F: FnOnce(&mut TestCase),
    {
        let before = self.recorder.len();
        clear_panic_location();
        self.phase = Some(phase);
        self.recorder.set_phase_active(true);

        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self)));

        self.recorder.set_phase_active(false);
        self.phase = None;

        let aborted = match result {
            Ok(()) => false,
            Err(payload) => {
                if !payload.is::<PhaseAbort>() {
                    let record = FailureRecord::from_panic(phase.label(), &*payload);
                    tracing::debug!(case = %self.name, phase = phase.label(), "phase panicked");
                    self.recorder.record_without_abort(record);
                }
                true
            }
        };

        PhaseOutcome {
            failed: self.recorder.len() > before,
            aborted,
        }
    }
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("continue_after_failure", &self.continue_after_failure())
            .field("failures", &self.recorder.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        log: Log,
        fail_set_up: bool,
        panic_set_up: bool,
        fail_body: bool,
        panic_body: bool,
    }

    impl Scripted {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                fail_set_up: false,
                panic_set_up: false,
                fail_body: false,
                panic_body: false,
            }
        }

        fn push(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    impl TestHooks for Scripted {
        fn set_up(&mut self, tc: &mut TestCase) {
            self.push("set_up");
            let log = self.log.clone();
            tc.add_teardown_block(move |_| log.lock().unwrap().push("block:set_up".into()))
                .unwrap();
            if self.fail_set_up {
                tc.record_failure("set_up failed", file!(), line!(), true);
                self.push("set_up:after_failure");
            }
            if self.panic_set_up {
                panic!("fixture unavailable");
            }
        }

        fn run(&mut self, tc: &mut TestCase) {
            self.push("body");
            let log = self.log.clone();
            tc.add_teardown_block(move |_| log.lock().unwrap().push("block:body".into()))
                .unwrap();
            if self.fail_body {
                tc.record_failure("body failed", file!(), line!(), true);
                self.push("body:after_failure");
            }
            if self.panic_body {
                panic!("body exploded");
            }
        }

        fn tear_down(&mut self, _tc: &mut TestCase) {
            self.push("tear_down");
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn should_run_phases_in_order() {
        let log = Log::default();
        let result = TestCase::new("order").invoke(&mut Scripted::new(&log));

        assert!(result.passed);
        assert_eq!(
            entries(&log),
            vec!["set_up", "body", "block:body", "block:set_up", "tear_down"]
        );
    }

    #[test]
    fn should_skip_body_when_set_up_fails_and_not_continuing() {
        let log = Log::default();
        let mut hooks = Scripted::new(&log);
        hooks.fail_set_up = true;
        let mut tc = TestCase::new("stop");
        tc.set_continue_after_failure(false);
        let result = tc.invoke(&mut hooks);

        assert!(!result.passed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(entries(&log), vec!["set_up", "block:set_up", "tear_down"]);
    }

    #[test]
    fn should_run_body_when_set_up_fails_and_continuing() {
        let log = Log::default();
        let mut hooks = Scripted::new(&log);
        hooks.fail_set_up = true;
        let result = TestCase::new("continue").invoke(&mut hooks);

        assert!(!result.passed);
        assert!(entries(&log).contains(&"set_up:after_failure".to_string()));
        assert!(entries(&log).contains(&"body".to_string()));
    }

    #[test]
    fn should_record_unexpected_fault_when_body_panics() {
        let log = Log::default();
        let mut hooks = Scripted::new(&log);
        hooks.panic_body = true;
        let result = TestCase::new("fault").invoke(&mut hooks);

        assert_eq!(result.failures.len(), 1);
        let fault = &result.failures[0];
        assert_eq!(fault.kind(), FailureKind::UnexpectedFault);
        assert!(!fault.expected());
        assert!(fault.description().contains("body exploded"));
        assert_eq!(
            entries(&log),
            vec!["set_up", "body", "block:body", "block:set_up", "tear_down"]
        );
    }

    #[test]
    fn should_tear_down_when_body_fails_and_not_continuing() {
        let log = Log::default();
        let mut hooks = Scripted::new(&log);
        hooks.fail_body = true;
        let mut tc = TestCase::new("body-abort");
        tc.set_continue_after_failure(false);
        let result = tc.invoke(&mut hooks);

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind(), FailureKind::AssertionFailure);
        assert_eq!(
            entries(&log),
            vec!["set_up", "body", "block:body", "block:set_up", "tear_down"]
        );
    }

    #[test]
    fn should_tear_down_when_set_up_panics_and_not_continuing() {
        let log = Log::default();
        let mut hooks = Scripted::new(&log);
        hooks.panic_set_up = true;
        let mut tc = TestCase::new("set-up-panic");
        tc.set_continue_after_failure(false);
        let result = tc.invoke(&mut hooks);

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind(), FailureKind::UnexpectedFault);
        assert!(result.failures[0].description().contains("fixture unavailable"));
        assert_eq!(entries(&log), vec!["set_up", "block:set_up", "tear_down"]);
    }

    struct ManualUnwind;

    impl TestHooks for ManualUnwind {
        fn set_up(&mut self, _tc: &mut TestCase) {
            let caught = panic::catch_unwind(|| panic!("handled in set_up"));
            assert!(caught.is_err());
        }

        fn run(&mut self, _tc: &mut TestCase) {
            panic::resume_unwind(Box::new("unwound by hand"));
        }
    }

    #[test]
    fn should_not_reuse_location_of_earlier_caught_panic() {
        let result = TestCase::new("manual-unwind").invoke(&mut ManualUnwind);

        assert_eq!(result.failures.len(), 1);
        let fault = &result.failures[0];
        assert!(fault.description().contains("unwound by hand"));
        assert_eq!(fault.file_path(), "<unknown>");
        assert_eq!(fault.line_number(), 0);
    }

    #[test]
    fn should_abort_only_current_teardown_action() {
        let log = Log::default();
        let first = log.clone();
        let second = log.clone();
        let mut tc = TestCase::new("teardown-abort");
        tc.set_continue_after_failure(false);
        let result = tc.invoke_fn(move |tc| {
            tc.add_teardown_block(move |_| first.lock().unwrap().push("first".into()))
                .unwrap();
            tc.add_teardown_block(move |tc| {
                tc.record_failure("cleanup failed", file!(), line!(), true);
                second.lock().unwrap().push("unreachable".into());
            })
            .unwrap();
        });

        assert_eq!(result.failures.len(), 1);
        assert_eq!(entries(&log), vec!["first"]);
    }

    #[test]
    fn should_reject_registration_from_teardown_action() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let result = TestCase::new("late").invoke_fn(move |tc| {
            tc.add_teardown_block(move |tc| {
                let flag = flag.clone();
                let err = tc.add_teardown_block(move |_| *flag.lock().unwrap() = true);
                assert!(err.is_err());
            })
            .unwrap();
        });

        assert!(!*ran.lock().unwrap());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(
            result.failures[0].kind(),
            FailureKind::RegistrationWindowViolation
        );
    }

    #[test]
    fn should_report_phase_while_running() {
        let result = TestCase::new("phase").invoke_fn(|tc| {
            assert_eq!(tc.phase(), Some(Phase::Body));
        });
        assert!(result.passed);
    }

    #[test]
    fn should_record_unknown_metric_and_run_no_iterations() {
        let mut iterations = 0;
        let result = TestCase::new("metric").invoke_fn(|tc| {
            let err = tc
                .measure_metrics(&["heap_bytes"], true, |_scope| iterations += 1)
                .unwrap_err();
            assert_eq!(err, MeasureError::UnknownMetric("heap_bytes".to_string()));
        });

        assert_eq!(iterations, 0);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind(), FailureKind::UnknownMetric);
        assert!(result.measurements.is_empty());
    }

    #[test]
    fn should_register_teardown_from_measured_block_through_registrar() {
        let log = Log::default();
        let seen = log.clone();
        let result = TestCase::new("measure-cleanup").invoke_fn(move |tc| {
            tc.set_measure_iterations(5);
            let registrar = tc.teardown_registrar();
            tc.measure(|scope| {
                if scope.iteration() == 0 {
                    let seen = seen.clone();
                    registrar
                        .add(move |_| seen.lock().unwrap().push("measured".into()))
                        .unwrap();
                }
            })
            .unwrap();
        });

        assert!(result.passed, "{:?}", result.failures);
        assert_eq!(entries(&log), vec!["measured"]);
    }

    #[test]
    fn should_drain_actions_registered_before_invoke() {
        let log = Log::default();
        let early = log.clone();
        let mut tc = TestCase::new("early");
        tc.add_teardown_block(move |_| early.lock().unwrap().push("early".into()))
            .unwrap();

        let mut hooks = Scripted::new(&log);
        let result = tc.invoke(&mut hooks);

        assert!(result.passed);
        assert_eq!(
            entries(&log),
            vec!["set_up", "body", "block:body", "block:set_up", "early", "tear_down"]
        );
    }

    #[test]
    fn should_keep_measurements_in_result() {
        let result = TestCase::new("measure").invoke_fn(|tc| {
            tc.set_measure_iterations(5);
            tc.measure(|_scope| {}).unwrap();
        });

        assert!(result.passed);
        assert_eq!(result.measurements.len(), 1);
        assert_eq!(result.measurements[0].metric, WALL_CLOCK_TIME);
        assert_eq!(result.measurements[0].samples.len(), 5);
    }
}
