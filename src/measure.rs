//! Measurement sessions: repeated block invocations with validated
//! start/stop windows and per-metric statistics.

use crate::failure::{FailureKind, FailureRecord, FailureRecorder};
use crate::metric::{
    group_metrics, MetricDescriptor, MetricProbe, MetricRegistry, WALL_CLOCK_TIME,
};
use serde::{Deserialize, Serialize};
use std::panic::Location;

/// Iterations per metric group unless configured otherwise.
pub const DEFAULT_ITERATIONS: usize = 10;
/// Lower bound on iterations per metric group.
pub const MIN_ITERATIONS: usize = 5;

/// Errors that stop a measure call before any iteration runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasureError {
    #[error("unknown performance metric `{0}`")]
    UnknownMetric(String),
}

/// Lifecycle of a session. A session that failed to configure never exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Running,
    Closed,
}

/// Measuring window of the current block iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Between iterations.
    Idle,
    /// Block entered, window not opened yet.
    Armed,
    Measuring,
    Stopped,
}

/// Statistics for one metric across the retained samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistics {
    pub metric: String,
    pub unit: String,
    /// Samples from iterations that honored the window protocol.
    pub samples: Vec<f64>,
    /// Iterations thrown away because of protocol violations.
    pub discarded: usize,
    /// `false` when no iteration produced a valid sample.
    pub passed: bool,
}

impl MetricStatistics {
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn median(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().min_by(f64::total_cmp)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().max_by(f64::total_cmp)
    }

    /// Sample standard deviation. Needs at least two samples.
    pub fn std_dev(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let mean = self.average()?;
        let variance = self
            .samples
            .iter()
            .map(|s| {
                let diff = s - mean;
                diff * diff
            })
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        Some(variance.sqrt())
    }

    /// Standard deviation as a percentage of the average.
    pub fn relative_std_dev(&self) -> Option<f64> {
        let mean = self.average()?;
        if mean == 0.0 {
            return Some(0.0);
        }
        self.std_dev().map(|sd| sd / mean * 100.0)
    }
}

/// One `measure_metrics` call.
#[derive(Debug)]
pub struct MeasurementSession {
    metrics: Vec<MetricDescriptor>,
    automatically_start_measuring: bool,
    iterations: usize,
    state: SessionState,
    statistics: Option<Vec<MetricStatistics>>,
    origin: &'static Location<'static>,
}

impl MeasurementSession {
    /// Validate `metrics` against `registry`. An empty list selects
    /// wall-clock time.
    #[track_caller]
    pub fn configure(
        registry: &MetricRegistry,
        metrics: &[&str],
        automatically_start_measuring: bool,
    ) -> Result<Self, MeasureError> {
        let requested: &[&str] = if metrics.is_empty() {
            &[WALL_CLOCK_TIME]
        } else {
            metrics
        };
        let metrics = registry.resolve(requested)?;
        Ok(Self {
            metrics,
            automatically_start_measuring,
            iterations: DEFAULT_ITERATIONS,
            state: SessionState::Configured,
            statistics: None,
            origin: Location::caller(),
        })
    }

    /// Iterations per metric group, never below [`MIN_ITERATIONS`].
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(MIN_ITERATIONS);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn metrics(&self) -> &[MetricDescriptor] {
        &self.metrics
    }

    /// Statistics once the session has closed.
    pub fn statistics(&self) -> Option<&[MetricStatistics]> {
        self.statistics.as_deref()
    }

    /// Invoke `block` for every iteration of every metric group.
    ///
    /// Protocol violations go to `recorder` and discard the sample of the
    /// iteration they happened in. A metric left without samples is reported
    /// failed. Running a closed session again returns its statistics without
    /// invoking the block.
    pub fn run_block<F>(
        &mut self,
        recorder: &mut FailureRecorder,
        mut block: F,
    ) -> Vec<MetricStatistics>
    where
        F: FnMut(&mut MeasureScope<'_>),
    {
        if let Some(stats) = &self.statistics {
            return stats.clone();
        }
        self.state = SessionState::Running;

        let mut stats: Vec<MetricStatistics> = self
            .metrics
            .iter()
            .map(|m| MetricStatistics {
                metric: m.id().to_string(),
                unit: m.unit().to_string(),
                samples: Vec::with_capacity(self.iterations),
                discarded: 0,
                passed: true,
            })
            .collect();

        for group in group_metrics(&self.metrics) {
            let ids: Vec<&str> = group.iter().map(MetricDescriptor::id).collect();
            tracing::debug!(metrics = ?ids, iterations = self.iterations, "measuring metric group");
            for iteration in 0..self.iterations {
                let mut scope = MeasureScope {
                    recorder: &mut *recorder,
                    probes: group.iter().map(MetricDescriptor::probe).collect(),
                    window: WindowState::Idle,
                    automatic: self.automatically_start_measuring,
                    invalid: false,
                    readings: None,
                    iteration,
                    origin: self.origin,
                };
                scope.arm();
                block(&mut scope);
                let readings = scope.finish();

                for (index, id) in ids.iter().enumerate() {
                    let Some(entry) = stats.iter_mut().find(|s| s.metric == *id) else {
                        continue;
                    };
                    match &readings {
                        Some(values) => entry.samples.push(values[index]),
                        None => entry.discarded += 1,
                    }
                }
            }
        }

        let mut empty = Vec::new();
        for entry in stats.iter_mut().filter(|s| s.samples.is_empty()) {
            entry.passed = false;
            empty.push(entry.metric.clone());
        }

        self.state = SessionState::Closed;
        self.statistics = Some(stats.clone());

        for metric in empty {
            tracing::warn!(%metric, "metric produced no valid samples");
            recorder.record(FailureRecord::new(
                FailureKind::NoValidSamples,
                format!("metric `{}` produced no valid samples", metric),
                self.origin.file(),
                self.origin.line(),
            ));
        }

        stats
    }
}

/// Handle passed to a measured block for one iteration.
pub struct MeasureScope<'a> {
    recorder: &'a mut FailureRecorder,
    probes: Vec<Box<dyn MetricProbe>>,
    window: WindowState,
    automatic: bool,
    invalid: bool,
    readings: Option<Vec<f64>>,
    iteration: usize,
    origin: &'static Location<'static>,
}

impl MeasureScope<'_> {
    /// Zero-based iteration index within the current metric group.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn window(&self) -> WindowState {
        self.window
    }

    /// Open the measuring window. Valid once per iteration, and only when
    /// the session does not start measuring automatically.
    #[track_caller]
    pub fn start_measuring(&mut self) {
        match self.window {
            WindowState::Armed if !self.automatic => self.open(),
            WindowState::Measuring => self.violation(
                FailureKind::DoubleStart,
                "start_measuring called while already measuring",
            ),
            _ if self.automatic => self.violation(
                FailureKind::DoubleStart,
                "start_measuring called in a block that starts measuring automatically",
            ),
            _ => self.violation(
                FailureKind::DoubleStart,
                "start_measuring called more than once in one iteration",
            ),
        }
    }

    /// Close the measuring window and take the iteration's samples.
    #[track_caller]
    pub fn stop_measuring(&mut self) {
        match self.window {
            WindowState::Measuring => self.close(),
            WindowState::Stopped => self.violation(
                FailureKind::DoubleStop,
                "stop_measuring called more than once in one iteration",
            ),
            WindowState::Idle | WindowState::Armed => self.violation(
                FailureKind::StopWithoutStart,
                "stop_measuring called before start_measuring",
            ),
        }
    }

    /// Record a failure from inside the measured block.
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

    fn arm(&mut self) {
        self.window = WindowState::Armed;
        if self.automatic {
            self.open();
        }
    }

    fn open(&mut self) {
        for probe in &mut self.probes {
            probe.start();
        }
        self.window = WindowState::Measuring;
    }

    fn close(&mut self) {
        self.readings = Some(self.probes.iter_mut().map(|p| p.stop()).collect());
        self.window = WindowState::Stopped;
    }

    #[track_caller]
    fn violation(&mut self, kind: FailureKind, description: &str) {
        let location = Location::caller();
        self.invalid = true;
        tracing::warn!(%kind, iteration = self.iteration, "measurement protocol violation");
        self.recorder.record(FailureRecord::new(
            kind,
            description,
            location.file(),
            location.line(),
        ));
    }

    /// End the iteration. Returns the samples, or `None` when the iteration
    /// has to be discarded.
    fn finish(mut self) -> Option<Vec<f64>> {
        match self.window {
            WindowState::Measuring => self.close(),
            WindowState::Armed | WindowState::Idle => {
                let origin = self.origin;
                self.invalid = true;
                tracing::warn!(
                    iteration = self.iteration,
                    "measured block never called start_measuring"
                );
                self.recorder.record(FailureRecord::new(
                    FailureKind::MissingStart,
                    "block finished without calling start_measuring",
                    origin.file(),
                    origin.line(),
                ));
            }
            WindowState::Stopped => {}
        }
        self.window = WindowState::Idle;
        if self.invalid {
            None
        } else {
            self.readings.take()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProbe {
        calls: Arc<AtomicUsize>,
    }

    impl MetricProbe for CountingProbe {
        fn start(&mut self) {}
        fn stop(&mut self) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst) as f64
        }
    }

    fn kinds(recorder: &FailureRecorder) -> Vec<FailureKind> {
        recorder.records().iter().map(|r| r.kind()).collect()
    }

    fn session(auto: bool) -> MeasurementSession {
        MeasurementSession::configure(&MetricRegistry::new(), &[WALL_CLOCK_TIME], auto)
            .unwrap()
            .iterations(MIN_ITERATIONS)
    }

    #[test]
    fn should_collect_all_samples_when_auto_start() {
        let mut recorder = FailureRecorder::new(true);
        let mut session = session(true);
        let stats = session.run_block(&mut recorder, |_scope| {
            std::thread::sleep(std::time::Duration::from_millis(1));
        });

        assert!(recorder.is_empty());
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].samples.len(), MIN_ITERATIONS);
        assert!(stats[0].passed);
        assert!(stats[0].min().unwrap() >= 0.001);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn should_record_double_start_when_auto_start_block_starts() {
        let mut recorder = FailureRecorder::new(true);
        let stats = session(true).run_block(&mut recorder, |scope| {
            if scope.iteration() == 0 {
                scope.start_measuring();
            }
        });

        assert_eq!(kinds(&recorder), vec![FailureKind::DoubleStart]);
        assert_eq!(stats[0].discarded, 1);
        assert_eq!(stats[0].samples.len(), MIN_ITERATIONS - 1);
    }

    #[test]
    fn should_record_missing_start_for_every_iteration() {
        let mut recorder = FailureRecorder::new(true);
        let stats = session(false).run_block(&mut recorder, |_scope| {});

        let missing = kinds(&recorder)
            .into_iter()
            .filter(|k| *k == FailureKind::MissingStart)
            .count();
        assert_eq!(missing, MIN_ITERATIONS);
        assert!(!stats[0].passed);
        assert!(stats[0].samples.is_empty());
        assert_eq!(
            recorder.records().last().unwrap().kind(),
            FailureKind::NoValidSamples
        );
    }

    #[test]
    fn should_record_double_stop_per_extra_call() {
        let mut recorder = FailureRecorder::new(true);
        let stats = session(false).run_block(&mut recorder, |scope| {
            scope.start_measuring();
            scope.stop_measuring();
            if scope.iteration() == 2 {
                scope.stop_measuring();
                scope.stop_measuring();
            }
        });

        assert_eq!(kinds(&recorder), vec![FailureKind::DoubleStop, FailureKind::DoubleStop]);
        assert_eq!(stats[0].discarded, 1);
        assert_eq!(stats[0].samples.len(), MIN_ITERATIONS - 1);
    }

    #[test]
    fn should_record_stop_without_start() {
        let mut recorder = FailureRecorder::new(true);
        session(false).run_block(&mut recorder, |scope| {
            if scope.iteration() == 0 {
                scope.stop_measuring();
            }
            scope.start_measuring();
        });

        assert_eq!(kinds(&recorder), vec![FailureKind::StopWithoutStart]);
    }

    #[test]
    fn should_record_double_start_when_manual_block_starts_twice() {
        let mut recorder = FailureRecorder::new(true);
        session(false).run_block(&mut recorder, |scope| {
            scope.start_measuring();
            if scope.iteration() == 1 {
                scope.start_measuring();
            }
        });

        assert_eq!(kinds(&recorder), vec![FailureKind::DoubleStart]);
    }

    #[test]
    fn should_close_open_window_at_block_exit() {
        let mut recorder = FailureRecorder::new(true);
        let stats = session(false).run_block(&mut recorder, |scope| {
            scope.start_measuring();
        });

        assert!(recorder.is_empty());
        assert_eq!(stats[0].samples.len(), MIN_ITERATIONS);
    }

    #[test]
    fn should_reject_unknown_metric_at_configure() {
        let err =
            MeasurementSession::configure(&MetricRegistry::new(), &["nope"], true).unwrap_err();
        assert_eq!(err, MeasureError::UnknownMetric("nope".to_string()));
    }

    #[test]
    fn should_default_to_wall_clock_when_no_metrics() {
        let session = MeasurementSession::configure(&MetricRegistry::new(), &[], true).unwrap();
        assert_eq!(session.metrics().len(), 1);
        assert_eq!(session.metrics()[0].id(), WALL_CLOCK_TIME);
    }

    #[test]
    fn should_run_isolated_metric_on_its_own_iterations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = calls.clone();
        let mut registry = MetricRegistry::new();
        registry.register(
            MetricDescriptor::new("probe_calls", "calls", move || {
                Box::new(CountingProbe {
                    calls: probe_calls.clone(),
                })
            })
            .isolated(true),
        );

        let mut recorder = FailureRecorder::new(true);
        let mut invocations = 0;
        let stats =
            MeasurementSession::configure(&registry, &[WALL_CLOCK_TIME, "probe_calls"], true)
                .unwrap()
                .iterations(MIN_ITERATIONS)
                .run_block(&mut recorder, |_scope| invocations += 1);

        assert_eq!(invocations, MIN_ITERATIONS * 2);
        assert_eq!(calls.load(Ordering::SeqCst), MIN_ITERATIONS);
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.samples.len() == MIN_ITERATIONS));
    }

    #[test]
    fn should_not_rerun_closed_session() {
        let mut recorder = FailureRecorder::new(true);
        let mut session = session(true);
        let first = session.run_block(&mut recorder, |_scope| {});
        let second = session.run_block(&mut recorder, |_scope| panic!("closed session reran"));
        assert_eq!(first, second);
    }

    #[test]
    fn should_clamp_iterations_to_minimum() {
        let mut recorder = FailureRecorder::new(true);
        let stats = MeasurementSession::configure(&MetricRegistry::new(), &[], true)
            .unwrap()
            .iterations(1)
            .run_block(&mut recorder, |_scope| {});
        assert_eq!(stats[0].samples.len(), MIN_ITERATIONS);
    }

    #[test]
    fn should_compute_statistics() {
        let stats = MetricStatistics {
            metric: "m".to_string(),
            unit: "s".to_string(),
            samples: vec![1.0, 2.0, 3.0, 4.0],
            discarded: 0,
            passed: true,
        };
        assert_eq!(stats.average(), Some(2.5));
        assert_eq!(stats.median(), Some(2.5));
        assert_eq!(stats.min(), Some(1.0));
        assert_eq!(stats.max(), Some(4.0));
        let sd = stats.std_dev().unwrap();
        assert!((sd - 1.2909944).abs() < 1e-6);
        assert!((stats.relative_std_dev().unwrap() - sd / 2.5 * 100.0).abs() < 1e-9);
    }
}
