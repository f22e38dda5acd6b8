//! Failure records and the per-test recorder.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic;
use std::sync::Once;

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A failed assertion-style check.
    AssertionFailure,
    /// A panic escaped a lifecycle phase.
    UnexpectedFault,
    /// A teardown action was registered outside the registration window.
    RegistrationWindowViolation,
    /// A measure call named a metric missing from the registry.
    UnknownMetric,
    /// `start_measuring` while a window was already started.
    DoubleStart,
    /// Manual-start iteration finished without `start_measuring`.
    MissingStart,
    /// `stop_measuring` before any window was opened.
    StopWithoutStart,
    /// `stop_measuring` after the window had already been stopped.
    DoubleStop,
    /// Every iteration of a metric was discarded.
    NoValidSamples,
}

impl FailureKind {
    /// Whether a failure of this kind came from a check rather than a fault.
    pub fn is_expected(self) -> bool {
        !matches!(self, FailureKind::UnexpectedFault)
    }

    pub fn is_measurement_violation(self) -> bool {
        matches!(
            self,
            FailureKind::DoubleStart
                | FailureKind::MissingStart
                | FailureKind::StopWithoutStart
                | FailureKind::DoubleStop
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::AssertionFailure => "assertion failure",
            FailureKind::UnexpectedFault => "unexpected fault",
            FailureKind::RegistrationWindowViolation => "registration window violation",
            FailureKind::UnknownMetric => "unknown metric",
            FailureKind::DoubleStart => "double start",
            FailureKind::MissingStart => "missing start",
            FailureKind::StopWithoutStart => "stop without start",
            FailureKind::DoubleStop => "double stop",
            FailureKind::NoValidSamples => "no valid samples",
        };
        f.write_str(s)
    }
}

/// A single failure recorded while a test case ran. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    kind: FailureKind,
    description: String,
    file_path: String,
    line_number: u32,
    expected: bool,
}

impl FailureRecord {
    pub fn new(
        kind: FailureKind,
        description: impl Into<String>,
        file_path: impl Into<String>,
        line_number: u32,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            file_path: file_path.into(),
            line_number,
            expected: kind.is_expected(),
        }
    }

    /// Build a record the way `record_failure` callers describe it: `expected`
    /// selects between an assertion failure and an unexpected fault.
    pub fn from_expected(
        description: impl Into<String>,
        file_path: impl Into<String>,
        line_number: u32,
        expected: bool,
    ) -> Self {
        let kind = if expected {
            FailureKind::AssertionFailure
        } else {
            FailureKind::UnexpectedFault
        };
        Self::new(kind, description, file_path, line_number)
    }

    /// Build an `UnexpectedFault` record from a caught panic payload.
    pub(crate) fn from_panic(context: &str, payload: &(dyn Any + Send)) -> Self {
        let message = panic_message(payload);
        let (file, line) =
            take_panic_location().unwrap_or_else(|| ("<unknown>".to_string(), 0));
        Self::new(
            FailureKind::UnexpectedFault,
            format!("{} panicked: {}", context, message),
            file,
            line,
        )
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    /// `true` for check failures, `false` for faults escaping a phase.
    pub fn expected(&self) -> bool {
        self.expected
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.file_path, self.line_number, self.kind, self.description
        )
    }
}

/// Unwind payload used to abort the current phase when
/// `continue_after_failure` is off. Raised with `resume_unwind`, so the
/// panic hook never sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseAbort;

/// Collects failures for one test case.
#[derive(Debug)]
pub struct FailureRecorder {
    records: Vec<FailureRecord>,
    continue_after_failure: bool,
    phase_active: bool,
}

impl FailureRecorder {
    pub fn new(continue_after_failure: bool) -> Self {
        Self {
            records: Vec::new(),
            continue_after_failure,
            phase_active: false,
        }
    }

    pub fn continue_after_failure(&self) -> bool {
        self.continue_after_failure
    }

    pub fn set_continue_after_failure(&mut self, value: bool) {
        self.continue_after_failure = value;
    }

    /// Append a failure.
    ///
    /// When `continue_after_failure` is off and a lifecycle phase is running,
    /// this unwinds the rest of that phase. The lifecycle catches the unwind
    /// and moves on to the next phase.
    pub fn record(&mut self, record: FailureRecord) {
        tracing::debug!(
            kind = %record.kind,
            location = %format!("{}:{}", record.file_path, record.line_number),
            "failure recorded"
        );
        self.records.push(record);
        if !self.continue_after_failure && self.phase_active {
            panic::resume_unwind(Box::new(PhaseAbort));
        }
    }

    /// Append a failure without ever unwinding.
    pub(crate) fn record_without_abort(&mut self, record: FailureRecord) {
        self.records.push(record);
    }

    pub(crate) fn set_phase_active(&mut self, active: bool) {
        self.phase_active = active;
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_failed(&self) -> bool {
        !self.records.is_empty()
    }

    pub(crate) fn into_records(self) -> Vec<FailureRecord> {
        self.records
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

thread_local! {
    static LAST_PANIC_LOCATION: RefCell<Option<(String, u32)>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install a process-wide hook that remembers where the last panic on each
/// thread happened, then defers to the previous hook.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let entry = (location.file().to_string(), location.line());
                LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(entry));
            }
            previous(info);
        }));
    });
}

fn take_panic_location() -> Option<(String, u32)> {
    LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take())
}

/// Forget any panic location left over from a panic that was caught before
/// the current phase started.
pub(crate) fn clear_panic_location() {
    LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = None);
}
