//! LIFO registry of teardown actions.
//!
//! Registration is thread-safe and may happen from any thread that holds a
//! [`TeardownRegistrar`]. Draining always happens on the thread running the
//! test case, one action at a time, most recently registered first.

use crate::case::TestCase;
use crate::failure::{FailureKind, FailureRecord};
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard};

/// A deferred cleanup action. It receives the test case it belongs to, so it
/// can record failures like any other phase.
pub type TeardownAction = Box<dyn FnOnce(&mut TestCase) + Send + 'static>;

/// Where the stack is in its single open -> draining -> closed life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Registrations are accepted. The window opens when the test case is
    /// created, so actions added before `invoke` count, and stays open
    /// through set-up and the test body.
    Open,
    /// Actions are being executed.
    Draining,
    /// All actions ran; nothing is accepted any more.
    Closed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Open => f.write_str("open"),
            RegistrationState::Draining => f.write_str("draining"),
            RegistrationState::Closed => f.write_str("closed"),
        }
    }
}

/// A teardown action was registered after the body had finished.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("teardown action for `{case}` registered while teardown is {state}")]
pub struct RegistrationWindowViolation {
    pub case: String,
    pub state: RegistrationState,
}

struct Pending {
    order: u64,
    action: TeardownAction,
}

struct Inner {
    case: String,
    state: RegistrationState,
    actions: Vec<Pending>,
    next_order: u64,
    rejected: Vec<FailureRecord>,
}

/// Stack of teardown actions owned by a test case.
#[derive(Clone)]
pub struct TeardownStack {
    inner: Arc<Mutex<Inner>>,
}

impl TeardownStack {
    pub fn new(case: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                case: case.into(),
                state: RegistrationState::Open,
                actions: Vec::new(),
                next_order: 0,
                rejected: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking action never holds the lock, so poisoning carries no torn state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an action. Fails once draining has begun.
    pub fn push(&self, action: TeardownAction) -> Result<(), RegistrationWindowViolation> {
        let mut inner = self.lock();
        if inner.state != RegistrationState::Open {
            return Err(RegistrationWindowViolation {
                case: inner.case.clone(),
                state: inner.state,
            });
        }
        let order = inner.next_order;
        inner.next_order += 1;
        inner.actions.push(Pending { order, action });
        tracing::debug!(case = %inner.case, order, "teardown action registered");
        Ok(())
    }

    /// A `Send + Sync` handle for registering actions from other threads.
    pub fn registrar(&self) -> TeardownRegistrar {
        TeardownRegistrar {
            stack: self.clone(),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.lock().state
    }

    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop and run every action, last registered first.
    ///
    /// `run` executes one action to completion before the next is popped.
    /// The lock is released while `run` executes, so an action that tries to
    /// register another one is rejected instead of deadlocking. Only the
    /// first call does anything; later calls return 0.
    pub fn drain<F>(&self, mut run: F) -> usize
    where
        F: FnMut(TeardownAction),
    {
        {
            let mut inner = self.lock();
            if inner.state != RegistrationState::Open {
                return 0;
            }
            inner.state = RegistrationState::Draining;
            tracing::debug!(
                case = %inner.case,
                pending = inner.actions.len(),
                "draining teardown actions"
            );
        }

        let mut executed = 0;
        loop {
            let next = self.lock().actions.pop();
            match next {
                Some(pending) => {
                    tracing::debug!(order = pending.order, "running teardown action");
                    run(pending.action);
                    executed += 1;
                }
                None => break,
            }
        }

        self.lock().state = RegistrationState::Closed;
        executed
    }

    /// Failures for registrations rejected through a [`TeardownRegistrar`].
    pub(crate) fn take_rejected(&self) -> Vec<FailureRecord> {
        std::mem::take(&mut self.lock().rejected)
    }
}

impl fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TeardownStack")
            .field("case", &inner.case)
            .field("state", &inner.state)
            .field("pending", &inner.actions.len())
            .finish()
    }
}

/// Cloneable registration handle for auxiliary threads spawned by a test.
///
/// Rejected registrations are kept and reported with the test's failures
/// once the lifecycle finishes.
#[derive(Clone, Debug)]
pub struct TeardownRegistrar {
    stack: TeardownStack,
}

impl TeardownRegistrar {
    #[track_caller]
    pub fn add<F>(&self, action: F) -> Result<(), RegistrationWindowViolation>
    where
        F: FnOnce(&mut TestCase) + Send + 'static,
    {
        let location = Location::caller();
        self.stack.push(Box::new(action)).inspect_err(|violation| {
            tracing::warn!(%violation, "rejected teardown registration");
            self.stack.lock().rejected.push(FailureRecord::new(
                FailureKind::RegistrationWindowViolation,
                violation.to_string(),
                location.file(),
                location.line(),
            ));
        })
    }
}
