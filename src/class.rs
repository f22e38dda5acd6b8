//! Grouping test methods into a class with shared fixtures.

use crate::case::{TestCase, TestHooks};
use crate::metric::WALL_CLOCK_TIME;

/// A named test method of a [`TestCaseClass`].
pub struct TestMethod<C> {
    pub name: &'static str,
    pub func: fn(&mut C, &mut TestCase),
}

impl<C> TestMethod<C> {
    pub const fn new(name: &'static str, func: fn(&mut C, &mut TestCase)) -> Self {
        Self { name, func }
    }
}

impl<C> Clone for TestMethod<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for TestMethod<C> {}

/// A set of test methods sharing per-instance and class-level set-up.
///
/// Every method runs on a fresh `Self::default()` fixture. `set_up_class`
/// runs once before the first method and `tear_down_class` once after the
/// last one.
///
/// # Example
///
/// ```rust
/// use cntryl_testcase::{tc_assert_eq, TestCase, TestCaseClass, TestMethod};
///
/// #[derive(Default)]
/// struct MathTest {
///     a: f32,
///     b: f32,
/// }
///
/// impl TestCaseClass for MathTest {
///     const NAME: &'static str = "MathTest";
///
///     fn tests() -> Vec<TestMethod<Self>> {
///         vec![TestMethod::new("test_addition", Self::test_addition)]
///     }
///
///     fn set_up(&mut self, _tc: &mut TestCase) {
///         self.a = 2.0;
///         self.b = 3.0;
///     }
/// }
///
/// impl MathTest {
///     fn test_addition(&mut self, tc: &mut TestCase) {
///         tc_assert_eq!(tc, self.a + self.b, 5.0);
///     }
/// }
/// ```
pub trait TestCaseClass: Default + 'static {
    const NAME: &'static str;

    fn tests() -> Vec<TestMethod<Self>>;

    fn set_up_class() {}

    fn tear_down_class() {}

    fn set_up(&mut self, _tc: &mut TestCase) {}

    fn tear_down(&mut self, _tc: &mut TestCase) {}

    /// Metrics measured by [`TestCase::measure`] in this class.
    fn default_performance_metrics() -> Vec<&'static str> {
        vec![WALL_CLOCK_TIME]
    }
}

/// A fixture instance bound to one of its methods.
pub(crate) struct BoundMethod<C> {
    fixture: C,
    func: fn(&mut C, &mut TestCase),
}

impl<C: TestCaseClass> BoundMethod<C> {
    pub(crate) fn new(method: TestMethod<C>) -> Self {
        Self {
            fixture: C::default(),
            func: method.func,
        }
    }
}

impl<C: TestCaseClass> TestHooks for BoundMethod<C> {
    fn set_up(&mut self, tc: &mut TestCase) {
        self.fixture.set_up(tc);
    }

    fn run(&mut self, tc: &mut TestCase) {
        (self.func)(&mut self.fixture, tc);
    }

    fn tear_down(&mut self, tc: &mut TestCase) {
        self.fixture.tear_down(tc);
    }
}
