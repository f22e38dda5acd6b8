//! Assertion macros that record failures instead of panicking.
//!
//! The first argument is anything with a `record_failure` method taking
//! `(description, file, line, expected)`: a [`TestCase`](crate::TestCase) or a
//! [`MeasureScope`](crate::MeasureScope).

/// Record an assertion failure when `cond` is false.
///
/// ```rust
/// use cntryl_testcase::{tc_assert, TestCase};
///
/// let result = TestCase::new("doc").invoke_fn(|tc| {
///     tc_assert!(tc, 1 + 1 == 3, "math is {}", "broken");
/// });
/// assert_eq!(result.failures.len(), 1);
/// ```
#[macro_export]
macro_rules! tc_assert {
    ($tc:expr, $cond:expr $(,)?) => {
        if !$cond {
            $tc.record_failure(
                concat!("assertion failed: ", stringify!($cond)),
                file!(),
                line!(),
                true,
            );
        }
    };
    ($tc:expr, $cond:expr, $($arg:tt)+) => {
        if !$cond {
            $tc.record_failure(
                format!("assertion failed: {}: {}", stringify!($cond), format_args!($($arg)+)),
                file!(),
                line!(),
                true,
            );
        }
    };
}

/// Record an assertion failure when the two values differ.
#[macro_export]
macro_rules! tc_assert_eq {
    ($tc:expr, $left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (left, right) => {
                if !(*left == *right) {
                    $tc.record_failure(
                        format!(
                            "assertion `left == right` failed\n  left: {:?}\n right: {:?}",
                            left, right
                        ),
                        file!(),
                        line!(),
                        true,
                    );
                }
            }
        }
    };
}

/// Record an assertion failure unconditionally.
#[macro_export]
macro_rules! tc_fail {
    ($tc:expr, $($arg:tt)+) => {
        $tc.record_failure(format!($($arg)+), file!(), line!(), true)
    };
}
