//! Assertion macros for fixture results.
//!
//! Failures print the whole result, so a wrong variant or an unexpected
//! success shows what the receiver or broker actually returned.

/// Assert that a result failed with an error matching `pattern`.
///
/// An optional third argument requires the error message to contain a
/// substring.
///
/// # Example
///
/// ```ignore
/// assert_err_variant!(factory.consume(0), TestyError::InvalidArgument(_));
/// assert_err_variant!(
///     channel.queue_message_count("gone"),
///     TestyError::NotFound(_),
///     "gone"
/// );
/// ```
#[macro_export]
macro_rules! assert_err_variant {
    ($result:expr, $pattern:pat) => {
        match &$result {
            Err($pattern) => (),
            Err(other) => panic!(
                "expected error {}, got {:?}",
                stringify!($pattern),
                other
            ),
            Ok(_) => panic!("expected error {}, got Ok", stringify!($pattern)),
        }
    };
    ($result:expr, $pattern:pat, $needle:expr) => {
        match &$result {
            Err(error @ $pattern) => {
                let message = error.to_string();
                assert!(
                    message.contains($needle),
                    "error message {:?} does not mention {:?}",
                    message,
                    $needle
                );
            }
            Err(other) => panic!(
                "expected error {}, got {:?}",
                stringify!($pattern),
                other
            ),
            Ok(_) => panic!("expected error {}, got Ok", stringify!($pattern)),
        }
    };
}

/// Assert that a timed read gave up waiting.
///
/// # Example
///
/// ```ignore
/// assert_timed_out!(receiver.collect_within(Duration::from_millis(50)).await);
/// ```
#[macro_export]
macro_rules! assert_timed_out {
    ($result:expr) => {
        match &$result {
            Err(error) if error.is_timeout() => (),
            Err(other) => panic!("expected a timeout, got {:?}", other),
            Ok(_) => panic!("expected a timeout, got Ok"),
        }
    };
}
