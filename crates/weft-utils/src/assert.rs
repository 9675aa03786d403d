/// Reports a programming error: panics in debug builds, logs through
/// `tracing::error!` in release builds.
///
/// Use for contract violations, never for runtime failures that callers are
/// expected to handle.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            $crate::tracing::error!($($arg)*);
        }
    };
}

/// Checks a contract the way [`bug!`] reports one: panic in debug builds,
/// `tracing::error!` in release builds.
#[macro_export]
macro_rules! bug_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::bug!("contract violated: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::bug!($($arg)+);
        }
    };
}
