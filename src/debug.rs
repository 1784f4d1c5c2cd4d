// NOTE: Exporting macros in Rust is a bit weird. `#[macro_export]` causes them
//       to be exported to the crate root, but that makes it difficult to
//       include just the macros without using `#[macro_use] extern crate`.
//       That's why the macros are also re-exported from this module.

/// Write something to the logger. Where the output ends up is decided once per
/// process by [`crate::logging::init()`]: a `/tmp/<endpoint>.<pid>.log` file
/// by default, or whatever the `VST2_BRIDGE_LOG` environment variable points
/// at.
#[macro_export]
macro_rules! bridge_log {
    ($($args:tt)*) => (
        $crate::log::info!($($args)*)
    );
}
pub use bridge_log;

/// Similar to `bridge_log!()`, more scream-y. Used for protocol violations and
/// fatal channel errors.
#[macro_export]
macro_rules! bridge_error {
    ($($args:tt)*) => (
        $crate::log::error!($($args)*)
    );
}
pub use bridge_error;

/// The same as `bridge_log!()`, but only shown when compiling in debug mode.
/// Safe to use on the audio path.
#[macro_export]
macro_rules! bridge_trace {
    ($($args:tt)*) => (
        $crate::util::permit_alloc(|| $crate::log::trace!($($args)*))
    );
}
pub use bridge_trace;

/// A `debug_assert!()` analogue that prints the error with line number
/// information instead of panicking. Aborting inside a DAW because of a bridge
/// bug takes the user's project down with it, so we log and limp on instead.
#[macro_export]
macro_rules! bridge_debug_assert {
    ($cond:expr $(,)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::util::permit_alloc(|| $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond))));
        }
    );
    ($cond:expr, $format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::util::permit_alloc(|| $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond), ", ", $format), $($($args)*)?));
        }
    );
}
pub use bridge_debug_assert;

/// An unconditional debug assertion failure, for if the condition has already
/// been checked elsewhere.
#[macro_export]
macro_rules! bridge_debug_assert_failure {
    () => (
        if cfg!(debug_assertions) {
            $crate::util::permit_alloc(|| $crate::log::debug!("Debug assertion failed"));
        }
    );
    ($format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) {
            $crate::util::permit_alloc(|| $crate::log::debug!(concat!("Debug assertion failed: ", $format), $($($args)*)?));
        }
    );
}
pub use bridge_debug_assert_failure;
